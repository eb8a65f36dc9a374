pub use anyhow::{anyhow, bail, Result};
pub use log::{debug, error, info, trace, warn};

pub use std::io::Write;
pub use std::str::FromStr;

pub use tokio::sync::broadcast;

pub use crate::{file_error, file_error_with_source};

pub use crate::channels::Channels;
pub use crate::config::{self, Config, ConfigWrapper};
pub use crate::error::{ConfigError, FieldDecodeError, FrameError, PersistenceError, PollError, SchemaError};
pub use crate::mppt::{
    self,
    decoder::{DecodedRecord, FieldValue},
    frame::{Frame, FrameCodec},
    schema::SchemaRegistry,
};
pub use crate::options::Options;
pub use crate::stations::Station;
