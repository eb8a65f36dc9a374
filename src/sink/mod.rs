// Downstream consumers of decoded records.
pub mod database;
pub mod datalog_writer;
pub mod log_line;

use crate::prelude::*;

use enum_dispatch::enum_dispatch;

pub use database::{Database, DatabaseChannel};
pub use datalog_writer::DatalogWriter;
pub use log_line::LogLine;

#[enum_dispatch]
pub trait RecordSink {
    fn name(&self) -> &str;

    fn publish(&self, record: &DecodedRecord) -> Result<(), PersistenceError>;
}

#[enum_dispatch(RecordSink)]
#[derive(Clone)]
pub enum Sink {
    LogLine,
    DatalogWriter,
    DatabaseChannel,
}
