use crate::prelude::*;
use crate::sink::RecordSink;

use std::fs::OpenOptions;
use std::path::Path;
use std::sync::{Arc, Mutex};

/// Appends one JSON object per decoded record to a file.
#[derive(Debug, Clone)]
pub struct DatalogWriter {
    file: Arc<Mutex<std::fs::File>>,
    path: String,
    records_written: Arc<Mutex<u64>>,
}

impl DatalogWriter {
    pub fn new(path: &str) -> Result<Self> {
        info!("Opening datalog file at {}", path);

        if let Some(parent) = Path::new(path).parent() {
            std::fs::create_dir_all(parent)?;
        }

        let file = match OpenOptions::new().create(true).append(true).open(path) {
            Ok(f) => f,
            Err(e) => {
                error!("Failed to open datalog file {}: {}", path, e);
                return Err(e.into());
            }
        };

        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            if let Err(e) = std::fs::set_permissions(path, std::fs::Permissions::from_mode(0o644)) {
                error!("Failed to set permissions on datalog file {}: {}", path, e);
                return Err(e.into());
            }
        }

        Ok(Self {
            file: Arc::new(Mutex::new(file)),
            path: path.to_string(),
            records_written: Arc::new(Mutex::new(0)),
        })
    }

    fn to_json(record: &DecodedRecord) -> serde_json::Value {
        serde_json::json!({
            "utc_timestamp": record.timestamp.timestamp(),
            "station": record.station,
            "header": record.header_id,
            "firmware": record.firmware_rev,
            "comm_duration": record.comm_duration,
            "raw": record.raw,
            "fields": record.fields,
        })
    }

    pub fn write_record(&self, record: &DecodedRecord) -> Result<(), PersistenceError> {
        let line = serde_json::to_string(&Self::to_json(record))?;

        let mut file = self
            .file
            .lock()
            .map_err(|_| PersistenceError::Channel(format!("{} lock poisoned", self.path)))?;
        if let Err(e) = writeln!(file, "{}", line).and_then(|_| file.flush()) {
            error!("Failed to write to datalog file {}: {}", self.path, e);
            return Err(e.into());
        }

        if let Ok(mut written) = self.records_written.lock() {
            *written += 1;
            debug!("Total records stored in datalog file: {}", *written);
        }

        Ok(())
    }
}

impl RecordSink for DatalogWriter {
    fn name(&self) -> &str {
        &self.path
    }

    fn publish(&self, record: &DecodedRecord) -> Result<(), PersistenceError> {
        self.write_record(record)
    }
}
