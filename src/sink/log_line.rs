use crate::prelude::*;
use crate::sink::RecordSink;

use chrono::{DateTime, Local, Utc};

const BATTERY_VOLTAGE: &str = "Adc_vb_f";
const LVD_VOLTAGE: &str = "V_lvd";
const LOAD_STATE: &str = "Load_State";
const CHARGE_STATE: &str = "Charge_State";

/// Quick-look status line per poll, e.g.
///
/// `MARC_mppt,7/24/2016,17:43:11, LoadState,LOAD_ON, VBatt,13.46,V, Vlvd,11.00,V, Vdiff,2.46,V, ChargeState,FLOAT, Comm_Duration, 0.317, seconds,`
#[derive(Clone, Debug, Default)]
pub struct LogLine;

fn volts(value: Option<f64>) -> String {
    value.map(|v| format!("{:.2}", v)).unwrap_or_else(|| "?".to_string())
}

impl LogLine {
    pub fn new() -> Self {
        Self
    }

    pub fn format(record: &DecodedRecord) -> String {
        let local: DateTime<Local> = DateTime::<Utc>::from(record.timestamp).with_timezone(&Local);
        let vbatt = record.number(BATTERY_VOLTAGE);
        let vlvd = record.number(LVD_VOLTAGE);
        let vdiff = vbatt.zip(vlvd).map(|(b, l)| b - l);

        format!(
            "{},{}, LoadState,{}, VBatt,{},V, Vlvd,{},V, Vdiff,{},V, ChargeState,{}, Comm_Duration, {:.3}, seconds,",
            record.station,
            local.format("%-m/%-d/%Y,%H:%M:%S"),
            record.state(LOAD_STATE).unwrap_or("?"),
            volts(vbatt),
            volts(vlvd),
            volts(vdiff),
            record.state(CHARGE_STATE).unwrap_or("?"),
            record.comm_duration,
        )
    }
}

impl RecordSink for LogLine {
    fn name(&self) -> &str {
        "log"
    }

    fn publish(&self, record: &DecodedRecord) -> Result<(), PersistenceError> {
        info!("{}", Self::format(record));
        Ok(())
    }
}
