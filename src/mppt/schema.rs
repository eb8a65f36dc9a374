use crate::prelude::*;

use std::collections::HashSet;

// Scale factors from the SunSaver MPPT MODBUS register map
pub const V_FACTOR: f64 = 100.0 / 32768.0; // volts
pub const VREF_FACTOR: f64 = 99.667 / 32768.0; // volts
pub const I_FACTOR: f64 = 79.16 / 32768.0; // amps
pub const AH_FACTOR: f64 = 0.1; // amp hours
pub const P_FACTOR: f64 = 989.5 / 65536.0; // watts

const HIGH_SUFFIX: &str = "_HI";
const LOW_SUFFIX: &str = "_LO";

/// One row of a bitfield table: the bit's label plus the state strings for 0 and 1.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct BitRow {
    pub label: &'static str,
    pub clear: &'static str,
    pub set: &'static str,
}

impl BitRow {
    pub const fn new(label: &'static str, clear: &'static str, set: &'static str) -> Self {
        Self { label, clear, set }
    }

    pub const fn fault(label: &'static str) -> Self {
        Self::new(label, "No Fault", "Fault")
    }
}

/// How a raw register token turns into a value.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum EncodingMode {
    Linear { factor: f64, unit: &'static str },
    Enumerated { states: &'static [&'static str] },
    Bitfield { rows: &'static [BitRow] },
    /// Upper 16 bits of a 32-bit quantity; the next register holds the low word.
    HighWord { scale: f64 },
    LowWord { unit: &'static str },
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct RegisterDescriptor {
    pub name: &'static str,
    pub mode: EncodingMode,
}

impl RegisterDescriptor {
    pub const fn linear(name: &'static str, factor: f64, unit: &'static str) -> Self {
        Self { name, mode: EncodingMode::Linear { factor, unit } }
    }

    pub const fn enumerated(name: &'static str, states: &'static [&'static str]) -> Self {
        Self { name, mode: EncodingMode::Enumerated { states } }
    }

    pub const fn bitfield(name: &'static str, rows: &'static [BitRow]) -> Self {
        Self { name, mode: EncodingMode::Bitfield { rows } }
    }

    pub const fn high_word(name: &'static str, scale: f64) -> Self {
        Self { name, mode: EncodingMode::HighWord { scale } }
    }

    pub const fn low_word(name: &'static str, unit: &'static str) -> Self {
        Self { name, mode: EncodingMode::LowWord { unit } }
    }

    /// Name of the combined field for a high/low word pair (`Ahc_r_HI` -> `Ahc_r`).
    pub fn stem(&self) -> &'static str {
        self.name
            .strip_suffix(HIGH_SUFFIX)
            .or_else(|| self.name.strip_suffix(LOW_SUFFIX))
            .unwrap_or(self.name)
    }
}

pub const CHARGE_STATES: &[&str] = &[
    "START",
    "NIGHT_CHECK",
    "DISCONNECT",
    "NIGHT",
    "FAULT",
    "BULK_CHARGE",
    "ABSORPTION",
    "FLOAT",
    "EQUALIZE",
];

pub const LOAD_STATES: &[&str] = &["START", "LOAD_ON", "LVD_WARNING", "LVD", "FAULT", "DISCONNECT"];

pub const LED_STATES: &[&str] = &[
    "LED_START",
    "LED_START2",
    "LED_BRANCH",
    "EQUALIZE (FAST GREEN BLINK)",
    "FLOAT (SLOW GREEN BLINK)",
    "ABSORPTION (GREEN BLINK, 1HZ)",
    "GREEN_LED",
    "UNDEFINED",
    "YELLOW_LED",
    "UNDEFINED",
    "BLINK_RED_LED",
    "RED_LED",
    "R-Y-G ERROR",
    "R/Y-G ERROR",
    "R/G-Y ERROR",
    "R-Y ERROR (HTD)",
    "R-G ERROR (HVD)",
    "R/Y-G/Y ERROR",
    "G/Y/R ERROR",
    "G/Y/R x 2",
];

pub const ARRAY_FAULTS: &[BitRow] = &[
    BitRow::fault("Overcurrent"),
    BitRow::fault("FETs shorted"),
    BitRow::fault("Software bug"),
    BitRow::fault("Battery HVD"),
    BitRow::fault("Array HVD"),
    BitRow::fault("EEPROM setting reset required"),
    BitRow::fault("RTS shorted"),
    BitRow::fault("RTS was valid now disconnected"),
    BitRow::fault("Local temp. sensor failed"),
    BitRow::fault("Fault 10"),
    BitRow::fault("Fault 11"),
    BitRow::fault("Fault 12"),
    BitRow::fault("Fault 13"),
    BitRow::fault("Fault 14"),
    BitRow::fault("Fault 15"),
    BitRow::fault("Fault 16"),
];

pub const LOAD_FAULTS: &[BitRow] = &[
    BitRow::fault("External Short Circuit"),
    BitRow::fault("Overcurrent"),
    BitRow::fault("FETs shorted"),
    BitRow::fault("Software bug"),
    BitRow::fault("HVD"),
    BitRow::fault("Heatsink over-temperature"),
    BitRow::fault("EEPROM setting reset required"),
    BitRow::fault("Fault 8"),
];

pub const DIP_SWITCHES: &[BitRow] = &[
    BitRow::new("Battery Type", "User Select Jumper", "Custom Battery Settings"),
    BitRow::new("LVD / LVR", "11.5V / 12.6V", "Custom Load Settings"),
    BitRow::new("Equalize", "Disabled", "Enabled"),
    BitRow::new("Comm Select", "Meterbus", "MODBUS"),
];

// Order matters: index i here is raw register token i of a frame.
const SUNSAVER_MPPT: &[RegisterDescriptor] = &[
    RegisterDescriptor::linear("Adc_vb_f", V_FACTOR, "V"),
    RegisterDescriptor::linear("Adc_va_f", V_FACTOR, "V"),
    RegisterDescriptor::linear("Adc_vl_f", V_FACTOR, "V"),
    RegisterDescriptor::linear("Adc_ic_f", I_FACTOR, "A"),
    RegisterDescriptor::linear("Adc_il_f", I_FACTOR, "A"),
    RegisterDescriptor::linear("T_hs", 1.0, "deg C"),
    RegisterDescriptor::linear("T_batt", 1.0, "deg C"),
    RegisterDescriptor::linear("T_amb", 1.0, "deg C"),
    RegisterDescriptor::linear("T_rts", 1.0, "deg C"),
    RegisterDescriptor::enumerated("Charge_State", CHARGE_STATES),
    RegisterDescriptor::bitfield("Array_Fault", ARRAY_FAULTS),
    RegisterDescriptor::linear("Vb_f", V_FACTOR, "V"),
    RegisterDescriptor::linear("Vb_ref", VREF_FACTOR, "V"),
    RegisterDescriptor::high_word("Ahc_r_HI", AH_FACTOR),
    RegisterDescriptor::low_word("Ahc_r_LO", "Ah"),
    RegisterDescriptor::high_word("Ahc_t_HI", AH_FACTOR),
    RegisterDescriptor::low_word("Ahc_t_LO", "Ah"),
    RegisterDescriptor::linear("KWhc", AH_FACTOR, "kWh"),
    RegisterDescriptor::enumerated("Load_State", LOAD_STATES),
    RegisterDescriptor::bitfield("Load_Fault", LOAD_FAULTS),
    RegisterDescriptor::linear("V_lvd", V_FACTOR, "V"),
    RegisterDescriptor::high_word("Ahl_r_HI", AH_FACTOR),
    RegisterDescriptor::low_word("Ahl_r_LO", "Ah"),
    RegisterDescriptor::high_word("Ahl_t_HI", AH_FACTOR),
    RegisterDescriptor::low_word("Ahl_t_LO", "Ah"),
    RegisterDescriptor::high_word("Hourmeter_HI", 1.0),
    RegisterDescriptor::low_word("Hourmeter_LO", "Hours"),
    // 24 bit alarm word, kept raw
    RegisterDescriptor::linear("Alarm_HI", 1.0, "bits"),
    RegisterDescriptor::linear("Alarm_LO", 1.0, "bits"),
    RegisterDescriptor::bitfield("Dip_Switch", DIP_SWITCHES),
    RegisterDescriptor::enumerated("LED_State", LED_STATES),
    RegisterDescriptor::linear("Power_out", P_FACTOR, "W"),
    RegisterDescriptor::linear("Sweep_Vmp", V_FACTOR, "V"),
    RegisterDescriptor::linear("Sweep_Pmax", P_FACTOR, "W"),
    RegisterDescriptor::linear("Sweep_Voc", V_FACTOR, "V"),
    RegisterDescriptor::linear("Vb_min_daily", V_FACTOR, "V"),
    RegisterDescriptor::linear("Vb_max_daily", V_FACTOR, "V"),
    RegisterDescriptor::linear("Ahc_daily", AH_FACTOR, "Ah"),
    RegisterDescriptor::linear("Ahl_daily", AH_FACTOR, "Ah"),
    RegisterDescriptor::linear("Array_Fault_daily", 1.0, "bits"),
    RegisterDescriptor::linear("Load_Fault_daily", 1.0, "bits"),
    RegisterDescriptor::linear("Alarm_HI_daily", 1.0, "bits"),
    RegisterDescriptor::linear("Alarm_LO_daily", 1.0, "bits"),
    RegisterDescriptor::linear("Vb_min", V_FACTOR, "V"),
    RegisterDescriptor::linear("Vb_max", V_FACTOR, "V"),
];

/// The positional register layout of a telemetry frame. Immutable once loaded.
#[derive(Debug, Clone)]
pub struct SchemaRegistry {
    descriptors: Vec<RegisterDescriptor>,
}

impl SchemaRegistry {
    /// Loads the SunSaver MPPT register table.
    pub fn load() -> Result<Self, SchemaError> {
        Self::from_descriptors(SUNSAVER_MPPT.to_vec())
    }

    /// Builds a registry from an arbitrary layout, rejecting tables the decoder
    /// could not walk safely.
    pub fn from_descriptors(descriptors: Vec<RegisterDescriptor>) -> Result<Self, SchemaError> {
        if descriptors.is_empty() {
            return Err(SchemaError::Empty);
        }

        let mut seen = HashSet::new();
        let mut iter = descriptors.iter().enumerate().peekable();

        while let Some((index, d)) = iter.next() {
            if d.name.is_empty() {
                return Err(SchemaError::EmptyName { index });
            }
            if !seen.insert(d.name) {
                return Err(SchemaError::DuplicateName { index, name: d.name.to_string() });
            }

            match d.mode {
                EncodingMode::Linear { factor, .. } | EncodingMode::HighWord { scale: factor }
                    if !factor.is_finite() =>
                {
                    return Err(SchemaError::InvalidFactor { name: d.name.to_string() });
                }
                EncodingMode::Enumerated { states } if states.is_empty() => {
                    return Err(SchemaError::EmptyTable { name: d.name.to_string() });
                }
                EncodingMode::Bitfield { rows } if rows.is_empty() => {
                    return Err(SchemaError::EmptyTable { name: d.name.to_string() });
                }
                EncodingMode::Bitfield { rows } if rows.len() > 16 => {
                    return Err(SchemaError::TooManyBits {
                        name: d.name.to_string(),
                        rows: rows.len(),
                    });
                }
                EncodingMode::LowWord { .. } => {
                    return Err(SchemaError::OrphanLowWord { index, name: d.name.to_string() });
                }
                EncodingMode::HighWord { .. } => {
                    // the low word is consumed here so the loop never sees it on its own
                    let Some((low_index, low)) = iter.next() else {
                        return Err(SchemaError::UnpairedHighWord { index, name: d.name.to_string() });
                    };
                    if !matches!(low.mode, EncodingMode::LowWord { .. }) {
                        return Err(SchemaError::UnpairedHighWord { index, name: d.name.to_string() });
                    }
                    if !d.name.ends_with(HIGH_SUFFIX) || !low.name.ends_with(LOW_SUFFIX) || d.stem() != low.stem() {
                        return Err(SchemaError::MismatchedPair {
                            high: d.name.to_string(),
                            low: low.name.to_string(),
                        });
                    }
                    if !seen.insert(low.name) {
                        return Err(SchemaError::DuplicateName {
                            index: low_index,
                            name: low.name.to_string(),
                        });
                    }
                }
                _ => {}
            }
        }

        debug!("register table loaded: {} registers", descriptors.len());

        Ok(Self { descriptors })
    }

    pub fn lookup(&self, index: usize) -> Option<&RegisterDescriptor> {
        self.descriptors.get(index)
    }

    pub fn len(&self) -> usize {
        self.descriptors.len()
    }

    pub fn is_empty(&self) -> bool {
        self.descriptors.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &RegisterDescriptor> {
        self.descriptors.iter()
    }

    /// SQL-friendly column names, one per register, in frame order.
    pub fn column_names(&self) -> Vec<String> {
        self.descriptors.iter().map(|d| d.name.to_lowercase()).collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sunsaver_table_loads() {
        let registry = SchemaRegistry::load().unwrap();
        assert_eq!(registry.len(), 45);
        assert_eq!(registry.lookup(0).unwrap().name, "Adc_vb_f");
        assert_eq!(registry.lookup(9).unwrap().name, "Charge_State");
        assert_eq!(registry.lookup(44).unwrap().name, "Vb_max");
        assert!(registry.lookup(45).is_none());
    }

    #[test]
    fn high_words_are_followed_by_their_low_word() {
        let registry = SchemaRegistry::load().unwrap();
        for (i, d) in registry.iter().enumerate() {
            if let EncodingMode::HighWord { .. } = d.mode {
                let next = registry.lookup(i + 1).unwrap();
                assert!(matches!(next.mode, EncodingMode::LowWord { .. }));
                assert_eq!(d.stem(), next.stem());
            }
        }
    }

    #[test]
    fn rejects_orphan_low_word() {
        let err = SchemaRegistry::from_descriptors(vec![
            RegisterDescriptor::linear("A", 1.0, "V"),
            RegisterDescriptor::low_word("B_LO", "Ah"),
        ])
        .unwrap_err();
        assert_eq!(err, SchemaError::OrphanLowWord { index: 1, name: "B_LO".to_string() });
    }

    #[test]
    fn rejects_high_word_at_end_of_table() {
        let err = SchemaRegistry::from_descriptors(vec![
            RegisterDescriptor::linear("A", 1.0, "V"),
            RegisterDescriptor::high_word("B_HI", 0.1),
        ])
        .unwrap_err();
        assert_eq!(err, SchemaError::UnpairedHighWord { index: 1, name: "B_HI".to_string() });
    }

    #[test]
    fn rejects_high_word_followed_by_linear() {
        let err = SchemaRegistry::from_descriptors(vec![
            RegisterDescriptor::high_word("B_HI", 0.1),
            RegisterDescriptor::linear("B_LO", 1.0, "Ah"),
        ])
        .unwrap_err();
        assert_eq!(err, SchemaError::UnpairedHighWord { index: 0, name: "B_HI".to_string() });
    }

    #[test]
    fn rejects_mismatched_pair() {
        let err = SchemaRegistry::from_descriptors(vec![
            RegisterDescriptor::high_word("Ahc_r_HI", 0.1),
            RegisterDescriptor::low_word("Ahc_t_LO", "Ah"),
        ])
        .unwrap_err();
        assert!(matches!(err, SchemaError::MismatchedPair { .. }));
    }

    #[test]
    fn rejects_empty_and_oversized_tables() {
        const NONE: &[&str] = &[];
        assert!(matches!(
            SchemaRegistry::from_descriptors(vec![RegisterDescriptor::enumerated("S", NONE)]),
            Err(SchemaError::EmptyTable { .. })
        ));

        const WIDE: &[BitRow] = &[BitRow::fault("x"); 17];
        assert!(matches!(
            SchemaRegistry::from_descriptors(vec![RegisterDescriptor::bitfield("F", WIDE)]),
            Err(SchemaError::TooManyBits { rows: 17, .. })
        ));

        assert_eq!(SchemaRegistry::from_descriptors(vec![]).unwrap_err(), SchemaError::Empty);
    }

    #[test]
    fn rejects_duplicate_names_and_bad_factors() {
        assert!(matches!(
            SchemaRegistry::from_descriptors(vec![
                RegisterDescriptor::linear("A", 1.0, "V"),
                RegisterDescriptor::linear("A", 1.0, "V"),
            ]),
            Err(SchemaError::DuplicateName { index: 1, .. })
        ));
        assert!(matches!(
            SchemaRegistry::from_descriptors(vec![RegisterDescriptor::linear("A", f64::NAN, "V")]),
            Err(SchemaError::InvalidFactor { .. })
        ));
    }

    #[test]
    fn column_names_follow_frame_order() {
        let registry = SchemaRegistry::load().unwrap();
        let columns = registry.column_names();
        assert_eq!(columns.len(), 45);
        assert_eq!(columns[13], "ahc_r_hi");
        assert_eq!(columns[14], "ahc_r_lo");
    }

    #[test]
    fn energy_counter_reports_kilowatt_hours() {
        let registry = SchemaRegistry::load().unwrap();
        let kwhc = registry.iter().find(|d| d.name == "KWhc").unwrap();
        assert!(matches!(kwhc.mode, EncodingMode::Linear { unit: "kWh", .. }));
    }
}
