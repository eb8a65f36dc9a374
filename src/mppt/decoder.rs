use crate::prelude::*;
use crate::mppt::schema::{BitRow, EncodingMode};

use chrono::{DateTime, Utc};
use serde::Serialize;

/// A decoded register value.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(untagged)]
pub enum FieldValue {
    Number(f64),
    State(&'static str),
    Flags(Vec<Flag>),
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Flag {
    pub label: &'static str,
    pub state: &'static str,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct DecodedField {
    pub name: &'static str,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub value: Option<FieldValue>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub unit: Option<&'static str>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl DecodedField {
    fn ok(name: &'static str, value: FieldValue, unit: Option<&'static str>) -> Self {
        Self {
            name,
            value: Some(value),
            unit,
            error: None,
        }
    }

    fn failed(name: &'static str, err: FieldDecodeError) -> Self {
        Self {
            name,
            value: None,
            unit: None,
            error: Some(err.to_string()),
        }
    }
}

/// Everything one successful poll of one station produced.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct DecodedRecord {
    pub station: String,
    pub timestamp: DateTime<Utc>,
    pub header_id: String,
    pub firmware_rev: String,
    pub fields: Vec<DecodedField>,
    /// Register values as transmitted, one per schema slot.
    pub raw: Vec<Option<i64>>,
    /// Seconds from report request to mode restore.
    pub comm_duration: f64,
}

impl DecodedRecord {
    pub fn field(&self, name: &str) -> Option<&DecodedField> {
        self.fields.iter().find(|f| f.name == name)
    }

    pub fn number(&self, name: &str) -> Option<f64> {
        match self.field(name)?.value {
            Some(FieldValue::Number(n)) => Some(n),
            _ => None,
        }
    }

    pub fn state(&self, name: &str) -> Option<&'static str> {
        match self.field(name)?.value {
            Some(FieldValue::State(s)) => Some(s),
            _ => None,
        }
    }

    pub fn errors(&self) -> impl Iterator<Item = &DecodedField> {
        self.fields.iter().filter(|f| f.error.is_some())
    }
}

fn parse_token(token: &str) -> Result<i64, FieldDecodeError> {
    token.trim().parse::<i64>().map_err(|_| FieldDecodeError::NotAnInteger {
        token: token.to_string(),
    })
}

fn word(token: &str) -> Result<i64, FieldDecodeError> {
    let value = parse_token(token)?;
    if !(0..=0xFFFF).contains(&value) {
        return Err(FieldDecodeError::WordOutOfRange { value });
    }
    Ok(value)
}

fn enumerated(value: i64, states: &'static [&'static str]) -> Result<FieldValue, FieldDecodeError> {
    usize::try_from(value)
        .ok()
        .and_then(|i| states.get(i))
        .map(|s| FieldValue::State(*s))
        .ok_or(FieldDecodeError::IndexOutOfRange {
            index: value,
            len: states.len(),
        })
}

fn bitfield(value: i64, rows: &'static [BitRow]) -> Result<FieldValue, FieldDecodeError> {
    if value < 0 {
        return Err(FieldDecodeError::NegativeBitfield { value });
    }
    let flags = rows
        .iter()
        .enumerate()
        .map(|(bit, row)| Flag {
            label: row.label,
            state: if (value >> bit) & 1 == 1 { row.set } else { row.clear },
        })
        .collect();
    Ok(FieldValue::Flags(flags))
}

/// Applies the register layout to a frame. Failures are confined to the field they
/// occur in; the record always comes back complete.
pub fn decode_all(
    frame: &Frame,
    registry: &SchemaRegistry,
    station: &str,
    timestamp: DateTime<Utc>,
    comm_duration: f64,
) -> DecodedRecord {
    let tokens = &frame.raw_registers;
    let token = |i: usize| tokens.get(i).map(String::as_str).unwrap_or("");

    let raw: Vec<Option<i64>> = (0..registry.len()).map(|i| parse_token(token(i)).ok()).collect();

    let mut fields = Vec::with_capacity(registry.len());
    let mut index = 0;

    while let Some(descriptor) = registry.lookup(index) {
        let name = descriptor.name;
        let at = index;

        let field = match descriptor.mode {
            EncodingMode::Linear { factor, unit } => match parse_token(token(index)) {
                Ok(v) => DecodedField::ok(name, FieldValue::Number(v as f64 * factor), Some(unit)),
                Err(e) => DecodedField::failed(name, e),
            },
            EncodingMode::Enumerated { states } => {
                match parse_token(token(index)).and_then(|v| enumerated(v, states)) {
                    Ok(value) => DecodedField::ok(name, value, None),
                    Err(e) => DecodedField::failed(name, e),
                }
            }
            EncodingMode::Bitfield { rows } => {
                match parse_token(token(index)).and_then(|v| bitfield(v, rows)) {
                    Ok(value) => DecodedField::ok(name, value, None),
                    Err(e) => DecodedField::failed(name, e),
                }
            }
            EncodingMode::HighWord { scale } => {
                let stem = descriptor.stem();
                // registry load guarantees the low word is next
                let unit = match registry.lookup(index + 1).map(|d| d.mode) {
                    Some(EncodingMode::LowWord { unit }) => unit,
                    _ => "",
                };
                let combined = word(token(index)).and_then(|hi| word(token(index + 1)).map(|lo| (hi << 16) | lo));
                index += 1;

                match combined {
                    Ok(v) => DecodedField::ok(stem, FieldValue::Number(v as f64 * scale), Some(unit)),
                    Err(e) => DecodedField::failed(stem, e),
                }
            }
            EncodingMode::LowWord { .. } => {
                // unreachable for a validated registry; skip the slot
                index += 1;
                continue;
            }
        };

        if let Some(err) = &field.error {
            warn!("{}: register {} ({}) not decoded: {}", station, at, field.name, err);
        }

        fields.push(field);
        index += 1;
    }

    DecodedRecord {
        station: station.to_string(),
        timestamp,
        header_id: frame.header_id.clone(),
        firmware_rev: frame.firmware_rev.clone(),
        fields,
        raw,
        comm_duration,
    }
}
