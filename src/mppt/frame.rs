use crate::prelude::*;

use nom::{
    branch::alt,
    bytes::complete::{tag, take_until, take_while_m_n},
    combinator::{map_res, opt},
    IResult,
};

pub const START_MARKER: u8 = b'$';
pub const END_MARKER: u8 = b'*';

/// One validated telemetry message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Frame {
    pub header_id: String,
    pub firmware_rev: String,
    pub raw_registers: Vec<String>,
    pub checksum: u8,
}

impl Frame {
    /// Renders the frame back onto the wire, checksum and CRLF included.
    pub fn encode(&self) -> Vec<u8> {
        let mut payload = format!("{},{}", self.header_id, self.firmware_rev);
        for token in &self.raw_registers {
            payload.push(',');
            payload.push_str(token);
        }
        let checksum = checksum(payload.as_bytes());

        format!("${payload}*{checksum:02X}\r\n").into_bytes()
    }
}

/// XOR of every payload byte (the bytes strictly between `$` and `*`).
pub fn checksum(payload: &[u8]) -> u8 {
    payload.iter().fold(0, |acc, b| acc ^ b)
}

// $<payload>*<hex>[\r\n]
fn wire_frame(input: &[u8]) -> IResult<&[u8], (&[u8], u8)> {
    let (input, _) = take_until("$")(input)?;
    let (input, _) = tag("$")(input)?;
    let (input, payload) = take_until("*")(input)?;
    let (input, _) = tag("*")(input)?;
    let (input, transmitted) = map_res(
        take_while_m_n(1, 2, |b: u8| b.is_ascii_hexdigit()),
        |digits: &[u8]| {
            std::str::from_utf8(digits)
                .map_err(|_| ())
                .and_then(|s| u8::from_str_radix(s, 16).map_err(|_| ()))
        },
    )(input)?;
    let (input, _) = opt(alt((tag("\r\n"), tag("\r"), tag("\n"))))(input)?;

    Ok((input, (payload, transmitted)))
}

/// Splits and validates raw frames for a register layout of a known size.
#[derive(Debug, Clone, Copy)]
pub struct FrameCodec {
    register_count: usize,
}

impl FrameCodec {
    pub fn new(register_count: usize) -> Self {
        Self { register_count }
    }

    pub fn for_registry(registry: &SchemaRegistry) -> Self {
        Self::new(registry.len())
    }

    pub fn decode(&self, raw: &[u8]) -> Result<Frame, FrameError> {
        if !raw.contains(&START_MARKER) {
            return Err(FrameError::Format("no start marker".to_string()));
        }
        if !raw.contains(&END_MARKER) {
            return Err(FrameError::Format("no end of data marker".to_string()));
        }

        let (_, (payload, transmitted)) = wire_frame(raw)
            .map_err(|e| FrameError::Format(format!("unparsable frame: {:?}", e.map(|e| e.code))))?;

        let computed = checksum(payload);
        if computed != transmitted {
            return Err(FrameError::Checksum { transmitted, computed });
        }

        let payload = std::str::from_utf8(payload)
            .ok()
            .filter(|s| s.is_ascii())
            .ok_or_else(|| FrameError::Format("payload is not ASCII".to_string()))?;

        let mut tokens = payload.split(',').map(|t| t.trim().to_string());
        let header_id = tokens.next().unwrap_or_default();
        let firmware_rev = tokens
            .next()
            .ok_or_else(|| FrameError::Format("missing firmware revision".to_string()))?;
        let raw_registers: Vec<String> = tokens.collect();

        if raw_registers.len() < self.register_count {
            return Err(FrameError::Format(format!(
                "{} registers, expected {}",
                raw_registers.len(),
                self.register_count
            )));
        }
        if raw_registers.len() > self.register_count {
            debug!(
                "frame {} carries {} registers, decoding the first {}",
                header_id,
                raw_registers.len(),
                self.register_count
            );
        }

        Ok(Frame {
            header_id,
            firmware_rev,
            raw_registers,
            checksum: transmitted,
        })
    }
}
