use std::fmt;
use std::io::Write;
use std::time::Instant;

use eyre::WrapErr;
use itertools::Itertools;
use serde::ser::SerializeStruct;

pub const MAX_STANDARD_ID: u32 = 0x7FF;
pub const MAX_EXTENDED_ID: u32 = 0x1FFF_FFFF;
pub const MAX_DLC: usize = 8;

/// A single classic CAN frame, either about to be sent or as observed on the bus
///
/// Frames are immutable once built. The payload is stored inline like it is on the wire, with the
/// DLC selecting how much of it is meaningful.
#[derive(Clone, Debug, Default, Eq)]
pub struct ObservedFrame {
    pub identifier: u32,
    pub extended: bool,
    /// Monotonic arrival time. Only set on frames that went through a receive path
    pub capture_time: Option<Instant>,

    dlc: usize,
    data: [u8; MAX_DLC],
}

/// Frames are compared by what was on the bus, not by when they showed up
impl PartialEq for ObservedFrame {
    fn eq(&self, other: &Self) -> bool {
        self.identifier == other.identifier
            && self.extended == other.extended
            && self.payload() == other.payload()
    }
}

impl ObservedFrame {
    /// Build a frame, validating the identifier width and payload length
    pub fn new(identifier: u32, extended: bool, payload: &[u8]) -> eyre::Result<Self> {
        let max_id = if extended {
            MAX_EXTENDED_ID
        } else {
            MAX_STANDARD_ID
        };
        if identifier > max_id {
            eyre::bail!(
                "Identifier {identifier:#X} does not fit in a {} identifier",
                if extended { "29-bit" } else { "11-bit" }
            );
        }
        if payload.len() > MAX_DLC {
            eyre::bail!(
                "Payload length {} exceeds the maximum of {MAX_DLC} bytes",
                payload.len()
            );
        }

        let mut data = [0; MAX_DLC];
        data[..payload.len()].copy_from_slice(payload);
        Ok(Self {
            identifier,
            extended,
            capture_time: None,
            dlc: payload.len(),
            data,
        })
    }

    /// Build a frame, using an extended identifier iff it doesn't fit in 11 bits
    pub fn inferred(identifier: u32, payload: &[u8]) -> eyre::Result<Self> {
        Self::new(identifier, identifier > MAX_STANDARD_ID, payload)
    }

    /// Stamp the frame with its arrival time
    #[must_use]
    pub fn captured_at(mut self, when: Instant) -> Self {
        self.capture_time = Some(when);
        self
    }

    #[inline]
    #[must_use]
    pub fn payload(&self) -> &[u8] {
        &self.data[..self.dlc]
    }

    #[inline]
    #[must_use]
    pub fn dlc(&self) -> usize {
        self.dlc
    }

    /// Write the frame as a `candump -L` line
    pub fn write_candump<W: Write>(
        &self,
        writer: &mut W,
        timestamp: f64,
        interface: &str,
    ) -> std::io::Result<()> {
        writeln!(
            writer,
            "({timestamp:.6}) {interface} {}#{}",
            self.candump_id(),
            hex::encode_upper(self.payload())
        )
    }

    /// Extended identifiers are always rendered with 8 digits, standard ones with 3
    fn candump_id(&self) -> String {
        if self.extended {
            format!("{:08X}", self.identifier)
        } else {
            format!("{:03X}", self.identifier)
        }
    }
}

/// Render bytes the way the bench tooling always has: `01 A0 FF`
pub fn format_payload(payload: &[u8]) -> String {
    payload.iter().map(|b| format!("{b:02X}")).join(" ")
}

impl fmt::Display for ObservedFrame {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "ID=0x{:X} ({}) DLC={} [{}]",
            self.identifier,
            if self.extended { "Ext" } else { "Std" },
            self.dlc,
            format_payload(self.payload())
        )
    }
}

impl serde::Serialize for ObservedFrame {
    fn serialize<S: serde::Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        let mut state = serializer.serialize_struct("ObservedFrame", 4)?;
        state.serialize_field("canid", &format!("{:#X}", self.identifier))?;
        state.serialize_field("extended", &self.extended)?;
        state.serialize_field("dlc", &self.dlc)?;
        state.serialize_field("data", &hex::encode_upper(self.payload()))?;
        state.end()
    }
}

/// Parse a CAN identifier given as hex, with or without a `0x` prefix
pub fn parse_identifier(text: &str) -> eyre::Result<u32> {
    let trimmed = text.trim();
    let digits = trimmed
        .strip_prefix("0x")
        .or_else(|| trimmed.strip_prefix("0X"))
        .unwrap_or(trimmed);
    let identifier = u32::from_str_radix(digits, 16)
        .wrap_err(format!("Failed to parse identifier {text:?} as hex"))?;
    if identifier > MAX_EXTENDED_ID {
        eyre::bail!("Identifier {identifier:#X} exceeds 29 bits");
    }
    Ok(identifier)
}

/// Parse payload bytes from text
///
/// Accepts hex tokens separated by spaces, commas, or dashes (`01 02 03`, `01,02,03`), each with
/// an optional `0x` prefix, as well as a single compact token like `010203`.
pub fn parse_payload(text: &str) -> eyre::Result<Vec<u8>> {
    let tokens: Vec<&str> = text
        .split(|c: char| c.is_ascii_whitespace() || c == ',' || c == '-')
        .filter(|t| !t.is_empty())
        .collect();

    let mut payload = Vec::new();
    if let [compact] = tokens.as_slice()
        && compact.len() > 2
        && !compact.starts_with("0x")
        && !compact.starts_with("0X")
    {
        payload = hex::decode(compact).wrap_err(format!("Failed to parse payload {text:?}"))?;
    } else {
        for token in tokens {
            payload.push(parse_byte(token)?);
        }
    }

    if payload.len() > MAX_DLC {
        eyre::bail!(
            "Payload length {} exceeds the maximum of {MAX_DLC} bytes",
            payload.len()
        );
    }
    Ok(payload)
}

pub(crate) fn parse_byte(token: &str) -> eyre::Result<u8> {
    let digits = token
        .strip_prefix("0x")
        .or_else(|| token.strip_prefix("0X"))
        .unwrap_or(token);
    if digits.is_empty() || digits.len() > 2 {
        eyre::bail!("Byte value {token:?} out of range (00-FF)");
    }
    u8::from_str_radix(digits, 16).wrap_err(format!("Invalid byte value {token:?}"))
}
