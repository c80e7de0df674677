//! FC 08 date/time payloads
//!
//! The nodes keep time as seconds since 2016-01-01 00:00:00 UTC, sent as a little-endian `u32`
//! followed by one reserved byte.
use chrono::{DateTime, NaiveDateTime, Utc};
use eyre::WrapErr;

use crate::decode::FieldKind;
use crate::registry::MessageDefinition;

/// Unix time of 2016-01-01 00:00:00 UTC
pub const DATETIME_EPOCH_SECONDS: i64 = 1_451_606_400;

/// Layout accepted by [parse_datetime]
pub const DATETIME_FORMAT: &str = "%Y-%m-%d %H:%M:%S";

/// Does this message carry a date/time stamp that can be generated?
#[must_use]
pub fn is_datetime_message(definition: &MessageDefinition) -> bool {
    definition.field_decoders.values().any(|spec| {
        matches!(
            spec.kind,
            FieldKind::Unsigned32 {
                epoch_offset_seconds: Some(DATETIME_EPOCH_SECONDS),
                ..
            }
        )
    })
}

/// Build the 5-byte payload for the given count of seconds since 2016-01-01
#[must_use]
pub fn encode_seconds(seconds: u32) -> [u8; 5] {
    let [b0, b1, b2, b3] = seconds.to_le_bytes();
    [b0, b1, b2, b3, 0x00]
}

/// Seconds between 2016-01-01 and `when`
pub fn seconds_since_epoch(when: DateTime<Utc>) -> eyre::Result<u32> {
    let seconds = when.timestamp() - DATETIME_EPOCH_SECONDS;
    if seconds < 0 {
        eyre::bail!("{when} is before 2016-01-01 00:00:00 UTC and can't be encoded");
    }
    u32::try_from(seconds).wrap_err(format!("{when} is too far in the future to be encoded"))
}

pub fn encode_datetime(when: DateTime<Utc>) -> eyre::Result<[u8; 5]> {
    seconds_since_epoch(when).map(encode_seconds)
}

/// Parse a `YYYY-MM-DD HH:MM:SS` UTC time
pub fn parse_datetime(text: &str) -> eyre::Result<DateTime<Utc>> {
    let naive = NaiveDateTime::parse_from_str(text.trim(), DATETIME_FORMAT).wrap_err(format!(
        "Invalid datetime {text:?}, expected YYYY-MM-DD HH:MM:SS"
    ))?;
    Ok(naive.and_utc())
}
