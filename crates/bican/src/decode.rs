//! Best-effort decoding of vendor payload fields
//!
//! Frames on this bus are frequently shorter than the largest offset their schema addresses, so
//! decoding never fails: a field whose bytes aren't present is simply left out of the result.
//! Everything that could be wrong with a field description is rejected when the registry is
//! built instead, see [crate::registry].
use std::collections::BTreeMap;
use std::fmt;

use byteorder::{BigEndian, ByteOrder, LittleEndian};
use chrono::{DateTime, Utc};
use indexmap::IndexMap;
use serde::{Deserialize, Serialize};

/// Label used when a raw value has no entry in a field's label table
pub const UNKNOWN_LABEL: &str = "Unknown";

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Endianness {
    #[default]
    Little,
    Big,
}

/// Raw value to display text
pub type Labels = BTreeMap<u8, String>;

/// A bit position within a single byte
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct BitIndex(u8);

impl BitIndex {
    pub fn new(bit: u8) -> Option<Self> {
        (bit < 8).then_some(Self(bit))
    }

    #[inline]
    #[must_use]
    pub fn get(self) -> u8 {
        self.0
    }
}

/// How to turn a signed day count into a human status
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StatusRule {
    /// Negative is overdue, zero is due today, positive is due in the future
    DaysUntilDue,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum DueStatus {
    Overdue { days: u32 },
    DueToday,
    DueIn { days: u32 },
}

impl StatusRule {
    #[must_use]
    pub fn evaluate(self, value: i16) -> DueStatus {
        match self {
            StatusRule::DaysUntilDue => match value {
                v if v < 0 => DueStatus::Overdue {
                    days: i32::from(v).unsigned_abs(),
                },
                0 => DueStatus::DueToday,
                v => DueStatus::DueIn { days: v as u32 },
            },
        }
    }
}

impl fmt::Display for DueStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DueStatus::Overdue { days } => write!(f, "OVERDUE by {days} days"),
            DueStatus::DueToday => write!(f, "DUE TODAY"),
            DueStatus::DueIn { days } => write!(f, "Due in {days} days"),
        }
    }
}

/// One decoder per field shape. Each variant carries exactly what it needs, so e.g. a bit index
/// on a 32-bit field can't be expressed.
#[derive(Clone, Debug, PartialEq)]
pub enum FieldKind {
    Unsigned16 {
        offsets: [usize; 2],
        endianness: Endianness,
    },
    Unsigned32 {
        offsets: [usize; 4],
        endianness: Endianness,
        /// When set, the value is seconds since this many seconds after the Unix epoch
        epoch_offset_seconds: Option<i64>,
    },
    Signed16 {
        offsets: [usize; 2],
        endianness: Endianness,
        status_rule: Option<StatusRule>,
    },
    NibbleLow {
        offset: usize,
        labels: Labels,
    },
    NibbleHigh {
        offset: usize,
        labels: Labels,
    },
    ByteEnum {
        offset: usize,
        labels: Labels,
    },
    SingleBit {
        offset: usize,
        bit: BitIndex,
        labels: Labels,
    },
}

impl FieldKind {
    /// The payload byte offsets this field reads
    #[must_use]
    pub fn offsets(&self) -> &[usize] {
        match self {
            FieldKind::Unsigned16 { offsets, .. } | FieldKind::Signed16 { offsets, .. } => {
                offsets.as_slice()
            }
            FieldKind::Unsigned32 { offsets, .. } => offsets.as_slice(),
            FieldKind::NibbleLow { offset, .. }
            | FieldKind::NibbleHigh { offset, .. }
            | FieldKind::ByteEnum { offset, .. }
            | FieldKind::SingleBit { offset, .. } => std::slice::from_ref(offset),
        }
    }
}

#[derive(Clone, Debug, PartialEq)]
pub struct FieldDecodeSpec {
    pub description: String,
    pub kind: FieldKind,
}

/// A decoded calendar time, or a marker for raw values that don't land on a representable date
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Timestamp {
    Valid(DateTime<Utc>),
    Invalid,
}

impl fmt::Display for Timestamp {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Timestamp::Valid(when) => write!(f, "{}", when.format("%Y-%m-%d %H:%M:%S UTC")),
            Timestamp::Invalid => write!(f, "invalid timestamp"),
        }
    }
}

#[derive(Clone, Debug, PartialEq)]
pub enum FieldValue {
    Unsigned16(u16),
    Unsigned32 {
        value: u32,
        timestamp: Option<Timestamp>,
    },
    Signed16 {
        value: i16,
        status: Option<DueStatus>,
    },
    Nibble {
        value: u8,
        /// The other half of the byte, kept for the breakdown display
        other: u8,
        label: Option<String>,
    },
    Enum {
        value: u8,
        label: Option<String>,
    },
    Bit {
        value: u8,
        byte: u8,
        bit: u8,
        label: Option<String>,
    },
}

impl FieldValue {
    /// The decoded number, widened so every kind fits
    #[must_use]
    pub fn as_i64(&self) -> i64 {
        match self {
            FieldValue::Unsigned16(value) => i64::from(*value),
            FieldValue::Unsigned32 { value, .. } => i64::from(*value),
            FieldValue::Signed16 { value, .. } => i64::from(*value),
            FieldValue::Nibble { value, .. }
            | FieldValue::Enum { value, .. }
            | FieldValue::Bit { value, .. } => i64::from(*value),
        }
    }

    #[must_use]
    pub fn label(&self) -> Option<&str> {
        match self {
            FieldValue::Nibble { label, .. }
            | FieldValue::Enum { label, .. }
            | FieldValue::Bit { label, .. } => label.as_deref(),
            _ => None,
        }
    }
}

#[derive(Clone, Debug, PartialEq)]
pub struct DecodedField {
    pub description: String,
    pub value: FieldValue,
}

impl fmt::Display for DecodedField {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let desc = &self.description;
        match &self.value {
            FieldValue::Unsigned16(value) => write!(f, "{desc}: {value} ({value:#06X})"),
            FieldValue::Unsigned32 { value, timestamp } => {
                write!(f, "{desc}: {value} ({value:#010X})")?;
                if let Some(timestamp) = timestamp {
                    write!(f, " = {timestamp}")?;
                }
                Ok(())
            }
            FieldValue::Signed16 { value, status } => match status {
                Some(status) => write!(f, "{desc}: {value} days -> {status}"),
                None => write!(f, "{desc}: {value}"),
            },
            FieldValue::Nibble {
                value,
                other,
                label,
            } => {
                write!(f, "{desc}: 0x{value:X} (other nibble 0x{other:X})")?;
                if let Some(label) = label {
                    write!(f, " = {label}")?;
                }
                Ok(())
            }
            FieldValue::Enum { value, label } => {
                write!(f, "{desc}: {value} ({value:#04X})")?;
                if let Some(label) = label {
                    write!(f, " = {label}")?;
                }
                Ok(())
            }
            FieldValue::Bit {
                value,
                byte,
                bit,
                label,
            } => {
                write!(f, "{desc}: byte {byte:#04X} bit {bit} = {value}")?;
                if let Some(label) = label {
                    write!(f, " ({label})")?;
                }
                Ok(())
            }
        }
    }
}

fn lookup(labels: &Labels, value: u8) -> Option<String> {
    if labels.is_empty() {
        return None;
    }
    Some(
        labels
            .get(&value)
            .cloned()
            .unwrap_or_else(|| UNKNOWN_LABEL.to_string()),
    )
}

fn gather<const N: usize>(payload: &[u8], offsets: &[usize; N]) -> Option<[u8; N]> {
    let mut bytes = [0; N];
    for (byte, offset) in bytes.iter_mut().zip(offsets) {
        *byte = *payload.get(*offset)?;
    }
    Some(bytes)
}

fn read_u16(bytes: &[u8; 2], endianness: Endianness) -> u16 {
    match endianness {
        Endianness::Little => LittleEndian::read_u16(bytes),
        Endianness::Big => BigEndian::read_u16(bytes),
    }
}

fn read_u32(bytes: &[u8; 4], endianness: Endianness) -> u32 {
    match endianness {
        Endianness::Little => LittleEndian::read_u32(bytes),
        Endianness::Big => BigEndian::read_u32(bytes),
    }
}

/// Convert seconds-since-`epoch_offset_seconds` into a calendar time
#[must_use]
pub fn epoch_timestamp(epoch_offset_seconds: i64, value: u32) -> Timestamp {
    epoch_offset_seconds
        .checked_add(i64::from(value))
        .and_then(|seconds| DateTime::<Utc>::from_timestamp(seconds, 0))
        .map_or(Timestamp::Invalid, Timestamp::Valid)
}

impl FieldKind {
    /// Decode this field, or `None` if the payload is too short
    #[must_use]
    pub fn decode(&self, payload: &[u8]) -> Option<FieldValue> {
        let value = match self {
            FieldKind::Unsigned16 {
                offsets,
                endianness,
            } => FieldValue::Unsigned16(read_u16(&gather(payload, offsets)?, *endianness)),
            FieldKind::Unsigned32 {
                offsets,
                endianness,
                epoch_offset_seconds,
            } => {
                let value = read_u32(&gather(payload, offsets)?, *endianness);
                FieldValue::Unsigned32 {
                    value,
                    timestamp: epoch_offset_seconds.map(|epoch| epoch_timestamp(epoch, value)),
                }
            }
            FieldKind::Signed16 {
                offsets,
                endianness,
                status_rule,
            } => {
                let value = read_u16(&gather(payload, offsets)?, *endianness) as i16;
                FieldValue::Signed16 {
                    value,
                    status: status_rule.map(|rule| rule.evaluate(value)),
                }
            }
            FieldKind::NibbleLow { offset, labels } => {
                let byte = *payload.get(*offset)?;
                let value = byte & 0x0F;
                FieldValue::Nibble {
                    value,
                    other: (byte >> 4) & 0x0F,
                    label: lookup(labels, value),
                }
            }
            FieldKind::NibbleHigh { offset, labels } => {
                let byte = *payload.get(*offset)?;
                let value = (byte >> 4) & 0x0F;
                FieldValue::Nibble {
                    value,
                    other: byte & 0x0F,
                    label: lookup(labels, value),
                }
            }
            FieldKind::ByteEnum { offset, labels } => {
                let value = *payload.get(*offset)?;
                FieldValue::Enum {
                    value,
                    label: lookup(labels, value),
                }
            }
            FieldKind::SingleBit {
                offset,
                bit,
                labels,
            } => {
                let byte = *payload.get(*offset)?;
                let value = (byte >> bit.get()) & 0x01;
                FieldValue::Bit {
                    value,
                    byte,
                    bit: bit.get(),
                    label: lookup(labels, value),
                }
            }
        };
        Some(value)
    }
}

/// Decode every field the payload is long enough for, in declaration order
pub fn decode(
    payload: &[u8],
    specs: &IndexMap<String, FieldDecodeSpec>,
) -> IndexMap<String, DecodedField> {
    let mut decoded = IndexMap::with_capacity(specs.len());
    for (name, spec) in specs {
        match spec.kind.decode(payload) {
            Some(value) => {
                decoded.insert(
                    name.clone(),
                    DecodedField {
                        description: spec.description.clone(),
                        value,
                    },
                );
            }
            None => tracing::debug!(
                "Skipping field {name:?}: needs bytes {:?} of a {}-byte payload",
                spec.kind.offsets(),
                payload.len()
            ),
        }
    }
    decoded
}

#[cfg(test)]
mod tests {
    use pretty_assertions::assert_eq;

    use super::*;

    const EPOCH_2016: i64 = 1451606400;

    fn specs(fields: &[(&str, FieldKind)]) -> IndexMap<String, FieldDecodeSpec> {
        fields
            .iter()
            .map(|(name, kind)| {
                (
                    name.to_string(),
                    FieldDecodeSpec {
                        description: name.to_string(),
                        kind: kind.clone(),
                    },
                )
            })
            .collect()
    }

    fn decode_one(payload: &[u8], kind: FieldKind) -> Option<FieldValue> {
        kind.decode(payload)
    }

    #[test]
    fn test_unsigned16_endianness() {
        let le = FieldKind::Unsigned16 {
            offsets: [0, 1],
            endianness: Endianness::Little,
        };
        let be = FieldKind::Unsigned16 {
            offsets: [0, 1],
            endianness: Endianness::Big,
        };
        assert_eq!(
            decode_one(&[0x34, 0x12], le),
            Some(FieldValue::Unsigned16(0x1234))
        );
        assert_eq!(
            decode_one(&[0x34, 0x12], be),
            Some(FieldValue::Unsigned16(0x3412))
        );
    }

    #[test]
    fn test_offsets_need_not_be_contiguous() {
        let kind = FieldKind::Unsigned16 {
            offsets: [3, 1],
            endianness: Endianness::Little,
        };
        assert_eq!(
            decode_one(&[0x00, 0xAB, 0x00, 0xCD], kind),
            Some(FieldValue::Unsigned16(0xABCD))
        );
    }

    #[test]
    fn test_unsigned_round_trip() {
        let u16_kind = FieldKind::Unsigned16 {
            offsets: [2, 3],
            endianness: Endianness::Little,
        };
        for value in [0u16, 1, 0x00FF, 0x0100, 0x7FFF, 0x8000, 0xBEEF, u16::MAX] {
            let [lo, hi] = value.to_le_bytes();
            let payload = [0xAA, 0xAA, lo, hi];
            assert_eq!(
                u16_kind.decode(&payload),
                Some(FieldValue::Unsigned16(value))
            );
        }

        let u32_kind = FieldKind::Unsigned32 {
            offsets: [3, 4, 5, 6],
            endianness: Endianness::Little,
            epoch_offset_seconds: None,
        };
        for value in [0u32, 1, 0xFF, 0x0102_0304, 0x8000_0000, u32::MAX] {
            let mut payload = [0u8; 8];
            payload[3..7].copy_from_slice(&value.to_le_bytes());
            assert_eq!(
                u32_kind.decode(&payload),
                Some(FieldValue::Unsigned32 {
                    value,
                    timestamp: None
                })
            );
        }
    }

    #[test]
    fn test_signed16_full_range() {
        let kind = FieldKind::Signed16 {
            offsets: [0, 1],
            endianness: Endianness::Little,
            status_rule: None,
        };
        for value in (i16::MIN..=i16::MAX).step_by(97).chain([i16::MIN, -1, 0, i16::MAX]) {
            let payload = value.to_le_bytes();
            assert_eq!(
                kind.decode(&payload),
                Some(FieldValue::Signed16 {
                    value,
                    status: None
                })
            );
        }
    }

    #[test]
    fn test_status_rule() {
        let rule = StatusRule::DaysUntilDue;
        assert_eq!(rule.evaluate(-3), DueStatus::Overdue { days: 3 });
        assert_eq!(rule.evaluate(0), DueStatus::DueToday);
        assert_eq!(rule.evaluate(12), DueStatus::DueIn { days: 12 });
        assert_eq!(rule.evaluate(i16::MIN), DueStatus::Overdue { days: 32768 });

        assert_eq!(rule.evaluate(-3).to_string(), "OVERDUE by 3 days");
        assert_eq!(rule.evaluate(0).to_string(), "DUE TODAY");
        assert_eq!(rule.evaluate(12).to_string(), "Due in 12 days");
    }

    #[test]
    fn test_signed16_with_status() {
        let kind = FieldKind::Signed16 {
            offsets: [0, 1],
            endianness: Endianness::Little,
            status_rule: Some(StatusRule::DaysUntilDue),
        };
        // -2 days
        assert_eq!(
            kind.decode(&[0xFE, 0xFF]),
            Some(FieldValue::Signed16 {
                value: -2,
                status: Some(DueStatus::Overdue { days: 2 })
            })
        );
    }

    #[test]
    fn test_epoch_timestamp() {
        let kind = FieldKind::Unsigned32 {
            offsets: [0, 1, 2, 3],
            endianness: Endianness::Little,
            epoch_offset_seconds: Some(EPOCH_2016),
        };
        let Some(FieldValue::Unsigned32 {
            value,
            timestamp: Some(timestamp),
        }) = kind.decode(&[0, 0, 0, 0])
        else {
            panic!("expected a timestamp");
        };
        assert_eq!(value, 0);
        assert_eq!(timestamp.to_string(), "2016-01-01 00:00:00 UTC");

        // One day and one second later
        let seconds = 86_401u32.to_le_bytes();
        let Some(FieldValue::Unsigned32 {
            timestamp: Some(timestamp),
            ..
        }) = kind.decode(&seconds)
        else {
            panic!("expected a timestamp");
        };
        assert_eq!(timestamp.to_string(), "2016-01-02 00:00:01 UTC");
    }

    #[test]
    fn test_unrepresentable_timestamp_is_marked() {
        assert_eq!(epoch_timestamp(i64::MAX, 1), Timestamp::Invalid);
        assert_eq!(epoch_timestamp(i64::MAX - 10, 0), Timestamp::Invalid);
        assert_eq!(Timestamp::Invalid.to_string(), "invalid timestamp");
    }

    #[test]
    fn test_nibbles() {
        let labels: Labels = [(0, "Fail"), (1, "Pass")]
            .into_iter()
            .map(|(k, v)| (k, v.to_string()))
            .collect();
        let low = FieldKind::NibbleLow {
            offset: 0,
            labels: labels.clone(),
        };
        let high = FieldKind::NibbleHigh {
            offset: 0,
            labels: Labels::new(),
        };
        assert_eq!(
            low.decode(&[0xA1]),
            Some(FieldValue::Nibble {
                value: 0x1,
                other: 0xA,
                label: Some("Pass".to_string())
            })
        );
        assert_eq!(
            high.decode(&[0xA1]),
            Some(FieldValue::Nibble {
                value: 0xA,
                other: 0x1,
                label: None
            })
        );
    }

    #[test]
    fn test_byte_enum_unknown_label() {
        let labels: Labels = [(0, "Completed".to_string())].into_iter().collect();
        let kind = FieldKind::ByteEnum { offset: 1, labels };
        assert_eq!(
            kind.decode(&[0x00, 0x07]),
            Some(FieldValue::Enum {
                value: 7,
                label: Some(UNKNOWN_LABEL.to_string())
            })
        );
    }

    #[test]
    fn test_bit_isolation() {
        let kind = FieldKind::SingleBit {
            offset: 0,
            bit: BitIndex::new(0).unwrap(),
            labels: Labels::new(),
        };
        assert_eq!(kind.decode(&[0b0000_0001]).unwrap().as_i64(), 1);
        assert_eq!(kind.decode(&[0b0000_0010]).unwrap().as_i64(), 0);

        let kind = FieldKind::SingleBit {
            offset: 0,
            bit: BitIndex::new(7).unwrap(),
            labels: Labels::new(),
        };
        assert_eq!(kind.decode(&[0b1000_0000]).unwrap().as_i64(), 1);
        assert!(BitIndex::new(8).is_none());
    }

    #[test]
    fn test_missing_field_is_omitted() {
        let specs = specs(&[
            (
                "timestamp",
                FieldKind::Unsigned32 {
                    offsets: [0, 1, 2, 3],
                    endianness: Endianness::Little,
                    epoch_offset_seconds: None,
                },
            ),
            (
                "status",
                FieldKind::ByteEnum {
                    offset: 0,
                    labels: Labels::new(),
                },
            ),
        ]);
        let decoded = decode(&[0x05], &specs);
        assert_eq!(decoded.len(), 1);
        assert!(!decoded.contains_key("timestamp"));
        assert_eq!(decoded["status"].value.as_i64(), 5);

        assert!(decode(&[], &specs).is_empty());
    }

    #[test]
    fn test_decode_preserves_declaration_order() {
        let specs = specs(&[
            (
                "z",
                FieldKind::ByteEnum {
                    offset: 1,
                    labels: Labels::new(),
                },
            ),
            (
                "a",
                FieldKind::ByteEnum {
                    offset: 0,
                    labels: Labels::new(),
                },
            ),
        ]);
        let decoded = decode(&[1, 2], &specs);
        let names: Vec<_> = decoded.keys().map(String::as_str).collect();
        assert_eq!(names, ["z", "a"]);
    }

    #[test]
    fn test_display() {
        let field = DecodedField {
            description: "Combined Cycle Number".to_string(),
            value: FieldValue::Unsigned16(0x0102),
        };
        assert_eq!(field.to_string(), "Combined Cycle Number: 258 (0x0102)");

        let field = DecodedField {
            description: "Days from Due".to_string(),
            value: FieldValue::Signed16 {
                value: 0,
                status: Some(DueStatus::DueToday),
            },
        };
        assert_eq!(field.to_string(), "Days from Due: 0 days -> DUE TODAY");

        let field = DecodedField {
            description: "Product In-Use Status".to_string(),
            value: FieldValue::Bit {
                value: 1,
                byte: 0x03,
                bit: 0,
                label: Some("In Use".to_string()),
            },
        };
        assert_eq!(
            field.to_string(),
            "Product In-Use Status: byte 0x03 bit 0 = 1 (In Use)"
        );
    }
}
