//! The catalog of known messages
//!
//! Definitions are loaded once, from the built-in catalog or a JSON file of the same shape, and
//! are immutable afterwards. Every check that could fail on a definition happens here, so the
//! decoders and matchers downstream can't encounter a malformed schema at runtime.
use std::collections::BTreeMap;
use std::path::Path;
use std::sync::Arc;

use eyre::WrapErr;
use indexmap::IndexMap;
use serde::Deserialize;

use crate::decode::{
    BitIndex, DecodedField, Endianness, FieldDecodeSpec, FieldKind, Labels, StatusRule, decode,
};
use crate::frame::{MAX_DLC, MAX_EXTENDED_ID, MAX_STANDARD_ID, parse_identifier};
use crate::matcher::{MatchTarget, PayloadPattern};

const BUILTIN_MESSAGES: &str = include_str!("messages.json");

/// A named class of frames, and how to make sense of their payloads
#[derive(Clone, Debug, PartialEq)]
pub struct MessageDefinition {
    pub name: String,
    pub description: String,
    pub identifier: u32,
    pub extended: bool,
    /// `None` matches any payload
    pub payload_pattern: Option<PayloadPattern>,
    /// Documentation only
    pub byte_descriptions: BTreeMap<usize, String>,
    pub field_decoders: IndexMap<String, FieldDecodeSpec>,
    pub notes: Vec<String>,
}

impl MessageDefinition {
    /// Decode the fields of the given payload, skipping any the payload is too short for
    pub fn decode(&self, payload: &[u8]) -> IndexMap<String, DecodedField> {
        decode(payload, &self.field_decoders)
    }

    /// Pair each payload byte that has a description with that description
    pub fn byte_breakdown<'a>(
        &'a self,
        payload: &'a [u8],
    ) -> impl Iterator<Item = (usize, u8, &'a str)> + 'a {
        payload.iter().enumerate().filter_map(move |(offset, byte)| {
            self.byte_descriptions
                .get(&offset)
                .map(|desc| (offset, *byte, desc.as_str()))
        })
    }

    /// The number of payload bytes the schema describes or decodes
    #[must_use]
    pub fn described_len(&self) -> usize {
        let described = self.byte_descriptions.keys().max().map(|o| o + 1);
        let decoded = self
            .field_decoders
            .values()
            .flat_map(|spec| spec.kind.offsets())
            .max()
            .map(|o| o + 1);
        let pattern = self.payload_pattern.as_ref().map(PayloadPattern::len);
        [described, decoded, pattern]
            .into_iter()
            .flatten()
            .max()
            .unwrap_or(0)
    }
}

/// An identifier written either as a JSON number or as hex text
#[derive(Debug, Deserialize)]
#[serde(untagged)]
pub(crate) enum RawIdentifier {
    Number(u32),
    Text(String),
}

impl RawIdentifier {
    pub(crate) fn resolve(self) -> eyre::Result<u32> {
        match self {
            RawIdentifier::Number(identifier) => Ok(identifier),
            RawIdentifier::Text(text) => parse_identifier(&text),
        }
    }
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "snake_case")]
enum RawKind {
    Unsigned16,
    Unsigned32,
    Signed16,
    NibbleLow,
    NibbleHigh,
    ByteEnum,
    SingleBit,
}

impl RawKind {
    fn arity(&self) -> usize {
        match self {
            RawKind::Unsigned16 | RawKind::Signed16 => 2,
            RawKind::Unsigned32 => 4,
            RawKind::NibbleLow | RawKind::NibbleHigh | RawKind::ByteEnum | RawKind::SingleBit => 1,
        }
    }
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
struct RawField {
    kind: RawKind,
    byte_offsets: Vec<usize>,
    #[serde(default)]
    description: Option<String>,
    #[serde(default)]
    endianness: Option<Endianness>,
    #[serde(default)]
    bit_index: Option<u8>,
    #[serde(default)]
    enum_labels: Option<Labels>,
    #[serde(default)]
    epoch_offset_seconds: Option<i64>,
    #[serde(default)]
    status_rule: Option<StatusRule>,
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
struct RawMessage {
    name: String,
    #[serde(default)]
    description: String,
    identifier: RawIdentifier,
    extended: bool,
    #[serde(default)]
    payload_pattern: Option<Vec<Option<u8>>>,
    #[serde(default)]
    byte_descriptions: BTreeMap<usize, String>,
    #[serde(default)]
    field_decoders: IndexMap<String, RawField>,
    #[serde(default)]
    notes: Vec<String>,
}

impl RawField {
    fn into_spec(self, name: &str) -> eyre::Result<FieldDecodeSpec> {
        let arity = self.kind.arity();
        if self.byte_offsets.len() != arity {
            eyre::bail!(
                "{:?} needs exactly {arity} byte offset(s), got {:?}",
                self.kind,
                self.byte_offsets
            );
        }
        if let Some(offset) = self.byte_offsets.iter().find(|o| **o >= MAX_DLC) {
            eyre::bail!("Byte offset {offset} is past the end of an {MAX_DLC}-byte payload");
        }
        if self.bit_index.is_some() && !matches!(self.kind, RawKind::SingleBit) {
            eyre::bail!("bit_index only applies to single_bit fields");
        }
        if self.epoch_offset_seconds.is_some() && !matches!(self.kind, RawKind::Unsigned32) {
            eyre::bail!("epoch_offset_seconds only applies to unsigned32 fields");
        }
        if self.status_rule.is_some() && !matches!(self.kind, RawKind::Signed16) {
            eyre::bail!("status_rule only applies to signed16 fields");
        }
        if self.endianness.is_some() && arity == 1 {
            eyre::bail!("endianness only applies to multi-byte fields");
        }
        if self.enum_labels.is_some() && arity != 1 {
            eyre::bail!("enum_labels only apply to single-byte fields");
        }

        let endianness = self.endianness.unwrap_or_default();
        let labels = self.enum_labels.unwrap_or_default();
        let offsets = &self.byte_offsets;
        let kind = match self.kind {
            RawKind::Unsigned16 => FieldKind::Unsigned16 {
                offsets: [offsets[0], offsets[1]],
                endianness,
            },
            RawKind::Unsigned32 => FieldKind::Unsigned32 {
                offsets: [offsets[0], offsets[1], offsets[2], offsets[3]],
                endianness,
                epoch_offset_seconds: self.epoch_offset_seconds,
            },
            RawKind::Signed16 => FieldKind::Signed16 {
                offsets: [offsets[0], offsets[1]],
                endianness,
                status_rule: self.status_rule,
            },
            RawKind::NibbleLow => FieldKind::NibbleLow {
                offset: offsets[0],
                labels,
            },
            RawKind::NibbleHigh => FieldKind::NibbleHigh {
                offset: offsets[0],
                labels,
            },
            RawKind::ByteEnum => FieldKind::ByteEnum {
                offset: offsets[0],
                labels,
            },
            RawKind::SingleBit => {
                let Some(bit) = self.bit_index else {
                    eyre::bail!("single_bit fields need a bit_index");
                };
                let Some(bit) = BitIndex::new(bit) else {
                    eyre::bail!("bit_index {bit} is out of range 0-7");
                };
                FieldKind::SingleBit {
                    offset: offsets[0],
                    bit,
                    labels,
                }
            }
        };

        Ok(FieldDecodeSpec {
            description: self.description.unwrap_or_else(|| name.to_string()),
            kind,
        })
    }
}

impl RawMessage {
    fn into_definition(self) -> eyre::Result<MessageDefinition> {
        if self.name.trim().is_empty() {
            eyre::bail!("Message names can't be empty");
        }
        let name = self.name;
        let identifier = self.identifier.resolve()?;
        let max_id = if self.extended {
            MAX_EXTENDED_ID
        } else {
            MAX_STANDARD_ID
        };
        if identifier > max_id {
            eyre::bail!("{name}: identifier {identifier:#X} exceeds its ID width");
        }

        let payload_pattern = self
            .payload_pattern
            .map(PayloadPattern::new)
            .transpose()
            .wrap_err(format!("{name}: invalid payload_pattern"))?;

        if let Some(offset) = self.byte_descriptions.keys().find(|o| **o >= MAX_DLC) {
            eyre::bail!("{name}: byte description for offset {offset} is past the payload");
        }

        let mut field_decoders = IndexMap::with_capacity(self.field_decoders.len());
        for (field, raw) in self.field_decoders {
            let spec = raw
                .into_spec(&field)
                .wrap_err(format!("{name}: invalid decoder for field {field:?}"))?;
            field_decoders.insert(field, spec);
        }

        Ok(MessageDefinition {
            name,
            description: self.description,
            identifier,
            extended: self.extended,
            payload_pattern,
            byte_descriptions: self.byte_descriptions,
            field_decoders,
            notes: self.notes,
        })
    }
}

/// The read-only set of [MessageDefinition]s, in the order they were defined
#[derive(Clone, Debug, Default)]
pub struct Registry {
    messages: IndexMap<String, Arc<MessageDefinition>>,
}

impl Registry {
    /// The catalog shipped with the tools
    pub fn builtin() -> eyre::Result<Self> {
        Self::from_json(BUILTIN_MESSAGES).wrap_err("Built-in message catalog is invalid")
    }

    /// Load a catalog from a JSON array of definitions
    pub fn from_json(json: &str) -> eyre::Result<Self> {
        let raw: Vec<RawMessage> =
            serde_json::from_str(json).wrap_err("Failed to parse message catalog")?;
        let definitions = raw
            .into_iter()
            .map(RawMessage::into_definition)
            .collect::<eyre::Result<Vec<_>>>()?;
        Self::from_definitions(definitions)
    }

    pub fn from_path(path: &Path) -> eyre::Result<Self> {
        let json = std::fs::read_to_string(path)
            .wrap_err(format!("Failed to read message catalog {path:?}"))?;
        Self::from_json(&json).wrap_err(format!("Invalid message catalog {path:?}"))
    }

    pub fn from_definitions(
        definitions: impl IntoIterator<Item = MessageDefinition>,
    ) -> eyre::Result<Self> {
        let mut messages = IndexMap::new();
        for definition in definitions {
            if messages.contains_key(&definition.name) {
                eyre::bail!("Duplicate message definition {:?}", definition.name);
            }
            messages.insert(definition.name.clone(), Arc::new(definition));
        }
        tracing::debug!("Loaded {} message definitions", messages.len());
        Ok(Self { messages })
    }

    #[must_use]
    pub fn get(&self, name: &str) -> Option<&Arc<MessageDefinition>> {
        self.messages.get(name).or_else(|| {
            self.messages
                .iter()
                .find(|(key, _)| key.eq_ignore_ascii_case(name))
                .map(|(_, definition)| definition)
        })
    }

    /// Look up a definition by name, failing if it's unknown
    pub fn resolve(&self, name: &str) -> eyre::Result<&Arc<MessageDefinition>> {
        let name = name.trim();
        self.get(name).ok_or_else(|| {
            eyre::eyre!(
                "Unknown message {name:?}. Known messages: {}",
                itertools::join(self.messages.keys(), ", ")
            )
        })
    }

    /// Build match targets for the given names, failing on the first unknown name
    pub fn targets<S: AsRef<str>>(&self, names: &[S]) -> eyre::Result<Vec<MatchTarget>> {
        names
            .iter()
            .map(|name| self.resolve(name.as_ref()).map(MatchTarget::from_definition))
            .collect()
    }

    /// The first definition describing frames with the given identifier, if any
    #[must_use]
    pub fn find_by_identifier(&self, identifier: u32) -> Option<&Arc<MessageDefinition>> {
        self.messages
            .values()
            .find(|definition| definition.identifier == identifier)
    }

    pub fn iter(&self) -> impl Iterator<Item = &Arc<MessageDefinition>> {
        self.messages.values()
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.messages.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.messages.is_empty()
    }
}
