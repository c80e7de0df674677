use std::fmt;
use std::str::FromStr;
use std::sync::Arc;

use serde::{Deserialize, Serialize};

use crate::frame::{MAX_DLC, ObservedFrame, parse_byte};
use crate::registry::MessageDefinition;

/// Byte pattern where `None` positions match anything
///
/// A pattern constrains a prefix of the payload. Bytes past the end of the pattern are ignored,
/// so `[FF 00 81]` matches `FF 00 81 02`.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct PayloadPattern(Vec<Option<u8>>);

impl PayloadPattern {
    pub fn new(bytes: Vec<Option<u8>>) -> eyre::Result<Self> {
        if bytes.len() > MAX_DLC {
            eyre::bail!(
                "Pattern length {} exceeds the maximum of {MAX_DLC} bytes",
                bytes.len()
            );
        }
        Ok(Self(bytes))
    }

    /// A pattern with no wildcards
    pub fn exact(bytes: &[u8]) -> eyre::Result<Self> {
        Self::new(bytes.iter().copied().map(Some).collect())
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.0.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    #[must_use]
    pub fn bytes(&self) -> &[Option<u8>] {
        &self.0
    }

    #[must_use]
    pub fn matches(&self, payload: &[u8]) -> bool {
        payload.len() >= self.0.len()
            && self
                .0
                .iter()
                .zip(payload)
                .all(|(expected, actual)| expected.is_none_or(|e| e == *actual))
    }
}

fn is_wildcard(token: &str) -> bool {
    matches!(token.to_ascii_uppercase().as_str(), "X" | "XX" | "*" | "?")
}

/// Parses `FF,00,XX` or `FF 00 *`. `X`, `XX`, `*`, and `?` are wildcards
impl FromStr for PayloadPattern {
    type Err = eyre::Report;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let mut bytes = Vec::new();
        for token in s
            .split(|c: char| c.is_ascii_whitespace() || c == ',')
            .filter(|t| !t.is_empty())
        {
            if is_wildcard(token) {
                bytes.push(None);
            } else {
                bytes.push(Some(parse_byte(token)?));
            }
        }
        Self::new(bytes)
    }
}

impl fmt::Display for PayloadPattern {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[")?;
        for (i, byte) in self.0.iter().enumerate() {
            if i > 0 {
                write!(f, " ")?;
            }
            match byte {
                Some(byte) => write!(f, "{byte:02X}")?,
                None => write!(f, "XX")?,
            }
        }
        write!(f, "]")
    }
}

/// Render an optional pattern, where no pattern means any payload
pub fn describe_pattern(pattern: Option<&PayloadPattern>) -> String {
    pattern.map_or_else(|| "ANY".to_string(), ToString::to_string)
}

/// A request to find frames on the bus
#[derive(Clone, Debug)]
pub struct MatchTarget {
    pub identifier: u32,
    /// When set, the identifier width must match too
    pub extended: Option<bool>,
    pub pattern: Option<PayloadPattern>,
    pub display_name: String,
    /// The schema used to report on matched frames
    pub decode_info: Option<Arc<MessageDefinition>>,
}

impl MatchTarget {
    pub fn new(identifier: u32, pattern: Option<PayloadPattern>) -> Self {
        Self {
            identifier,
            extended: None,
            pattern,
            display_name: format!("0x{identifier:X}"),
            decode_info: None,
        }
    }

    /// Target the frames described by a registry entry
    pub fn from_definition(definition: &Arc<MessageDefinition>) -> Self {
        Self {
            identifier: definition.identifier,
            extended: Some(definition.extended),
            pattern: definition.payload_pattern.clone(),
            display_name: definition.name.clone(),
            decode_info: Some(Arc::clone(definition)),
        }
    }

    #[must_use]
    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.display_name = name.into();
        self
    }

    #[must_use]
    pub fn matches(&self, frame: &ObservedFrame) -> bool {
        matches(frame, self)
    }
}

impl fmt::Display for MatchTarget {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} (ID=0x{:X}, Data={})",
            self.display_name,
            self.identifier,
            describe_pattern(self.pattern.as_ref())
        )
    }
}

/// Does the frame satisfy the target?
#[must_use]
pub fn matches(frame: &ObservedFrame, target: &MatchTarget) -> bool {
    if frame.identifier != target.identifier {
        return false;
    }
    if target.extended.is_some_and(|extended| extended != frame.extended) {
        return false;
    }
    target
        .pattern
        .as_ref()
        .is_none_or(|pattern| pattern.matches(frame.payload()))
}

/// The index of the first target, in declaration order, that the frame satisfies
#[must_use]
pub fn first_match(frame: &ObservedFrame, targets: &[MatchTarget]) -> Option<usize> {
    targets.iter().position(|target| matches(frame, target))
}
