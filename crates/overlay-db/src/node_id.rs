//! Node identity.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Deserializer, Serialize, Serializer};
use thiserror::Error;

/// Length in bytes of a node identity.
pub const NODE_ID_LEN: usize = 32;

/// Error returned when parsing a node ID from its hex form.
#[derive(Clone, Debug, Error, Eq, PartialEq)]
pub enum NodeIdParseError {
    /// Input was not valid hex.
    #[error("invalid hex: {0}")]
    Hex(String),

    /// Input decoded to the wrong number of bytes.
    #[error("expected {NODE_ID_LEN} bytes, got {0}")]
    Length(usize),
}

/// Fixed-length, globally unique identity of a storage node.
#[derive(Clone, Copy, Default, Eq, Hash, Ord, PartialEq, PartialOrd)]
pub struct NodeId([u8; NODE_ID_LEN]);

impl NodeId {
    /// Creates a node ID from raw bytes.
    #[must_use]
    pub const fn from_bytes(bytes: [u8; NODE_ID_LEN]) -> Self {
        Self(bytes)
    }

    /// Raw bytes of the ID.
    #[must_use]
    pub const fn as_bytes(&self) -> &[u8; NODE_ID_LEN] {
        &self.0
    }

    /// Whether this is the all-zero ID, which is never a valid node.
    #[must_use]
    pub fn is_zero(&self) -> bool {
        self.0.iter().all(|b| *b == 0)
    }

    /// Short hex prefix for log lines.
    #[must_use]
    pub fn short(&self) -> String {
        hex::encode(&self.0[..4])
    }

    /// Generates a random node ID.
    #[cfg(feature = "test-helpers")]
    #[must_use]
    pub fn random() -> Self {
        use rand::RngCore;

        let mut bytes = [0u8; NODE_ID_LEN];
        rand::thread_rng().fill_bytes(&mut bytes);
        Self(bytes)
    }
}

impl fmt::Display for NodeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&hex::encode(self.0))
    }
}

impl fmt::Debug for NodeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "NodeId({})", self.short())
    }
}

impl FromStr for NodeId {
    type Err = NodeIdParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let bytes = hex::decode(s).map_err(|e| NodeIdParseError::Hex(e.to_string()))?;
        let bytes: [u8; NODE_ID_LEN] = bytes
            .try_into()
            .map_err(|v: Vec<u8>| NodeIdParseError::Length(v.len()))?;
        Ok(Self(bytes))
    }
}

impl From<[u8; NODE_ID_LEN]> for NodeId {
    fn from(bytes: [u8; NODE_ID_LEN]) -> Self {
        Self(bytes)
    }
}

impl Serialize for NodeId {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.to_string())
    }
}

impl<'de> Deserialize<'de> for NodeId {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let s = String::deserialize(deserializer)?;
        s.parse().map_err(serde::de::Error::custom)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    use assert_matches::assert_matches;

    #[test]
    fn test_hex_roundtrip_and_display() {
        let id = NodeId::from_bytes([7u8; NODE_ID_LEN]);
        let s = id.to_string();
        assert_eq!(s.len(), NODE_ID_LEN * 2);
        assert_eq!(s.parse::<NodeId>().unwrap(), id);
        assert_eq!(format!("{id:?}"), "NodeId(07070707)");
    }

    #[test]
    fn test_parse_rejects_bad_input() {
        assert_matches!("zz".parse::<NodeId>(), Err(NodeIdParseError::Hex(_)));
        assert_matches!("abcd".parse::<NodeId>(), Err(NodeIdParseError::Length(2)));
    }

    #[test]
    fn test_zero_id() {
        assert!(NodeId::default().is_zero());
        assert!(!NodeId::from_bytes([1u8; NODE_ID_LEN]).is_zero());
    }

    #[test]
    fn test_serde_as_hex_string() {
        let id = NodeId::from_bytes([0xab; NODE_ID_LEN]);
        let json = serde_json::to_string(&id).unwrap();
        assert_eq!(json, format!("\"{}\"", "ab".repeat(NODE_ID_LEN)));
        let back: NodeId = serde_json::from_str(&json).unwrap();
        assert_eq!(back, id);
    }
}
