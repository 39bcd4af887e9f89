//! Core type definitions for Agora

use serde::de::{self, SeqAccess, Visitor};
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use std::fmt;

use crate::error::{AgoraError, Result};

/// Maximum length of a network id in bytes
pub const MAX_NETWORK_ID_LENGTH: usize = 300;

/// Block height. Two negative values are reserved sentinels.
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize, Default)]
pub struct Height(pub i64);

impl Height {
    /// Unset height
    pub const NIL: Height = Height(-2);

    /// Height before the genesis block; lowest valid height
    pub const PRE_GENESIS: Height = Height(-1);

    pub const GENESIS: Height = Height(0);

    pub fn new(h: i64) -> Self {
        Self(h)
    }

    pub fn value(&self) -> i64 {
        self.0
    }

    pub fn is_valid(&self) -> Result<()> {
        if self.0 < Self::PRE_GENESIS.0 {
            return Err(AgoraError::invalid(format!(
                "height must be greater than {}; height={}",
                Self::PRE_GENESIS.0,
                self.0
            )));
        }
        Ok(())
    }

    pub fn next(&self) -> Height {
        Height(self.0 + 1)
    }

    pub fn prev(&self) -> Height {
        Height(self.0 - 1)
    }

    pub fn bytes(&self) -> [u8; 8] {
        self.0.to_be_bytes()
    }
}

impl fmt::Display for Height {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl fmt::Debug for Height {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Height({})", self.0)
    }
}

impl std::ops::Sub for Height {
    type Output = i64;

    fn sub(self, rhs: Height) -> i64 {
        self.0 - rhs.0
    }
}

/// Attempt counter within a height
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize, Default)]
pub struct Round(pub u64);

impl Round {
    pub fn new(r: u64) -> Self {
        Self(r)
    }

    pub fn value(&self) -> u64 {
        self.0
    }

    pub fn next(&self) -> Round {
        Round(self.0 + 1)
    }

    pub fn bytes(&self) -> [u8; 8] {
        self.0.to_be_bytes()
    }
}

impl fmt::Display for Round {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl fmt::Debug for Round {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Round({})", self.0)
    }
}

/// Voting stage. Declaration order is the comparison order.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum Stage {
    Init,
    Sign,
    Accept,
    Proposal,
}

impl Stage {
    /// Only INIT and ACCEPT ballots are counted by the ballotbox
    pub fn can_vote(&self) -> bool {
        matches!(self, Stage::Init | Stage::Accept)
    }

    pub fn bytes(&self) -> [u8; 1] {
        [match self {
            Stage::Init => 0x01,
            Stage::Sign => 0x02,
            Stage::Accept => 0x03,
            Stage::Proposal => 0x04,
        }]
    }
}

impl fmt::Display for Stage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Stage::Init => "INIT",
            Stage::Sign => "SIGN",
            Stage::Accept => "ACCEPT",
            Stage::Proposal => "PROPOSAL",
        };
        f.write_str(s)
    }
}

/// Operating state of a node
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum NodeState {
    #[default]
    Unknown,
    Stopped,
    Booting,
    Joining,
    Consensus,
    Syncing,
    Handover,
}

impl NodeState {
    pub fn is_valid(&self) -> Result<()> {
        if *self == NodeState::Unknown {
            return Err(AgoraError::invalid("unknown node state"));
        }
        Ok(())
    }

    pub fn all() -> [NodeState; 6] {
        [
            NodeState::Stopped,
            NodeState::Booting,
            NodeState::Joining,
            NodeState::Consensus,
            NodeState::Syncing,
            NodeState::Handover,
        ]
    }
}

impl fmt::Display for NodeState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            NodeState::Unknown => "UNKNOWN",
            NodeState::Stopped => "STOPPED",
            NodeState::Booting => "BOOTING",
            NodeState::Joining => "JOINING",
            NodeState::Consensus => "CONSENSUS",
            NodeState::Syncing => "SYNCING",
            NodeState::Handover => "HANDOVER",
        };
        f.write_str(s)
    }
}

/// A `(height, round)` pair
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct Point {
    pub height: Height,
    pub round: Round,
}

impl Point {
    pub fn new(height: Height, round: Round) -> Self {
        Self { height, round }
    }
}

impl fmt::Display for Point {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.height, self.round)
    }
}

/// A point plus stage; ordered lexicographically
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct StagePoint {
    pub point: Point,
    pub stage: Stage,
}

impl StagePoint {
    pub fn new(height: Height, round: Round, stage: Stage) -> Self {
        Self {
            point: Point::new(height, round),
            stage,
        }
    }

    pub fn height(&self) -> Height {
        self.point.height
    }

    pub fn round(&self) -> Round {
        self.point.round
    }
}

impl fmt::Display for StagePoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.point, self.stage)
    }
}

/// Byte string mixed into every signature to namespace networks
///
/// Serialized as its raw bytes. Readable formats get a string instead when
/// the bytes are UTF-8, so config files can spell it out.
#[derive(Clone, PartialEq, Eq, Hash)]
pub struct NetworkId(Vec<u8>);

impl NetworkId {
    pub fn new(id: impl AsRef<[u8]>) -> Result<Self> {
        let nid = Self(id.as_ref().to_vec());
        nid.is_valid()?;
        Ok(nid)
    }

    pub fn is_valid(&self) -> Result<()> {
        if self.0.is_empty() {
            return Err(AgoraError::invalid("empty network id"));
        }
        if self.0.len() > MAX_NETWORK_ID_LENGTH {
            return Err(AgoraError::invalid(format!(
                "network id too long; {} > {}",
                self.0.len(),
                MAX_NETWORK_ID_LENGTH
            )));
        }
        Ok(())
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.0
    }
}

impl fmt::Display for NetworkId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&String::from_utf8_lossy(&self.0))
    }
}

impl fmt::Debug for NetworkId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "NetworkId({})", self)
    }
}

impl Serialize for NetworkId {
    fn serialize<S: Serializer>(&self, s: S) -> std::result::Result<S::Ok, S::Error> {
        match std::str::from_utf8(&self.0) {
            Ok(text) if s.is_human_readable() => s.serialize_str(text),
            _ => s.serialize_bytes(&self.0),
        }
    }
}

impl<'de> Deserialize<'de> for NetworkId {
    fn deserialize<D: Deserializer<'de>>(d: D) -> std::result::Result<Self, D::Error> {
        struct NetworkIdVisitor;

        impl<'de> Visitor<'de> for NetworkIdVisitor {
            type Value = NetworkId;

            fn expecting(&self, f: &mut fmt::Formatter) -> fmt::Result {
                write!(f, "network id of 1 to {} bytes", MAX_NETWORK_ID_LENGTH)
            }

            fn visit_str<E: de::Error>(self, v: &str) -> std::result::Result<Self::Value, E> {
                self.visit_bytes(v.as_bytes())
            }

            fn visit_bytes<E: de::Error>(self, v: &[u8]) -> std::result::Result<Self::Value, E> {
                NetworkId::new(v).map_err(E::custom)
            }

            fn visit_seq<A: SeqAccess<'de>>(self, mut seq: A) -> std::result::Result<Self::Value, A::Error> {
                let mut bytes = Vec::with_capacity(seq.size_hint().unwrap_or(0).min(MAX_NETWORK_ID_LENGTH));
                while let Some(b) = seq.next_element::<u8>()? {
                    bytes.push(b);
                }
                self.visit_bytes(&bytes)
            }
        }

        if d.is_human_readable() {
            d.deserialize_any(NetworkIdVisitor)
        } else {
            d.deserialize_byte_buf(NetworkIdVisitor)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_height_validity() {
        assert!(Height::PRE_GENESIS.is_valid().is_ok());
        assert!(Height::GENESIS.is_valid().is_ok());
        assert!(Height::NIL.is_valid().is_err());
        assert!(Height(-100).is_valid().is_err());
    }

    #[test]
    fn test_stage_order_and_voting() {
        assert!(Stage::Init < Stage::Sign);
        assert!(Stage::Sign < Stage::Accept);
        assert!(Stage::Accept < Stage::Proposal);

        assert!(Stage::Init.can_vote());
        assert!(Stage::Accept.can_vote());
        assert!(!Stage::Sign.can_vote());
        assert!(!Stage::Proposal.can_vote());
    }

    #[test]
    fn test_stage_point_ordering() {
        let a = StagePoint::new(Height(3), Round(2), Stage::Accept);
        let b = StagePoint::new(Height(3), Round(3), Stage::Init);
        let c = StagePoint::new(Height(4), Round(0), Stage::Init);

        assert!(a < b);
        assert!(b < c);
        assert!(StagePoint::new(Height(3), Round(2), Stage::Init) < a);
    }

    #[test]
    fn test_node_state_validity() {
        assert!(NodeState::Unknown.is_valid().is_err());
        for s in NodeState::all() {
            assert!(s.is_valid().is_ok());
        }
    }

    #[test]
    fn test_network_id_bounds() {
        assert!(NetworkId::new("").is_err());
        assert!(NetworkId::new("test").is_ok());
        assert!(NetworkId::new(vec![b'a'; MAX_NETWORK_ID_LENGTH]).is_ok());
        assert!(NetworkId::new(vec![b'a'; MAX_NETWORK_ID_LENGTH + 1]).is_err());
    }

    #[test]
    fn test_network_id_serde() {
        let nid = NetworkId::new("test").unwrap();
        let s = serde_json::to_string(&nid).unwrap();
        assert_eq!(s, "\"test\"");

        let back: NetworkId = serde_json::from_str(&s).unwrap();
        assert_eq!(back, nid);

        assert!(serde_json::from_str::<NetworkId>("\"\"").is_err());
    }

    #[test]
    fn test_network_id_keeps_non_utf8_bytes() {
        let nid = NetworkId::new([0xff, 0x00, b'a', 0xc3]).unwrap();

        let s = serde_json::to_string(&nid).unwrap();
        assert_eq!(s, "[255,0,97,195]");
        let back: NetworkId = serde_json::from_str(&s).unwrap();
        assert_eq!(back.as_bytes(), nid.as_bytes());

        let b = bincode::serialize(&nid).unwrap();
        let back: NetworkId = bincode::deserialize(&b).unwrap();
        assert_eq!(back, nid);

        // binary formats carry the bytes even when they are text
        let text = NetworkId::new("test").unwrap();
        let back: NetworkId = bincode::deserialize(&bincode::serialize(&text).unwrap()).unwrap();
        assert_eq!(back, text);
    }
}
