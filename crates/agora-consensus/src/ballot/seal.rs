//! Seals
//!
//! Everything sent between nodes is a seal:
//!
//! ```text
//!   body_hash = H(body || signed_at)
//!   signature = sign(body_hash || network_id)
//!   hash      = H(body_hash || signature)
//! ```

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;

use agora_core::{is_zero_time, time_bytes, Address, AgoraError, NetworkId, Result};
use agora_crypto::{Hash, PublicKey, Signature};

use super::Ballot;
use crate::error::ConsensusResult;
use crate::local::LocalNode;

fn seal_signing_bytes(body_hash: &Hash, network_id: &NetworkId) -> Vec<u8> {
    let mut b = body_hash.bytes().to_vec();
    b.extend_from_slice(network_id.as_bytes());
    b
}

/// Seal-level signature
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct SealSign {
    pub signer: PublicKey,
    pub signature: Signature,
    pub signed_at: DateTime<Utc>,
}

impl SealSign {
    pub fn sign(body_hash: &Hash, local: &LocalNode, network_id: &NetworkId, signed_at: DateTime<Utc>) -> Self {
        Self {
            signer: *local.public_key(),
            signature: local.sign(&seal_signing_bytes(body_hash, network_id)),
            signed_at,
        }
    }

    pub fn hash(&self, body_hash: &Hash) -> Hash {
        Hash::concat(&[body_hash.bytes(), self.signature.bytes()])
    }

    pub fn is_valid(&self, body_hash: &Hash, network_id: &NetworkId) -> Result<()> {
        if is_zero_time(&self.signed_at) {
            return Err(AgoraError::invalid("empty signed_at of seal"));
        }
        if self.signature.is_empty() {
            return Err(AgoraError::invalid("empty seal signature"));
        }
        self.signer
            .verify(&seal_signing_bytes(body_hash, network_id), &self.signature)
            .map_err(|e| AgoraError::SignatureVerificationFailed(format!("seal: {}", e)))
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum HandoverSealKind {
    /// New node announces itself to the old node
    Start,
    /// New node keeps the old node informed while handover is running
    Ping,
    /// New node asks the old node to stop
    End,
}

impl HandoverSealKind {
    fn bytes(&self) -> [u8; 1] {
        [match self {
            HandoverSealKind::Start => 0x01,
            HandoverSealKind::Ping => 0x02,
            HandoverSealKind::End => 0x03,
        }]
    }
}

impl fmt::Display for HandoverSealKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            HandoverSealKind::Start => "start-handover",
            HandoverSealKind::Ping => "ping-handover",
            HandoverSealKind::End => "end-handover",
        };
        f.write_str(s)
    }
}

/// Control seal exchanged between the old and new instance of a node
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct HandoverSeal {
    pub kind: HandoverSealKind,
    pub address: Address,
    pub conn_info: String,
    pub sign: SealSign,
}

impl HandoverSeal {
    pub fn new(
        kind: HandoverSealKind,
        local: &LocalNode,
        conn_info: impl Into<String>,
        network_id: &NetworkId,
        signed_at: DateTime<Utc>,
    ) -> Self {
        let conn_info = conn_info.into();
        let body_hash = Self::body_hash_of(kind, local.address(), &conn_info, &signed_at);
        Self {
            kind,
            address: local.address().clone(),
            conn_info,
            sign: SealSign::sign(&body_hash, local, network_id, signed_at),
        }
    }

    fn body_hash_of(kind: HandoverSealKind, address: &Address, conn_info: &str, signed_at: &DateTime<Utc>) -> Hash {
        Hash::concat(&[&kind.bytes(), address.bytes(), conn_info.as_bytes(), &time_bytes(signed_at)])
    }

    pub fn body_hash(&self) -> Hash {
        Self::body_hash_of(self.kind, &self.address, &self.conn_info, &self.sign.signed_at)
    }

    pub fn hash(&self) -> Hash {
        self.sign.hash(&self.body_hash())
    }

    pub fn is_valid(&self, network_id: &NetworkId) -> Result<()> {
        self.address.is_valid()?;
        if self.conn_info.is_empty() {
            return Err(AgoraError::invalid("empty conn info of handover seal"));
        }
        self.sign.is_valid(&self.body_hash(), network_id)
    }
}

/// Anything a node sends to another node
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub enum Seal {
    Ballot(Ballot),
    Handover(HandoverSeal),
}

impl Seal {
    pub fn hash(&self) -> Hash {
        match self {
            Seal::Ballot(b) => b.hash(),
            Seal::Handover(h) => h.hash(),
        }
    }

    pub fn signed_at(&self) -> DateTime<Utc> {
        match self {
            Seal::Ballot(b) => b.seal.signed_at,
            Seal::Handover(h) => h.sign.signed_at,
        }
    }

    pub fn is_valid(&self, network_id: &NetworkId) -> Result<()> {
        match self {
            Seal::Ballot(b) => b.is_valid(network_id),
            Seal::Handover(h) => h.is_valid(network_id),
        }
    }

    pub fn as_ballot(&self) -> Option<&Ballot> {
        match self {
            Seal::Ballot(b) => Some(b),
            _ => None,
        }
    }

    /// Wire form
    pub fn to_bytes(&self) -> ConsensusResult<Vec<u8>> {
        Ok(bincode::serialize(self)?)
    }

    pub fn from_bytes(b: &[u8]) -> ConsensusResult<Self> {
        Ok(bincode::deserialize(b)?)
    }
}

impl From<Ballot> for Seal {
    fn from(b: Ballot) -> Self {
        Seal::Ballot(b)
    }
}

impl From<HandoverSeal> for Seal {
    fn from(h: HandoverSeal) -> Self {
        Seal::Handover(h)
    }
}
