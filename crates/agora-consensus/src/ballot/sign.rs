//! Fact signatures
//!
//! A node signs `fact_hash || signed_at || network_id`. Mixing in the
//! network id keeps a signature from being replayed on another network.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use agora_core::{is_zero_time, time_bytes, Address, AgoraError, NetworkId, Result};
use agora_crypto::{Hash, PrivateKey, PublicKey, Signature};

use super::fact::BallotFact;

pub fn fact_signing_bytes(fact_hash: &Hash, signed_at: &DateTime<Utc>, network_id: &NetworkId) -> Vec<u8> {
    let mut b = Vec::with_capacity(96);
    b.extend_from_slice(fact_hash.bytes());
    b.extend_from_slice(&time_bytes(signed_at));
    b.extend_from_slice(network_id.as_bytes());
    b
}

/// Who signed a fact, and when
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct BallotFactSign {
    pub node: Address,
    pub signer: PublicKey,
    pub signature: Signature,
    pub signed_at: DateTime<Utc>,
}

impl BallotFactSign {
    pub fn sign(
        fact_hash: &Hash,
        node: Address,
        key: &PrivateKey,
        network_id: &NetworkId,
        signed_at: DateTime<Utc>,
    ) -> Self {
        let signature = key.sign(&fact_signing_bytes(fact_hash, &signed_at, network_id));
        Self {
            node,
            signer: key.public_key(),
            signature,
            signed_at,
        }
    }

    pub fn verify(&self, fact_hash: &Hash, network_id: &NetworkId) -> Result<()> {
        self.signer
            .verify(&fact_signing_bytes(fact_hash, &self.signed_at, network_id), &self.signature)
            .map_err(|e| AgoraError::SignatureVerificationFailed(format!("{}; node={}", e, self.node)))
    }

    pub fn is_valid(&self) -> Result<()> {
        self.node.is_valid()?;
        if self.signature.is_empty() {
            return Err(AgoraError::invalid("empty fact signature"));
        }
        if is_zero_time(&self.signed_at) {
            return Err(AgoraError::invalid("empty signed_at of fact sign"));
        }
        Ok(())
    }

    pub fn bytes(&self) -> Vec<u8> {
        let mut b = Vec::with_capacity(160);
        b.extend_from_slice(self.signer.bytes());
        b.extend_from_slice(self.signature.bytes());
        b.extend_from_slice(&time_bytes(&self.signed_at));
        b.extend_from_slice(self.node.bytes());
        b
    }
}

/// A fact together with its signature
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct SignedBallotFact {
    pub fact: BallotFact,
    pub sign: BallotFactSign,
}

impl SignedBallotFact {
    pub fn new(fact: BallotFact, node: Address, key: &PrivateKey, network_id: &NetworkId, signed_at: DateTime<Utc>) -> Self {
        let sign = BallotFactSign::sign(&fact.hash(), node, key, network_id, signed_at);
        Self { fact, sign }
    }

    /// `H(H(signer || signed_at) || signature)`
    pub fn hash(&self) -> Hash {
        let body = Hash::concat(&[self.sign.signer.bytes(), &time_bytes(&self.sign.signed_at)]);
        Hash::concat(&[body.bytes(), self.sign.signature.bytes()])
    }

    pub fn bytes(&self) -> Vec<u8> {
        let mut b = self.fact.hash().bytes().to_vec();
        b.extend_from_slice(&self.sign.bytes());
        b
    }

    pub fn is_valid(&self, network_id: &NetworkId) -> Result<()> {
        self.fact.is_valid()?;
        self.sign.is_valid()?;

        if let BallotFact::Proposal(p) = &self.fact {
            if p.proposer != self.sign.node {
                return Err(AgoraError::invalid(format!(
                    "proposal not signed by proposer; proposer={} signer={}",
                    p.proposer, self.sign.node
                )));
            }
        }

        self.sign.verify(&self.fact.hash(), network_id)
    }
}
