//! The local node identity

use agora_core::Address;
use agora_crypto::{PrivateKey, PublicKey, Signature};

/// Address and signing key of this node
#[derive(Clone, Debug)]
pub struct LocalNode {
    address: Address,
    private_key: PrivateKey,
    public_key: PublicKey,
}

impl LocalNode {
    pub fn new(address: Address, private_key: PrivateKey) -> Self {
        let public_key = private_key.public_key();
        Self {
            address,
            private_key,
            public_key,
        }
    }

    pub fn address(&self) -> &Address {
        &self.address
    }

    pub fn private_key(&self) -> &PrivateKey {
        &self.private_key
    }

    pub fn public_key(&self) -> &PublicKey {
        &self.public_key
    }

    pub fn sign(&self, message: &[u8]) -> Signature {
        self.private_key.sign(message)
    }
}
