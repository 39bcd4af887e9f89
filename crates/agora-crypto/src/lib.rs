//! # Agora Crypto
//!
//! Hashes, keys and signatures used by ballots, seals and voteproofs.
//!
//! - `Hash` - 32-byte BLAKE3 content address
//! - `PrivateKey` / `PublicKey` - ed25519 keys with a canonical string form
//! - `Signature` - opaque signature bytes

pub mod error;
pub mod hash;
pub mod keys;

pub use error::{CryptoError, CryptoResult};
pub use hash::Hash;
pub use keys::{PrivateKey, PublicKey, Signature};
