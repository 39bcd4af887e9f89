//! # Agora Core
//!
//! Primitive types shared by every Agora crate.
//!
//! This crate provides the vocabulary the consensus core is written in:
//! - `Height`, `Round`, `Stage` - the coordinates of a vote
//! - `NodeState` - the operating states of a node
//! - `Address`, `NetworkId` - identities and network namespaces
//! - `ThresholdRatio`, `Threshold`, `find_majority` - voting arithmetic
//! - `Clock` - an injectable time source
//!
//! ## Points
//!
//! Every vote happens at a point. Points are totally ordered:
//!
//! ```text
//!   (h, r, INIT) < (h, r, SIGN) < (h, r, ACCEPT) < (h, r, PROPOSAL)
//!                < (h, r+1, INIT) < ... < (h+1, 0, INIT)
//! ```

pub mod address;
pub mod clock;
pub mod error;
pub mod threshold;
pub mod types;

pub use address::*;
pub use clock::*;
pub use error::*;
pub use threshold::*;
pub use types::*;

/// Prelude module for convenient imports
pub mod prelude {
    pub use crate::address::Address;
    pub use crate::clock::{Clock, SystemClock};
    pub use crate::error::{AgoraError, Result};
    pub use crate::threshold::{find_majority, MajorityResult, Threshold, ThresholdRatio, VoteResult};
    pub use crate::types::*;
}
