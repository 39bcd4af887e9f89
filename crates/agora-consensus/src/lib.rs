//! # Agora Consensus
//!
//! The consensus core of an Agora node: the state machine that drives block
//! agreement among a fixed suffrage of validators.
//!
//! ## Data Flow
//!
//! ```text
//!   seal ──► validation ──► Ballotbox ──► Voteproof ──► StateMachine
//!                                                           │
//!            ┌──────────────────────────────────────────────┘
//!            ▼
//!   Booting ─► Joining ─► Consensus ◄─► Syncing
//!                             ▲
//!                          Handover
//! ```
//!
//! Ballots are voted at `(height, round, stage)` points. When a threshold of
//! the acting suffrage agrees (or can no longer agree), the ballotbox emits a
//! voteproof. The current state reacts to voteproofs by broadcasting the next
//! ballots, processing proposals and saving blocks.

pub mod ballot;
pub mod ballotbox;
pub mod checker;
pub mod database;
pub mod error;
pub mod handover;
pub mod local;
pub mod network;
pub mod policy;
pub mod processor;
pub mod states;
pub mod suffrage;
pub mod syncer;
pub mod timer;
pub mod voteproof;

#[cfg(test)]
pub(crate) mod test_utils;

pub use ballot::{AcceptFact, Ballot, BallotFact, BallotFactSign, InitFact, ProposalFact, Seal, SignedBallotFact};
pub use ballotbox::Ballotbox;
pub use database::{Database, Manifest};
pub use error::{ConsensusError, ConsensusResult};
pub use handover::{Handover, HandoverSeal, HandoverSealKind};
pub use local::LocalNode;
pub use network::{Channel, ChannelLoader, Discovery, NodeInfo, Nodepool, SealHandler};
pub use policy::LocalPolicy;
pub use processor::{Block, ProcessorPool, ProcessorState};
pub use states::{OperationsSource, StateEvent, StateMachine, StateMachineBuilder, StateSwitchContext, StatesConfig};
pub use suffrage::{ActingSuffrage, FixedSuffrage, RoundrobinSuffrage, Suffrage};
pub use syncer::{SyncSource, Syncers, SyncersFactory};
pub use timer::{ContextTimer, TimerId, Timers};
pub use voteproof::{compare_voteproof, Voteproof, VoteproofNodeFact};
