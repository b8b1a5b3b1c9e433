#![deny(missing_docs)]

//! A two-round collective-signing consensus core.
//!
//! `cosig` implements the agreement kernel of a pBFT-style committee: a
//! designated leader coordinates the committee's backups through two
//! successive Schnorr multi-signing rounds to produce a single collective
//! signature over an agreed payload, together with a bitmap naming the
//! signers. The second round signs the first round's output, so the final
//! artifact proves that a quorum saw a quorum sign the payload.
//!
//! The crate is deliberately narrow: it speaks through host-supplied
//! interfaces ([`traits`]) for transport, payload validation and failure
//! policy, and it neither retries, times out, nor persists anything. A
//! [`ConsensusLeader`] or [`ConsensusBackup`] owns exactly one instance of
//! the protocol; when it reaches [`State::Done`] the host collects the
//! final signature and bitmap and disposes of it, and when it reaches
//! [`State::Error`] the host runs its own recovery (view change, fallback).
//!
//! ```no_run
//! # use std::sync::Arc;
//! # use cosig::*;
//! # struct Nop;
//! # impl traits::MessageSender for Nop {
//! #     fn send(&self, _: &std::net::SocketAddr, _: &[u8]) {}
//! #     fn broadcast(&self, _: &[std::net::SocketAddr], _: &[u8]) {}
//! # }
//! # struct NoFail;
//! # impl traits::CommitFailureHandler for NoFail {
//! #     fn handle(&mut self, _: &std::collections::BTreeMap<u16, Vec<u8>>) -> bool { true }
//! # }
//! # fn committee() -> Committee { unimplemented!() }
//! # fn my_key() -> PrivKey { unimplemented!() }
//! let params = SessionParams {
//!     consensus_id: 1,
//!     block_number: 42,
//!     block_hash: [0u8; 32],
//!     my_id: 0,
//!     class_tag: 0x01,
//!     instruction_tag: 0x02,
//! };
//! let leader = ConsensusLeader::new(
//!     params,
//!     my_key(),
//!     committee(),
//!     Arc::new(Nop),
//!     Box::new(NoFail),
//!     Box::new(rand::rngs::OsRng),
//! );
//! let payload = b"one serialized block".to_vec();
//! leader.start_consensus(&payload, payload.len(), None).unwrap();
//! // ...then feed inbound messages to leader.process_message(...).
//! ```

use std::time::Duration;

mod backup;
mod bitmap;
mod common;
mod error;
mod leader;
mod message;
pub mod multisig;
pub mod traits;

pub use backup::ConsensusBackup;
pub use bitmap::Bitmap;
pub use common::{Committee, CommitteeMember, SessionParams, State};
pub use error::Error;
pub use leader::ConsensusLeader;
pub use message::MessageType;
pub use multisig::{Challenge, CommitPoint, CommitSecret, PrivKey, PubKey, Response, Signature};

/// Upper bound on the number of candidate signing subsets the leader
/// challenges in parallel per round.
pub const NUM_CONSENSUS_SUBSETS: usize = 2;

/// How long [`ConsensusLeader::can_process_message`] and
/// [`ConsensusBackup::can_process_message`] wait for the state machine to
/// catch up before giving up on an out-of-order message.
pub const CONSENSUS_MSG_ORDER_BLOCK_WINDOW: Duration = Duration::from_secs(5);
