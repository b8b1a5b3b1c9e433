// -*- mode: rust; -*-
//
// This file is part of cosig.
// See LICENSE for licensing information.

use thiserror::Error;

/// An error produced while driving a consensus instance.
///
/// Handlers never panic and never throw; every failed check surfaces as one
/// of these variants. Most of them are recoverable by simply dropping the
/// offending message; the fatal ones also move the instance to
/// [`State::Error`](crate::State::Error), which is terminal.
#[derive(Debug, Copy, Clone, Eq, PartialEq, Error)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub enum Error {
    /// The message is too short, fails to decode, or carries content that
    /// does not belong to this session (wrong consensus id, block hash, or
    /// an out-of-range participant). Recovered by dropping.
    #[error("malformed or inadmissible message")]
    MalformedMessage,
    /// The message is inappropriate for the current state. Recovered by
    /// dropping; the host may retry delivery after the state catches up.
    #[error("message inappropriate for the current state")]
    InvalidState,
    /// A peer signature (or per-backup response share) failed verification.
    /// Logged and dropped.
    #[error("invalid peer signature")]
    InvalidSignature,
    /// The aggregated collective signature failed verification. Fatal for
    /// the instance.
    #[error("collective signature verification failed")]
    InvalidAggregate,
    /// The locally recomputed challenge differs from the leader's. Fatal
    /// for the backup.
    #[error("recomputed challenge does not match the received challenge")]
    ChallengeMismatch,
    /// The peer already contributed to the current phase. The duplicate is
    /// rejected without touching recorded state.
    #[error("participant already contributed to this phase")]
    DuplicateParticipant,
    /// The host's validator declined the announced payload. Fatal for the
    /// backup, which emits a commit-failure message.
    #[error("payload rejected by the content validator")]
    PayloadRejected,
    /// Enough commit failures accumulated that a quorum can no longer be
    /// assumed. Fatal for the leader, which emits a consensus-failure
    /// message.
    #[error("too many commit failures to reach quorum")]
    QuorumImpossible,
    /// `start_consensus` was invoked with an empty payload.
    #[error("payload must not be empty")]
    EmptyPayload,
}
