//! Capabilities the host node supplies to a consensus instance.
//!
//! The core observes the outside world only through these interfaces: it
//! hands finished wire bytes to a [`MessageSender`], asks a
//! [`PayloadValidator`] whether an announced payload is acceptable, and
//! defers the commit-failure verdict to a [`CommitFailureHandler`]. None of
//! the traits report delivery success; the transport is fire-and-forget and
//! retries are the host's concern.

use std::collections::BTreeMap;
use std::net::SocketAddr;

/// Outbound transport handle, injected at construction.
///
/// Implementations should not block for long: the instance's state lock is
/// held while sending.
pub trait MessageSender: Send + Sync {
    /// Unicast `message` to a single peer.
    fn send(&self, peer: &SocketAddr, message: &[u8]);

    /// Multicast `message` to a set of peers.
    fn broadcast(&self, peers: &[SocketAddr], message: &[u8]);
}

/// Validates the payload a backup receives in an announcement.
///
/// On success, returns the exact byte string the collective signature is
/// computed over — it must match what the leader's
/// [`AnnouncementGenerator`] (or its `payload_size_for_cosign` default)
/// produced, or the backup will reject the leader's challenge. On failure,
/// returns an error body that the backup forwards to the leader inside a
/// commit-failure message.
pub trait PayloadValidator: Send {
    /// Check `payload` and produce the message-to-cosign bytes.
    fn validate(&self, payload: &[u8]) -> Result<Vec<u8>, Vec<u8>>;
}

/// Extends the leader's announcement with host-specific metadata.
///
/// `body` already holds the fixed header and the payload; anything the
/// generator appends travels between the payload and the trailing
/// signature. The return value is the canonical message-to-cosign.
pub trait AnnouncementGenerator: Send {
    /// Append metadata to `body` and return the message-to-cosign bytes.
    fn generate(&mut self, payload: &[u8], body: &mut Vec<u8>) -> Vec<u8>;
}

/// Decides what the leader does once `f + 1` commit failures accumulate.
///
/// The argument maps each failed backup's committee index to the error body
/// it reported. Returning `true` tells the leader to broadcast a
/// consensus-failure message and stop; `false` keeps the instance waiting
/// for more commits.
pub trait CommitFailureHandler: Send {
    /// Inspect the accumulated failures and render the verdict.
    fn handle(&mut self, failures: &BTreeMap<u16, Vec<u8>>) -> bool;
}
