// -*- mode: rust; -*-
//
// This file is part of cosig.
// See LICENSE for licensing information.

//! Session state shared by the leader and backup roles.

use std::net::SocketAddr;

use rand_core::CryptoRngCore;

use crate::bitmap::Bitmap;
use crate::error::Error;
use crate::multisig::{self, Challenge, CommitPoint, PrivKey, PubKey, Signature};

/// The lifecycle of a consensus instance.
///
/// Transitions are monotonic along the happy path; [`State::Error`] is
/// terminal and reachable from anywhere. The leader occupies the
/// announce/challenge/collective-sig states, the backup the
/// commit/response states.
#[derive(Copy, Clone, Debug, Eq, PartialEq, Ord, PartialOrd)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub enum State {
    /// Freshly constructed; nothing sent or received.
    Initial,
    /// Leader: announcement broadcast.
    AnnounceDone,
    /// Backup: commit sent for round 1.
    CommitDone,
    /// Leader: round-1 challenges sent to the candidate subsets.
    ChallengeDone,
    /// Backup: round-1 response sent.
    ResponseDone,
    /// Leader: CS1 broadcast. Backup also passes through this implicitly.
    CollectiveSigDone,
    /// Backup: round-2 commit sent.
    FinalCommitDone,
    /// Leader: round-2 challenges sent.
    FinalChallengeDone,
    /// Backup: round-2 response sent.
    FinalResponseDone,
    /// The final collective signature is available.
    Done,
    /// Terminal failure; the host drives recovery externally.
    Error,
}

/// The immutable identifiers of one consensus session, fixed at
/// construction and shared verbatim by every participant.
#[derive(Copy, Clone, Debug)]
pub struct SessionParams {
    /// Session identifier carried in every message.
    pub consensus_id: u32,
    /// Logical block height this session decides.
    pub block_number: u64,
    /// Anti-replay tag carried in every message.
    pub block_hash: [u8; 32],
    /// The local participant's index in the committee.
    pub my_id: u16,
    /// Routing byte the host dispatcher keys on.
    pub class_tag: u8,
    /// Routing byte the host dispatcher keys on.
    pub instruction_tag: u8,
}

/// One committee slot: a public key and the peer's network address.
#[derive(Clone, Debug)]
pub struct CommitteeMember {
    /// The member's long-lived public key.
    pub pub_key: PubKey,
    /// Where the member receives consensus messages.
    pub address: SocketAddr,
}

/// The fixed, ordered committee for one consensus instance.
///
/// Committee indices (`u16`) are positions in this ordering; the leader
/// occupies one slot like everybody else. Membership never changes during
/// an instance.
#[derive(Clone, Debug)]
pub struct Committee {
    members: Vec<CommitteeMember>,
}

impl Committee {
    /// Build a committee from its ordered members.
    pub fn new(members: Vec<CommitteeMember>) -> Self {
        Committee { members }
    }

    /// Committee size `N`.
    pub fn size(&self) -> usize {
        self.members.len()
    }

    /// The fault tolerance `f = ⌊(N − 1) / 3⌋`.
    pub fn fault_tolerance(&self) -> usize {
        (self.size().saturating_sub(1)) / 3
    }

    /// The quorum `N − f`, the smallest signing set tolerant to `f`
    /// Byzantine members.
    pub fn quorum(&self) -> usize {
        self.size() - self.fault_tolerance()
    }

    /// How many commit failures put quorum out of reach: `f + 1`.
    pub fn failure_threshold(&self) -> usize {
        self.fault_tolerance() + 1
    }

    pub(crate) fn pub_key(&self, id: u16) -> Option<&PubKey> {
        self.members.get(id as usize).map(|m| &m.pub_key)
    }

    pub(crate) fn address(&self, id: u16) -> Option<SocketAddr> {
        self.members.get(id as usize).map(|m| m.address)
    }

    pub(crate) fn addresses_except(&self, id: u16) -> Vec<SocketAddr> {
        self.members
            .iter()
            .enumerate()
            .filter(|(i, _)| *i != id as usize)
            .map(|(_, m)| m.address)
            .collect()
    }

    pub(crate) fn addresses_for(&self, bitmap: &Bitmap) -> Vec<SocketAddr> {
        bitmap
            .iter_ones()
            .filter_map(|i| self.members.get(i).map(|m| m.address))
            .collect()
    }

    /// Byte width of this committee's membership bitmaps on the wire,
    /// excluding the length prefix.
    pub(crate) fn bitmap_byte_len(&self) -> usize {
        crate::bitmap::byte_len(self.size())
    }
}

/// State common to both roles for one instance: the immutable session
/// parameters plus the evolving payload, state tag and collective-signature
/// outputs.
pub(crate) struct ConsensusCommon {
    pub consensus_id: u32,
    pub block_number: u64,
    pub block_hash: [u8; 32],
    pub my_id: u16,
    priv_key: PrivKey,
    pub committee: Committee,
    pub class_tag: u8,
    pub instruction_tag: u8,

    pub state: State,
    /// The full payload under agreement (round 1), or `CS1 ‖ B1` (round 2).
    pub payload: Vec<u8>,
    /// The exact bytes the current round's collective signature covers.
    pub cosign_payload: Vec<u8>,
    pub cs1: Option<Signature>,
    pub b1: Option<Bitmap>,
    pub cs2: Option<Signature>,
    pub b2: Option<Bitmap>,
}

impl ConsensusCommon {
    pub fn new(params: SessionParams, priv_key: PrivKey, committee: Committee) -> Self {
        ConsensusCommon {
            consensus_id: params.consensus_id,
            block_number: params.block_number,
            block_hash: params.block_hash,
            my_id: params.my_id,
            priv_key,
            committee,
            class_tag: params.class_tag,
            instruction_tag: params.instruction_tag,
            state: State::Initial,
            payload: Vec::new(),
            cosign_payload: Vec::new(),
            cs1: None,
            b1: None,
            cs2: None,
            b2: None,
        }
    }

    /// Sign `body` with the local key.
    pub fn sign_message(&self, rng: &mut dyn CryptoRngCore, body: &[u8]) -> Signature {
        let pub_key = self.priv_key.pub_key();
        multisig::sign(rng, body, &self.priv_key, &pub_key)
    }

    /// Verify `signature` over `body` against `peer_id`'s committee key.
    pub fn verify_peer(&self, body: &[u8], signature: &Signature, peer_id: u16) -> bool {
        match self.committee.pub_key(peer_id) {
            Some(pub_key) => multisig::verify(body, signature, pub_key),
            None => false,
        }
    }

    /// Sum the committee keys selected by `bitmap`.
    pub fn aggregate_keys(&self, bitmap: &Bitmap) -> Option<PubKey> {
        let keys: Vec<PubKey> = bitmap
            .iter_ones()
            .filter_map(|i| self.committee.pub_key(i as u16).copied())
            .collect();
        if keys.len() != bitmap.count_ones() {
            return None;
        }
        multisig::aggregate_pub_keys(&keys)
    }

    /// The Fiat-Shamir challenge over the current round's cosign payload.
    pub fn build_challenge(&self, commit: &CommitPoint, key: &PubKey) -> Challenge {
        multisig::build_challenge(commit, key, &self.cosign_payload)
    }

    pub fn priv_key(&self) -> &PrivKey {
        &self.priv_key
    }

    /// Check the header fields every message opens with. A mismatch means
    /// the message belongs to another session and is dropped.
    pub fn check_header(&self, header: &crate::message::Header) -> Result<(), Error> {
        if header.consensus_id != self.consensus_id {
            tracing::debug!(
                got = header.consensus_id,
                want = self.consensus_id,
                "dropping message for foreign consensus id"
            );
            return Err(Error::MalformedMessage);
        }
        if header.block_hash != self.block_hash {
            tracing::debug!("dropping message with mismatched block hash");
            return Err(Error::MalformedMessage);
        }
        Ok(())
    }

    /// `CS2`, available once the instance is [`State::Done`].
    pub fn collective_sig(&self) -> Option<Signature> {
        if self.state == State::Done {
            self.cs2
        } else {
            None
        }
    }

    /// Encoded `B2`, available once the instance is [`State::Done`].
    pub fn collective_sig_bitmap(&self) -> Option<Vec<u8>> {
        if self.state == State::Done {
            self.b2.as_ref().map(Bitmap::encode)
        } else {
            None
        }
    }
}
