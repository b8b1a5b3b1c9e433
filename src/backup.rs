// -*- mode: rust; -*-
//
// This file is part of cosig.
// See LICENSE for licensing information.

//! The consensus backup.
//!
//! A backup validates the leader's announcement, contributes a commit and a
//! response share per round, and checks every aggregate the leader claims:
//! the challenge is recomputed locally before the backup signs anything, and
//! both collective signatures are verified against the keys selected by the
//! leader's bitmap. Any failed check that implicates the leader moves the
//! instance to [`State::Error`]; malformed or mis-signed traffic is simply
//! dropped.

use std::net::SocketAddr;
use std::sync::{Arc, Condvar, Mutex, MutexGuard};
use std::time::Duration;

use rand_core::CryptoRngCore;
use tracing::{debug, info, warn};

use crate::bitmap::Bitmap;
use crate::common::{Committee, ConsensusCommon, SessionParams, State};
use crate::error::Error;
use crate::message::{self, constants, MessageType, Reader};
use crate::multisig::{self, Challenge, CommitPoint, CommitSecret, PrivKey, PubKey, Signature};
use crate::traits::{MessageSender, PayloadValidator};
use crate::CONSENSUS_MSG_ORDER_BLOCK_WINDOW;

/// Which of the two signing rounds a handler is serving.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
enum Round {
    First,
    Second,
}

impl Round {
    fn commit_done_state(self) -> State {
        match self {
            Round::First => State::CommitDone,
            Round::Second => State::FinalCommitDone,
        }
    }

    fn response_done_state(self) -> State {
        match self {
            Round::First => State::ResponseDone,
            Round::Second => State::FinalResponseDone,
        }
    }

    fn response_kind(self) -> MessageType {
        match self {
            Round::First => MessageType::Response,
            Round::Second => MessageType::FinalResponse,
        }
    }
}

struct BackupInner {
    common: ConsensusCommon,
    leader_id: u16,
    rng: Box<dyn CryptoRngCore + Send>,
    validator: Box<dyn PayloadValidator>,
    /// The current round's nonce. Consumed by the first valid challenge;
    /// answering two distinct challenges with one nonce would leak the
    /// private key, so later subset challenges are dropped.
    commit_secret: Option<CommitSecret>,
}

impl BackupInner {
    fn set_error(&mut self) {
        self.common.state = State::Error;
        // No commit secret may outlive a terminal transition.
        self.commit_secret = None;
    }
}

/// A backup's half of one consensus instance.
///
/// Thread-safe: handlers serialize on an internal mutex, so the host may
/// deliver messages from any number of I/O threads.
pub struct ConsensusBackup {
    inner: Mutex<BackupInner>,
    caught_up: Condvar,
    sender: Arc<dyn MessageSender>,
}

impl ConsensusBackup {
    /// Build a backup instance for one consensus session. `leader_id` is the
    /// leader's index in `committee`.
    pub fn new(
        params: SessionParams,
        leader_id: u16,
        priv_key: PrivKey,
        committee: Committee,
        sender: Arc<dyn MessageSender>,
        validator: Box<dyn PayloadValidator>,
        rng: Box<dyn CryptoRngCore + Send>,
    ) -> Self {
        ConsensusBackup {
            inner: Mutex::new(BackupInner {
                common: ConsensusCommon::new(params, priv_key, committee),
                leader_id,
                rng,
                validator,
                commit_secret: None,
            }),
            caught_up: Condvar::new(),
            sender,
        }
    }

    fn lock(&self) -> MutexGuard<'_, BackupInner> {
        self.inner.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Process one inbound consensus message. `message[offset]` must be the
    /// message-type byte; `from` is the delivering peer, used only for
    /// diagnostics.
    pub fn process_message(&self, message: &[u8], offset: usize, from: SocketAddr) -> Result<(), Error> {
        let kind = message
            .get(offset)
            .copied()
            .map(MessageType::try_from)
            .ok_or(Error::MalformedMessage)??;
        let body = &message[offset + 1..];
        debug!(?kind, %from, "backup received consensus message");

        let result = match kind {
            MessageType::Announce => self.process_announce(body),
            MessageType::Challenge => self.process_challenge(body, Round::First),
            MessageType::CollectiveSig => self.process_collective_sig(body, Round::First),
            MessageType::FinalChallenge => self.process_challenge(body, Round::Second),
            MessageType::FinalCollectiveSig => self.process_collective_sig(body, Round::Second),
            MessageType::ConsensusFailure => self.process_consensus_failure(body),
            other => {
                debug!(kind = ?other, "message kind not handled by the backup role");
                Err(Error::MalformedMessage)
            }
        };
        self.caught_up.notify_all();
        result
    }

    fn process_announce(&self, body: &[u8]) -> Result<(), Error> {
        let mut guard = self.lock();
        let inner = &mut *guard;

        if inner.common.state != State::Initial {
            debug!(state = ?inner.common.state, "dropping announce out of state");
            return Err(Error::InvalidState);
        }

        let mut reader = Reader::new(body);
        let header = reader.header()?;
        inner.common.check_header(&header)?;
        if header.peer_id != inner.leader_id {
            debug!(got = header.peer_id, want = inner.leader_id, "announce from wrong leader id");
            return Err(Error::MalformedMessage);
        }

        let payload_len = reader
            .remaining()
            .checked_sub(constants::SIGNATURE_SIZE)
            .filter(|len| *len > 0)
            .ok_or(Error::MalformedMessage)?;
        let payload = reader.bytes(payload_len)?.to_vec();
        let signed_len = reader.position();
        let signature =
            Signature::from_bytes(reader.bytes(constants::SIGNATURE_SIZE)?).ok_or(Error::MalformedMessage)?;

        let cosign_payload = match inner.validator.validate(&payload) {
            Ok(cosign_payload) => cosign_payload,
            Err(error_body) => {
                warn!(
                    consensus_id = inner.common.consensus_id,
                    "announced payload rejected by validator"
                );
                let msg = self.build_commit_failure(inner, &error_body);
                inner.set_error();
                if let Some(leader) = inner.common.committee.address(inner.leader_id) {
                    self.sender.send(&leader, &msg);
                }
                return Err(Error::PayloadRejected);
            }
        };

        if !inner.common.verify_peer(&body[..signed_len], &signature, inner.leader_id) {
            warn!("invalid leader signature on announce");
            return Err(Error::InvalidSignature);
        }

        inner.common.payload = payload;
        inner.common.cosign_payload = cosign_payload;
        info!(
            consensus_id = inner.common.consensus_id,
            block_number = inner.common.block_number,
            payload_len = inner.common.payload.len(),
            "announcement accepted, sending commit"
        );
        self.send_commit(inner, MessageType::Commit);
        inner.common.state = State::CommitDone;
        Ok(())
    }

    fn process_challenge(&self, body: &[u8], round: Round) -> Result<(), Error> {
        let mut guard = self.lock();
        let inner = &mut *guard;

        if inner.common.state != round.commit_done_state() {
            debug!(state = ?inner.common.state, ?round, "dropping challenge out of state");
            return Err(Error::InvalidState);
        }

        let mut reader = Reader::new(body);
        let header = reader.header()?;
        inner.common.check_header(&header)?;
        if header.peer_id != inner.leader_id {
            return Err(Error::MalformedMessage);
        }

        let subset_id = reader.u16()?;
        let aggregated_commit = CommitPoint::from_bytes(reader.bytes(constants::COMMIT_POINT_SIZE)?)
            .ok_or(Error::MalformedMessage)?;
        let aggregated_key =
            PubKey::from_bytes(reader.bytes(constants::PUB_KEY_SIZE)?).ok_or(Error::MalformedMessage)?;
        let challenge =
            Challenge::from_bytes(reader.bytes(constants::CHALLENGE_SIZE)?).ok_or(Error::MalformedMessage)?;
        let signed_len = reader.position();
        let signature =
            Signature::from_bytes(reader.bytes(constants::SIGNATURE_SIZE)?).ok_or(Error::MalformedMessage)?;
        if !inner.common.verify_peer(&body[..signed_len], &signature, inner.leader_id) {
            warn!("invalid leader signature on challenge");
            return Err(Error::InvalidSignature);
        }

        // The challenge must be the Fiat-Shamir hash of what the leader
        // claims to aggregate; anything else could trick the backup into
        // signing an arbitrary scalar.
        let recomputed = inner.common.build_challenge(&aggregated_commit, &aggregated_key);
        if recomputed != challenge {
            warn!(subset_id, "received challenge does not match recomputation");
            inner.set_error();
            return Err(Error::ChallengeMismatch);
        }

        let secret = inner.commit_secret.take().ok_or(Error::InvalidState)?;
        let response = multisig::generate_response(&secret, &challenge, inner.common.priv_key());
        drop(secret);

        let common = &inner.common;
        let mut msg = message::begin(common.class_tag, common.instruction_tag, round.response_kind());
        let body_start = msg.len();
        message::put_header(&mut msg, common.consensus_id, &common.block_hash, common.my_id);
        message::put_u16(&mut msg, subset_id);
        msg.extend_from_slice(&response.to_bytes());
        let signature = inner.common.sign_message(inner.rng.as_mut(), &msg[body_start..]);
        msg.extend_from_slice(&signature.to_bytes());

        inner.common.state = round.response_done_state();
        debug!(subset_id, ?round, "response sent");
        if let Some(leader) = inner.common.committee.address(inner.leader_id) {
            self.sender.send(&leader, &msg);
        }
        Ok(())
    }

    fn process_collective_sig(&self, body: &[u8], round: Round) -> Result<(), Error> {
        let mut guard = self.lock();
        let inner = &mut *guard;

        // A backup left out of every winning subset never responds, so both
        // the commit-done and response-done states admit the aggregate.
        let state_ok = inner.common.state == round.commit_done_state()
            || inner.common.state == round.response_done_state();
        if !state_ok {
            debug!(state = ?inner.common.state, ?round, "dropping collective signature out of state");
            return Err(Error::InvalidState);
        }

        let mut reader = Reader::new(body);
        let header = reader.header()?;
        inner.common.check_header(&header)?;
        if header.peer_id != inner.leader_id {
            return Err(Error::MalformedMessage);
        }

        let bitmap_len = 2 + inner.common.committee.bitmap_byte_len();
        let bitmap_bytes = reader.bytes(bitmap_len)?;
        let bitmap = Bitmap::decode(bitmap_bytes, inner.common.committee.bitmap_byte_len())
            .filter(|bitmap| bitmap.len() == inner.common.committee.size())
            .ok_or(Error::MalformedMessage)?;
        let collective_sig =
            Signature::from_bytes(reader.bytes(constants::SIGNATURE_SIZE)?).ok_or(Error::MalformedMessage)?;
        let signed_len = reader.position();
        let signature =
            Signature::from_bytes(reader.bytes(constants::SIGNATURE_SIZE)?).ok_or(Error::MalformedMessage)?;
        if !inner.common.verify_peer(&body[..signed_len], &signature, inner.leader_id) {
            warn!("invalid leader signature on collective signature");
            return Err(Error::InvalidSignature);
        }

        if bitmap.count_ones() < inner.common.committee.quorum() {
            warn!(
                signers = bitmap.count_ones(),
                quorum = inner.common.committee.quorum(),
                "collective signature bitmap below quorum"
            );
            inner.set_error();
            return Err(Error::InvalidAggregate);
        }
        if round == Round::Second {
            let within_round1 = inner
                .common
                .b1
                .as_ref()
                .is_some_and(|b1| bitmap.is_subset_of(b1));
            if !within_round1 {
                warn!("final signers are not a subset of the round-1 signing set");
                inner.set_error();
                return Err(Error::InvalidAggregate);
            }
        }
        let aggregated_key = match inner.common.aggregate_keys(&bitmap) {
            Some(key) => key,
            None => {
                inner.set_error();
                return Err(Error::InvalidAggregate);
            }
        };
        if !multisig::verify(&inner.common.cosign_payload, &collective_sig, &aggregated_key) {
            warn!(?round, "collective signature failed verification");
            inner.set_error();
            return Err(Error::InvalidAggregate);
        }

        match round {
            Round::First => {
                inner.common.cs1 = Some(collective_sig);
                inner.common.b1 = Some(bitmap.clone());
                // Round 2 signs the round-1 output.
                let mut next_payload = collective_sig.to_bytes().to_vec();
                next_payload.extend_from_slice(&bitmap.encode());
                inner.common.payload = next_payload.clone();
                inner.common.cosign_payload = next_payload;

                info!(
                    consensus_id = inner.common.consensus_id,
                    signers = bitmap.count_ones(),
                    "round-1 collective signature verified, sending final commit"
                );
                self.send_commit(inner, MessageType::FinalCommit);
                inner.common.state = State::FinalCommitDone;
            }
            Round::Second => {
                inner.common.cs2 = Some(collective_sig);
                inner.common.b2 = Some(bitmap);
                inner.commit_secret = None;
                inner.common.state = State::Done;
                info!(
                    consensus_id = inner.common.consensus_id,
                    block_number = inner.common.block_number,
                    "consensus complete"
                );
            }
        }
        Ok(())
    }

    fn process_consensus_failure(&self, body: &[u8]) -> Result<(), Error> {
        let mut guard = self.lock();
        let inner = &mut *guard;

        if inner.common.state >= State::Done {
            debug!(state = ?inner.common.state, "dropping consensus failure in terminal state");
            return Err(Error::InvalidState);
        }

        let mut reader = Reader::new(body);
        let header = reader.header()?;
        inner.common.check_header(&header)?;
        if header.peer_id != inner.leader_id {
            return Err(Error::MalformedMessage);
        }
        let signed_len = reader.position();
        let signature =
            Signature::from_bytes(reader.bytes(constants::SIGNATURE_SIZE)?).ok_or(Error::MalformedMessage)?;
        if !inner.common.verify_peer(&body[..signed_len], &signature, inner.leader_id) {
            warn!("invalid leader signature on consensus failure");
            return Err(Error::InvalidSignature);
        }

        warn!(
            consensus_id = inner.common.consensus_id,
            "leader declared consensus failure"
        );
        inner.set_error();
        Ok(())
    }

    /// Assemble a commit-failure message carrying the validator's error body.
    fn build_commit_failure(&self, inner: &mut BackupInner, error_body: &[u8]) -> Vec<u8> {
        let common = &inner.common;
        let mut msg = message::begin(common.class_tag, common.instruction_tag, MessageType::CommitFailure);
        let body_start = msg.len();
        message::put_header(&mut msg, common.consensus_id, &common.block_hash, common.my_id);
        msg.extend_from_slice(error_body);
        let signature = inner.common.sign_message(inner.rng.as_mut(), &msg[body_start..]);
        msg.extend_from_slice(&signature.to_bytes());
        msg
    }

    /// Generate a fresh commit for the current round and send it to the
    /// leader. The caller advances the state.
    fn send_commit(&self, inner: &mut BackupInner, kind: MessageType) {
        let secret = CommitSecret::new(inner.rng.as_mut());
        let commit_point = secret.commit_point();
        inner.commit_secret = Some(secret);

        let common = &inner.common;
        let mut msg = message::begin(common.class_tag, common.instruction_tag, kind);
        let body_start = msg.len();
        message::put_header(&mut msg, common.consensus_id, &common.block_hash, common.my_id);
        msg.extend_from_slice(&commit_point.to_bytes());
        let signature = inner.common.sign_message(inner.rng.as_mut(), &msg[body_start..]);
        msg.extend_from_slice(&signature.to_bytes());

        if let Some(leader) = inner.common.committee.address(inner.leader_id) {
            self.sender.send(&leader, &msg);
        }
    }

    /// The instance's current state.
    pub fn state(&self) -> State {
        self.lock().common.state
    }

    /// The payload under agreement: the announced bytes during round 1,
    /// `CS1 ‖ B1` during round 2.
    pub fn payload(&self) -> Vec<u8> {
        self.lock().common.payload.clone()
    }

    /// `CS2`, available once the instance is [`State::Done`].
    pub fn retrieve_collective_sig(&self) -> Option<Signature> {
        self.lock().common.collective_sig()
    }

    /// Encoded `B2`, available once the instance is [`State::Done`].
    pub fn retrieve_collective_sig_bitmap(&self) -> Option<Vec<u8>> {
        self.lock().common.collective_sig_bitmap()
    }

    /// Block up to [`CONSENSUS_MSG_ORDER_BLOCK_WINDOW`] until the state
    /// machine is ready for `message`, and report whether delivering it now
    /// can succeed.
    pub fn can_process_message(&self, message: &[u8], offset: usize) -> bool {
        let required = match message.get(offset).copied().map(MessageType::try_from) {
            Some(Ok(MessageType::Challenge)) | Some(Ok(MessageType::CollectiveSig)) => State::CommitDone,
            Some(Ok(MessageType::FinalChallenge)) | Some(Ok(MessageType::FinalCollectiveSig)) => {
                State::FinalCommitDone
            }
            // Announcements and failure notices are valid from the start;
            // anything else gets its precise error from the handler.
            _ => return true,
        };
        let guard = self.lock();
        let (guard, _) = self
            .caught_up
            .wait_timeout_while(guard, CONSENSUS_MSG_ORDER_BLOCK_WINDOW, |inner| {
                inner.common.state < required && inner.common.state != State::Error
            })
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        guard.common.state != State::Error && guard.common.state >= required
    }

    /// Block until the instance reaches [`State::Done`] or [`State::Error`]
    /// or `timeout` elapses, returning the state observed last.
    pub fn wait_done(&self, timeout: Duration) -> State {
        let guard = self.lock();
        let (guard, _) = self
            .caught_up
            .wait_timeout_while(guard, timeout, |inner| inner.common.state < State::Done)
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        guard.common.state
    }
}
