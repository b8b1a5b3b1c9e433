// -*- mode: rust; -*-
//
// This file is part of cosig.
// See LICENSE for licensing information.

//! The consensus leader.
//!
//! The leader drives both signing rounds: it announces the payload, collects
//! commits until a quorum is reached, challenges one or more candidate
//! subsets of the committers, verifies and aggregates their responses into a
//! collective signature, and repeats the whole dance over `CS1 ‖ B1` to
//! produce the final signature. Commit failures reported by backups are
//! escalated to the host once `f + 1` of them accumulate.
//!
//! All handlers run under the instance mutex; messages that do not fit the
//! current state are dropped, never queued.

use std::collections::BTreeMap;
use std::net::SocketAddr;
use std::sync::{Arc, Condvar, Mutex, MutexGuard};
use std::time::Duration;

use rand_core::CryptoRngCore;
use tracing::{debug, error, info, warn};

use crate::bitmap::Bitmap;
use crate::common::{Committee, ConsensusCommon, SessionParams, State};
use crate::error::Error;
use crate::message::{self, constants, MessageType, Reader};
use crate::multisig::{self, CommitPoint, PrivKey, Response, Signature};
use crate::traits::{AnnouncementGenerator, CommitFailureHandler, MessageSender};
use crate::{CONSENSUS_MSG_ORDER_BLOCK_WINDOW, NUM_CONSENSUS_SUBSETS};

pub(crate) mod subset;

use subset::{Subset, SubsetState};

/// Which of the two signing rounds a handler is serving.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
enum Round {
    First,
    Second,
}

impl Round {
    /// State in which this round's commits trigger subset formation.
    fn commit_state(self) -> State {
        match self {
            Round::First => State::AnnounceDone,
            Round::Second => State::CollectiveSigDone,
        }
    }

    /// State in which this round's commits are parked as redundant.
    fn challenge_done_state(self) -> State {
        match self {
            Round::First => State::ChallengeDone,
            Round::Second => State::FinalChallengeDone,
        }
    }

    fn challenge_kind(self) -> MessageType {
        match self {
            Round::First => MessageType::Challenge,
            Round::Second => MessageType::FinalChallenge,
        }
    }

    fn collective_sig_kind(self) -> MessageType {
        match self {
            Round::First => MessageType::CollectiveSig,
            Round::Second => MessageType::FinalCollectiveSig,
        }
    }
}

struct LeaderInner {
    common: ConsensusCommon,
    rng: Box<dyn CryptoRngCore + Send>,
    failure_handler: Box<dyn CommitFailureHandler>,
    /// Commits feeding the current round's subsets, keyed by backup id.
    commits: BTreeMap<u16, CommitPoint>,
    /// Commits received after the subsets were fixed. Retained as the hook
    /// for recomputing subsets after a stall; unused by the current design.
    redundant_commits: BTreeMap<u16, CommitPoint>,
    commit_failures: BTreeMap<u16, Vec<u8>>,
    subsets: Vec<Subset>,
    chosen_subset: Option<usize>,
}

/// The leader's half of one consensus instance.
///
/// Thread-safe: handlers serialize on an internal mutex, so the host may
/// deliver messages from any number of I/O threads.
pub struct ConsensusLeader {
    inner: Mutex<LeaderInner>,
    caught_up: Condvar,
    sender: Arc<dyn MessageSender>,
}

impl ConsensusLeader {
    /// Build a leader instance for one consensus session.
    pub fn new(
        params: SessionParams,
        priv_key: PrivKey,
        committee: Committee,
        sender: Arc<dyn MessageSender>,
        failure_handler: Box<dyn CommitFailureHandler>,
        rng: Box<dyn CryptoRngCore + Send>,
    ) -> Self {
        ConsensusLeader {
            inner: Mutex::new(LeaderInner {
                common: ConsensusCommon::new(params, priv_key, committee),
                rng,
                failure_handler,
                commits: BTreeMap::new(),
                redundant_commits: BTreeMap::new(),
                commit_failures: BTreeMap::new(),
                subsets: Vec::new(),
                chosen_subset: None,
            }),
            caught_up: Condvar::new(),
            sender,
        }
    }

    fn lock(&self) -> MutexGuard<'_, LeaderInner> {
        self.inner.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Start consensus over `payload`.
    ///
    /// The collective signature covers `payload[..payload_size_for_cosign]`
    /// unless an `announcement_generator` is supplied, in which case the
    /// generator appends host metadata to the announcement and dictates the
    /// message-to-cosign. Broadcasts the announcement to the whole committee
    /// and moves to [`State::AnnounceDone`].
    pub fn start_consensus(
        &self,
        payload: &[u8],
        payload_size_for_cosign: usize,
        announcement_generator: Option<&mut dyn AnnouncementGenerator>,
    ) -> Result<(), Error> {
        let result = self.start_consensus_inner(payload, payload_size_for_cosign, announcement_generator);
        self.caught_up.notify_all();
        result
    }

    fn start_consensus_inner(
        &self,
        payload: &[u8],
        payload_size_for_cosign: usize,
        announcement_generator: Option<&mut dyn AnnouncementGenerator>,
    ) -> Result<(), Error> {
        let mut guard = self.lock();
        let inner = &mut *guard;
        let common = &mut inner.common;

        if common.state != State::Initial {
            debug!(state = ?common.state, "announce requested but instance already started");
            return Err(Error::InvalidState);
        }
        if payload.is_empty() {
            return Err(Error::EmptyPayload);
        }
        if payload_size_for_cosign > payload.len() {
            return Err(Error::MalformedMessage);
        }

        let mut msg = message::begin(common.class_tag, common.instruction_tag, MessageType::Announce);
        let body_start = msg.len();
        message::put_header(&mut msg, common.consensus_id, &common.block_hash, common.my_id);
        msg.extend_from_slice(payload);
        let cosign_payload = match announcement_generator {
            Some(generator) => generator.generate(payload, &mut msg),
            None => payload[..payload_size_for_cosign].to_vec(),
        };
        let signature = common.sign_message(inner.rng.as_mut(), &msg[body_start..]);
        msg.extend_from_slice(&signature.to_bytes());

        common.payload = payload.to_vec();
        common.cosign_payload = cosign_payload;
        common.state = State::AnnounceDone;
        info!(
            consensus_id = common.consensus_id,
            block_number = common.block_number,
            payload_len = payload.len(),
            "announcement broadcast, collecting commits"
        );
        self.sender
            .broadcast(&common.committee.addresses_except(common.my_id), &msg);
        Ok(())
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
        debug!(?kind, %from, "leader received consensus message");

        let result = match kind {
            MessageType::Commit => self.process_commit(body, Round::First),
            MessageType::CommitFailure => self.process_commit_failure(body),
            MessageType::Response => self.process_response(body, Round::First),
            MessageType::FinalCommit => self.process_commit(body, Round::Second),
            MessageType::FinalResponse => self.process_response(body, Round::Second),
            other => {
                debug!(kind = ?other, "message kind not handled by the leader role");
                Err(Error::MalformedMessage)
            }
        };
        self.caught_up.notify_all();
        result
    }

    fn process_commit(&self, body: &[u8], round: Round) -> Result<(), Error> {
        let mut guard = self.lock();
        let inner = &mut *guard;
        let common = &mut inner.common;

        let redundant = common.state == round.challenge_done_state();
        if common.state != round.commit_state() && !redundant {
            debug!(state = ?common.state, ?round, "dropping commit out of state");
            return Err(Error::InvalidState);
        }

        let mut reader = Reader::new(body);
        let header = reader.header()?;
        common.check_header(&header)?;
        let backup_id = header.peer_id;
        if backup_id as usize >= common.committee.size() || backup_id == common.my_id {
            debug!(backup_id, "commit from id outside the backup range");
            return Err(Error::MalformedMessage);
        }
        if inner.commits.contains_key(&backup_id) || inner.redundant_commits.contains_key(&backup_id) {
            debug!(backup_id, "backup already sent a validated commit");
            return Err(Error::DuplicateParticipant);
        }
        if round == Round::Second {
            // Round-2 signers must come from the round-1 signing set.
            let in_b1 = common
                .b1
                .as_ref()
                .is_some_and(|b1| b1.get(backup_id as usize));
            if !in_b1 {
                warn!(backup_id, "final commit from backup outside the CS1 bitmap");
                return Err(Error::MalformedMessage);
            }
        }

        let commit_point = CommitPoint::from_bytes(reader.bytes(constants::COMMIT_POINT_SIZE)?)
            .ok_or(Error::MalformedMessage)?;
        let signed_len = reader.position();
        let signature =
            Signature::from_bytes(reader.bytes(constants::SIGNATURE_SIZE)?).ok_or(Error::MalformedMessage)?;
        if !common.verify_peer(&body[..signed_len], &signature, backup_id) {
            warn!(backup_id, "invalid signature on commit");
            return Err(Error::InvalidSignature);
        }

        if redundant {
            inner.redundant_commits.insert(backup_id, commit_point);
            debug!(
                backup_id,
                total = inner.redundant_commits.len(),
                "commit parked after subset formation"
            );
            return Ok(());
        }

        inner.commits.insert(backup_id, commit_point);
        debug!(
            backup_id,
            received = inner.commits.len(),
            needed = common.committee.quorum(),
            "commit accepted"
        );
        if inner.commits.len() == common.committee.quorum() {
            form_subsets(inner, self.sender.as_ref(), round)?;
        }
        Ok(())
    }

    fn process_response(&self, body: &[u8], round: Round) -> Result<(), Error> {
        let mut guard = self.lock();
        let inner = &mut *guard;
        let common = &mut inner.common;

        if common.state != round.challenge_done_state() {
            debug!(state = ?common.state, ?round, "dropping response out of state");
            return Err(Error::InvalidState);
        }

        let mut reader = Reader::new(body);
        let header = reader.header()?;
        common.check_header(&header)?;
        let backup_id = header.peer_id;
        if backup_id as usize >= common.committee.size() {
            return Err(Error::MalformedMessage);
        }

        let subset_id = reader.u16()?;
        let subset = inner
            .subsets
            .get_mut(subset_id as usize)
            .ok_or(Error::MalformedMessage)?;
        if !subset.members.get(backup_id as usize) {
            warn!(backup_id, subset_id, "response from backup outside the subset");
            return Err(Error::MalformedMessage);
        }
        if subset.responses.contains_key(&backup_id) {
            debug!(backup_id, subset_id, "backup already sent a validated response");
            return Err(Error::DuplicateParticipant);
        }

        let response =
            Response::from_bytes(reader.bytes(constants::RESPONSE_SIZE)?).ok_or(Error::MalformedMessage)?;
        // Reject a bad share before it can poison the aggregate; this also
        // pins the blame on a specific backup.
        let commit_point = inner.commits.get(&backup_id).ok_or(Error::MalformedMessage)?;
        let pub_key = common
            .committee
            .pub_key(backup_id)
            .ok_or(Error::MalformedMessage)?;
        if !multisig::verify_response(&response, &subset.challenge, pub_key, commit_point) {
            warn!(backup_id, subset_id, "response share failed verification");
            return Err(Error::InvalidSignature);
        }

        let signed_len = reader.position();
        let signature =
            Signature::from_bytes(reader.bytes(constants::SIGNATURE_SIZE)?).ok_or(Error::MalformedMessage)?;
        if !common.verify_peer(&body[..signed_len], &signature, backup_id) {
            warn!(backup_id, "invalid signature on response");
            return Err(Error::InvalidSignature);
        }

        subset.responses.insert(backup_id, response);
        debug!(
            backup_id,
            subset_id,
            received = subset.responses.len(),
            needed = common.committee.quorum(),
            "response accepted"
        );
        if subset.responses.len() == common.committee.quorum() && inner.chosen_subset.is_none() {
            finish_round(inner, self.sender.as_ref(), round, subset_id as usize)?;
        }
        Ok(())
    }

    fn process_commit_failure(&self, body: &[u8]) -> Result<(), Error> {
        let mut guard = self.lock();
        let inner = &mut *guard;
        let common = &mut inner.common;

        if common.state != State::AnnounceDone {
            debug!(state = ?common.state, "dropping commit failure out of state");
            return Err(Error::InvalidState);
        }

        let mut reader = Reader::new(body);
        let header = reader.header()?;
        common.check_header(&header)?;
        let backup_id = header.peer_id;
        if backup_id as usize >= common.committee.size() || backup_id == common.my_id {
            return Err(Error::MalformedMessage);
        }
        if inner.commit_failures.contains_key(&backup_id) {
            debug!(backup_id, "backup already reported a commit failure");
            return Err(Error::DuplicateParticipant);
        }

        let error_len = reader
            .remaining()
            .checked_sub(constants::SIGNATURE_SIZE)
            .ok_or(Error::MalformedMessage)?;
        let error_body = reader.bytes(error_len)?.to_vec();
        let signed_len = reader.position();
        let signature =
            Signature::from_bytes(reader.bytes(constants::SIGNATURE_SIZE)?).ok_or(Error::MalformedMessage)?;
        if !common.verify_peer(&body[..signed_len], &signature, backup_id) {
            warn!(backup_id, "invalid signature on commit failure");
            return Err(Error::InvalidSignature);
        }

        warn!(backup_id, error_len = error_body.len(), "backup reported commit failure");
        inner.commit_failures.insert(backup_id, error_body);

        if inner.commit_failures.len() == common.committee.failure_threshold()
            && inner.failure_handler.handle(&inner.commit_failures)
        {
            let mut msg =
                message::begin(common.class_tag, common.instruction_tag, MessageType::ConsensusFailure);
            let body_start = msg.len();
            message::put_header(&mut msg, common.consensus_id, &common.block_hash, common.my_id);
            let signature = common.sign_message(inner.rng.as_mut(), &msg[body_start..]);
            msg.extend_from_slice(&signature.to_bytes());

            common.state = State::Error;
            error!(
                consensus_id = common.consensus_id,
                failures = inner.commit_failures.len(),
                "quorum unreachable, broadcasting consensus failure"
            );
            self.sender
                .broadcast(&common.committee.addresses_except(common.my_id), &msg);
            return Err(Error::QuorumImpossible);
        }
        Ok(())
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
    /// can succeed. Lets the host tolerate mild reordering without the core
    /// keeping a reorder buffer.
    pub fn can_process_message(&self, message: &[u8], offset: usize) -> bool {
        let required = match message.get(offset).copied().map(MessageType::try_from) {
            Some(Ok(MessageType::Commit)) | Some(Ok(MessageType::CommitFailure)) => State::AnnounceDone,
            Some(Ok(MessageType::Response)) => State::ChallengeDone,
            Some(Ok(MessageType::FinalCommit)) => State::CollectiveSigDone,
            Some(Ok(MessageType::FinalResponse)) => State::FinalChallengeDone,
            // Let the handler produce the precise error.
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

    /// Block until the instance reaches a terminal-enough state
    /// ([`State::Done`] or [`State::Error`]) or `timeout` elapses, returning
    /// the state observed last.
    pub fn wait_done(&self, timeout: Duration) -> State {
        let guard = self.lock();
        let (guard, _) = self
            .caught_up
            .wait_timeout_while(guard, timeout, |inner| inner.common.state < State::Done)
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        guard.common.state
    }
}

/// Partition the current committers, challenge every candidate subset, and
/// advance to the round's challenge-done state.
fn form_subsets(inner: &mut LeaderInner, sender: &dyn MessageSender, round: Round) -> Result<(), Error> {
    let common = &mut inner.common;
    let committers: Vec<u16> = inner.commits.keys().copied().collect();
    let member_sets = subset::partition_committers(
        &committers,
        common.committee.size(),
        common.committee.quorum(),
        NUM_CONSENSUS_SUBSETS,
    );
    if member_sets.is_empty() {
        error!("subset formation produced no candidates");
        common.state = State::Error;
        return Err(Error::InvalidAggregate);
    }

    inner.subsets.clear();
    inner.chosen_subset = None;
    for (subset_id, members) in member_sets.into_iter().enumerate() {
        let commit_points: Vec<CommitPoint> = members
            .iter_ones()
            .filter_map(|i| inner.commits.get(&(i as u16)).copied())
            .collect();
        let aggregated_commit = match multisig::aggregate_commits(&commit_points) {
            Some(commit) if commit_points.len() == members.count_ones() => commit,
            _ => {
                error!(subset_id, "commit aggregation failed");
                common.state = State::Error;
                return Err(Error::InvalidAggregate);
            }
        };
        let aggregated_key = match common.aggregate_keys(&members) {
            Some(key) => key,
            None => {
                error!(subset_id, "key aggregation failed");
                common.state = State::Error;
                return Err(Error::InvalidAggregate);
            }
        };
        let challenge = common.build_challenge(&aggregated_commit, &aggregated_key);

        let mut msg = message::begin(common.class_tag, common.instruction_tag, round.challenge_kind());
        let body_start = msg.len();
        message::put_header(&mut msg, common.consensus_id, &common.block_hash, common.my_id);
        message::put_u16(&mut msg, subset_id as u16);
        msg.extend_from_slice(&aggregated_commit.to_bytes());
        msg.extend_from_slice(&aggregated_key.to_bytes());
        msg.extend_from_slice(&challenge.to_bytes());
        let signature = common.sign_message(inner.rng.as_mut(), &msg[body_start..]);
        msg.extend_from_slice(&signature.to_bytes());

        let mut subset = Subset {
            members,
            aggregated_commit,
            aggregated_key,
            challenge,
            responses: BTreeMap::new(),
            state: SubsetState::Initial,
        };
        sender.broadcast(&common.committee.addresses_for(&subset.members), &msg);
        subset.state = match round {
            Round::First => SubsetState::ChallengeDone,
            Round::Second => SubsetState::FinalChallengeDone,
        };
        inner.subsets.push(subset);
    }

    common.state = round.challenge_done_state();
    info!(
        consensus_id = common.consensus_id,
        subsets = inner.subsets.len(),
        ?round,
        "challenges sent, collecting responses"
    );
    Ok(())
}

/// Aggregate the winning subset's responses into a collective signature,
/// publish it, and either switch to round 2 or finish.
fn finish_round(
    inner: &mut LeaderInner,
    sender: &dyn MessageSender,
    round: Round,
    subset_id: usize,
) -> Result<(), Error> {
    let common = &mut inner.common;
    let subset = &mut inner.subsets[subset_id];

    let responses: Vec<Response> = subset.responses.values().copied().collect();
    let aggregated_response = match multisig::aggregate_responses(&responses) {
        Some(response) => response,
        None => {
            error!(subset_id, "response aggregation failed");
            common.state = State::Error;
            return Err(Error::InvalidAggregate);
        }
    };
    // The aggregation law first: `s_agg·G + c·K_agg` must reproduce the
    // subset's aggregated commitment.
    if !multisig::verify_response(
        &aggregated_response,
        &subset.challenge,
        &subset.aggregated_key,
        &subset.aggregated_commit,
    ) {
        error!(subset_id, "aggregated response does not reproduce the aggregated commitment");
        subset.state = SubsetState::Error;
        common.state = State::Error;
        return Err(Error::InvalidAggregate);
    }
    let collective_sig = multisig::aggregate_sign(&subset.challenge, &aggregated_response);

    // Every subset member responded (quorum of quorum), so the signer
    // bitmap is exactly the membership bitmap.
    let bitmap = subset.members.clone();
    let aggregated_key = match common.aggregate_keys(&bitmap) {
        Some(key) => key,
        None => {
            error!(subset_id, "key aggregation failed");
            common.state = State::Error;
            return Err(Error::InvalidAggregate);
        }
    };
    if !multisig::verify(&common.cosign_payload, &collective_sig, &aggregated_key) {
        error!(subset_id, "aggregated collective signature failed verification");
        subset.state = SubsetState::Error;
        common.state = State::Error;
        return Err(Error::InvalidAggregate);
    }

    subset.state = match round {
        Round::First => SubsetState::CollectiveSigDone,
        Round::Second => SubsetState::Done,
    };
    inner.chosen_subset = Some(subset_id);
    for (index, other) in inner.subsets.iter_mut().enumerate() {
        if index != subset_id {
            other.state = SubsetState::Error;
        }
    }

    let mut msg = message::begin(common.class_tag, common.instruction_tag, round.collective_sig_kind());
    let body_start = msg.len();
    message::put_header(&mut msg, common.consensus_id, &common.block_hash, common.my_id);
    msg.extend_from_slice(&bitmap.encode());
    msg.extend_from_slice(&collective_sig.to_bytes());
    let signature = common.sign_message(inner.rng.as_mut(), &msg[body_start..]);
    msg.extend_from_slice(&signature.to_bytes());

    match round {
        Round::First => {
            common.cs1 = Some(collective_sig);
            common.b1 = Some(bitmap.clone());
            // Round 2 signs the round-1 output.
            let mut next_payload = collective_sig.to_bytes().to_vec();
            next_payload.extend_from_slice(&bitmap.encode());
            common.payload = next_payload.clone();
            common.cosign_payload = next_payload;
            common.state = State::CollectiveSigDone;

            inner.commits.clear();
            inner.redundant_commits.clear();
            inner.commit_failures.clear();
            inner.subsets.clear();
            inner.chosen_subset = None;
            info!(
                consensus_id = common.consensus_id,
                signers = common.b1.as_ref().map(Bitmap::count_ones).unwrap_or(0),
                "round-1 collective signature broadcast, starting round 2"
            );
        }
        Round::Second => {
            common.cs2 = Some(collective_sig);
            common.b2 = Some(bitmap);
            common.state = State::Done;

            inner.commits.clear();
            inner.redundant_commits.clear();
            inner.subsets.clear();
            inner.chosen_subset = None;
            info!(
                consensus_id = common.consensus_id,
                block_number = common.block_number,
                "consensus complete"
            );
        }
    }

    sender.broadcast(&common.committee.addresses_except(common.my_id), &msg);
    Ok(())
}
