//! End-to-end protocol scenarios, driven through `process_message` with
//! real wire bytes captured from a recording transport.

use std::collections::BTreeMap;
use std::net::SocketAddr;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use rand_chacha::ChaChaRng;
use rand_core::SeedableRng;

use cosig::traits::{CommitFailureHandler, MessageSender, PayloadValidator};
use cosig::{
    multisig, Bitmap, Committee, CommitteeMember, ConsensusBackup, ConsensusLeader, Error,
    MessageType, PrivKey, PubKey, SessionParams, Signature, State,
};

const CLASS_TAG: u8 = 0x01;
const INSTRUCTION_TAG: u8 = 0x02;
const CONSENSUS_ID: u32 = 7;
const BLOCK_HASH: [u8; 32] = [0x42; 32];
const BLOCK_NUMBER: u64 = 900;
/// Offset of the message-type byte in a delivered message.
const TYPE_OFFSET: usize = 2;
const PAYLOAD: &[u8] = b"one serialized microblock";

#[derive(Default)]
struct RecordingSender {
    outbox: Mutex<Vec<(Vec<SocketAddr>, Vec<u8>)>>,
}

impl RecordingSender {
    fn drain(&self) -> Vec<(Vec<SocketAddr>, Vec<u8>)> {
        std::mem::take(&mut *self.outbox.lock().unwrap())
    }
}

impl MessageSender for RecordingSender {
    fn send(&self, peer: &SocketAddr, message: &[u8]) {
        self.outbox
            .lock()
            .unwrap()
            .push((vec![*peer], message.to_vec()));
    }

    fn broadcast(&self, peers: &[SocketAddr], message: &[u8]) {
        self.outbox
            .lock()
            .unwrap()
            .push((peers.to_vec(), message.to_vec()));
    }
}

struct AcceptAll;

impl PayloadValidator for AcceptAll {
    fn validate(&self, payload: &[u8]) -> Result<Vec<u8>, Vec<u8>> {
        Ok(payload.to_vec())
    }
}

struct RejectWith(&'static [u8]);

impl PayloadValidator for RejectWith {
    fn validate(&self, _payload: &[u8]) -> Result<Vec<u8>, Vec<u8>> {
        Err(self.0.to_vec())
    }
}

#[derive(Default)]
struct RecordingFailureHandler {
    calls: Arc<Mutex<Vec<BTreeMap<u16, Vec<u8>>>>>,
}

impl CommitFailureHandler for RecordingFailureHandler {
    fn handle(&mut self, failures: &BTreeMap<u16, Vec<u8>>) -> bool {
        self.calls.lock().unwrap().push(failures.clone());
        true
    }
}

fn addr(id: u16) -> SocketAddr {
    format!("127.0.0.1:{}", 7100 + id).parse().unwrap()
}

fn params(my_id: u16) -> SessionParams {
    SessionParams {
        consensus_id: CONSENSUS_ID,
        block_number: BLOCK_NUMBER,
        block_hash: BLOCK_HASH,
        my_id,
        class_tag: CLASS_TAG,
        instruction_tag: INSTRUCTION_TAG,
    }
}

struct Fixture {
    leader: ConsensusLeader,
    leader_out: Arc<RecordingSender>,
    /// Backup with committee id `i + 1` sits at index `i`.
    backups: Vec<ConsensusBackup>,
    backup_out: Vec<Arc<RecordingSender>>,
    priv_keys: Vec<PrivKey>,
    pub_keys: Vec<PubKey>,
    failure_calls: Arc<Mutex<Vec<BTreeMap<u16, Vec<u8>>>>>,
    n: usize,
}

impl Fixture {
    fn new(n: usize) -> Self {
        Self::with_validators(n, |_| Box::new(AcceptAll))
    }

    fn with_validators(
        n: usize,
        mut validator_for: impl FnMut(u16) -> Box<dyn PayloadValidator>,
    ) -> Self {
        let mut rng = ChaChaRng::seed_from_u64(0xc051);
        let priv_keys: Vec<PrivKey> = (0..n).map(|_| PrivKey::new(&mut rng)).collect();
        let pub_keys: Vec<PubKey> = priv_keys.iter().map(PrivKey::pub_key).collect();
        let committee = Committee::new(
            pub_keys
                .iter()
                .enumerate()
                .map(|(id, pub_key)| CommitteeMember {
                    pub_key: *pub_key,
                    address: addr(id as u16),
                })
                .collect(),
        );

        let failure_calls = Arc::new(Mutex::new(Vec::new()));
        let leader_out = Arc::new(RecordingSender::default());
        let leader = ConsensusLeader::new(
            params(0),
            priv_keys[0].clone(),
            committee.clone(),
            leader_out.clone(),
            Box::new(RecordingFailureHandler {
                calls: failure_calls.clone(),
            }),
            Box::new(ChaChaRng::seed_from_u64(0x1ead)),
        );

        let mut backups = Vec::new();
        let mut backup_out = Vec::new();
        for id in 1..n as u16 {
            let out = Arc::new(RecordingSender::default());
            backups.push(ConsensusBackup::new(
                params(id),
                0,
                priv_keys[id as usize].clone(),
                committee.clone(),
                out.clone(),
                validator_for(id),
                Box::new(ChaChaRng::seed_from_u64(0xbac0 + id as u64)),
            ));
            backup_out.push(out);
        }

        Fixture {
            leader,
            leader_out,
            backups,
            backup_out,
            priv_keys,
            pub_keys,
            failure_calls,
            n,
        }
    }

    fn backup(&self, id: u16) -> &ConsensusBackup {
        &self.backups[id as usize - 1]
    }

    fn backup_outbox(&self, id: u16) -> &RecordingSender {
        &self.backup_out[id as usize - 1]
    }

    /// Start consensus and return the broadcast announcement.
    fn announce(&self) -> Vec<u8> {
        self.leader
            .start_consensus(PAYLOAD, PAYLOAD.len(), None)
            .unwrap();
        let mut sent = self.leader_out.drain();
        assert_eq!(sent.len(), 1);
        let (targets, msg) = sent.pop().unwrap();
        assert_eq!(targets.len(), self.n - 1);
        assert_eq!(MessageType::try_from(msg[TYPE_OFFSET]), Ok(MessageType::Announce));
        msg
    }

    /// Deliver the announcement to `id` and return the commit it emits.
    fn commit_from(&self, id: u16, announcement: &[u8]) -> Vec<u8> {
        self.backup(id)
            .process_message(announcement, TYPE_OFFSET, addr(0))
            .unwrap();
        assert_eq!(self.backup(id).state(), State::CommitDone);
        let mut sent = self.backup_outbox(id).drain();
        assert_eq!(sent.len(), 1);
        let (targets, msg) = sent.pop().unwrap();
        assert_eq!(targets, vec![addr(0)]);
        msg
    }

    /// Deliver a backup-originated message to the leader.
    fn to_leader(&self, id: u16, msg: &[u8]) -> Result<(), Error> {
        self.leader.process_message(msg, TYPE_OFFSET, addr(id))
    }

    /// Deliver a leader-originated message to a backup and return whatever
    /// the backup sends back to the leader.
    fn to_backup(&self, id: u16, msg: &[u8]) -> (Result<(), Error>, Vec<Vec<u8>>) {
        let result = self.backup(id).process_message(msg, TYPE_OFFSET, addr(0));
        let replies = self
            .backup_outbox(id)
            .drain()
            .into_iter()
            .map(|(_, msg)| msg)
            .collect();
        (result, replies)
    }

    /// Drive round 1 up to the point where the leader has broadcast CS1,
    /// with commits arriving from `committers` in order. Returns the
    /// collective-signature broadcast.
    fn run_round1(&self, committers: &[u16]) -> Vec<u8> {
        let announcement = self.announce();
        let commits: Vec<(u16, Vec<u8>)> = committers
            .iter()
            .map(|&id| (id, self.commit_from(id, &announcement)))
            .collect();

        let quorum = self.quorum();
        for (i, (id, commit)) in commits.iter().enumerate() {
            self.to_leader(*id, commit).unwrap();
            if i + 1 < quorum {
                assert_eq!(self.leader.state(), State::AnnounceDone);
            }
        }
        assert_eq!(self.leader.state(), State::ChallengeDone);

        let challenges = self.leader_out.drain();
        assert!(!challenges.is_empty());
        let (members, challenge) = &challenges[0];
        assert_eq!(
            MessageType::try_from(challenge[TYPE_OFFSET]),
            Ok(MessageType::Challenge)
        );
        assert_eq!(members.len(), quorum);

        for &id in committers.iter().take(quorum) {
            let (result, mut replies) = self.to_backup(id, challenge);
            result.unwrap();
            assert_eq!(self.backup(id).state(), State::ResponseDone);
            self.to_leader(id, &replies.pop().unwrap()).unwrap();
        }
        assert_eq!(self.leader.state(), State::CollectiveSigDone);

        let mut sent = self.leader_out.drain();
        assert_eq!(sent.len(), 1);
        let (targets, collective_sig) = sent.pop().unwrap();
        assert_eq!(targets.len(), self.n - 1);
        assert_eq!(
            MessageType::try_from(collective_sig[TYPE_OFFSET]),
            Ok(MessageType::CollectiveSig)
        );
        collective_sig
    }

    /// Drive round 2 from the CS1 broadcast to completion. `signers` are the
    /// round-1 subset members that keep participating.
    fn run_round2(&self, collective_sig: &[u8], signers: &[u16]) -> Vec<u8> {
        for &id in signers {
            let (result, mut replies) = self.to_backup(id, collective_sig);
            result.unwrap();
            assert_eq!(self.backup(id).state(), State::FinalCommitDone);
            self.to_leader(id, &replies.pop().unwrap()).unwrap();
        }
        assert_eq!(self.leader.state(), State::FinalChallengeDone);

        let challenges = self.leader_out.drain();
        let (_, final_challenge) = &challenges[0];
        assert_eq!(
            MessageType::try_from(final_challenge[TYPE_OFFSET]),
            Ok(MessageType::FinalChallenge)
        );

        for &id in signers {
            let (result, mut replies) = self.to_backup(id, final_challenge);
            result.unwrap();
            assert_eq!(self.backup(id).state(), State::FinalResponseDone);
            self.to_leader(id, &replies.pop().unwrap()).unwrap();
        }
        assert_eq!(self.leader.state(), State::Done);

        let mut sent = self.leader_out.drain();
        assert_eq!(sent.len(), 1);
        let (_, final_collective_sig) = sent.pop().unwrap();
        assert_eq!(
            MessageType::try_from(final_collective_sig[TYPE_OFFSET]),
            Ok(MessageType::FinalCollectiveSig)
        );
        final_collective_sig
    }

    fn quorum(&self) -> usize {
        self.n - (self.n - 1) / 3
    }
}

/// Split a collective-signature broadcast into its bitmap and signature.
fn parse_collective_sig(msg: &[u8], n: usize) -> (Bitmap, Signature) {
    let body = &msg[TYPE_OFFSET + 1..];
    let bitmap_offset = 4 + 32 + 2;
    let bitmap_width = 2 + (n + 7) / 8;
    let bitmap = Bitmap::decode(&body[bitmap_offset..bitmap_offset + bitmap_width], (n + 7) / 8).unwrap();
    let sig_offset = bitmap_offset + bitmap_width;
    let signature = Signature::from_bytes(&body[sig_offset..sig_offset + 64]).unwrap();
    (bitmap, signature)
}

fn push_header(msg: &mut Vec<u8>, peer_id: u16) {
    msg.extend_from_slice(&CONSENSUS_ID.to_be_bytes());
    msg.extend_from_slice(&BLOCK_HASH);
    msg.extend_from_slice(&peer_id.to_be_bytes());
}

/// S1: four-member committee, everyone honest and prompt.
#[test]
fn happy_path_unanimous() {
    let fix = Fixture::new(4);
    let collective_sig = fix.run_round1(&[1, 2, 3]);
    let (b1, cs1) = parse_collective_sig(&collective_sig, 4);
    assert_eq!(b1.count_ones(), 3);

    let final_collective_sig = fix.run_round2(&collective_sig, &[1, 2, 3]);
    let (b2, cs2) = parse_collective_sig(&final_collective_sig, 4);

    // Every honest observer lands on DONE with byte-identical outputs.
    let leader_sig = fix.leader.retrieve_collective_sig().unwrap();
    let leader_bitmap = fix.leader.retrieve_collective_sig_bitmap().unwrap();
    assert_eq!(leader_sig, cs2);
    assert_eq!(leader_bitmap, b2.encode());
    for id in 1..=3 {
        let (result, replies) = fix.to_backup(id, &final_collective_sig);
        result.unwrap();
        assert!(replies.is_empty());
        assert_eq!(fix.backup(id).state(), State::Done);
        assert_eq!(fix.backup(id).retrieve_collective_sig(), Some(cs2));
        assert_eq!(
            fix.backup(id).retrieve_collective_sig_bitmap(),
            Some(b2.encode())
        );
    }

    // Quorum and subset properties.
    assert!(b1.count_ones() >= fix.quorum());
    assert!(b2.count_ones() >= fix.quorum());
    assert!(b2.is_subset_of(&b1));

    // The final signature verifies against B2's keys over `CS1 ‖ B1`.
    let mut round2_payload = cs1.to_bytes().to_vec();
    round2_payload.extend_from_slice(&b1.encode());
    let keys: Vec<PubKey> = b2.iter_ones().map(|i| fix.pub_keys[i]).collect();
    let aggregated_key = multisig::aggregate_pub_keys(&keys).unwrap();
    assert!(multisig::verify(&round2_payload, &cs2, &aggregated_key));
}

/// S2: a slow sixth backup commits after the threshold; consensus completes
/// without it and its late contributions are parked or rejected.
#[test]
fn slow_backup_is_left_out() {
    let fix = Fixture::new(7);
    let announcement = fix.announce();

    let commits: Vec<(u16, Vec<u8>)> = (1..=6u16)
        .map(|id| (id, fix.commit_from(id, &announcement)))
        .collect();

    // Five commits reach the quorum and fix the subset.
    for (id, commit) in commits.iter().take(5) {
        fix.to_leader(*id, commit).unwrap();
    }
    assert_eq!(fix.leader.state(), State::ChallengeDone);
    let challenges = fix.leader_out.drain();
    let (members, challenge) = &challenges[0];
    assert_eq!(members.len(), 5);

    // The straggler's commit is accepted into the redundant pool only.
    fix.to_leader(6, &commits[5].1).unwrap();
    assert_eq!(fix.leader.state(), State::ChallengeDone);
    assert!(fix.leader_out.drain().is_empty());

    for id in 1..=5u16 {
        let (result, mut replies) = fix.to_backup(id, challenge);
        result.unwrap();
        fix.to_leader(id, &replies.pop().unwrap()).unwrap();
    }
    assert_eq!(fix.leader.state(), State::CollectiveSigDone);
    let (_, collective_sig) = fix.leader_out.drain().pop().unwrap();

    let (b1, _) = parse_collective_sig(&collective_sig, 7);
    assert_eq!(b1.iter_ones().collect::<Vec<_>>(), vec![1, 2, 3, 4, 5]);

    // The straggler still verifies CS1 and volunteers for round 2, but it
    // is outside B1 and the leader must refuse its final commit.
    let (result, mut replies) = fix.to_backup(6, &collective_sig);
    result.unwrap();
    assert_eq!(fix.backup(6).state(), State::FinalCommitDone);
    assert_eq!(
        fix.to_leader(6, &replies.pop().unwrap()),
        Err(Error::MalformedMessage)
    );

    let final_collective_sig = fix.run_round2(&collective_sig, &[1, 2, 3, 4, 5]);
    let (b2, _) = parse_collective_sig(&final_collective_sig, 7);
    assert!(b2.is_subset_of(&b1));
    assert!(!b2.get(6));

    // The straggler converges on the same final state as everyone else.
    let (result, _) = fix.to_backup(6, &final_collective_sig);
    result.unwrap();
    assert_eq!(fix.backup(6).state(), State::Done);
    assert_eq!(
        fix.backup(6).retrieve_collective_sig(),
        fix.leader.retrieve_collective_sig()
    );
}

/// S3: a zeroed response share is rejected without poisoning the round, and
/// a later valid share from the same backup completes it.
#[test]
fn bad_response_share_is_rejected() {
    let fix = Fixture::new(7);
    let announcement = fix.announce();
    for id in 1..=5u16 {
        let commit = fix.commit_from(id, &announcement);
        fix.to_leader(id, &commit).unwrap();
    }
    let challenges = fix.leader_out.drain();
    let (_, challenge) = &challenges[0];

    // Honest responses from four of the five subset members.
    for id in 1..=4u16 {
        let (result, mut replies) = fix.to_backup(id, challenge);
        result.unwrap();
        fix.to_leader(id, &replies.pop().unwrap()).unwrap();
    }
    assert_eq!(fix.leader.state(), State::ChallengeDone);

    // Backup 5 first sends a properly signed but zeroed response share.
    let mut forged = vec![CLASS_TAG, INSTRUCTION_TAG, MessageType::Response as u8];
    let body_start = forged.len();
    push_header(&mut forged, 5);
    forged.extend_from_slice(&0u16.to_be_bytes()); // subset id
    forged.extend_from_slice(&[0u8; 32]); // zero scalar
    let body = forged[body_start..].to_vec();
    let mut rng = ChaChaRng::seed_from_u64(0xbad);
    let signature = multisig::sign(&mut rng, &body, &fix.priv_keys[5], &fix.pub_keys[5]);
    forged.extend_from_slice(&signature.to_bytes());

    assert_eq!(fix.to_leader(5, &forged), Err(Error::InvalidSignature));
    assert_eq!(fix.leader.state(), State::ChallengeDone);
    assert!(fix.leader_out.drain().is_empty());

    // The genuine response still counts: the bad share was never recorded.
    let (result, mut replies) = fix.to_backup(5, challenge);
    result.unwrap();
    fix.to_leader(5, &replies.pop().unwrap()).unwrap();
    assert_eq!(fix.leader.state(), State::CollectiveSigDone);
}

/// S4: f + 1 commit failures trip the consensus-failure escape hatch.
#[test]
fn commit_failures_abort_the_instance() {
    const ERROR_BODY: &[u8] = b"RECEIPT_HASH_MISMATCH";
    let fix = Fixture::with_validators(4, |id| {
        if id <= 2 {
            Box::new(RejectWith(ERROR_BODY))
        } else {
            Box::new(AcceptAll)
        }
    });
    let announcement = fix.announce();

    // Backup 3 is healthy and commits normally.
    let commit = fix.commit_from(3, &announcement);
    fix.to_leader(3, &commit).unwrap();

    // Backups 1 and 2 reject the payload and report commit failures.
    let mut failure_msgs = Vec::new();
    for id in 1..=2u16 {
        let (result, mut replies) = fix.to_backup(id, &announcement);
        assert_eq!(result, Err(Error::PayloadRejected));
        assert_eq!(fix.backup(id).state(), State::Error);
        let msg = replies.pop().unwrap();
        assert_eq!(
            MessageType::try_from(msg[TYPE_OFFSET]),
            Ok(MessageType::CommitFailure)
        );
        failure_msgs.push(msg);
    }

    // First failure: recorded, nothing else happens (f + 1 = 2 here).
    fix.to_leader(1, &failure_msgs[0]).unwrap();
    assert_eq!(fix.leader.state(), State::AnnounceDone);
    assert!(fix.failure_calls.lock().unwrap().is_empty());

    // Second failure reaches the threshold: the host handler sees both
    // error bodies and the leader broadcasts a consensus failure.
    assert_eq!(fix.to_leader(2, &failure_msgs[1]), Err(Error::QuorumImpossible));
    assert_eq!(fix.leader.state(), State::Error);
    let calls = fix.failure_calls.lock().unwrap();
    assert_eq!(calls.len(), 1);
    assert_eq!(calls[0].get(&1).map(Vec::as_slice), Some(ERROR_BODY));
    assert_eq!(calls[0].get(&2).map(Vec::as_slice), Some(ERROR_BODY));
    drop(calls);

    let mut sent = fix.leader_out.drain();
    let (targets, failure_broadcast) = sent.pop().unwrap();
    assert_eq!(targets.len(), 3);
    assert_eq!(
        MessageType::try_from(failure_broadcast[TYPE_OFFSET]),
        Ok(MessageType::ConsensusFailure)
    );

    // The healthy backup observes the broadcast and goes to ERROR too.
    let (result, replies) = fix.to_backup(3, &failure_broadcast);
    result.unwrap();
    assert!(replies.is_empty());
    assert_eq!(fix.backup(3).state(), State::Error);
}

/// S5: a challenge whose scalar is not the Fiat-Shamir hash is refused by
/// every honest backup without a response being emitted.
#[test]
fn forged_challenge_is_refused() {
    let fix = Fixture::new(4);
    let announcement = fix.announce();
    let mut commits = Vec::new();
    for id in 1..=3u16 {
        commits.push(fix.commit_from(id, &announcement));
    }

    // Leader-signed challenge over R, K of the leader's choosing, with the
    // scalar computed over a different message.
    let mut rng = ChaChaRng::seed_from_u64(0xf0f0);
    let fake_commit = cosig::CommitSecret::new(&mut rng).commit_point();
    let fake_key = fix.pub_keys[0];
    let wrong_challenge = multisig::build_challenge(&fake_commit, &fake_key, b"a different payload");

    let mut forged = vec![CLASS_TAG, INSTRUCTION_TAG, MessageType::Challenge as u8];
    let body_start = forged.len();
    push_header(&mut forged, 0);
    forged.extend_from_slice(&0u16.to_be_bytes());
    forged.extend_from_slice(&fake_commit.to_bytes());
    forged.extend_from_slice(&fake_key.to_bytes());
    forged.extend_from_slice(&wrong_challenge.to_bytes());
    let body = forged[body_start..].to_vec();
    let signature = multisig::sign(&mut rng, &body, &fix.priv_keys[0], &fix.pub_keys[0]);
    forged.extend_from_slice(&signature.to_bytes());

    for id in 1..=3u16 {
        let (result, replies) = fix.to_backup(id, &forged);
        assert_eq!(result, Err(Error::ChallengeMismatch));
        assert!(replies.is_empty());
        assert_eq!(fix.backup(id).state(), State::Error);
    }
}

/// S6: replaying a commit neither double-counts nor changes state.
#[test]
fn replayed_commit_is_dropped() {
    let fix = Fixture::new(4);
    let announcement = fix.announce();
    let commit1 = fix.commit_from(1, &announcement);
    let commit2 = fix.commit_from(2, &announcement);
    let commit3 = fix.commit_from(3, &announcement);

    fix.to_leader(1, &commit1).unwrap();
    fix.to_leader(2, &commit2).unwrap();
    assert_eq!(fix.leader.state(), State::AnnounceDone);

    // The replay is rejected and contributes nothing to the count.
    assert_eq!(fix.to_leader(2, &commit2), Err(Error::DuplicateParticipant));
    assert_eq!(fix.leader.state(), State::AnnounceDone);
    assert!(fix.leader_out.drain().is_empty());

    // The third distinct commit completes the quorum.
    fix.to_leader(3, &commit3).unwrap();
    assert_eq!(fix.leader.state(), State::ChallengeDone);
}

#[test]
fn out_of_order_messages_are_dropped_not_queued() {
    let fix = Fixture::new(4);

    // A commit before the announcement finds the leader in INITIAL.
    let fake_commit = vec![CLASS_TAG, INSTRUCTION_TAG, MessageType::Commit as u8];
    assert_eq!(
        fix.leader.process_message(&fake_commit, TYPE_OFFSET, addr(1)),
        Err(Error::InvalidState)
    );

    // A backup refuses a challenge before it has committed.
    let challenge_probe = vec![CLASS_TAG, INSTRUCTION_TAG, MessageType::Challenge as u8];
    let (result, replies) = fix.to_backup(1, &challenge_probe);
    assert_eq!(result, Err(Error::InvalidState));
    assert!(replies.is_empty());

    let announcement = fix.announce();

    // A second announcement is refused outright.
    assert_eq!(
        fix.leader.start_consensus(PAYLOAD, PAYLOAD.len(), None),
        Err(Error::InvalidState)
    );

    // Replaying the announcement to a committed backup changes nothing.
    let (result, _) = fix.to_backup(1, &announcement[..]);
    result.unwrap();
    let (result, replies) = fix.to_backup(1, &announcement[..]);
    assert_eq!(result, Err(Error::InvalidState));
    assert!(replies.is_empty());
    assert_eq!(fix.backup(1).state(), State::CommitDone);
}

#[test]
fn retrieval_is_gated_on_done() {
    let fix = Fixture::new(4);
    assert_eq!(fix.leader.retrieve_collective_sig(), None);
    assert_eq!(fix.leader.retrieve_collective_sig_bitmap(), None);

    let collective_sig = fix.run_round1(&[1, 2, 3]);
    assert_eq!(fix.leader.retrieve_collective_sig(), None);

    fix.run_round2(&collective_sig, &[1, 2, 3]);
    assert!(fix.leader.retrieve_collective_sig().is_some());
    assert!(fix.leader.retrieve_collective_sig_bitmap().is_some());
}

#[test]
fn can_process_message_waits_for_the_state_machine() {
    let fix = Fixture::new(4);
    let announcement = fix.announce();

    // Already-satisfied requirements return immediately.
    let commit_probe = vec![CLASS_TAG, INSTRUCTION_TAG, MessageType::Commit as u8];
    assert!(fix.leader.can_process_message(&commit_probe, TYPE_OFFSET));

    // A backup asked about a challenge catches up once the announcement
    // lands from another thread.
    let challenge_probe = vec![CLASS_TAG, INSTRUCTION_TAG, MessageType::Challenge as u8];
    std::thread::scope(|scope| {
        let backup = fix.backup(1);
        let announcement = &announcement;
        scope.spawn(move || {
            std::thread::sleep(Duration::from_millis(50));
            backup
                .process_message(announcement, TYPE_OFFSET, addr(0))
                .unwrap();
        });
        assert!(backup.can_process_message(&challenge_probe, TYPE_OFFSET));
    });
    assert_eq!(fix.backup(1).state(), State::CommitDone);
}

#[test]
fn wait_done_observes_completion() {
    let fix = Fixture::new(4);
    let collective_sig = fix.run_round1(&[1, 2, 3]);

    std::thread::scope(|scope| {
        let leader = &fix.leader;
        scope.spawn(move || {
            assert_eq!(leader.wait_done(Duration::from_secs(5)), State::Done);
        });
        std::thread::sleep(Duration::from_millis(20));
        fix.run_round2(&collective_sig, &[1, 2, 3]);
    });
}
