//! Integration tests for the voting engine.

use std::collections::BTreeMap;
use std::time::Duration;

use chrono::Duration as ChronoDuration;
use quorum_core::{
    clock, Coordinator, MessageKind, NewVote, Stance, VoteError, VoteMechanism, VoteOutcome,
    VoteStatus,
};

fn voters(ids: &[&str]) -> Vec<String> {
    ids.iter().map(|s| s.to_string()).collect()
}

fn options(opts: &[&str]) -> Vec<String> {
    opts.iter().map(|s| s.to_string()).collect()
}

#[test]
fn test_insufficient_voters_then_no_quorum() {
    let coordinator = Coordinator::in_memory().unwrap();
    let voting = coordinator.voting();

    let too_few = voting.initiate(NewVote::new(
        "p",
        "X",
        options(&["yes", "no"]),
        VoteMechanism::SimpleMajority,
        voters(&["a", "b"]),
        clock::expiry(3_600),
    ));
    assert!(matches!(too_few, Err(VoteError::InsufficientVoters { got: 2, need: 3 })));

    let vote_id = voting
        .initiate(NewVote::new(
            "p",
            "X",
            options(&["yes", "no"]),
            VoteMechanism::SimpleMajority,
            voters(&["a", "b", "c"]),
            clock::expiry(3_600),
        ))
        .unwrap();

    voting.cast("a", &vote_id, "yes", None, None).unwrap();
    let result = voting.tally(&vote_id).unwrap();
    assert_eq!(result.outcome, VoteOutcome::NoQuorum);
    assert_eq!(result.total_votes, 1);
    assert_eq!(result.eligible, 3);
}

#[test]
fn test_initiate_notifies_each_voter_on_urgent() {
    let coordinator = Coordinator::in_memory().unwrap();
    let voting = coordinator.voting();
    let broker = coordinator.broker();

    let vote_id = voting
        .initiate(NewVote::new(
            "p",
            "Adopt workspace layout?",
            options(&["yes", "no"]),
            VoteMechanism::SimpleMajority,
            voters(&["a", "b", "c"]),
            clock::expiry(3_600),
        ))
        .unwrap();

    for voter in ["a", "b", "c"] {
        let inbox = broker.peek(voter, &["urgent".to_string()], 10).unwrap();
        assert_eq!(inbox.len(), 1, "voter {} missing the ballot call", voter);
        let msg = &inbox[0];
        assert_eq!(msg.kind, MessageKind::VoteInitiate);
        assert_eq!(msg.priority, 9);
        assert_eq!(msg.payload["vote_id"], vote_id.as_str());
    }
}

#[test]
fn test_simple_majority_decides() {
    let coordinator = Coordinator::in_memory().unwrap();
    let voting = coordinator.voting();

    let vote_id = voting
        .initiate(NewVote::new(
            "p",
            "TypeScript?",
            options(&["yes", "no", "defer"]),
            VoteMechanism::SimpleMajority,
            voters(&["a", "b", "c"]),
            clock::expiry(3_600),
        ))
        .unwrap();

    voting.cast("a", &vote_id, "yes", None, Some("type safety")).unwrap();
    voting.cast("b", &vote_id, "yes", None, None).unwrap();
    voting.cast("c", &vote_id, "no", None, None).unwrap();

    let result = voting.tally(&vote_id).unwrap();
    assert_eq!(result.outcome, VoteOutcome::Decided("yes".to_string()));
    assert_eq!(result.tally["yes"], 2);
    assert_eq!(result.tally["no"], 1);
    assert_eq!(result.tally["defer"], 0);

    let record = voting.status(&vote_id).unwrap();
    assert_eq!(record.status, VoteStatus::Closed);
    assert!(record.closed_at.is_some());
}

#[test]
fn test_tally_is_idempotent_and_byte_identical() {
    let coordinator = Coordinator::in_memory().unwrap();
    let voting = coordinator.voting();

    let vote_id = voting
        .initiate(NewVote::new(
            "p",
            "X",
            options(&["yes", "no"]),
            VoteMechanism::SimpleMajority,
            voters(&["a", "b", "c"]),
            clock::expiry(3_600),
        ))
        .unwrap();
    voting.cast("a", &vote_id, "yes", None, None).unwrap();
    voting.cast("b", &vote_id, "no", None, None).unwrap();

    let first = voting.tally(&vote_id).unwrap();
    let second = voting.tally(&vote_id).unwrap();
    assert_eq!(
        serde_json::to_vec(&first).unwrap(),
        serde_json::to_vec(&second).unwrap()
    );
}

#[test]
fn test_weighted_votes_use_caller_weights() {
    let coordinator = Coordinator::in_memory().unwrap();
    let voting = coordinator.voting();

    let mut weights = BTreeMap::new();
    weights.insert("senior".to_string(), 3u32);

    let vote_id = voting
        .initiate(
            NewVote::new(
                "p",
                "Approach?",
                options(&["rewrite", "refactor"]),
                VoteMechanism::Weighted,
                voters(&["senior", "b", "c"]),
                clock::expiry(3_600),
            )
            .with_weights(weights),
        )
        .unwrap();

    voting.cast("senior", &vote_id, "refactor", None, None).unwrap();
    voting.cast("b", &vote_id, "rewrite", None, None).unwrap();
    voting.cast("c", &vote_id, "rewrite", None, None).unwrap();

    let result = voting.tally(&vote_id).unwrap();
    assert_eq!(result.outcome, VoteOutcome::Decided("refactor".to_string()));
    assert_eq!(result.tally["refactor"], 3);
    assert_eq!(result.tally["rewrite"], 2);
}

#[test]
fn test_weight_validation() {
    let coordinator = Coordinator::in_memory().unwrap();
    let voting = coordinator.voting();

    let mut over_cap = BTreeMap::new();
    over_cap.insert("a".to_string(), 4u32);
    let result = voting.initiate(
        NewVote::new(
            "p",
            "X",
            options(&["yes", "no"]),
            VoteMechanism::Weighted,
            voters(&["a", "b", "c"]),
            clock::expiry(3_600),
        )
        .with_weights(over_cap),
    );
    assert!(matches!(result, Err(VoteError::InvalidVote(_))));

    let mut stranger = BTreeMap::new();
    stranger.insert("outsider".to_string(), 2u32);
    let result = voting.initiate(
        NewVote::new(
            "p",
            "X",
            options(&["yes", "no"]),
            VoteMechanism::Weighted,
            voters(&["a", "b", "c"]),
            clock::expiry(3_600),
        )
        .with_weights(stranger),
    );
    assert!(matches!(result, Err(VoteError::InvalidVote(_))));
}

#[test]
fn test_consensus_block_and_pass() {
    let coordinator = Coordinator::in_memory().unwrap();
    let voting = coordinator.voting();

    let vote_id = voting
        .initiate(NewVote::new(
            "p",
            "Merge now?",
            options(&["merge", "wait"]),
            VoteMechanism::Consensus,
            voters(&["a", "b", "c"]),
            clock::expiry(3_600),
        ))
        .unwrap();

    // A consensus ballot must carry a stance.
    let no_stance = voting.cast("a", &vote_id, "merge", None, None);
    assert!(matches!(no_stance, Err(VoteError::InvalidVote(_))));

    voting.cast("a", &vote_id, "merge", Some(Stance::Support), None).unwrap();
    voting.cast("b", &vote_id, "merge", Some(Stance::Support), None).unwrap();
    voting
        .cast("c", &vote_id, "wait", Some(Stance::Block), Some("migration not staged"))
        .unwrap();

    let result = voting.tally(&vote_id).unwrap();
    assert_eq!(result.outcome, VoteOutcome::Blocked);
    assert_eq!(result.blockers.len(), 1);
    assert_eq!(result.blockers[0].voter, "c");
    assert_eq!(result.blockers[0].reasoning.as_deref(), Some("migration not staged"));

    // Same shape without the block passes.
    let vote_id = voting
        .initiate(NewVote::new(
            "p",
            "Merge later?",
            options(&["merge", "wait"]),
            VoteMechanism::Consensus,
            voters(&["a", "b", "c"]),
            clock::expiry(3_600),
        ))
        .unwrap();
    voting.cast("a", &vote_id, "merge", Some(Stance::Support), None).unwrap();
    voting.cast("b", &vote_id, "merge", Some(Stance::Support), None).unwrap();
    voting.cast("c", &vote_id, "merge", Some(Stance::Acceptable), None).unwrap();
    assert_eq!(voting.tally(&vote_id).unwrap().outcome, VoteOutcome::Passed);
}

#[test]
fn test_cast_eligibility_and_uniqueness() {
    let coordinator = Coordinator::in_memory().unwrap();
    let voting = coordinator.voting();

    let vote_id = voting
        .initiate(NewVote::new(
            "p",
            "X",
            options(&["yes", "no"]),
            VoteMechanism::SimpleMajority,
            voters(&["a", "b", "c"]),
            clock::expiry(3_600),
        ))
        .unwrap();

    let outsider = voting.cast("z", &vote_id, "yes", None, None);
    assert!(matches!(outsider, Err(VoteError::NotEligible { .. })));

    let bad_choice = voting.cast("a", &vote_id, "maybe", None, None);
    assert!(matches!(bad_choice, Err(VoteError::InvalidVote(_))));

    voting.cast("a", &vote_id, "yes", None, None).unwrap();
    let repeat = voting.cast("a", &vote_id, "no", None, None);
    assert!(matches!(repeat, Err(VoteError::AlreadyVoted { .. })));

    // Exactly one ballot for the voter survives.
    let record = voting.status(&vote_id).unwrap();
    assert_eq!(record.votes_cast.len(), 1);
    assert_eq!(record.votes_cast["a"].choice, "yes");
}

#[test]
fn test_deadline_enforcement() {
    let coordinator = Coordinator::in_memory().unwrap();
    let voting = coordinator.voting();

    let vote_id = voting
        .initiate(NewVote::new(
            "p",
            "X",
            options(&["yes", "no"]),
            VoteMechanism::SimpleMajority,
            voters(&["a", "b", "c"]),
            clock::now() + ChronoDuration::milliseconds(150),
        ))
        .unwrap();

    voting.cast("a", &vote_id, "yes", None, None).unwrap();
    voting.cast("b", &vote_id, "yes", None, None).unwrap();
    std::thread::sleep(Duration::from_millis(200));

    let late = voting.cast("c", &vote_id, "no", None, None);
    assert!(matches!(late, Err(VoteError::VoteClosed(_))));

    // Tallying a deadline-past open vote closes it with what was cast.
    let result = voting.tally(&vote_id).unwrap();
    assert_eq!(result.outcome, VoteOutcome::Decided("yes".to_string()));
    assert_eq!(result.total_votes, 2);
}

#[test]
fn test_cast_after_close_rejected() {
    let coordinator = Coordinator::in_memory().unwrap();
    let voting = coordinator.voting();

    let vote_id = voting
        .initiate(NewVote::new(
            "p",
            "X",
            options(&["yes", "no"]),
            VoteMechanism::SimpleMajority,
            voters(&["a", "b", "c"]),
            clock::expiry(3_600),
        ))
        .unwrap();
    voting.cast("a", &vote_id, "yes", None, None).unwrap();
    voting.cast("b", &vote_id, "yes", None, None).unwrap();
    voting.tally(&vote_id).unwrap();

    let late = voting.cast("c", &vote_id, "no", None, None);
    assert!(matches!(late, Err(VoteError::VoteClosed(_))));
}

#[test]
fn test_result_broadcast_to_voters() {
    let coordinator = Coordinator::in_memory().unwrap();
    let voting = coordinator.voting();
    let broker = coordinator.broker();

    let vote_id = voting
        .initiate(NewVote::new(
            "p",
            "X",
            options(&["yes", "no"]),
            VoteMechanism::SimpleMajority,
            voters(&["a", "b", "c"]),
            clock::expiry(3_600),
        ))
        .unwrap();
    voting.cast("a", &vote_id, "yes", None, None).unwrap();
    voting.cast("b", &vote_id, "yes", None, None).unwrap();
    voting.tally(&vote_id).unwrap();

    for voter in ["a", "b", "c"] {
        let results = broker
            .peek_filtered(
                voter,
                &["general".to_string()],
                10,
                Some(&MessageKind::VoteResult),
            )
            .unwrap();
        assert_eq!(results.len(), 1, "voter {} missing the result", voter);
        assert_eq!(results[0].priority, 8);
        assert_eq!(results[0].payload["vote_id"], vote_id.as_str());
    }
}

#[test]
fn test_open_votes_and_cancel() {
    let coordinator = Coordinator::in_memory().unwrap();
    let voting = coordinator.voting();

    let first = voting
        .initiate(NewVote::new(
            "p",
            "first",
            options(&["yes", "no"]),
            VoteMechanism::SimpleMajority,
            voters(&["a", "b", "c"]),
            clock::expiry(3_600),
        ))
        .unwrap();
    std::thread::sleep(Duration::from_millis(5));
    let second = voting
        .initiate(NewVote::new(
            "p",
            "second",
            options(&["yes", "no"]),
            VoteMechanism::SimpleMajority,
            voters(&["a", "b", "c"]),
            clock::expiry(3_600),
        ))
        .unwrap();

    let open: Vec<String> =
        voting.open_votes().unwrap().into_iter().map(|v| v.vote_id).collect();
    assert_eq!(open, vec![second.clone(), first.clone()]);

    voting.cancel(&first, "p").unwrap();
    assert_eq!(voting.status(&first).unwrap().status, VoteStatus::Cancelled);

    let tally_cancelled = voting.tally(&first);
    assert!(matches!(tally_cancelled, Err(VoteError::VoteClosed(_))));

    let cast_cancelled = voting.cast("a", &first, "yes", None, None);
    assert!(matches!(cast_cancelled, Err(VoteError::VoteClosed(_))));
}

#[test]
fn test_duplicate_options_rejected() {
    let coordinator = Coordinator::in_memory().unwrap();
    let voting = coordinator.voting();

    let result = voting.initiate(NewVote::new(
        "p",
        "X",
        options(&["yes", "yes"]),
        VoteMechanism::SimpleMajority,
        voters(&["a", "b", "c"]),
        clock::expiry(3_600),
    ));
    assert!(matches!(result, Err(VoteError::InvalidVote(_))));
}
