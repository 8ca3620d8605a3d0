//! Vote data structures and tally computation.

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Tally mechanism for a vote.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum VoteMechanism {
    /// One voter, one vote; strict plurality wins.
    SimpleMajority,
    /// Caller-supplied per-voter weights (1-3); strict plurality of weight.
    Weighted,
    /// Stance-based: passes only without blockers and with majority support.
    Consensus,
}

impl VoteMechanism {
    /// String form stored in the database.
    pub fn as_str(&self) -> &'static str {
        match self {
            VoteMechanism::SimpleMajority => "simple_majority",
            VoteMechanism::Weighted => "weighted",
            VoteMechanism::Consensus => "consensus",
        }
    }

    /// Parses the stored string form.
    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "simple_majority" => Some(VoteMechanism::SimpleMajority),
            "weighted" => Some(VoteMechanism::Weighted),
            "consensus" => Some(VoteMechanism::Consensus),
            _ => None,
        }
    }
}

/// Vote lifecycle status.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum VoteStatus {
    /// Accepting ballots.
    Open,
    /// Tallied; result recorded.
    Closed,
    /// Withdrawn before tally.
    Cancelled,
}

impl VoteStatus {
    /// String form stored in the database.
    pub fn as_str(&self) -> &'static str {
        match self {
            VoteStatus::Open => "open",
            VoteStatus::Closed => "closed",
            VoteStatus::Cancelled => "cancelled",
        }
    }

    /// Parses the stored string form.
    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "open" => Some(VoteStatus::Open),
            "closed" => Some(VoteStatus::Closed),
            "cancelled" => Some(VoteStatus::Cancelled),
            _ => None,
        }
    }
}

/// A voter's position in a consensus vote.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Stance {
    /// Actively in favor.
    Support,
    /// Can live with it.
    Acceptable,
    /// Vetoes the proposal.
    Block,
}

/// One cast ballot.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Ballot {
    /// The chosen option.
    pub choice: String,
    /// Consensus stance; `None` for other mechanisms.
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub stance: Option<Stance>,
    /// Free-form reasoning.
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub reasoning: Option<String>,
    /// When the ballot was cast.
    pub cast_at: DateTime<Utc>,
}

/// Outcome of a tally.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum VoteOutcome {
    /// A single option won.
    Decided(String),
    /// Two or more options shared the greatest count.
    Tie,
    /// Consensus reached (no blocks, majority support).
    Passed,
    /// Consensus vetoed.
    Blocked,
    /// Fewer than half the eligible voters cast.
    NoQuorum,
}

/// A blocking voter in a consensus tally.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Blocker {
    /// Who blocked.
    pub voter: String,
    /// Their stated reasoning, if any.
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub reasoning: Option<String>,
}

/// Result record produced by the first (and only) tally.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TallyResult {
    /// The outcome.
    pub outcome: VoteOutcome,
    /// Per-option counts (weight sums for weighted votes). Every option
    /// appears, even with zero votes.
    pub tally: BTreeMap<String, i64>,
    /// Ballots cast.
    pub total_votes: u32,
    /// Size of the eligible set.
    pub eligible: u32,
    /// Mechanism that produced the result.
    pub mechanism: VoteMechanism,
    /// Blocking voters (consensus only).
    #[serde(skip_serializing_if = "Vec::is_empty", default)]
    pub blockers: Vec<Blocker>,
}

/// A vote as persisted in the store.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Vote {
    /// Unique vote identifier.
    pub vote_id: String,
    /// Topic / question being decided.
    pub topic: String,
    /// Optional longer description.
    pub description: Option<String>,
    /// The options on the ballot (at least two, unique).
    pub options: Vec<String>,
    /// Tally mechanism.
    pub mechanism: VoteMechanism,
    /// Proposing agent.
    pub proposed_by: String,
    /// When the vote was opened.
    pub proposed_at: DateTime<Utc>,
    /// Absolute deadline for casting.
    pub deadline: DateTime<Utc>,
    /// Lifecycle status.
    pub status: VoteStatus,
    /// Agents allowed to cast.
    pub eligible_voters: Vec<String>,
    /// Per-voter weights for weighted votes; absent voters weigh 1.
    pub weights: Option<BTreeMap<String, u32>>,
    /// Ballots by voter. A voter appears at most once.
    pub votes_cast: BTreeMap<String, Ballot>,
    /// Result record, once tallied.
    pub result: Option<TallyResult>,
    /// When the vote closed.
    pub closed_at: Option<DateTime<Utc>>,
}

/// Parameters for initiating a vote.
#[derive(Debug, Clone)]
pub struct NewVote {
    /// Proposing agent.
    pub proposer: String,
    /// Topic / question.
    pub topic: String,
    /// Optional longer description.
    pub description: Option<String>,
    /// Ballot options.
    pub options: Vec<String>,
    /// Tally mechanism.
    pub mechanism: VoteMechanism,
    /// Eligible voters (at least three).
    pub eligible_voters: Vec<String>,
    /// Absolute deadline.
    pub deadline: DateTime<Utc>,
    /// Per-voter weights (weighted mechanism).
    pub weights: Option<BTreeMap<String, u32>>,
}

impl NewVote {
    /// Starts a vote definition.
    pub fn new(
        proposer: impl Into<String>,
        topic: impl Into<String>,
        options: Vec<String>,
        mechanism: VoteMechanism,
        eligible_voters: Vec<String>,
        deadline: DateTime<Utc>,
    ) -> Self {
        Self {
            proposer: proposer.into(),
            topic: topic.into(),
            description: None,
            options,
            mechanism,
            eligible_voters,
            deadline,
            weights: None,
        }
    }

    /// Sets the description.
    pub fn with_description(mut self, description: impl Into<String>) -> Self {
        self.description = Some(description.into());
        self
    }

    /// Sets per-voter weights for a weighted vote.
    pub fn with_weights(mut self, weights: BTreeMap<String, u32>) -> Self {
        self.weights = Some(weights);
        self
    }
}

/// Computes the tally for a vote. Pure; the caller persists the result.
pub fn compute_tally(vote: &Vote) -> TallyResult {
    let total_votes = vote.votes_cast.len() as u32;
    let eligible = vote.eligible_voters.len() as u32;

    let mut tally: BTreeMap<String, i64> =
        vote.options.iter().map(|opt| (opt.clone(), 0)).collect();

    // Quorum applies to every mechanism: fewer than half the eligible
    // voters cast means no decision, but the raw counts still ship with
    // the result.
    let quorum_met = u64::from(total_votes) * 2 >= u64::from(eligible);

    match vote.mechanism {
        VoteMechanism::SimpleMajority => {
            for ballot in vote.votes_cast.values() {
                *tally.entry(ballot.choice.clone()).or_insert(0) += 1;
            }
            let outcome =
                if quorum_met { plurality(&tally) } else { VoteOutcome::NoQuorum };
            TallyResult {
                outcome,
                tally,
                total_votes,
                eligible,
                mechanism: vote.mechanism,
                blockers: Vec::new(),
            }
        }
        VoteMechanism::Weighted => {
            for (voter, ballot) in &vote.votes_cast {
                let weight = vote
                    .weights
                    .as_ref()
                    .and_then(|w| w.get(voter))
                    .copied()
                    .unwrap_or(1);
                *tally.entry(ballot.choice.clone()).or_insert(0) += i64::from(weight);
            }
            let outcome =
                if quorum_met { plurality(&tally) } else { VoteOutcome::NoQuorum };
            TallyResult {
                outcome,
                tally,
                total_votes,
                eligible,
                mechanism: vote.mechanism,
                blockers: Vec::new(),
            }
        }
        VoteMechanism::Consensus => {
            let mut support = 0u32;
            let mut blockers = Vec::new();
            for (voter, ballot) in &vote.votes_cast {
                *tally.entry(ballot.choice.clone()).or_insert(0) += 1;
                match ballot.stance {
                    Some(Stance::Support) => support += 1,
                    Some(Stance::Block) => blockers.push(Blocker {
                        voter: voter.clone(),
                        reasoning: ballot.reasoning.clone(),
                    }),
                    Some(Stance::Acceptable) | None => {}
                }
            }
            let outcome = if !quorum_met {
                VoteOutcome::NoQuorum
            } else if blockers.is_empty() && support >= total_votes.div_ceil(2) {
                VoteOutcome::Passed
            } else {
                VoteOutcome::Blocked
            };
            TallyResult {
                outcome,
                tally,
                total_votes,
                eligible,
                mechanism: vote.mechanism,
                blockers,
            }
        }
    }
}

fn plurality(tally: &BTreeMap<String, i64>) -> VoteOutcome {
    let max = tally.values().copied().max().unwrap_or(0);
    let winners: Vec<&String> =
        tally.iter().filter(|(_, count)| **count == max).map(|(opt, _)| opt).collect();
    if winners.len() == 1 {
        VoteOutcome::Decided(winners[0].clone())
    } else {
        VoteOutcome::Tie
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock;

    fn vote_with(
        mechanism: VoteMechanism,
        eligible: &[&str],
        ballots: &[(&str, &str, Option<Stance>)],
    ) -> Vote {
        let mut votes_cast = BTreeMap::new();
        for (voter, choice, stance) in ballots {
            votes_cast.insert(
                voter.to_string(),
                Ballot {
                    choice: choice.to_string(),
                    stance: *stance,
                    reasoning: None,
                    cast_at: clock::now(),
                },
            );
        }
        Vote {
            vote_id: "vote-1".to_string(),
            topic: "topic".to_string(),
            description: None,
            options: vec!["yes".to_string(), "no".to_string()],
            mechanism,
            proposed_by: "p".to_string(),
            proposed_at: clock::now(),
            deadline: clock::expiry(3600),
            status: VoteStatus::Open,
            eligible_voters: eligible.iter().map(|s| s.to_string()).collect(),
            weights: None,
            votes_cast,
            result: None,
            closed_at: None,
        }
    }

    #[test]
    fn test_simple_majority_winner() {
        let vote = vote_with(
            VoteMechanism::SimpleMajority,
            &["a", "b", "c"],
            &[("a", "yes", None), ("b", "yes", None), ("c", "no", None)],
        );
        let result = compute_tally(&vote);
        assert_eq!(result.outcome, VoteOutcome::Decided("yes".to_string()));
        assert_eq!(result.tally["yes"], 2);
        assert_eq!(result.tally["no"], 1);
    }

    #[test]
    fn test_simple_majority_tie() {
        let vote = vote_with(
            VoteMechanism::SimpleMajority,
            &["a", "b", "c"],
            &[("a", "yes", None), ("b", "no", None)],
        );
        let result = compute_tally(&vote);
        assert_eq!(result.outcome, VoteOutcome::Tie);
    }

    #[test]
    fn test_no_quorum_when_fewer_than_half_cast() {
        let vote =
            vote_with(VoteMechanism::SimpleMajority, &["a", "b", "c"], &[("a", "yes", None)]);
        let result = compute_tally(&vote);
        assert_eq!(result.outcome, VoteOutcome::NoQuorum);
        // Counts still present for reporting.
        assert_eq!(result.tally["yes"], 1);
    }

    #[test]
    fn test_weighted_uses_caller_weights() {
        let mut vote = vote_with(
            VoteMechanism::Weighted,
            &["a", "b", "c"],
            &[("a", "yes", None), ("b", "no", None), ("c", "no", None)],
        );
        let mut weights = BTreeMap::new();
        weights.insert("a".to_string(), 3);
        vote.weights = Some(weights);
        let result = compute_tally(&vote);
        // a's weight 3 beats b+c at default weight 1 each.
        assert_eq!(result.outcome, VoteOutcome::Decided("yes".to_string()));
        assert_eq!(result.tally["yes"], 3);
        assert_eq!(result.tally["no"], 2);
    }

    #[test]
    fn test_consensus_passes_without_blocks() {
        let vote = vote_with(
            VoteMechanism::Consensus,
            &["a", "b", "c"],
            &[
                ("a", "yes", Some(Stance::Support)),
                ("b", "yes", Some(Stance::Acceptable)),
                ("c", "yes", Some(Stance::Support)),
            ],
        );
        let result = compute_tally(&vote);
        assert_eq!(result.outcome, VoteOutcome::Passed);
        assert!(result.blockers.is_empty());
    }

    #[test]
    fn test_consensus_blocked_lists_blockers() {
        let vote = vote_with(
            VoteMechanism::Consensus,
            &["a", "b", "c"],
            &[
                ("a", "yes", Some(Stance::Support)),
                ("b", "yes", Some(Stance::Support)),
                ("c", "no", Some(Stance::Block)),
            ],
        );
        let result = compute_tally(&vote);
        assert_eq!(result.outcome, VoteOutcome::Blocked);
        assert_eq!(result.blockers.len(), 1);
        assert_eq!(result.blockers[0].voter, "c");
    }

    #[test]
    fn test_consensus_needs_majority_support() {
        // No blocks, but only 1 of 3 supports: ceil(3/2) = 2 > 1.
        let vote = vote_with(
            VoteMechanism::Consensus,
            &["a", "b", "c"],
            &[
                ("a", "yes", Some(Stance::Support)),
                ("b", "yes", Some(Stance::Acceptable)),
                ("c", "yes", Some(Stance::Acceptable)),
            ],
        );
        let result = compute_tally(&vote);
        assert_eq!(result.outcome, VoteOutcome::Blocked);
    }

    #[test]
    fn test_tally_serialization_is_deterministic() {
        let vote = vote_with(
            VoteMechanism::SimpleMajority,
            &["a", "b", "c"],
            &[("a", "yes", None), ("b", "no", None), ("c", "yes", None)],
        );
        let a = serde_json::to_string(&compute_tally(&vote)).unwrap();
        let b = serde_json::to_string(&compute_tally(&vote)).unwrap();
        assert_eq!(a, b);
    }

    #[test]
    fn test_mechanism_round_trip() {
        for m in
            [VoteMechanism::SimpleMajority, VoteMechanism::Weighted, VoteMechanism::Consensus]
        {
            assert_eq!(VoteMechanism::parse(m.as_str()), Some(m));
        }
    }
}
