//! Vote lifecycle: initiate, cast, tally, status.
//!
//! Votes live in the same store as messages, so ballot notifications commit
//! atomically with the vote rows that justify them. Tallying is idempotent:
//! the first close stores the result record and every later tally returns
//! it unchanged.

use std::collections::BTreeSet;
use std::sync::Arc;

use rusqlite::{params, OptionalExtension, Row, Transaction};
use serde_json::{json, Value};
use tracing::{debug, info};

use crate::audit::{self, AuditKind};
use crate::broker::broker::{build_envelope, fan_out, insert_message};
use crate::broker::message::{MessageKind, Submit};
use crate::clock;
use crate::limits::{CircuitBreaker, RateLimiter};
use crate::storage::{self, Database, SharedDatabase, StorageResult};
use crate::voting::error::{Result, VoteError};
use crate::voting::vote::{
    compute_tally, Ballot, NewVote, Stance, TallyResult, Vote, VoteMechanism, VoteStatus,
};

const VOTE_COLUMNS: &str = "vote_id, topic, description, options, mechanism, proposed_by, \
     proposed_at, deadline, status, eligible_voters, weights, votes_cast, result, closed_at";

/// Minimum size of the eligible voter set.
pub const MIN_VOTERS: usize = 3;

/// Maximum per-voter weight in weighted votes.
pub const MAX_WEIGHT: u32 = 3;

fn text_conversion(
    idx: usize,
    err: impl std::error::Error + Send + Sync + 'static,
) -> rusqlite::Error {
    rusqlite::Error::FromSqlConversionFailure(idx, rusqlite::types::Type::Text, Box::new(err))
}

fn vote_from_row(row: &Row<'_>) -> rusqlite::Result<Vote> {
    let options: String = row.get(3)?;
    let mechanism: String = row.get(4)?;
    let proposed_at: String = row.get(6)?;
    let deadline: String = row.get(7)?;
    let status: String = row.get(8)?;
    let eligible: String = row.get(9)?;
    let weights: Option<String> = row.get(10)?;
    let votes_cast: String = row.get(11)?;
    let result: Option<String> = row.get(12)?;
    let closed_at: Option<String> = row.get(13)?;

    Ok(Vote {
        vote_id: row.get(0)?,
        topic: row.get(1)?,
        description: row.get(2)?,
        options: serde_json::from_str(&options).map_err(|e| text_conversion(3, e))?,
        mechanism: VoteMechanism::parse(&mechanism).ok_or_else(|| {
            rusqlite::Error::InvalidColumnType(
                4,
                "mechanism".to_string(),
                rusqlite::types::Type::Text,
            )
        })?,
        proposed_by: row.get(5)?,
        proposed_at: clock::from_iso(&proposed_at).map_err(|e| text_conversion(6, e))?,
        deadline: clock::from_iso(&deadline).map_err(|e| text_conversion(7, e))?,
        status: VoteStatus::parse(&status).ok_or_else(|| {
            rusqlite::Error::InvalidColumnType(8, "status".to_string(), rusqlite::types::Type::Text)
        })?,
        eligible_voters: serde_json::from_str(&eligible).map_err(|e| text_conversion(9, e))?,
        weights: weights
            .map(|w| serde_json::from_str(&w).map_err(|e| text_conversion(10, e)))
            .transpose()?,
        votes_cast: serde_json::from_str(&votes_cast).map_err(|e| text_conversion(11, e))?,
        result: result
            .map(|r| serde_json::from_str(&r).map_err(|e| text_conversion(12, e)))
            .transpose()?,
        closed_at: closed_at
            .map(|s| clock::from_iso(&s).map_err(|e| text_conversion(13, e)))
            .transpose()?,
    })
}

fn load_vote(tx: &Transaction, vote_id: &str) -> StorageResult<Option<Vote>> {
    let vote = tx
        .query_row(
            &format!("SELECT {VOTE_COLUMNS} FROM votes WHERE vote_id = ?"),
            [vote_id],
            vote_from_row,
        )
        .optional()?;
    Ok(vote)
}

/// Inserts a direct notification message inside the caller's transaction.
fn send_direct(
    tx: &Transaction,
    from: &str,
    to: &str,
    kind: MessageKind,
    priority: u8,
    channel: &str,
    payload: Value,
) -> StorageResult<()> {
    let msg = build_envelope(
        &Submit::direct(from, to, kind, payload).with_priority(priority).on_channel(channel),
    );
    insert_message(tx, &msg)?;
    tx.execute(
        "UPDATE agent_status SET messages_pending = messages_pending + 1 WHERE agent_id = ?",
        [to],
    )?;
    Ok(())
}

/// Voting engine over the shared store.
#[derive(Clone)]
pub struct VotingEngine {
    db: SharedDatabase,
    limiter: Arc<RateLimiter>,
    breaker: Arc<CircuitBreaker>,
}

impl VotingEngine {
    /// Creates a voting engine over the shared database.
    pub fn new(db: SharedDatabase, limiter: Arc<RateLimiter>, breaker: Arc<CircuitBreaker>) -> Self {
        Self { db, limiter, breaker }
    }

    fn guarded<T>(
        &self,
        operation: &str,
        f: impl FnOnce(&mut Database) -> Result<T>,
    ) -> Result<T> {
        if !self.breaker.check(operation) {
            return Err(VoteError::CircuitOpen { operation: operation.to_string() });
        }
        let result = {
            let mut db = storage::lock(&self.db)?;
            f(&mut db)
        };
        match &result {
            Ok(_) => self.breaker.record_success(operation),
            Err(VoteError::Storage(_)) => self.breaker.record_failure(operation),
            Err(_) => {}
        }
        result
    }

    /// Opens a vote and notifies each eligible voter with a `vote.initiate`
    /// message (priority 9, channel `urgent`). Returns the vote id.
    ///
    /// # Errors
    /// * `InsufficientVoters` with fewer than three eligible voters
    /// * `InvalidVote` for bad options, a past deadline, or bad weights
    pub fn initiate(&self, new: NewVote) -> Result<String> {
        let unique_options: BTreeSet<&String> = new.options.iter().collect();
        if new.options.len() < 2 || unique_options.len() != new.options.len() {
            return Err(VoteError::InvalidVote(
                "need at least two unique options".to_string(),
            ));
        }
        let unique_voters: BTreeSet<&String> = new.eligible_voters.iter().collect();
        if unique_voters.len() < MIN_VOTERS {
            return Err(VoteError::InsufficientVoters {
                got: unique_voters.len(),
                need: MIN_VOTERS,
            });
        }
        if new.deadline <= clock::now() {
            return Err(VoteError::InvalidVote("deadline must be in the future".to_string()));
        }
        if let Some(weights) = &new.weights {
            for (voter, weight) in weights {
                if !(1..=MAX_WEIGHT).contains(weight) {
                    return Err(VoteError::InvalidVote(format!(
                        "weight for {} must be 1-{}, got {}",
                        voter, MAX_WEIGHT, weight
                    )));
                }
                if !new.eligible_voters.contains(voter) {
                    return Err(VoteError::InvalidVote(format!(
                        "weight given for non-voter {}",
                        voter
                    )));
                }
            }
        }
        if !self.limiter.allow(&new.proposer) {
            return Err(VoteError::RateLimited { agent_id: new.proposer });
        }

        self.guarded("voting.initiate", |db| {
            let vote_id = clock::new_short_id("vote");
            let outcome: StorageResult<Result<String>> = db.immediate(|tx| {
                let now = clock::now();
                tx.execute(
                    "INSERT INTO votes (vote_id, topic, description, options, mechanism, \
                     proposed_by, proposed_at, deadline, status, eligible_voters, weights, \
                     votes_cast) VALUES (?, ?, ?, ?, ?, ?, ?, ?, 'open', ?, ?, '{}')",
                    params![
                        vote_id,
                        new.topic,
                        new.description,
                        serde_json::to_string(&new.options)?,
                        new.mechanism.as_str(),
                        new.proposer,
                        clock::to_iso(now),
                        clock::to_iso(new.deadline),
                        serde_json::to_string(&new.eligible_voters)?,
                        new.weights.as_ref().map(serde_json::to_string).transpose()?,
                    ],
                )?;

                let payload = json!({
                    "vote_id": &vote_id,
                    "topic": &new.topic,
                    "description": &new.description,
                    "options": &new.options,
                    "mechanism": new.mechanism.as_str(),
                    "deadline": clock::to_iso(new.deadline),
                });
                for voter in &new.eligible_voters {
                    send_direct(
                        tx,
                        &new.proposer,
                        voter,
                        MessageKind::VoteInitiate,
                        9,
                        "urgent",
                        payload.clone(),
                    )?;
                }
                audit::record(tx, &new.proposer, AuditKind::VoteInitiate, &vote_id)?;
                info!(vote_id = %vote_id, topic = %new.topic, voters = new.eligible_voters.len(), "vote opened");
                Ok(Ok(vote_id.clone()))
            });
            outcome?
        })
    }

    /// Casts a ballot.
    ///
    /// # Errors
    /// * `NotFound`, `VoteClosed`, `NotEligible`, `AlreadyVoted`
    /// * `InvalidVote` for an unknown choice or a consensus cast with no
    ///   stance
    pub fn cast(
        &self,
        voter: &str,
        vote_id: &str,
        choice: &str,
        stance: Option<Stance>,
        reasoning: Option<&str>,
    ) -> Result<()> {
        if !self.limiter.allow(voter) {
            return Err(VoteError::RateLimited { agent_id: voter.to_string() });
        }
        let voter = voter.to_string();
        let vote_id = vote_id.to_string();
        let choice = choice.to_string();
        let reasoning = reasoning.map(str::to_string);

        self.guarded("voting.cast", |db| {
            let outcome: StorageResult<Result<()>> = db.immediate(|tx| {
                let Some(mut vote) = load_vote(tx, &vote_id)? else {
                    return Ok(Err(VoteError::NotFound(vote_id.clone())));
                };
                if vote.status != VoteStatus::Open {
                    return Ok(Err(VoteError::VoteClosed(vote_id.clone())));
                }
                if clock::now() >= vote.deadline {
                    return Ok(Err(VoteError::VoteClosed(vote_id.clone())));
                }
                if !vote.eligible_voters.contains(&voter) {
                    return Ok(Err(VoteError::NotEligible { voter: voter.clone() }));
                }
                if !vote.options.contains(&choice) {
                    return Ok(Err(VoteError::InvalidVote(format!(
                        "choice {:?} is not on the ballot",
                        choice
                    ))));
                }
                if vote.votes_cast.contains_key(&voter) {
                    return Ok(Err(VoteError::AlreadyVoted { voter: voter.clone() }));
                }
                if vote.mechanism == VoteMechanism::Consensus && stance.is_none() {
                    return Ok(Err(VoteError::InvalidVote(
                        "consensus votes require a stance".to_string(),
                    )));
                }

                vote.votes_cast.insert(
                    voter.clone(),
                    Ballot {
                        choice: choice.clone(),
                        stance,
                        reasoning: reasoning.clone(),
                        cast_at: clock::now(),
                    },
                );
                tx.execute(
                    "UPDATE votes SET votes_cast = ? WHERE vote_id = ?",
                    params![serde_json::to_string(&vote.votes_cast)?, vote_id],
                )?;

                // Progress notification so observers can see participation.
                let msg = build_envelope(&Submit::broadcast(
                    voter.as_str(),
                    MessageKind::VoteCast,
                    json!({
                        "vote_id": &vote_id,
                        "votes_received": vote.votes_cast.len(),
                        "votes_needed": vote.eligible_voters.len(),
                    }),
                ));
                insert_message(tx, &msg)?;
                fan_out(tx, &msg, &clock::now_iso())?;

                audit::record(
                    tx,
                    &voter,
                    AuditKind::VoteCast,
                    &format!("{} on {}", choice, vote_id),
                )?;
                debug!(vote_id = %vote_id, voter = %voter, "ballot cast");
                Ok(Ok(()))
            });
            outcome?
        })
    }

    /// Tallies a vote, closing it if still open.
    ///
    /// Idempotent: a closed vote returns its stored result record
    /// unchanged. Closing broadcasts `vote.result` to every eligible voter
    /// (priority 8).
    pub fn tally(&self, vote_id: &str) -> Result<TallyResult> {
        let vote_id = vote_id.to_string();

        self.guarded("voting.tally", |db| {
            let outcome: StorageResult<Result<TallyResult>> = db.immediate(|tx| {
                let Some(vote) = load_vote(tx, &vote_id)? else {
                    return Ok(Err(VoteError::NotFound(vote_id.clone())));
                };
                match vote.status {
                    VoteStatus::Cancelled => {
                        return Ok(Err(VoteError::VoteClosed(vote_id.clone())))
                    }
                    VoteStatus::Closed => {
                        return Ok(vote.result.clone().ok_or_else(|| {
                            VoteError::InvalidVote(format!(
                                "vote {} closed without a result",
                                vote_id
                            ))
                        }));
                    }
                    VoteStatus::Open => {}
                }

                let result = compute_tally(&vote);
                tx.execute(
                    "UPDATE votes SET status = 'closed', result = ?, closed_at = ? \
                     WHERE vote_id = ?",
                    params![
                        serde_json::to_string(&result)?,
                        clock::now_iso(),
                        vote_id
                    ],
                )?;

                let payload = json!({
                    "vote_id": &vote_id,
                    "topic": &vote.topic,
                    "outcome": &result.outcome,
                    "tally": &result.tally,
                    "total_votes": result.total_votes,
                });
                for voter in &vote.eligible_voters {
                    send_direct(
                        tx,
                        &vote.proposed_by,
                        voter,
                        MessageKind::VoteResult,
                        8,
                        "general",
                        payload.clone(),
                    )?;
                }
                audit::record(
                    tx,
                    &vote.proposed_by,
                    AuditKind::VoteTally,
                    &format!("{} -> {:?}", vote_id, result.outcome),
                )?;
                info!(vote_id = %vote_id, outcome = ?result.outcome, "vote closed");
                Ok(Ok(result))
            });
            outcome?
        })
    }

    /// Cancels an open vote.
    pub fn cancel(&self, vote_id: &str, by: &str) -> Result<()> {
        let vote_id = vote_id.to_string();
        let by = by.to_string();

        self.guarded("voting.cancel", |db| {
            let outcome: StorageResult<Result<()>> = db.immediate(|tx| {
                let Some(vote) = load_vote(tx, &vote_id)? else {
                    return Ok(Err(VoteError::NotFound(vote_id.clone())));
                };
                if vote.status != VoteStatus::Open {
                    return Ok(Err(VoteError::VoteClosed(vote_id.clone())));
                }
                tx.execute(
                    "UPDATE votes SET status = 'cancelled', closed_at = ? WHERE vote_id = ?",
                    params![clock::now_iso(), vote_id],
                )?;
                audit::record(tx, &by, AuditKind::VoteCancel, &vote_id)?;
                Ok(Ok(()))
            });
            outcome?
        })
    }

    /// Returns the full vote record.
    pub fn status(&self, vote_id: &str) -> Result<Vote> {
        let db = storage::lock(&self.db)?;
        let vote = db
            .conn()
            .query_row(
                &format!("SELECT {VOTE_COLUMNS} FROM votes WHERE vote_id = ?"),
                [vote_id],
                vote_from_row,
            )
            .optional()?;
        vote.ok_or_else(|| VoteError::NotFound(vote_id.to_string()))
    }

    /// Lists open votes, newest first.
    pub fn open_votes(&self) -> Result<Vec<Vote>> {
        let db = storage::lock(&self.db)?;
        let mut stmt = db.conn().prepare(&format!(
            "SELECT {VOTE_COLUMNS} FROM votes WHERE status = 'open' ORDER BY proposed_at DESC"
        ))?;
        let votes = stmt
            .query_map([], vote_from_row)?
            .collect::<std::result::Result<Vec<_>, _>>()?;
        Ok(votes)
    }
}
