//! Contest Join
//!
//! [`JoinRepository`] keeps the two join projections in step:
//!
//! - point records keyed `(user, contest)`, the source of truth
//! - the FIFO index keyed `(status, contest, joined_at, user)`
//!
//! Writes go point record first (conditional update), then index with a few
//! retries. If the index write keeps failing the point write is undone with
//! a conditional restore, so a join either lands in both projections or in
//! neither. Anything left inconsistent by a crash between the two is
//! repaired by the reconcile sweep.

use std::sync::Arc;
use std::time::Duration;
use chrono::{DateTime, Utc};
use tokio::sync::Notify;
use tracing::{debug, info, instrument, warn};

use crate::auth::AuthContext;
use crate::core::{Clock, ContestId, UserId};
use crate::error::ServiceError;
use crate::store::{decide, KeyRange, SharedTable, StoreError, UpdateFn, Updated, Write};
use super::model::{IndexKey, JoinRecord, JoinStatus};

const INDEX_WRITE_ATTEMPTS: u32 = 3;
const INDEX_RETRY_BACKOFF: Duration = Duration::from_millis(10);
const MAX_CONTEST_ID_LEN: usize = 128;
const MAX_TEAM_NAME_LEN: usize = 64;

/// Point-projection key.
pub type RecordKey = (UserId, ContestId);

/// What a join did.
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JoinOutcome {
    /// A new waiting record was written.
    Joined,
    /// Already waiting; nothing changed.
    AlreadyWaiting,
    /// Already paired in this contest; nothing changed.
    AlreadyMatched,
}

/// Result of [`JoinRepository::admit`].
#[derive(Debug, Clone)]
pub struct Admission {
    /// What happened.
    pub outcome: JoinOutcome,
    /// The record as it now stands.
    pub record: JoinRecord,
}

// =============================================================================
// REPOSITORY
// =============================================================================

/// Both join projections behind one interface.
pub struct JoinRepository {
    records: SharedTable<RecordKey, JoinRecord>,
    index: SharedTable<IndexKey, ()>,
}

impl JoinRepository {
    /// Create a repository over the two tables.
    pub fn new(records: SharedTable<RecordKey, JoinRecord>, index: SharedTable<IndexKey, ()>) -> Self {
        Self { records, index }
    }

    /// Point lookup.
    pub async fn get(&self, user: &UserId, contest: &ContestId) -> Result<Option<JoinRecord>, StoreError> {
        self.records.get(&(user.clone(), contest.clone())).await
    }

    /// Conditional update of one point record. The index is not touched.
    pub async fn update(&self, key: &RecordKey, decide: UpdateFn<JoinRecord>) -> Result<Updated<JoinRecord>, StoreError> {
        self.records.update(key, decide).await
    }

    /// Put `candidate` in the pool unless the user is already waiting or
    /// matched in that contest.
    pub async fn admit(&self, candidate: JoinRecord) -> Result<Admission, StoreError> {
        let key = candidate.key();
        let fresh = candidate.clone();
        let updated = self
            .records
            .update(&key, decide(move |cur: Option<&JoinRecord>| match cur.map(|r| r.status) {
                None | Some(JoinStatus::Cancelled) => Write::Put(fresh),
                Some(JoinStatus::Waiting) | Some(JoinStatus::Matched) => Write::Keep,
            }))
            .await?;

        let record = match updated.current {
            Some(record) => record,
            None => return Err(StoreError::Backend("join record missing after admit".into())),
        };

        if !updated.applied {
            return Ok(match record.status {
                JoinStatus::Matched => Admission { outcome: JoinOutcome::AlreadyMatched, record },
                _ => {
                    // Heal a missing index entry on an idempotent rejoin.
                    if let Err(e) = self.index.put(record.index_key(), ()).await {
                        warn!("Index refresh failed for {} in {}: {}", record.user_id, record.contest_id, e);
                    }
                    Admission { outcome: JoinOutcome::AlreadyWaiting, record }
                }
            });
        }

        if let Err(e) = self.put_index(record.index_key()).await {
            self.compensate(&key, &record, updated.previous.clone()).await;
            return Err(e);
        }

        if let Some(prev) = updated.previous.filter(|p| p.status == JoinStatus::Cancelled) {
            if let Err(e) = self.index.delete(&prev.index_key()).await {
                debug!("Stale cancelled entry left for reconcile: {}", e);
            }
        }
        Ok(Admission { outcome: JoinOutcome::Joined, record })
    }

    /// Move a record's index entry from `from` to its current key.
    pub async fn move_index(&self, from: &IndexKey, to: IndexKey) -> Result<(), StoreError> {
        self.put_index(to).await?;
        self.index.delete(from).await
    }

    /// Remove one index entry.
    pub async fn remove_index(&self, key: &IndexKey) -> Result<(), StoreError> {
        self.index.delete(key).await
    }

    /// Insert one index entry, retrying transient failures.
    pub async fn put_index(&self, key: IndexKey) -> Result<(), StoreError> {
        let mut attempt = 1;
        loop {
            match self.index.put(key.clone(), ()).await {
                Ok(()) => return Ok(()),
                Err(e) if attempt >= INDEX_WRITE_ATTEMPTS => return Err(e),
                Err(e) => {
                    debug!("Index write attempt {} failed: {}", attempt, e);
                    tokio::time::sleep(INDEX_RETRY_BACKOFF * attempt).await;
                    attempt += 1;
                }
            }
        }
    }

    /// Contests that have at least one waiting entry, in contest order.
    ///
    /// Skip-scan: one single-row scan per contest, jumping past each
    /// contest's partition, so cost is independent of pool size.
    pub async fn waiting_contests(&self, limit: usize) -> Result<Vec<ContestId>, StoreError> {
        let end = IndexKey::partition_start(JoinStatus::Matched, &ContestId::new(""));
        let mut start = IndexKey::partition_start(JoinStatus::Waiting, &ContestId::new(""));
        let mut contests = Vec::new();
        while contests.len() < limit {
            let rows = self.index.scan(KeyRange::half_open(start, end.clone()), 1).await?;
            let Some((key, ())) = rows.into_iter().next() else {
                break;
            };
            start = IndexKey::partition_start(JoinStatus::Waiting, &key.contest.successor());
            contests.push(key.contest);
        }
        Ok(contests)
    }

    /// Oldest waiting index entries of one contest.
    pub async fn waiting_entries(&self, contest: &ContestId, limit: usize) -> Result<Vec<IndexKey>, StoreError> {
        let range = KeyRange::half_open(
            IndexKey::partition_start(JoinStatus::Waiting, contest),
            IndexKey::partition_start(JoinStatus::Waiting, &contest.successor()),
        );
        let rows = self.index.scan(range, limit).await?;
        Ok(rows.into_iter().map(|(key, ())| key).collect())
    }

    /// Page through index entries.
    pub async fn scan_index(&self, after: Option<IndexKey>, limit: usize) -> Result<Vec<IndexKey>, StoreError> {
        let range = after.map(KeyRange::after).unwrap_or_else(KeyRange::all);
        let rows = self.index.scan(range, limit).await?;
        Ok(rows.into_iter().map(|(key, ())| key).collect())
    }

    /// Page through point records.
    pub async fn scan_records(&self, after: Option<RecordKey>, limit: usize) -> Result<Vec<JoinRecord>, StoreError> {
        let range = after.map(KeyRange::after).unwrap_or_else(KeyRange::all);
        let rows = self.records.scan(range, limit).await?;
        Ok(rows.into_iter().map(|(_, record)| record).collect())
    }

    /// Whether an index entry exists.
    pub async fn has_index(&self, key: &IndexKey) -> Result<bool, StoreError> {
        Ok(self.index.get(key).await?.is_some())
    }

    async fn compensate(&self, key: &RecordKey, written: &JoinRecord, previous: Option<JoinRecord>) {
        let expected = written.clone();
        let restore = decide(move |cur: Option<&JoinRecord>| match (cur, previous) {
            (Some(cur), Some(prev)) if *cur == expected => Write::Put(prev),
            (Some(cur), None) if *cur == expected => Write::Delete,
            _ => Write::Keep,
        });
        match self.records.update(key, restore).await {
            Ok(_) => warn!("Join by {} in {} rolled back after index failure", key.0, key.1),
            Err(e) => warn!("Join rollback failed for {} in {}, left for reconcile: {}", key.0, key.1, e),
        }
    }
}

// =============================================================================
// HANDLER
// =============================================================================

/// Join acknowledgment. Never names an opponent.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct JoinAck {
    /// Contest joined.
    pub contest_id: ContestId,
    /// Team id, if a team name was supplied.
    pub team_id: Option<String>,
    /// Recorded join time.
    pub joined_at: DateTime<Utc>,
    /// What happened.
    pub outcome: JoinOutcome,
}

/// Admits authenticated users into a contest's waiting pool.
pub struct ContestJoinHandler {
    joins: Arc<JoinRepository>,
    clock: Arc<dyn Clock>,
    run_now: Option<Arc<Notify>>,
}

impl ContestJoinHandler {
    /// Create a handler.
    pub fn new(joins: Arc<JoinRepository>, clock: Arc<dyn Clock>) -> Self {
        Self { joins, clock, run_now: None }
    }

    /// Request an immediate matchmaking tick after each new join.
    pub fn with_trigger(mut self, run_now: Arc<Notify>) -> Self {
        self.run_now = Some(run_now);
        self
    }

    /// Join `contest_id` as the authenticated user.
    #[instrument(skip(self, ctx, team_name), fields(user = %ctx.user_id, contest = %contest_id))]
    pub async fn join(
        &self,
        ctx: &AuthContext,
        contest_id: &str,
        team_name: Option<&str>,
    ) -> Result<JoinAck, ServiceError> {
        let contest = validate_contest_id(contest_id)?;
        let team_name = match team_name.map(str::trim) {
            None | Some("") => None,
            Some(name) if name.chars().count() > MAX_TEAM_NAME_LEN => {
                return Err(ServiceError::invalid("team", "too long"));
            }
            Some(name) => Some(name.to_string()),
        };

        let now = self.clock.now();
        let team_id = team_name.as_ref().map(|_| team_id(&contest, now));
        let candidate = JoinRecord::waiting(ctx.user_id.clone(), contest.clone(), team_name, team_id, now);
        let admission = self.joins.admit(candidate).await?;

        match admission.outcome {
            JoinOutcome::Joined => {
                info!("User {} joined contest {}", ctx.user_id, contest);
                if let Some(run_now) = &self.run_now {
                    run_now.notify_one();
                }
            }
            JoinOutcome::AlreadyWaiting => debug!("User {} already waiting in {}", ctx.user_id, contest),
            JoinOutcome::AlreadyMatched => debug!("User {} already matched in {}", ctx.user_id, contest),
        }

        Ok(JoinAck {
            contest_id: contest,
            team_id: admission.record.team_id,
            joined_at: admission.record.joined_at,
            outcome: admission.outcome,
        })
    }
}

/// Validate a client-supplied contest id.
pub fn validate_contest_id(contest_id: &str) -> Result<ContestId, ServiceError> {
    let trimmed = contest_id.trim();
    if trimmed.is_empty() {
        return Err(ServiceError::FieldMissing("contest_id"));
    }
    if trimmed.len() > MAX_CONTEST_ID_LEN || trimmed.chars().any(char::is_control) {
        return Err(ServiceError::invalid("contest_id", "malformed contest id"));
    }
    Ok(ContestId::new(trimmed))
}

fn team_id(contest: &ContestId, now: DateTime<Utc>) -> String {
    format!("team_{}_{}", contest, now.format("%Y%m%d%H%M%S"))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::{ManualClock, SessionToken};
    use crate::error::ErrorKind;
    use crate::store::testing::FaultyTable;
    use crate::store::{memory_table, Table};

    struct Fixture {
        clock: Arc<ManualClock>,
        index: Arc<FaultyTable<IndexKey, ()>>,
        joins: Arc<JoinRepository>,
        handler: ContestJoinHandler,
    }

    fn fixture() -> Fixture {
        let clock = Arc::new(ManualClock::fixed());
        let index: Arc<FaultyTable<IndexKey, ()>> = Arc::new(FaultyTable::new());
        let joins = Arc::new(JoinRepository::new(memory_table(), index.clone()));
        let handler = ContestJoinHandler::new(joins.clone(), clock.clone());
        Fixture { clock, index, joins, handler }
    }

    fn ctx(user: &str) -> AuthContext {
        AuthContext {
            user_id: UserId::from(user),
            mobile: "9000000001".into(),
            device_id: "dev".into(),
            push_token: "push".into(),
            session_token: SessionToken::from("tok"),
        }
    }

    #[tokio::test]
    async fn test_join_writes_both_projections() {
        let f = fixture();
        let ack = f.handler.join(&ctx("u1"), "c1", Some("Tigers")).await.unwrap();
        assert_eq!(ack.outcome, JoinOutcome::Joined);
        assert_eq!(ack.team_id.as_deref(), Some("team_c1_20240101000000"));

        let record = f.joins.get(&UserId::from("u1"), &ContestId::from("c1")).await.unwrap().unwrap();
        assert_eq!(record.status, JoinStatus::Waiting);
        assert!(f.joins.has_index(&record.index_key()).await.unwrap());
    }

    #[tokio::test]
    async fn test_rejoin_while_waiting_is_idempotent() {
        let f = fixture();
        let first = f.handler.join(&ctx("u1"), "c1", None).await.unwrap();
        f.clock.advance(chrono::Duration::seconds(30));
        let second = f.handler.join(&ctx("u1"), "c1", None).await.unwrap();

        assert_eq!(second.outcome, JoinOutcome::AlreadyWaiting);
        assert_eq!(second.joined_at, first.joined_at);
        assert_eq!(f.joins.waiting_entries(&ContestId::from("c1"), 10).await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_rejoin_after_cancel_gets_fresh_record() {
        let f = fixture();
        let first = f.handler.join(&ctx("u1"), "c1", None).await.unwrap();
        let key = (UserId::from("u1"), ContestId::from("c1"));
        let cancelled = f
            .joins
            .update(&key, decide(|cur: Option<&JoinRecord>| match cur {
                Some(r) => Write::Put(JoinRecord { status: JoinStatus::Cancelled, ..r.clone() }),
                None => Write::Keep,
            }))
            .await
            .unwrap()
            .current
            .unwrap();
        let waiting_key = IndexKey::new(JoinStatus::Waiting, &key.1, first.joined_at, &key.0);
        f.joins.move_index(&waiting_key, cancelled.index_key()).await.unwrap();

        f.clock.advance(chrono::Duration::seconds(5));
        let again = f.handler.join(&ctx("u1"), "c1", None).await.unwrap();
        assert_eq!(again.outcome, JoinOutcome::Joined);
        assert!(again.joined_at > first.joined_at);
        assert!(!f.joins.has_index(&cancelled.index_key()).await.unwrap());
        assert_eq!(f.joins.waiting_entries(&key.1, 10).await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_index_retry_recovers() {
        let f = fixture();
        f.index.fail_next_puts(2);
        let ack = f.handler.join(&ctx("u1"), "c1", None).await.unwrap();
        assert_eq!(ack.outcome, JoinOutcome::Joined);
        assert_eq!(f.joins.waiting_entries(&ContestId::from("c1"), 10).await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_index_failure_rolls_back_point_record() {
        let f = fixture();
        f.index.fail_puts_where(|_| true);
        let err = f.handler.join(&ctx("u1"), "c1", None).await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::StoreUnavailable);
        assert!(f.joins.get(&UserId::from("u1"), &ContestId::from("c1")).await.unwrap().is_none());

        f.index.heal();
        assert_eq!(f.handler.join(&ctx("u1"), "c1", None).await.unwrap().outcome, JoinOutcome::Joined);
    }

    #[tokio::test]
    async fn test_waiting_contests_skip_scan() {
        let f = fixture();
        for (user, contest) in [("a", "c2"), ("b", "c1"), ("c", "c2"), ("d", "c10"), ("e", "c1")] {
            f.handler.join(&ctx(user), contest, None).await.unwrap();
            f.clock.advance(chrono::Duration::seconds(1));
        }
        let contests = f.joins.waiting_contests(10).await.unwrap();
        assert_eq!(contests, vec![ContestId::from("c1"), ContestId::from("c10"), ContestId::from("c2")]);
        assert_eq!(f.joins.waiting_contests(2).await.unwrap().len(), 2);

        let entries = f.joins.waiting_entries(&ContestId::from("c1"), 10).await.unwrap();
        let users: Vec<_> = entries.iter().map(|k| k.user.as_str().to_string()).collect();
        assert_eq!(users, vec!["b", "e"]);
    }

    #[tokio::test]
    async fn test_join_validation() {
        let f = fixture();
        let err = f.handler.join(&ctx("u1"), "  ", None).await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::FieldMissing);
        let long = "x".repeat(200);
        let err = f.handler.join(&ctx("u1"), &long, None).await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::FieldInvalid);
        assert!(f.index.scan(KeyRange::all(), 10).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_join_triggers_run_now() {
        let f = fixture();
        let run_now = Arc::new(Notify::new());
        let handler = ContestJoinHandler::new(f.joins.clone(), f.clock.clone()).with_trigger(run_now.clone());
        handler.join(&ctx("u1"), "c1", None).await.unwrap();
        tokio::time::timeout(Duration::from_millis(50), run_now.notified()).await.unwrap();
    }
}
