use chrono::{DateTime, Utc};
use std::collections::{BTreeSet, HashMap};
use tracing::{debug, trace, warn};

use crate::core::config::WorkerConfig;
use crate::core::limits::{ReserveOutcome, ResourceLedger};
use crate::machine::task::{PeerAddr, Priority, TaskEntity, TaskKey};

/// One admitted outgoing request: every key is bound for the same peer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FetchBatch {
    pub peer: PeerAddr,
    pub keys: Vec<TaskKey>,
    pub bytes: u64,
}

/// What to do with a key after a failed batch.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FetchDisposition {
    /// Another holder is eligible; the key goes back to the fetch queue.
    Requeued,
    /// Every known holder is blacklisted or gone; ask the coordinator for
    /// refreshed location information.
    NeedHolders,
    /// The retry cap is spent; surface the failure.
    Exhausted,
}

/// Decides which waiting dependencies to fetch next and from which holder,
/// respecting the connection and flight-byte budgets. Keys bound for the
/// same peer are bundled into one request to amortize connection overhead.
///
/// The clock comes in through stimulus timestamps, never from a wall-clock
/// read, so a replayed log reproduces every admission and blacklist decision.
#[derive(Debug)]
pub struct FetchOrchestrator {
    /// Keys in `Fetch` state, ordered by priority (lowest first).
    pending: BTreeSet<(Priority, TaskKey)>,
    /// Keys on the wire, and which peer carries each.
    in_flight: HashMap<TaskKey, PeerAddr>,
    /// (peer, key) pairs to avoid until the deadline passes.
    blacklist: HashMap<(PeerAddr, TaskKey), DateTime<Utc>>,
    batch_keys: usize,
    batch_bytes: u64,
    assumed_key_bytes: u64,
    blacklist_window: chrono::Duration,
    retry_cap: u32,
}

impl FetchOrchestrator {
    pub fn new(config: &WorkerConfig) -> Self {
        Self {
            pending: BTreeSet::new(),
            in_flight: HashMap::new(),
            blacklist: HashMap::new(),
            batch_keys: config.fetch_batch_keys,
            batch_bytes: config.fetch_batch_bytes,
            assumed_key_bytes: config.assumed_key_bytes,
            blacklist_window: chrono::Duration::from_std(config.fetch_blacklist_window)
                .unwrap_or_else(|_| chrono::Duration::max_value()),
            retry_cap: config.fetch_retry_cap,
        }
    }

    /// Queue a key whose holder set is non-empty. Caller has already moved
    /// the task to `Fetch`.
    pub fn enqueue(&mut self, priority: Priority, key: TaskKey) {
        trace!(%key, "queued for fetch");
        self.pending.insert((priority, key));
    }

    /// Scrub a key from every bucket (task forgotten).
    pub fn forget_key(&mut self, key: &str) {
        self.remove_pending(key);
        self.in_flight.remove(key);
    }

    pub fn is_pending(&self, key: &str) -> bool {
        self.pending.iter().any(|(_, k)| k == key)
    }

    pub fn in_flight_peer(&self, key: &str) -> Option<&PeerAddr> {
        self.in_flight.get(key)
    }

    /// Admit queued keys up to the ledger's budgets, in priority order,
    /// batching keys per peer. Admitted keys move to the in-flight bucket;
    /// the caller transitions their tasks and emits `BeginFetch`.
    pub fn admit(
        &mut self,
        now: DateTime<Utc>,
        ledger: &mut ResourceLedger,
        tasks: &HashMap<TaskKey, TaskEntity>,
    ) -> Vec<FetchBatch> {
        self.blacklist.retain(|_, until| *until > now);
        if self.pending.is_empty() || !ledger.has_fetch_capacity() {
            return Vec::new();
        }

        // Group admissible keys by chosen peer, in priority order. One new
        // batch per peer per admission round; peers already carrying a batch
        // are saturated.
        let mut building: Vec<FetchBatch> = Vec::new();
        for (_, key) in &self.pending {
            let Some(entity) = tasks.get(key) else {
                continue;
            };
            let mut holders: Vec<&PeerAddr> = entity.holders.iter().collect();
            holders.sort();
            let size = entity.size_estimate(self.assumed_key_bytes);
            for peer in holders {
                if self.is_blacklisted(peer, key, now) {
                    continue;
                }
                if ledger.fetch_reservation(peer).is_some() {
                    continue;
                }
                if let Some(batch) = building.iter_mut().find(|b| &b.peer == peer) {
                    if batch.keys.len() < self.batch_keys && batch.bytes + size <= self.batch_bytes
                    {
                        batch.keys.push(key.clone());
                        batch.bytes += size;
                    } else {
                        // Batch for this peer is full; try another holder.
                        continue;
                    }
                } else {
                    building.push(FetchBatch {
                        peer: peer.clone(),
                        keys: vec![key.clone()],
                        bytes: size,
                    });
                }
                break;
            }
        }

        // Commit batches against the ledger in deterministic order; stop at
        // the first budget refusal so admission stays priority-faithful.
        let mut admitted = Vec::new();
        for batch in building {
            match ledger.reserve_fetch(&batch.peer, batch.keys.clone(), batch.bytes) {
                ReserveOutcome::Reserved(_) => {
                    for key in &batch.keys {
                        self.remove_pending(key);
                        self.in_flight.insert(key.clone(), batch.peer.clone());
                    }
                    debug!(
                        peer = %batch.peer,
                        keys = batch.keys.len(),
                        bytes = batch.bytes,
                        "admitted fetch batch"
                    );
                    admitted.push(batch);
                }
                ReserveOutcome::Insufficient { resource, .. } => {
                    trace!(peer = %batch.peer, %resource, "fetch budget exhausted");
                    break;
                }
            }
        }
        admitted
    }

    /// A key from a batch against `peer` came back successfully.
    pub fn settle_ok(&mut self, peer: &str, key: &str) {
        if self.in_flight.get(key).map(String::as_str) == Some(peer) {
            self.in_flight.remove(key);
        }
    }

    /// A key from a batch against `peer` failed. Blacklists the pairing for
    /// the backoff window and decides where the key goes next.
    pub fn settle_err(
        &mut self,
        now: DateTime<Utc>,
        peer: &str,
        key: &str,
        attempts: u32,
        entity: &TaskEntity,
    ) -> FetchDisposition {
        self.in_flight.remove(key);
        let until = now
            .checked_add_signed(self.blacklist_window)
            .unwrap_or(DateTime::<Utc>::MAX_UTC);
        self.blacklist
            .insert((peer.to_string(), key.to_string()), until);

        if attempts >= self.retry_cap {
            warn!(%key, attempts, "fetch retry cap exhausted");
            return FetchDisposition::Exhausted;
        }
        let alternative = entity
            .holders
            .iter()
            .any(|holder| !self.is_blacklisted(holder, key, now));
        if alternative {
            FetchDisposition::Requeued
        } else {
            debug!(%key, "no unblacklisted holder remains");
            FetchDisposition::NeedHolders
        }
    }

    fn is_blacklisted(&self, peer: &str, key: &str, now: DateTime<Utc>) -> bool {
        self.blacklist
            .get(&(peer.to_string(), key.to_string()))
            .is_some_and(|until| *until > now)
    }

    fn remove_pending(&mut self, key: &str) {
        self.pending.retain(|(_, k)| k != key);
    }

    // Validator access.
    pub(crate) fn pending_keys(&self) -> impl Iterator<Item = &TaskKey> {
        self.pending.iter().map(|(_, k)| k)
    }

    pub(crate) fn in_flight_map(&self) -> &HashMap<TaskKey, PeerAddr> {
        &self.in_flight
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::machine::stimulus::StimulusId;
    use crate::machine::task::TaskState;

    fn config() -> WorkerConfig {
        WorkerConfig::builder()
            .fetch_budgets(2, 100 * 1024 * 1024)
            .fetch_batching(10, 50 * 1024 * 1024)
            .build()
            .unwrap()
    }

    fn fetch_target(key: &str, holders: &[&str]) -> TaskEntity {
        let mut entity = TaskEntity::new(key.to_string(), StimulusId::fresh(), Utc::now());
        entity.state = TaskState::Fetch;
        entity.holders = holders.iter().map(|h| h.to_string()).collect();
        entity.nbytes = Some(1024);
        entity
    }

    fn arena(entities: Vec<TaskEntity>) -> HashMap<TaskKey, TaskEntity> {
        entities.into_iter().map(|e| (e.key.clone(), e)).collect()
    }

    #[test]
    fn test_same_peer_keys_batch_into_one_request() {
        let config = config();
        let mut orchestrator = FetchOrchestrator::new(&config);
        let mut ledger = ResourceLedger::new(&config);
        let tasks = arena(vec![
            fetch_target("a", &["peer-1"]),
            fetch_target("b", &["peer-1"]),
            fetch_target("c", &["peer-1"]),
        ]);
        for key in ["a", "b", "c"] {
            orchestrator.enqueue(Priority::default(), key.to_string());
        }

        let batches = orchestrator.admit(Utc::now(), &mut ledger, &tasks);
        assert_eq!(batches.len(), 1);
        let mut keys = batches[0].keys.clone();
        keys.sort();
        assert_eq!(keys, vec!["a", "b", "c"]);
        assert!(!orchestrator.is_pending("a"));
        assert_eq!(
            orchestrator.in_flight_peer("b"),
            Some(&"peer-1".to_string())
        );
    }

    #[test]
    fn test_priority_order_respected() {
        let config = config();
        let mut orchestrator = FetchOrchestrator::new(&config);
        let mut ledger = ResourceLedger::new(&config);
        let tasks = arena(vec![
            fetch_target("low", &["peer-1"]),
            fetch_target("high", &["peer-2"]),
        ]);
        orchestrator.enqueue(Priority::new(5, 0), "low".to_string());
        orchestrator.enqueue(Priority::new(0, 0), "high".to_string());

        let batches = orchestrator.admit(Utc::now(), &mut ledger, &tasks);
        assert_eq!(batches.len(), 2);
        assert_eq!(batches[0].keys, vec!["high"]);
        assert_eq!(batches[1].keys, vec!["low"]);
    }

    #[test]
    fn test_saturated_peer_not_reused() {
        let config = config();
        let mut orchestrator = FetchOrchestrator::new(&config);
        let mut ledger = ResourceLedger::new(&config);
        let tasks = arena(vec![fetch_target("a", &["peer-1"])]);
        orchestrator.enqueue(Priority::default(), "a".to_string());
        let batches = orchestrator.admit(Utc::now(), &mut ledger, &tasks);
        assert_eq!(batches.len(), 1);

        // Second key for the same peer while the batch is on the wire.
        let mut tasks = tasks;
        tasks.insert("b".to_string(), fetch_target("b", &["peer-1"]));
        orchestrator.enqueue(Priority::default(), "b".to_string());
        let batches = orchestrator.admit(Utc::now(), &mut ledger, &tasks);
        assert!(batches.is_empty());
        assert!(orchestrator.is_pending("b"));
    }

    #[test]
    fn test_failure_blacklists_and_retries_alternate_holder() {
        let config = config();
        let mut orchestrator = FetchOrchestrator::new(&config);
        let now = Utc::now();
        let entity = fetch_target("a", &["peer-1", "peer-2"]);

        let disposition = orchestrator.settle_err(now, "peer-1", "a", 1, &entity);
        assert_eq!(disposition, FetchDisposition::Requeued);

        // Re-queued and re-admitted: the blacklisted peer is skipped.
        let mut ledger = ResourceLedger::new(&config);
        orchestrator.enqueue(Priority::default(), "a".to_string());
        let tasks = arena(vec![entity]);
        let batches = orchestrator.admit(now, &mut ledger, &tasks);
        assert_eq!(batches.len(), 1);
        assert_eq!(batches[0].peer, "peer-2");
    }

    #[test]
    fn test_no_alternative_holder_requests_refresh() {
        let config = config();
        let mut orchestrator = FetchOrchestrator::new(&config);
        let now = Utc::now();
        let entity = fetch_target("a", &["peer-1"]);

        let disposition = orchestrator.settle_err(now, "peer-1", "a", 1, &entity);
        assert_eq!(disposition, FetchDisposition::NeedHolders);
    }

    #[test]
    fn test_retry_cap_exhausts() {
        let config = config();
        let mut orchestrator = FetchOrchestrator::new(&config);
        let entity = fetch_target("a", &["peer-1", "peer-2"]);
        let disposition = orchestrator.settle_err(
            Utc::now(),
            "peer-1",
            "a",
            config.fetch_retry_cap,
            &entity,
        );
        assert_eq!(disposition, FetchDisposition::Exhausted);
    }

    #[test]
    fn test_blacklist_expires_with_the_clock() {
        let config = config();
        let mut orchestrator = FetchOrchestrator::new(&config);
        let mut ledger = ResourceLedger::new(&config);
        let now = Utc::now();
        let entity = fetch_target("a", &["peer-1"]);
        orchestrator.settle_err(now, "peer-1", "a", 1, &entity);

        orchestrator.enqueue(Priority::default(), "a".to_string());
        let tasks = arena(vec![entity]);

        // Within the window: nothing admissible.
        assert!(orchestrator.admit(now, &mut ledger, &tasks).is_empty());

        // After the window: the same peer is eligible again.
        let later = now + chrono::Duration::from_std(config.fetch_blacklist_window).unwrap()
            + chrono::Duration::seconds(1);
        let batches = orchestrator.admit(later, &mut ledger, &tasks);
        assert_eq!(batches.len(), 1);
        assert_eq!(batches[0].peer, "peer-1");
    }
}
