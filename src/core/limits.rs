use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use tracing::debug;

use crate::core::config::WorkerConfig;
use crate::core::errors::{GantryError, Result};

/// Name of the implicit compute pool every task draws from.
pub const THREADS: &str = "threads";

/// Restriction key routed to the memory budget instead of a slot pool.
pub const MEMORY: &str = "memory";

/// A bounded resource: total capacity and what is currently available.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Pool {
    pub total: u64,
    pub available: u64,
}

impl Pool {
    fn new(total: u64) -> Self {
        Self {
            total,
            available: total,
        }
    }

    fn take(&mut self, amount: u64) {
        debug_assert!(amount <= self.available);
        self.available -= amount;
    }

    fn put_back(&mut self, amount: u64) {
        self.available = (self.available + amount).min(self.total);
    }

    pub fn in_use(&self) -> u64 {
        self.total - self.available
    }
}

/// Amounts held by one executing task. Travels with the `ExecuteTask`
/// instruction so the executor knows what it was granted.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResourceGrant {
    pub amounts: HashMap<String, u64>,
    pub memory_bytes: u64,
}

/// Outcome of a reservation attempt. `Insufficient` is backpressure, not an
/// error: the task stays ready until capacity frees up.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ReserveOutcome {
    Reserved(ResourceGrant),
    Insufficient {
        resource: String,
        requested: u64,
        available: u64,
    },
}

#[derive(Debug, Clone)]
struct ComputeReservation {
    grant: ResourceGrant,
    seceded: bool,
}

/// One in-flight fetch batch against a single peer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FetchReservation {
    pub keys: Vec<String>,
    pub bytes: u64,
}

/// Point-in-time view of the ledger for introspection and reports.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LedgerSnapshot {
    pub slots: HashMap<String, Pool>,
    pub memory: Pool,
    pub connections: Pool,
    pub flight_bytes: Pool,
    pub compute_reservations: usize,
    pub fetch_reservations: usize,
    pub stored_bytes: u64,
}

/// Tracks compute slots, memory budget and outbound-fetch budgets, and gates
/// which tasks may move from ready into execution or from fetch into flight.
///
/// Mutated only from within a stimulus-processing step; plain owned state,
/// no interior locking.
#[derive(Debug)]
pub struct ResourceLedger {
    slots: HashMap<String, Pool>,
    memory: Pool,
    connections: Pool,
    flight_bytes: Pool,
    compute: HashMap<String, ComputeReservation>,
    fetches: HashMap<String, FetchReservation>,
    stored_bytes: u64,
}

impl ResourceLedger {
    pub fn new(config: &WorkerConfig) -> Self {
        let mut slots = HashMap::new();
        slots.insert(THREADS.to_string(), Pool::new(config.thread_slots));
        for (name, quantity) in &config.extra_slots {
            slots.insert(name.clone(), Pool::new(*quantity));
        }
        Self {
            slots,
            memory: Pool::new(config.memory_budget_bytes),
            connections: Pool::new(config.fetch_connections),
            flight_bytes: Pool::new(config.flight_byte_cap),
            compute: HashMap::new(),
            fetches: HashMap::new(),
            stored_bytes: 0,
        }
    }

    /// Attempt to reserve everything `restrictions` asks for, plus one
    /// implicit thread slot unless the restrictions name the threads pool
    /// explicitly. All-or-nothing: on `Insufficient` nothing is decremented.
    pub fn reserve(
        &mut self,
        key: &str,
        restrictions: &HashMap<String, u64>,
    ) -> Result<ReserveOutcome> {
        if self.compute.contains_key(key) {
            return Err(GantryError::ledger_desync(
                key,
                "reserve while a reservation is already held",
            ));
        }

        let mut amounts: HashMap<String, u64> = HashMap::new();
        let mut memory_bytes = 0u64;
        amounts.insert(THREADS.to_string(), 1);
        for (name, quantity) in restrictions {
            if name == MEMORY {
                memory_bytes = *quantity;
            } else {
                amounts.insert(name.clone(), *quantity);
            }
        }

        // First pass: check every pool before touching any of them.
        for (name, quantity) in &amounts {
            let pool = self
                .slots
                .get(name)
                .ok_or_else(|| GantryError::unknown_resource(name.clone(), key))?;
            if *quantity > pool.available {
                return Ok(ReserveOutcome::Insufficient {
                    resource: name.clone(),
                    requested: *quantity,
                    available: pool.available,
                });
            }
        }
        if memory_bytes > self.memory.available {
            return Ok(ReserveOutcome::Insufficient {
                resource: MEMORY.to_string(),
                requested: memory_bytes,
                available: self.memory.available,
            });
        }

        // Commit. Every pool was checked above.
        for (name, quantity) in &amounts {
            if let Some(pool) = self.slots.get_mut(name) {
                pool.take(*quantity);
            }
        }
        self.memory.take(memory_bytes);

        let grant = ResourceGrant {
            amounts,
            memory_bytes,
        };
        self.compute.insert(
            key.to_string(),
            ComputeReservation {
                grant: grant.clone(),
                seceded: false,
            },
        );
        debug!(key, "reserved compute resources");
        Ok(ReserveOutcome::Reserved(grant))
    }

    /// Restore a held reservation. Releasing a reservation that is not held
    /// indicates a task-arena/ledger desync and is fatal.
    pub fn release(&mut self, key: &str) -> Result<ResourceGrant> {
        let reservation = self.compute.remove(key).ok_or_else(|| {
            GantryError::ledger_desync(key, "release of a reservation not currently held")
        })?;
        for (name, quantity) in &reservation.grant.amounts {
            // A seceded task already returned its thread units.
            if reservation.seceded && name == THREADS {
                continue;
            }
            if let Some(pool) = self.slots.get_mut(name) {
                pool.put_back(*quantity);
            }
        }
        self.memory.put_back(reservation.grant.memory_bytes);
        debug!(key, "released compute resources");
        Ok(reservation.grant)
    }

    /// Return only the thread units of a held reservation, keeping the rest
    /// open. Long-running tasks stop occupying a compute slot.
    pub fn secede(&mut self, key: &str) -> Result<()> {
        let reservation = self.compute.get_mut(key).ok_or_else(|| {
            GantryError::ledger_desync(key, "secede without a held reservation")
        })?;
        if reservation.seceded {
            return Ok(());
        }
        reservation.seceded = true;
        let threads = reservation
            .grant
            .amounts
            .get(THREADS)
            .copied()
            .unwrap_or(0);
        if let Some(pool) = self.slots.get_mut(THREADS) {
            pool.put_back(threads);
        }
        debug!(key, threads, "seceded thread units back to the pool");
        Ok(())
    }

    pub fn holds_compute(&self, key: &str) -> bool {
        self.compute.contains_key(key)
    }

    /// Reserve one connection plus flight bytes for a batch to `peer`.
    ///
    /// A batch larger than the whole byte pool is still admitted when the
    /// pool is idle, so a single oversized key cannot wedge forever.
    pub fn reserve_fetch(&mut self, peer: &str, keys: Vec<String>, bytes: u64) -> ReserveOutcome {
        if self.fetches.contains_key(peer) {
            return ReserveOutcome::Insufficient {
                resource: format!("connection:{peer}"),
                requested: 1,
                available: 0,
            };
        }
        if self.connections.available == 0 {
            return ReserveOutcome::Insufficient {
                resource: "connections".to_string(),
                requested: 1,
                available: 0,
            };
        }
        let charged = bytes.min(self.flight_bytes.total);
        if charged > self.flight_bytes.available {
            return ReserveOutcome::Insufficient {
                resource: "flight-bytes".to_string(),
                requested: charged,
                available: self.flight_bytes.available,
            };
        }
        self.connections.take(1);
        self.flight_bytes.take(charged);
        self.fetches.insert(
            peer.to_string(),
            FetchReservation {
                keys,
                bytes: charged,
            },
        );
        debug!(peer, bytes = charged, "reserved fetch budget");
        ReserveOutcome::Reserved(ResourceGrant {
            amounts: HashMap::new(),
            memory_bytes: 0,
        })
    }

    /// Release the batch reservation held against `peer`. Fatal if absent.
    pub fn release_fetch(&mut self, peer: &str) -> Result<FetchReservation> {
        let reservation = self.fetches.remove(peer).ok_or_else(|| {
            GantryError::ledger_desync(peer, "fetch release without a held batch")
        })?;
        self.connections.put_back(1);
        self.flight_bytes.put_back(reservation.bytes);
        debug!(peer, bytes = reservation.bytes, "released fetch budget");
        Ok(reservation)
    }

    pub fn fetch_reservation(&self, peer: &str) -> Option<&FetchReservation> {
        self.fetches.get(peer)
    }

    pub fn has_fetch_capacity(&self) -> bool {
        self.connections.available > 0
    }

    /// Record bytes stored in the local data bank (informational).
    pub fn note_stored(&mut self, bytes: u64) {
        self.stored_bytes += bytes;
    }

    pub fn note_evicted(&mut self, bytes: u64) {
        self.stored_bytes = self.stored_bytes.saturating_sub(bytes);
    }

    pub fn snapshot(&self) -> LedgerSnapshot {
        LedgerSnapshot {
            slots: self.slots.clone(),
            memory: self.memory,
            connections: self.connections,
            flight_bytes: self.flight_bytes,
            compute_reservations: self.compute.len(),
            fetch_reservations: self.fetches.len(),
            stored_bytes: self.stored_bytes,
        }
    }

    // Validator access: pool arithmetic must reconcile with held
    // reservations.
    pub(crate) fn audit(&self) -> Vec<(String, String)> {
        let mut findings = Vec::new();
        let mut held: HashMap<&str, u64> = HashMap::new();
        let mut held_memory = 0u64;
        for reservation in self.compute.values() {
            for (name, quantity) in &reservation.grant.amounts {
                if reservation.seceded && name == THREADS {
                    continue;
                }
                *held.entry(name.as_str()).or_default() += quantity;
            }
            held_memory += reservation.grant.memory_bytes;
        }
        for (name, pool) in &self.slots {
            let claimed = held.get(name.as_str()).copied().unwrap_or(0);
            if pool.in_use() != claimed {
                findings.push((
                    name.clone(),
                    format!("pool in_use {} != reserved {}", pool.in_use(), claimed),
                ));
            }
        }
        if self.memory.in_use() != held_memory {
            findings.push((
                MEMORY.to_string(),
                format!(
                    "memory in_use {} != reserved {}",
                    self.memory.in_use(),
                    held_memory
                ),
            ));
        }
        let flight: u64 = self.fetches.values().map(|f| f.bytes).sum();
        if self.connections.in_use() != self.fetches.len() as u64 {
            findings.push((
                "connections".to_string(),
                format!(
                    "connections in_use {} != open batches {}",
                    self.connections.in_use(),
                    self.fetches.len()
                ),
            ));
        }
        if self.flight_bytes.in_use() != flight {
            findings.push((
                "flight-bytes".to_string(),
                format!(
                    "flight bytes in_use {} != reserved {}",
                    self.flight_bytes.in_use(),
                    flight
                ),
            ));
        }
        findings
    }
}
