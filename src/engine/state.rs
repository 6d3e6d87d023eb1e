//! Shared in-memory state.
//!
//! The entry-order map, the take-profit-placed set, the position map and
//! the circuit breaker are shared by the execution engine and the risk
//! monitor. Every lock is scoped to a single map operation and is never
//! held across an `.await`; sequences that span a network call rely on
//! claim-style membership guards instead.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::{Mutex, MutexGuard, PoisonError};

use crate::engine::monitor::CircuitBreaker;
use crate::types::{EntryOrder, HardStopEvent, Position};

fn lock<T>(m: &Mutex<T>) -> MutexGuard<'_, T> {
    m.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Why an entry could not be registered.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RegisterRefusal {
    /// The token already has a resting entry.
    EntryOpen,
    /// The token is already held.
    PositionOpen,
}

pub struct SharedState {
    entries: Mutex<HashMap<String, EntryOrder>>,
    tp_placed: Mutex<HashSet<String>>,
    positions: Mutex<HashMap<String, Position>>,
    breaker: Mutex<CircuitBreaker>,
}

impl SharedState {
    pub fn new(breaker: CircuitBreaker) -> Self {
        Self {
            entries: Mutex::new(HashMap::new()),
            tp_placed: Mutex::new(HashSet::new()),
            positions: Mutex::new(HashMap::new()),
            breaker: Mutex::new(breaker),
        }
    }

    // -- Entry orders ----------------------------------------------------

    /// Whether the token has a resting entry or a live position.
    pub fn token_busy(&self, token_id: &str) -> bool {
        let entry_open = lock(&self.entries).values().any(|e| e.token_id == token_id);
        entry_open || lock(&self.positions).contains_key(token_id)
    }

    /// Commit a placed entry. Refused if the token already has an entry or
    /// a position, keeping at most one open entry per token.
    pub fn register_entry(&self, entry: EntryOrder) -> Result<(), RegisterRefusal> {
        if lock(&self.positions).contains_key(&entry.token_id) {
            return Err(RegisterRefusal::PositionOpen);
        }
        let mut entries = lock(&self.entries);
        if entries.values().any(|e| e.token_id == entry.token_id) {
            return Err(RegisterRefusal::EntryOpen);
        }
        entries.insert(entry.order_id.clone(), entry);
        Ok(())
    }

    /// Remove an entry. Only one caller ever receives it, which settles
    /// the race between fill handling and timeout cancellation.
    pub fn take_entry(&self, order_id: &str) -> Option<EntryOrder> {
        lock(&self.entries).remove(order_id)
    }

    /// Put back an entry whose removal turned out to be premature.
    pub fn restore_entry(&self, entry: EntryOrder) {
        lock(&self.entries).insert(entry.order_id.clone(), entry);
    }

    pub fn entries(&self) -> Vec<EntryOrder> {
        lock(&self.entries).values().cloned().collect()
    }

    pub fn entry_count(&self) -> usize {
        lock(&self.entries).len()
    }

    // -- Take-profit guard -----------------------------------------------

    /// Claim the right to place the take-profit for an entry order.
    /// Returns false if it was already claimed.
    pub fn claim_take_profit(&self, entry_order_id: &str) -> bool {
        lock(&self.tp_placed).insert(entry_order_id.to_string())
    }

    /// Release a claim after a failed placement so it can be retried.
    pub fn release_take_profit(&self, entry_order_id: &str) {
        lock(&self.tp_placed).remove(entry_order_id);
    }

    pub fn take_profit_placed(&self, entry_order_id: &str) -> bool {
        lock(&self.tp_placed).contains(entry_order_id)
    }

    // -- Positions -------------------------------------------------------

    pub fn insert_position(&self, position: Position) {
        lock(&self.positions).insert(position.token_id.clone(), position);
    }

    pub fn position(&self, token_id: &str) -> Option<Position> {
        lock(&self.positions).get(token_id).cloned()
    }

    /// Mutate a position in place. Returns false if it is no longer held.
    pub fn modify_position(&self, token_id: &str, f: impl FnOnce(&mut Position)) -> bool {
        match lock(&self.positions).get_mut(token_id) {
            Some(p) => {
                f(p);
                true
            }
            None => false,
        }
    }

    pub fn remove_position(&self, token_id: &str) -> Option<Position> {
        lock(&self.positions).remove(token_id)
    }

    pub fn positions(&self) -> Vec<Position> {
        lock(&self.positions).values().cloned().collect()
    }

    pub fn position_count(&self) -> usize {
        lock(&self.positions).len()
    }

    // -- Circuit breaker -------------------------------------------------

    /// Prune and evaluate the breaker. Returns true while entries are
    /// suppressed.
    pub fn breaker_check(&self, now: DateTime<Utc>) -> bool {
        lock(&self.breaker).check(now)
    }

    pub fn record_hard_stop(&self, event: HardStopEvent) {
        lock(&self.breaker).record(event);
    }

    pub fn entries_suppressed(&self, now: DateTime<Utc>) -> bool {
        lock(&self.breaker).is_tripped(now)
    }

    pub fn hard_stop_count(&self) -> usize {
        lock(&self.breaker).events().len()
    }

    // -- Caps ------------------------------------------------------------

    /// Open exposure (entries plus positions) per category.
    pub fn category_counts(&self) -> BTreeMap<String, usize> {
        let mut counts = BTreeMap::new();
        for e in lock(&self.entries).values() {
            *counts.entry(e.category.clone()).or_insert(0) += 1;
        }
        for p in lock(&self.positions).values() {
            *counts.entry(p.category.clone()).or_insert(0) += 1;
        }
        counts
    }

    // -- Snapshot --------------------------------------------------------

    /// Each map is copied under its own short lock; no two guards are held
    /// at once.
    pub fn snapshot(&self, now: DateTime<Utc>) -> StateSnapshot {
        let category_counts = self.category_counts();
        let active_entry_orders = lock(&self.entries).clone();
        let active_positions = lock(&self.positions).clone();
        let mut tp_placed: Vec<String> = lock(&self.tp_placed).iter().cloned().collect();
        tp_placed.sort();
        let (hard_stops, breaker_tripped_at, entries_suppressed) = {
            let breaker = lock(&self.breaker);
            (breaker.events().to_vec(), breaker.tripped_at(), breaker.is_tripped(now))
        };

        StateSnapshot {
            written_at: now,
            active_entry_orders,
            tp_placed_orders: tp_placed,
            active_positions,
            hard_stops,
            breaker_tripped_at,
            entries_suppressed,
            category_counts,
        }
    }

    /// Reload state written by a previous run.
    pub fn restore(&self, snapshot: StateSnapshot) {
        *lock(&self.entries) = snapshot.active_entry_orders;
        *lock(&self.tp_placed) = snapshot.tp_placed_orders.into_iter().collect();
        *lock(&self.positions) = snapshot.active_positions;
        lock(&self.breaker).restore(snapshot.hard_stops, snapshot.breaker_tripped_at);
    }
}

/// Point-in-time view of the shared state, written for external
/// inspection and reloaded on restart.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StateSnapshot {
    pub written_at: DateTime<Utc>,
    pub active_entry_orders: HashMap<String, EntryOrder>,
    pub tp_placed_orders: Vec<String>,
    pub active_positions: HashMap<String, Position>,
    pub hard_stops: Vec<HardStopEvent>,
    pub breaker_tripped_at: Option<DateTime<Utc>>,
    pub entries_suppressed: bool,
    pub category_counts: BTreeMap<String, usize>,
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
