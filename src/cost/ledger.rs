use std::collections::VecDeque;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use serde::Serialize;
use uuid::Uuid;

use crate::clock::Clock;
use crate::utils::lock_or_recover;

use super::CostEstimate;

pub const HOUR: Duration = Duration::from_secs(60 * 60);
pub const DAY: Duration = Duration::from_secs(24 * 60 * 60);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub enum CallOutcome {
    /// Recorded at dispatch; the call has not returned yet.
    Dispatched,
    Completed,
    /// The call errored or timed out.
    Failed,
}

/// One admitted analyzer call, priced with the estimate made at dispatch time.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct CostLedgerEntry {
    pub id: Uuid,
    pub tokens: u64,
    pub usd: f64,
    pub model_id: String,
    pub recorded_at: DateTime<Utc>,
    pub outcome: CallOutcome,
    #[serde(skip)]
    at: Instant,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct LedgerSummary {
    pub hourly_usd: f64,
    pub daily_usd: f64,
    pub completed_hourly_usd: f64,
    pub calls_last_hour: usize,
    pub dispatched: usize,
    pub completed: usize,
    pub failed: usize,
}

/// Rolling 24 hour list of admitted calls.
///
/// Spend figures count every admitted call at its estimated price, whatever
/// its outcome: provider usage is never observed, so a call that timed out may
/// still have been billed.
pub struct CostLedger {
    clock: Arc<dyn Clock>,
    retention: Duration,
    entries: Mutex<VecDeque<CostLedgerEntry>>,
}

fn prune(entries: &mut VecDeque<CostLedgerEntry>, now: Instant, retention: Duration) {
    while let Some(front) = entries.front() {
        if now.saturating_duration_since(front.at) > retention {
            entries.pop_front();
        } else {
            break;
        }
    }
}

fn sum_within<'a>(
    entries: impl Iterator<Item = &'a CostLedgerEntry>,
    now: Instant,
    window: Duration,
) -> f64 {
    entries
        .filter(|e| now.saturating_duration_since(e.at) <= window)
        .map(|e| e.usd)
        .sum()
}

impl CostLedger {
    pub fn new(clock: Arc<dyn Clock>) -> Self {
        Self {
            clock,
            retention: DAY,
            entries: Mutex::new(VecDeque::new()),
        }
    }

    fn entry(&self, estimate: &CostEstimate, model_id: &str, now: Instant) -> CostLedgerEntry {
        CostLedgerEntry {
            id: Uuid::new_v4(),
            tokens: estimate.tokens,
            usd: estimate.usd,
            model_id: model_id.to_string(),
            recorded_at: Utc::now(),
            outcome: CallOutcome::Dispatched,
            at: now,
        }
    }

    pub fn record(&self, estimate: &CostEstimate, model_id: &str) -> Uuid {
        let now = self.clock.now();
        let mut entries = lock_or_recover(&self.entries);
        prune(&mut entries, now, self.retention);
        let entry = self.entry(estimate, model_id, now);
        let id = entry.id;
        entries.push_back(entry);
        id
    }

    /// Run `check` against the trailing hourly spend and record the call only
    /// if it passes, all under one lock so concurrent admissions cannot both
    /// slip under the budget.
    pub fn record_if<E>(
        &self,
        estimate: &CostEstimate,
        model_id: &str,
        check: impl FnOnce(f64) -> Result<(), E>,
    ) -> Result<Uuid, E> {
        let now = self.clock.now();
        let mut entries = lock_or_recover(&self.entries);
        prune(&mut entries, now, self.retention);
        check(sum_within(entries.iter(), now, HOUR))?;
        let entry = self.entry(estimate, model_id, now);
        let id = entry.id;
        entries.push_back(entry);
        Ok(id)
    }

    /// Set the outcome of a recorded call. Returns false if the entry is gone.
    pub fn mark(&self, id: Uuid, outcome: CallOutcome) -> bool {
        let mut entries = lock_or_recover(&self.entries);
        match entries.iter_mut().rev().find(|e| e.id == id) {
            Some(entry) => {
                entry.outcome = outcome;
                true
            }
            None => false,
        }
    }

    pub fn spend_within(&self, window: Duration) -> f64 {
        let now = self.clock.now();
        let entries = lock_or_recover(&self.entries);
        sum_within(entries.iter(), now, window)
    }

    pub fn hourly_spend(&self) -> f64 {
        self.spend_within(HOUR)
    }

    pub fn daily_spend(&self) -> f64 {
        self.spend_within(DAY)
    }

    /// Spend of calls that actually returned a result.
    pub fn completed_spend_within(&self, window: Duration) -> f64 {
        let now = self.clock.now();
        let entries = lock_or_recover(&self.entries);
        sum_within(
            entries.iter().filter(|e| e.outcome == CallOutcome::Completed),
            now,
            window,
        )
    }

    pub fn prune(&self) {
        let now = self.clock.now();
        prune(&mut lock_or_recover(&self.entries), now, self.retention);
    }

    pub fn len(&self) -> usize {
        lock_or_recover(&self.entries).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn entries(&self) -> Vec<CostLedgerEntry> {
        lock_or_recover(&self.entries).iter().cloned().collect()
    }

    pub fn summary(&self) -> LedgerSummary {
        let now = self.clock.now();
        let entries = lock_or_recover(&self.entries);
        let count = |outcome: CallOutcome| entries.iter().filter(|e| e.outcome == outcome).count();
        LedgerSummary {
            hourly_usd: sum_within(entries.iter(), now, HOUR),
            daily_usd: sum_within(entries.iter(), now, DAY),
            completed_hourly_usd: sum_within(
                entries.iter().filter(|e| e.outcome == CallOutcome::Completed),
                now,
                HOUR,
            ),
            calls_last_hour: entries
                .iter()
                .filter(|e| now.saturating_duration_since(e.at) <= HOUR)
                .count(),
            dispatched: count(CallOutcome::Dispatched),
            completed: count(CallOutcome::Completed),
            failed: count(CallOutcome::Failed),
        }
    }
}
