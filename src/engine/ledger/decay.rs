// ── Field: Tiered Decay ─────────────────────────────────────────────────────
//
// Periodic forgetting over the co-occurrence table. Each edge decays by the
// factor of the tier its current count falls in:
//
//   surface  count in [1, middle_from)        × surface_factor (0.90)
//   middle   count in [middle_from, deep_from) × middle_factor  (0.95)
//   deep     count ≥ deep_from                 × deep_factor    (0.998)
//
// The new count is floor(count × factor); edges below `min_threshold` are
// deleted. Bigram and trigram tables are never touched.

use crate::atoms::field_types::{DecayConfig, TokenId};
use crate::atoms::traits::WriteOp;
use crate::engine::ledger::Ledger;
use log::info;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum DecayTier {
    Surface,
    Middle,
    Deep,
}

impl DecayTier {
    pub fn for_count(count: u64, config: &DecayConfig) -> Self {
        if count >= config.deep_from {
            DecayTier::Deep
        } else if count >= config.middle_from {
            DecayTier::Middle
        } else {
            DecayTier::Surface
        }
    }

    pub fn factor(self, config: &DecayConfig) -> f64 {
        match self {
            DecayTier::Surface => config.surface_factor,
            DecayTier::Middle => config.middle_factor,
            DecayTier::Deep => config.deep_factor,
        }
    }
}

/// Post-decay count for one edge.
pub fn decayed_count(count: u64, config: &DecayConfig) -> u64 {
    let factor = DecayTier::for_count(count, config).factor(config);
    (count as f64 * factor).floor() as u64
}

/// What a decay pass did.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct DecayReport {
    pub examined: usize,
    pub changed: usize,
    pub evicted: usize,
    pub surface: usize,
    pub middle: usize,
    pub deep: usize,
}

impl Ledger {
    /// Run one decay pass over the co-occurrence table.
    pub fn decay(&mut self, config: &DecayConfig) -> (DecayReport, Vec<WriteOp>) {
        let mut report = DecayReport::default();
        let mut updated: Vec<(TokenId, TokenId, u64)> = Vec::new();
        let mut evicted: Vec<(TokenId, TokenId)> = Vec::new();

        for (&word, row) in self.cooccurrence_mut().iter_mut() {
            row.retain(|&context, count| {
                report.examined += 1;
                match DecayTier::for_count(*count, config) {
                    DecayTier::Surface => report.surface += 1,
                    DecayTier::Middle => report.middle += 1,
                    DecayTier::Deep => report.deep += 1,
                }
                let next = decayed_count(*count, config);
                if next < config.min_threshold.max(1) {
                    evicted.push((word, context));
                    return false;
                }
                if next != *count {
                    *count = next;
                    updated.push((word, context, next));
                    report.changed += 1;
                }
                true
            });
        }
        self.cooccurrence_mut().retain(|_, row| !row.is_empty());
        report.evicted = evicted.len();

        updated.sort_unstable();
        evicted.sort_unstable();
        let mut batch = Vec::with_capacity(2);
        if !updated.is_empty() {
            batch.push(WriteOp::Cooccur(updated));
        }
        if !evicted.is_empty() {
            batch.push(WriteOp::EvictCooccur(evicted));
        }

        info!(
            "[decay] Examined {} edges ({} surface, {} middle, {} deep): {} decayed, {} evicted",
            report.examined, report.surface, report.middle, report.deep, report.changed, report.evicted
        );
        (report, batch)
    }
}

/// Counts ingests and says when a scheduled pass is due.
#[derive(Debug, Clone, Default)]
pub struct DecayScheduler {
    interval: u64,
    since_last: u64,
}

impl DecayScheduler {
    pub fn new(interval: u64) -> Self {
        Self { interval, since_last: 0 }
    }

    /// Record one ingest; `true` when a pass should run now.
    pub fn tick(&mut self) -> bool {
        if self.interval == 0 {
            return false;
        }
        self.since_last += 1;
        if self.since_last >= self.interval {
            self.since_last = 0;
            true
        } else {
            false
        }
    }

    pub fn reset(&mut self) {
        self.since_last = 0;
    }
}
