use std::sync::Arc;

use serde::Serialize;
use thiserror::Error;
use uuid::Uuid;

use crate::config::{ConfidenceThresholds, PipelineConfig};
use crate::sensing::ActivityBand;

use super::ledger::{CallOutcome, CostLedger};
use super::{CostEstimate, CostModel};

// Set to true to enable verbose logging in this module
const ENABLE_LOGS: bool = true;

use crate::log_debug;

#[derive(Debug, Clone)]
pub struct GatePolicy {
    pub cost_threshold_per_hour: f64,
    pub per_call_cost_ceiling: f64,
    pub thresholds: ConfidenceThresholds,
    pub quiet_threshold: f64,
    pub active_threshold: f64,
}

impl From<&PipelineConfig> for GatePolicy {
    fn from(config: &PipelineConfig) -> Self {
        Self {
            cost_threshold_per_hour: config.cost_threshold_per_hour,
            per_call_cost_ceiling: config.per_call_cost_ceiling,
            thresholds: config.confidence_thresholds,
            quiet_threshold: config.quiet_threshold,
            active_threshold: config.active_threshold,
        }
    }
}

/// Everything the gate needs to judge one request. The cache-hit flag is
/// computed by the caller; the gate never touches the cache.
#[derive(Debug, Clone, Copy)]
pub struct GateCandidate {
    pub cache_hit: bool,
    pub change_confidence: f64,
    pub estimate: CostEstimate,
    pub activity_level: f64,
}

#[derive(Debug, Clone, Copy, PartialEq, Error, Serialize)]
#[serde(rename_all = "camelCase", tag = "reason")]
pub enum RejectReason {
    #[error("result already cached")]
    CacheHit,
    #[error("hourly spend ${spent:.4} is over the ${budget:.4} budget")]
    OverHourlyBudget { spent: f64, budget: f64 },
    #[error("estimated call cost ${estimate:.4} is over the ${ceiling:.4} ceiling")]
    OverCallCeiling { estimate: f64, ceiling: f64 },
    #[error("change confidence {confidence:.3} does not exceed {threshold:.3} ({band:?})")]
    BelowThreshold {
        confidence: f64,
        threshold: f64,
        band: ActivityBand,
    },
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub enum GateDecision {
    Approved { ledger_id: Uuid, estimate: CostEstimate },
    Rejected(RejectReason),
}

impl GateDecision {
    pub fn is_approved(&self) -> bool {
        matches!(self, GateDecision::Approved { .. })
    }
}

/// Routes each request to the expensive analyzer or the fallback.
///
/// Checks run in a fixed order: cache hit, trailing hourly spend, per-call
/// ceiling, then the activity-adjusted confidence threshold. Approved calls
/// are written to the ledger with their estimated cost before the analyzer
/// runs.
pub struct CostGate {
    policy: GatePolicy,
    model: CostModel,
    ledger: Arc<CostLedger>,
}

impl CostGate {
    pub fn new(policy: GatePolicy, model: CostModel, ledger: Arc<CostLedger>) -> Self {
        Self {
            policy,
            model,
            ledger,
        }
    }

    pub fn model(&self) -> &CostModel {
        &self.model
    }

    pub fn ledger(&self) -> &Arc<CostLedger> {
        &self.ledger
    }

    pub fn band_for(&self, activity_level: f64) -> ActivityBand {
        if activity_level < self.policy.quiet_threshold {
            ActivityBand::Quiet
        } else if activity_level > self.policy.active_threshold {
            ActivityBand::Active
        } else {
            ActivityBand::Normal
        }
    }

    /// Confidence a candidate must exceed. Busy screens lower the bar, quiet
    /// screens raise it.
    pub fn threshold_for(&self, activity_level: f64) -> f64 {
        let t = &self.policy.thresholds;
        match self.band_for(activity_level) {
            ActivityBand::Quiet => t.quiet,
            ActivityBand::Normal => t.normal,
            ActivityBand::Active => t.active,
        }
    }

    fn check(&self, candidate: &GateCandidate, hourly_spend: f64) -> Result<(), RejectReason> {
        if candidate.cache_hit {
            return Err(RejectReason::CacheHit);
        }
        if hourly_spend > self.policy.cost_threshold_per_hour {
            return Err(RejectReason::OverHourlyBudget {
                spent: hourly_spend,
                budget: self.policy.cost_threshold_per_hour,
            });
        }
        if candidate.estimate.usd > self.policy.per_call_cost_ceiling {
            return Err(RejectReason::OverCallCeiling {
                estimate: candidate.estimate.usd,
                ceiling: self.policy.per_call_cost_ceiling,
            });
        }
        let threshold = self.threshold_for(candidate.activity_level);
        if candidate.change_confidence > threshold {
            Ok(())
        } else {
            Err(RejectReason::BelowThreshold {
                confidence: candidate.change_confidence,
                threshold,
                band: self.band_for(candidate.activity_level),
            })
        }
    }

    /// Side-effect free decision against the current ledger.
    pub fn evaluate(&self, candidate: &GateCandidate) -> Result<(), RejectReason> {
        self.check(candidate, self.ledger.hourly_spend())
    }

    pub fn should_analyze_expensive(&self, candidate: &GateCandidate) -> bool {
        self.evaluate(candidate).is_ok()
    }

    /// Decide and, on approval, record the estimated cost in the ledger.
    pub fn admit(&self, candidate: &GateCandidate) -> GateDecision {
        if candidate.cache_hit {
            return GateDecision::Rejected(RejectReason::CacheHit);
        }
        let admitted = self
            .ledger
            .record_if(&candidate.estimate, &self.model.model_id, |spent| {
                self.check(candidate, spent)
            });
        match admitted {
            Ok(ledger_id) => {
                log_debug!(
                    "gate approved {} tokens (${:.4}) at confidence {:.3}",
                    candidate.estimate.tokens,
                    candidate.estimate.usd,
                    candidate.change_confidence
                );
                GateDecision::Approved {
                    ledger_id,
                    estimate: candidate.estimate,
                }
            }
            Err(reason) => {
                log_debug!("gate rejected: {}", reason);
                GateDecision::Rejected(reason)
            }
        }
    }

    pub fn complete(&self, ledger_id: Uuid) {
        self.ledger.mark(ledger_id, CallOutcome::Completed);
    }

    pub fn fail(&self, ledger_id: Uuid) {
        self.ledger.mark(ledger_id, CallOutcome::Failed);
    }
}
