//! Stopping conditions queried once per completed training epoch.
//!
//! Epochs are counted from 1: the first query of a run sees epoch 1. Upper
//! bounds are inclusive, so a condition with a ceiling of `n` lets a run
//! perform exactly `n` epochs and answers `Stop` at the `n`-th query.

use serde::{Deserialize, Serialize};
use std::fmt;
use tracing::{debug, info};

use crate::errors::{ConfigError, NsResult};

/// Whether a larger metric value is an improvement.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum MetricDirection {
    Maximize,
    Minimize,
}

impl Default for MetricDirection {
    fn default() -> Self {
        Self::Maximize
    }
}

/// Answer of a stopping condition for one epoch.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum StopDecision {
    Continue,
    Stop,
}

impl StopDecision {
    pub fn should_stop(&self) -> bool {
        matches!(self, StopDecision::Stop)
    }
}

/// Observable state of a stopping condition within one run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum StoppingState {
    /// Epoch budget not yet exhausted.
    Counting,
    /// Before `min_epoch`; stalls are tolerated.
    Warmup,
    /// Last epoch improved on the best value seen.
    Tracking,
    /// One or more consecutive epochs without improvement.
    Stalled,
    /// Terminal for the rest of the run.
    Stopped,
}

/// Observed values for one completed epoch.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EpochMetrics {
    /// 1-based epoch index.
    pub epoch: usize,
    pub loss: f64,
    pub metric: f64,
    pub val_loss: Option<f64>,
    pub val_metric: Option<f64>,
    pub direction: MetricDirection,
}

impl EpochMetrics {
    pub fn new(epoch: usize, loss: f64, metric: f64) -> Self {
        Self {
            epoch,
            loss,
            metric,
            val_loss: None,
            val_metric: None,
            direction: MetricDirection::Maximize,
        }
    }

    pub fn with_validation(mut self, val_loss: f64, val_metric: f64) -> Self {
        self.val_loss = Some(val_loss);
        self.val_metric = Some(val_metric);
        self
    }

    pub fn with_direction(mut self, direction: MetricDirection) -> Self {
        self.direction = direction;
        self
    }

    /// The value progress is judged on: validation metric when available,
    /// otherwise the training metric.
    pub fn monitored(&self) -> f64 {
        self.val_metric.unwrap_or(self.metric)
    }

    /// `monitored` oriented so that larger is always better.
    pub fn monitored_score(&self) -> f64 {
        match self.direction {
            MetricDirection::Maximize => self.monitored(),
            MetricDirection::Minimize => -self.monitored(),
        }
    }
}

/// Per-run decision policy.
///
/// Implementations keep their run state private. `reset` must be called
/// before a new run reuses an instance.
pub trait StoppingCondition: Send + Sync + fmt::Debug {
    /// Record one completed epoch and decide whether training continues.
    fn decide(&mut self, metrics: &EpochMetrics) -> StopDecision;

    /// Return to the initial state.
    fn reset(&mut self);

    fn state(&self) -> StoppingState;

    /// Number of epochs recorded in the current run.
    fn epoch(&self) -> usize;

    fn name(&self) -> &str;
}

// ---- Fixed epoch budget ----

/// Stops once `max_epochs` epochs have completed.
#[derive(Debug, Clone, PartialEq)]
pub struct EpochStoppingCondition {
    max_epochs: usize,
    epoch: usize,
}

impl EpochStoppingCondition {
    pub fn new(max_epochs: usize) -> NsResult<Self> {
        if max_epochs == 0 {
            return Err(ConfigError::InvalidStopping {
                message: "max_epochs must be positive".to_string(),
            }
            .into());
        }
        Ok(Self {
            max_epochs,
            epoch: 0,
        })
    }

    pub fn max_epochs(&self) -> usize {
        self.max_epochs
    }
}

impl StoppingCondition for EpochStoppingCondition {
    fn decide(&mut self, _metrics: &EpochMetrics) -> StopDecision {
        self.epoch = self.epoch.saturating_add(1);
        if self.epoch < self.max_epochs {
            debug!("epoch {}/{}: continue", self.epoch, self.max_epochs);
            StopDecision::Continue
        } else {
            if self.epoch == self.max_epochs {
                info!("Epoch budget of {} reached, stopping", self.max_epochs);
            }
            StopDecision::Stop
        }
    }

    fn reset(&mut self) {
        self.epoch = 0;
    }

    fn state(&self) -> StoppingState {
        if self.epoch < self.max_epochs {
            StoppingState::Counting
        } else {
            StoppingState::Stopped
        }
    }

    fn epoch(&self) -> usize {
        self.epoch
    }

    fn name(&self) -> &str {
        "epoch"
    }
}

// ---- Stall detection ----

/// Stops when the monitored metric has not improved for `noprogress_count`
/// consecutive epochs once past `min_epoch`, and unconditionally at
/// `max_epoch`.
///
/// Ties with the best value seen count as no improvement. A
/// `noprogress_count` of 0 behaves like 1: the first non-improving epoch
/// after warmup stops the run.
#[derive(Debug, Clone, PartialEq)]
pub struct AccuracyDecreaseStoppingCondition {
    noprogress_count: usize,
    min_epoch: usize,
    max_epoch: usize,
    epoch: usize,
    best: f64,
    stall: usize,
    stopped: bool,
}

impl AccuracyDecreaseStoppingCondition {
    pub fn new(noprogress_count: usize, min_epoch: usize, max_epoch: usize) -> NsResult<Self> {
        if max_epoch == 0 {
            return Err(ConfigError::InvalidStopping {
                message: "max_epoch must be positive".to_string(),
            }
            .into());
        }
        if max_epoch < min_epoch {
            return Err(ConfigError::InvalidStopping {
                message: format!("max_epoch ({max_epoch}) is below min_epoch ({min_epoch})"),
            }
            .into());
        }
        Ok(Self {
            noprogress_count,
            min_epoch,
            max_epoch,
            epoch: 0,
            best: f64::NEG_INFINITY,
            stall: 0,
            stopped: false,
        })
    }

    pub fn noprogress_count(&self) -> usize {
        self.noprogress_count
    }

    pub fn min_epoch(&self) -> usize {
        self.min_epoch
    }

    pub fn max_epoch(&self) -> usize {
        self.max_epoch
    }

    /// Best monitored score of the current run (negative infinity before
    /// the first epoch).
    pub fn best(&self) -> f64 {
        self.best
    }

    /// Consecutive epochs without improvement.
    pub fn stall_count(&self) -> usize {
        self.stall
    }

    fn stop(&mut self, reason: &str) -> StopDecision {
        info!("Stopping at epoch {}: {}", self.epoch, reason);
        self.stopped = true;
        StopDecision::Stop
    }
}

impl StoppingCondition for AccuracyDecreaseStoppingCondition {
    fn decide(&mut self, metrics: &EpochMetrics) -> StopDecision {
        self.epoch = self.epoch.saturating_add(1);
        if self.stopped {
            return StopDecision::Stop;
        }
        if self.epoch >= self.max_epoch {
            return self.stop("max_epoch reached");
        }

        let score = metrics.monitored_score();
        if score > self.best {
            self.best = score;
            self.stall = 0;
        } else {
            self.stall += 1;
        }
        debug!(
            "epoch {}: score {:.5}, best {:.5}, stalled {}",
            self.epoch, score, self.best, self.stall
        );

        if self.epoch < self.min_epoch {
            return StopDecision::Continue;
        }
        if self.stall >= self.noprogress_count.max(1) {
            return self.stop("no progress");
        }
        StopDecision::Continue
    }

    fn reset(&mut self) {
        self.epoch = 0;
        self.best = f64::NEG_INFINITY;
        self.stall = 0;
        self.stopped = false;
    }

    fn state(&self) -> StoppingState {
        if self.stopped {
            StoppingState::Stopped
        } else if self.epoch < self.min_epoch {
            StoppingState::Warmup
        } else if self.stall > 0 {
            StoppingState::Stalled
        } else {
            StoppingState::Tracking
        }
    }

    fn epoch(&self) -> usize {
        self.epoch
    }

    fn name(&self) -> &str {
        "accuracy_decrease"
    }
}

// ---- Serializable description ----

/// Immutable description of a stopping condition. Training policies store
/// this and every run instantiates fresh state from it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum StoppingSpec {
    Epoch {
        max_epochs: usize,
    },
    AccuracyDecrease {
        noprogress_count: usize,
        min_epoch: usize,
        max_epoch: usize,
    },
}

impl StoppingSpec {
    pub fn epoch(max_epochs: usize) -> NsResult<Self> {
        Ok(EpochStoppingCondition::new(max_epochs)?.into())
    }

    pub fn accuracy_decrease(
        noprogress_count: usize,
        min_epoch: usize,
        max_epoch: usize,
    ) -> NsResult<Self> {
        Ok(AccuracyDecreaseStoppingCondition::new(noprogress_count, min_epoch, max_epoch)?.into())
    }

    pub fn validate(&self) -> NsResult<()> {
        self.instantiate().map(|_| ())
    }

    /// Fresh condition with initial run state.
    pub fn instantiate(&self) -> NsResult<Box<dyn StoppingCondition>> {
        Ok(match *self {
            StoppingSpec::Epoch { max_epochs } => Box::new(EpochStoppingCondition::new(max_epochs)?),
            StoppingSpec::AccuracyDecrease {
                noprogress_count,
                min_epoch,
                max_epoch,
            } => Box::new(AccuracyDecreaseStoppingCondition::new(
                noprogress_count,
                min_epoch,
                max_epoch,
            )?),
        })
    }

    /// Hard epoch ceiling of the condition.
    pub fn max_epochs(&self) -> usize {
        match *self {
            StoppingSpec::Epoch { max_epochs } => max_epochs,
            StoppingSpec::AccuracyDecrease { max_epoch, .. } => max_epoch,
        }
    }
}

impl From<EpochStoppingCondition> for StoppingSpec {
    fn from(condition: EpochStoppingCondition) -> Self {
        StoppingSpec::Epoch {
            max_epochs: condition.max_epochs,
        }
    }
}

impl From<AccuracyDecreaseStoppingCondition> for StoppingSpec {
    fn from(condition: AccuracyDecreaseStoppingCondition) -> Self {
        StoppingSpec::AccuracyDecrease {
            noprogress_count: condition.noprogress_count,
            min_epoch: condition.min_epoch,
            max_epoch: condition.max_epoch,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn at(epoch: usize, metric: f64) -> EpochMetrics {
        EpochMetrics::new(epoch, 1.0, metric)
    }

    /// Feed `metrics` in order and return the 1-based epoch of the first stop.
    fn first_stop(condition: &mut dyn StoppingCondition, metrics: &[f64]) -> Option<usize> {
        metrics
            .iter()
            .enumerate()
            .find(|(i, m)| condition.decide(&at(i + 1, **m)).should_stop())
            .map(|(i, _)| i + 1)
    }

    #[test]
    fn epoch_condition_stops_at_budget() {
        let mut condition = EpochStoppingCondition::new(3).unwrap();
        assert_eq!(condition.state(), StoppingState::Counting);
        assert_eq!(condition.decide(&at(1, 0.1)), StopDecision::Continue);
        assert_eq!(condition.decide(&at(2, 0.1)), StopDecision::Continue);
        assert_eq!(condition.decide(&at(3, 0.1)), StopDecision::Stop);
        assert_eq!(condition.state(), StoppingState::Stopped);
    }

    #[test]
    fn epoch_condition_stop_is_terminal() {
        let mut condition = EpochStoppingCondition::new(2).unwrap();
        let decisions: Vec<_> = (1..=6).map(|e| condition.decide(&at(e, 0.5))).collect();
        let continues = decisions.iter().filter(|d| !d.should_stop()).count();
        assert_eq!(continues, 1);
        assert!(decisions[1..].iter().all(|d| d.should_stop()));
    }

    #[test]
    fn epoch_condition_of_one_stops_immediately() {
        let mut condition = EpochStoppingCondition::new(1).unwrap();
        assert!(condition.decide(&at(1, 0.0)).should_stop());
    }

    #[test]
    fn epoch_condition_rejects_zero() {
        assert!(EpochStoppingCondition::new(0).unwrap_err().is_config());
    }

    #[test]
    fn epoch_condition_reset_starts_new_run() {
        let mut condition = EpochStoppingCondition::new(2).unwrap();
        condition.decide(&at(1, 0.0));
        condition.decide(&at(2, 0.0));
        assert_eq!(condition.state(), StoppingState::Stopped);

        condition.reset();
        assert_eq!(condition.epoch(), 0);
        assert_eq!(condition.decide(&at(1, 0.0)), StopDecision::Continue);
    }

    #[test]
    fn accuracy_condition_improving_runs_until_ceiling() {
        let mut condition = AccuracyDecreaseStoppingCondition::new(1, 0, 5).unwrap();
        let metrics = [0.1, 0.2, 0.3, 0.4, 0.5, 0.6, 0.7];
        assert_eq!(first_stop(&mut condition, &metrics), Some(5));
    }

    #[test]
    fn accuracy_condition_ceiling_is_inclusive() {
        let mut condition = AccuracyDecreaseStoppingCondition::new(10, 0, 4).unwrap();
        for epoch in 1..4 {
            assert_eq!(condition.decide(&at(epoch, epoch as f64)), StopDecision::Continue);
        }
        assert_eq!(condition.decide(&at(4, 4.0)), StopDecision::Stop);
    }

    #[test]
    fn accuracy_condition_flat_sequence_stops_at_kth_stall() {
        let mut condition = AccuracyDecreaseStoppingCondition::new(2, 1, 10).unwrap();
        // Epoch 1 improves on -inf, epochs 2 and 3 are ties.
        assert_eq!(first_stop(&mut condition, &[0.5, 0.5, 0.5, 0.5]), Some(3));
        assert_eq!(condition.stall_count(), 2);
    }

    #[test]
    fn accuracy_condition_ties_are_not_progress() {
        let mut condition = AccuracyDecreaseStoppingCondition::new(1, 0, 10).unwrap();
        assert_eq!(condition.decide(&at(1, 0.8)), StopDecision::Continue);
        assert_eq!(condition.state(), StoppingState::Tracking);
        assert_eq!(condition.decide(&at(2, 0.8)), StopDecision::Stop);
    }

    #[test]
    fn accuracy_condition_warmup_tolerates_stalls() {
        let mut condition = AccuracyDecreaseStoppingCondition::new(1, 4, 10).unwrap();
        let metrics = [0.5, 0.4, 0.3, 0.2, 0.1];
        for (i, m) in metrics[..3].iter().enumerate() {
            assert_eq!(condition.decide(&at(i + 1, *m)), StopDecision::Continue);
            assert_eq!(condition.state(), StoppingState::Warmup);
        }
        // First post-warmup epoch already carries three stalls.
        assert_eq!(condition.decide(&at(4, metrics[3])), StopDecision::Stop);
    }

    #[test]
    fn accuracy_condition_min_epoch_boundary() {
        // min_epoch = 2: epoch 1 is warmup, epoch 2 may stop.
        let mut condition = AccuracyDecreaseStoppingCondition::new(1, 2, 10).unwrap();
        assert_eq!(condition.decide(&at(1, 0.5)), StopDecision::Continue);
        assert_eq!(condition.decide(&at(2, 0.4)), StopDecision::Stop);
    }

    #[test]
    fn accuracy_condition_recovers_after_improvement() {
        let mut condition = AccuracyDecreaseStoppingCondition::new(2, 0, 20).unwrap();
        let metrics = [0.5, 0.4, 0.6, 0.55, 0.7, 0.65, 0.6];
        assert_eq!(first_stop(&mut condition, &metrics), Some(7));
    }

    #[test]
    fn accuracy_condition_zero_noprogress_stops_on_first_stall() {
        let mut condition = AccuracyDecreaseStoppingCondition::new(0, 0, 10).unwrap();
        assert_eq!(condition.decide(&at(1, 0.5)), StopDecision::Continue);
        assert_eq!(condition.decide(&at(2, 0.6)), StopDecision::Continue);
        assert_eq!(condition.decide(&at(3, 0.6)), StopDecision::Stop);
    }

    #[test]
    fn accuracy_condition_nan_counts_as_stall() {
        let mut condition = AccuracyDecreaseStoppingCondition::new(1, 0, 10).unwrap();
        condition.decide(&at(1, 0.5));
        assert_eq!(condition.decide(&at(2, f64::NAN)), StopDecision::Stop);
    }

    #[test]
    fn accuracy_condition_stop_is_terminal() {
        let mut condition = AccuracyDecreaseStoppingCondition::new(1, 0, 10).unwrap();
        condition.decide(&at(1, 0.5));
        assert!(condition.decide(&at(2, 0.4)).should_stop());
        assert!(condition.decide(&at(3, 0.9)).should_stop());
        assert_eq!(condition.state(), StoppingState::Stopped);
    }

    #[test]
    fn accuracy_condition_uses_validation_metric() {
        let mut condition = AccuracyDecreaseStoppingCondition::new(1, 0, 10).unwrap();
        condition.decide(&at(1, 0.5).with_validation(1.0, 0.7));
        // Training metric improves, validation does not.
        let decision = condition.decide(&at(2, 0.9).with_validation(0.9, 0.6));
        assert!(decision.should_stop());
    }

    #[test]
    fn accuracy_condition_minimized_metric() {
        let mut condition = AccuracyDecreaseStoppingCondition::new(1, 0, 10).unwrap();
        let falling = |epoch, mse| at(epoch, mse).with_direction(MetricDirection::Minimize);
        assert_eq!(condition.decide(&falling(1, 0.9)), StopDecision::Continue);
        assert_eq!(condition.decide(&falling(2, 0.5)), StopDecision::Continue);
        assert_eq!(condition.decide(&falling(3, 0.6)), StopDecision::Stop);
    }

    #[test]
    fn accuracy_condition_rejects_bad_bounds() {
        assert!(AccuracyDecreaseStoppingCondition::new(2, 5, 3).is_err());
        assert!(AccuracyDecreaseStoppingCondition::new(2, 0, 0).is_err());
        assert!(AccuracyDecreaseStoppingCondition::new(2, 5, 5).is_ok());
    }

    #[test]
    fn accuracy_condition_reset_clears_best() {
        let mut condition = AccuracyDecreaseStoppingCondition::new(1, 0, 10).unwrap();
        condition.decide(&at(1, 0.9));
        condition.decide(&at(2, 0.1));
        assert_eq!(condition.state(), StoppingState::Stopped);

        condition.reset();
        assert_eq!(condition.best(), f64::NEG_INFINITY);
        // 0.2 would be a stall against the old best of 0.9.
        assert_eq!(condition.decide(&at(1, 0.2)), StopDecision::Continue);
        assert_eq!(condition.decide(&at(2, 0.3)), StopDecision::Continue);
    }

    #[test]
    fn spec_instances_do_not_share_state() {
        let spec = StoppingSpec::accuracy_decrease(2, 1, 5).unwrap();
        let mut first = spec.instantiate().unwrap();
        first.decide(&at(1, 0.5));
        first.decide(&at(2, 0.5));

        let second = spec.instantiate().unwrap();
        assert_eq!(second.epoch(), 0);
        assert_eq!(first.epoch(), 2);
    }

    #[test]
    fn spec_validation_and_serde() {
        assert!(StoppingSpec::epoch(0).is_err());
        assert!(StoppingSpec::accuracy_decrease(2, 6, 5).is_err());

        let bad = StoppingSpec::AccuracyDecrease {
            noprogress_count: 1,
            min_epoch: 9,
            max_epoch: 3,
        };
        assert!(bad.validate().unwrap_err().is_config());

        let spec: StoppingSpec = serde_json::from_str(
            r#"{"type":"accuracy_decrease","noprogress_count":2,"min_epoch":1,"max_epoch":5}"#,
        )
        .unwrap();
        assert_eq!(spec.max_epochs(), 5);
        assert_eq!(spec.instantiate().unwrap().name(), "accuracy_decrease");
    }
}
