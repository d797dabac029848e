//! Trial tracking and single-trial execution.

use chrono::{DateTime, Utc};
use ns_design::{Blueprint, BlueprintGenerator, RandomBlueprintGenerator};
use ns_types::{default_device, Experiment, NsResult};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use tracing::{info, warn};
use uuid::Uuid;

use crate::builder::ModelBuilder;
use crate::model::{FitResult, Score};

/// Unique trial identifier.
pub type TrialId = Uuid;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum TrialStatus {
    Pending,
    Running,
    Completed,
    Failed,
}

/// One generate/build/fit/evaluate execution of an experiment.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Trial {
    pub id: TrialId,
    pub experiment: String,
    pub trial_number: usize,
    pub status: TrialStatus,
    pub blueprint: Option<Blueprint>,
    pub fit: Option<FitResult>,
    pub score: Option<Score>,
    /// Scoped working directory; gone once the run has returned.
    pub workspace: Option<PathBuf>,
    pub created_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub finished_at: Option<DateTime<Utc>>,
    pub error: Option<String>,
}

impl Trial {
    pub fn new(experiment: impl Into<String>, trial_number: usize) -> Self {
        Self {
            id: Uuid::new_v4(),
            experiment: experiment.into(),
            trial_number,
            status: TrialStatus::Pending,
            blueprint: None,
            fit: None,
            score: None,
            workspace: None,
            created_at: Utc::now(),
            started_at: None,
            finished_at: None,
            error: None,
        }
    }

    pub fn mark_running(&mut self) {
        self.status = TrialStatus::Running;
        self.started_at = Some(Utc::now());
    }

    pub fn mark_completed(&mut self, fit: FitResult, score: Score) {
        self.status = TrialStatus::Completed;
        self.finished_at = Some(Utc::now());
        self.fit = Some(fit);
        self.score = Some(score);
    }

    pub fn mark_failed(&mut self, error: String) {
        self.status = TrialStatus::Failed;
        self.finished_at = Some(Utc::now());
        self.error = Some(error);
    }

    pub fn to_json(&self) -> NsResult<String> {
        Ok(serde_json::to_string_pretty(self)?)
    }

    pub fn duration_seconds(&self) -> Option<i64> {
        match (self.started_at, self.finished_at) {
            (Some(start), Some(end)) => Some((end - start).num_seconds()),
            _ => None,
        }
    }
}

/// Runs trials of one experiment, one at a time.
pub struct TrialRunner<'a> {
    experiment: &'a Experiment,
    builder: ModelBuilder,
    generator: Box<dyn BlueprintGenerator + 'a>,
    trials_started: usize,
    last_trial: Option<Trial>,
}

impl<'a> TrialRunner<'a> {
    /// Random generator and a builder sized by the experiment's environment.
    pub fn new(experiment: &'a Experiment) -> Self {
        Self {
            experiment,
            builder: ModelBuilder::for_environment(experiment.environment()),
            generator: Box::new(RandomBlueprintGenerator::new()),
            trials_started: 0,
            last_trial: None,
        }
    }

    pub fn with_generator(mut self, generator: impl BlueprintGenerator + 'a) -> Self {
        self.generator = Box::new(generator);
        self
    }

    pub fn with_builder(mut self, builder: ModelBuilder) -> Self {
        self.builder = builder;
        self
    }

    /// Record of the most recent run, including failed ones.
    pub fn last_trial(&self) -> Option<&Trial> {
        self.last_trial.as_ref()
    }

    pub fn trials_started(&self) -> usize {
        self.trials_started
    }

    /// Generate, build, fit for up to `nb_epoch` epochs and evaluate on the
    /// test iterator. The trial's working directory is removed on return.
    pub fn run(&mut self, nb_epoch: usize) -> NsResult<Trial> {
        self.trials_started += 1;
        let mut trial = Trial::new(self.experiment.name(), self.trials_started);
        trial.mark_running();
        info!(
            "Starting trial {} of {} ({})",
            trial.trial_number, trial.experiment, trial.id
        );

        let outcome = self.execute(&mut trial, nb_epoch);
        match outcome {
            Ok((fit, score)) => {
                let best_epoch = fit.best().map_or(0, |m| m.epoch);
                info!(
                    "Trial {} completed after {} epochs (best at {}): loss {:.4}, metric {:.4}",
                    trial.trial_number,
                    fit.epochs_run(),
                    best_epoch,
                    score.loss,
                    score.metric
                );
                trial.mark_completed(fit, score);
                self.last_trial = Some(trial.clone());
                Ok(trial)
            }
            Err(e) => {
                warn!("Trial {} failed: {}", trial.trial_number, e);
                trial.mark_failed(e.to_string());
                self.last_trial = Some(trial);
                Err(e)
            }
        }
    }

    fn execute(&mut self, trial: &mut Trial, nb_epoch: usize) -> NsResult<(FitResult, Score)> {
        let experiment = self.experiment;
        let environment = experiment.environment();
        std::fs::create_dir_all(&environment.data_dir)?;
        let workspace = tempfile::Builder::new()
            .prefix(&format!("trial-{}-", trial.trial_number))
            .tempdir_in(&environment.data_dir)?;
        trial.workspace = Some(workspace.path().to_path_buf());

        let blueprint = self.generator.generate(experiment)?;
        std::fs::write(workspace.path().join("blueprint.json"), blueprint.to_json()?)?;
        trial.blueprint = Some(blueprint.clone());

        let mut model = self.builder.build(&blueprint, default_device())?;
        let mut train = experiment.train_iterator().clone();
        let mut test = experiment.test_iterator().clone();
        let samples_per_epoch = train.samples_per_epoch();
        let test_samples = test.sample_count();

        let fit = model.fit_generator(
            &mut train,
            samples_per_epoch,
            nb_epoch,
            Some(&mut test),
            test_samples,
        )?;
        let score = model.evaluate_generator(&mut test, test_samples)?;

        workspace.close()?;
        Ok((fit, score))
    }
}
