//! JSON experiment documents.
//!
//! ```json
//! {
//!   "name": "reuters",
//!   "layout": { "input_size": 1000, "output_size": 46, "output_activation": "softmax" },
//!   "training": {
//!     "objective": "categorical_crossentropy",
//!     "optimizer": { "optimizer": "Adam" },
//!     "metric": "categorical_accuracy",
//!     "stopping": { "type": "epoch", "max_epochs": 10 },
//!     "batch_size": 50
//!   },
//!   "parameters": { "use_default_values": true, "values": { "layout": { "rows": 1 } } },
//!   "environment": { "n_jobs": 1, "data_dir": "/tmp/trials" }
//! }
//! ```

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use tracing::info;

use crate::data::BatchIterator;
use crate::environment::{default_device, Device, Environment};
use crate::errors::NsResult;
use crate::experiment::Experiment;
use crate::layout::Layout;
use crate::parameters::{ExperimentParameters, Parameter, ParameterValue};
use crate::training::Training;

/// A parameter as written in a config file: a domain object, or a bare
/// value as shorthand for a fixed parameter.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum ParameterEntry {
    Domain(Parameter),
    Value(ParameterValue),
}

impl From<ParameterEntry> for Parameter {
    fn from(entry: ParameterEntry) -> Self {
        match entry {
            ParameterEntry::Domain(parameter) => parameter,
            ParameterEntry::Value(value) => Parameter::Fixed { value },
        }
    }
}

fn default_true() -> bool {
    true
}

fn default_jobs() -> usize {
    1
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ParameterConfig {
    #[serde(default = "default_true")]
    pub use_default_values: bool,
    /// Overrides applied after default seeding.
    #[serde(default)]
    pub values: BTreeMap<String, BTreeMap<String, ParameterEntry>>,
}

impl Default for ParameterConfig {
    fn default() -> Self {
        Self {
            use_default_values: true,
            values: BTreeMap::new(),
        }
    }
}

impl ParameterConfig {
    pub fn build(&self) -> ExperimentParameters {
        let mut params = ExperimentParameters::new(self.use_default_values);
        for (category, entries) in &self.values {
            for (name, entry) in entries {
                params.parameter(category.as_str(), name.as_str(), Parameter::from(entry.clone()));
            }
        }
        params
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EnvironmentConfig {
    #[serde(default = "default_jobs")]
    pub n_jobs: usize,
    pub data_dir: PathBuf,
    #[serde(default)]
    pub devices: Vec<Device>,
}

impl EnvironmentConfig {
    pub fn build(&self) -> NsResult<Environment> {
        let devices = if self.devices.is_empty() {
            vec![default_device()]
        } else {
            self.devices.clone()
        };
        let env = Environment::cpu(self.n_jobs, &self.data_dir)?.with_devices(devices);
        env.validate()?;
        Ok(env)
    }
}

/// Serializable description of an experiment, without its data.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExperimentConfig {
    pub name: String,
    pub layout: Layout,
    pub training: Training,
    #[serde(default)]
    pub parameters: ParameterConfig,
    pub environment: EnvironmentConfig,
}

impl ExperimentConfig {
    pub fn from_json_str(json: &str) -> NsResult<Self> {
        let config: Self = serde_json::from_str(json)?;
        config.validate()?;
        Ok(config)
    }

    pub fn from_path(path: impl AsRef<Path>) -> NsResult<Self> {
        let path = path.as_ref();
        info!("Loading experiment config from: {}", path.display());
        let contents = std::fs::read_to_string(path)?;
        Self::from_json_str(&contents)
    }

    pub fn to_json_pretty(&self) -> NsResult<String> {
        Ok(serde_json::to_string_pretty(self)?)
    }

    pub fn validate(&self) -> NsResult<()> {
        self.layout.validate()?;
        self.training.validate()?;
        self.environment.build().map(|_| ())
    }

    /// Attach data sources and build the experiment.
    pub fn into_experiment(
        self,
        train_iterator: BatchIterator,
        test_iterator: BatchIterator,
    ) -> NsResult<Experiment> {
        let environment = self.environment.build()?;
        let parameters = self.parameters.build();
        Experiment::new(
            self.name,
            self.layout,
            self.training,
            train_iterator,
            test_iterator,
            environment,
            parameters,
        )
    }
}
