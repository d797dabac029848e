use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

use crate::errors::{ConfigError, NsError, NsResult};
use crate::stopping::{MetricDirection, StoppingSpec};

fn unknown(kind: &str, name: &str) -> NsError {
    ConfigError::UnknownName {
        kind: kind.to_string(),
        name: name.to_string(),
    }
    .into()
}

/// Loss function minimized during training
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Objective {
    CategoricalCrossentropy,
    BinaryCrossentropy,
    MeanSquaredError,
}

impl Objective {
    pub fn new(name: &str) -> NsResult<Self> {
        name.parse()
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Objective::CategoricalCrossentropy => "categorical_crossentropy",
            Objective::BinaryCrossentropy => "binary_crossentropy",
            Objective::MeanSquaredError => "mean_squared_error",
        }
    }
}

impl FromStr for Objective {
    type Err = NsError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "categorical_crossentropy" => Ok(Objective::CategoricalCrossentropy),
            "binary_crossentropy" => Ok(Objective::BinaryCrossentropy),
            "mean_squared_error" | "mse" => Ok(Objective::MeanSquaredError),
            _ => Err(unknown("objective", s)),
        }
    }
}

impl fmt::Display for Objective {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Optimization algorithm
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum OptimizerKind {
    #[serde(rename = "SGD")]
    Sgd,
    Adam,
    #[serde(rename = "RMSprop")]
    RmsProp,
}

impl OptimizerKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            OptimizerKind::Sgd => "SGD",
            OptimizerKind::Adam => "Adam",
            OptimizerKind::RmsProp => "RMSprop",
        }
    }
}

impl FromStr for OptimizerKind {
    type Err = NsError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "sgd" => Ok(OptimizerKind::Sgd),
            "adam" => Ok(OptimizerKind::Adam),
            "rmsprop" => Ok(OptimizerKind::RmsProp),
            _ => Err(unknown("optimizer", s)),
        }
    }
}

/// Optimizer with optional sub-parameters. An unset learning rate is
/// sampled from the experiment parameters when a blueprint is generated.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Optimizer {
    pub optimizer: OptimizerKind,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub learning_rate: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub momentum: Option<f64>,
}

impl Optimizer {
    pub fn new(optimizer: &str) -> NsResult<Self> {
        Ok(Self {
            optimizer: optimizer.parse()?,
            learning_rate: None,
            momentum: None,
        })
    }

    pub fn with_learning_rate(mut self, learning_rate: f64) -> Self {
        self.learning_rate = Some(learning_rate);
        self
    }

    pub fn with_momentum(mut self, momentum: f64) -> Self {
        self.momentum = Some(momentum);
        self
    }

    pub fn validate(&self) -> NsResult<()> {
        if let Some(lr) = self.learning_rate {
            if !(lr.is_finite() && lr > 0.0) {
                return Err(crate::training_config_error!(
                    "learning_rate must be positive, got {lr}"
                ));
            }
        }
        if let Some(momentum) = self.momentum {
            if self.optimizer != OptimizerKind::Sgd {
                return Err(crate::training_config_error!(
                    "momentum only applies to SGD, not {}",
                    self.optimizer.as_str()
                ));
            }
            if !(0.0..1.0).contains(&momentum) {
                return Err(crate::training_config_error!(
                    "momentum must be in [0, 1), got {momentum}"
                ));
            }
        }
        Ok(())
    }
}

/// Evaluation metric reported per epoch
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Metric {
    CategoricalAccuracy,
    Accuracy,
    MeanSquaredError,
}

impl Metric {
    pub fn new(name: &str) -> NsResult<Self> {
        name.parse()
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Metric::CategoricalAccuracy => "categorical_accuracy",
            Metric::Accuracy => "accuracy",
            Metric::MeanSquaredError => "mean_squared_error",
        }
    }

    pub fn direction(&self) -> MetricDirection {
        match self {
            Metric::CategoricalAccuracy | Metric::Accuracy => MetricDirection::Maximize,
            Metric::MeanSquaredError => MetricDirection::Minimize,
        }
    }
}

impl FromStr for Metric {
    type Err = NsError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "categorical_accuracy" => Ok(Metric::CategoricalAccuracy),
            "accuracy" | "binary_accuracy" => Ok(Metric::Accuracy),
            "mean_squared_error" | "mse" => Ok(Metric::MeanSquaredError),
            _ => Err(unknown("metric", s)),
        }
    }
}

impl fmt::Display for Metric {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Training policy of an experiment
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Training {
    pub objective: Objective,
    pub optimizer: Optimizer,
    pub metric: Metric,
    pub stopping: StoppingSpec,
    pub batch_size: usize,
}

impl Training {
    pub fn new(
        objective: Objective,
        optimizer: Optimizer,
        metric: Metric,
        stopping: impl Into<StoppingSpec>,
        batch_size: usize,
    ) -> NsResult<Self> {
        let training = Self {
            objective,
            optimizer,
            metric,
            stopping: stopping.into(),
            batch_size,
        };
        training.validate()?;
        Ok(training)
    }

    pub fn validate(&self) -> NsResult<()> {
        if self.batch_size == 0 {
            return Err(crate::training_config_error!("batch_size must be positive"));
        }
        self.optimizer.validate()?;
        self.stopping.validate()
    }
}
