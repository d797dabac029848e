use tracing::debug;

use crate::data::BatchIterator;
use crate::environment::Environment;
use crate::errors::{ConfigError, NsError, NsResult};
use crate::layout::Layout;
use crate::parameters::ExperimentParameters;
use crate::training::Training;

/// Everything one architecture-search trial needs.
///
/// An experiment carries no training logic. It is shared by reference with
/// any number of blueprint generation calls; only `parameters` can change
/// after construction.
#[derive(Debug, Clone)]
pub struct Experiment {
    name: String,
    layout: Layout,
    training: Training,
    train_iterator: BatchIterator,
    test_iterator: BatchIterator,
    environment: Environment,
    parameters: ExperimentParameters,
}

impl Experiment {
    pub fn new(
        name: impl Into<String>,
        layout: Layout,
        training: Training,
        train_iterator: BatchIterator,
        test_iterator: BatchIterator,
        environment: Environment,
        parameters: ExperimentParameters,
    ) -> NsResult<Self> {
        let name = name.into();
        if name.trim().is_empty() {
            return Err(invalid("experiment name is empty".to_string()));
        }
        layout.validate()?;
        training.validate()?;
        environment.validate()?;

        for (label, iterator) in [("train", &train_iterator), ("test", &test_iterator)] {
            if iterator.input_size() != layout.input_size {
                return Err(invalid(format!(
                    "{label} data has {} inputs, layout expects {}",
                    iterator.input_size(),
                    layout.input_size
                )));
            }
            if iterator.output_size() != layout.output_size {
                return Err(invalid(format!(
                    "{label} data has {} outputs, layout expects {}",
                    iterator.output_size(),
                    layout.output_size
                )));
            }
            if iterator.batch_size() != training.batch_size {
                return Err(invalid(format!(
                    "{label} data is batched by {}, training expects batch_size {}",
                    iterator.batch_size(),
                    training.batch_size
                )));
            }
        }

        debug!("Created experiment {} ({:?})", name, layout);
        Ok(Self {
            name,
            layout,
            training,
            train_iterator,
            test_iterator,
            environment,
            parameters,
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn layout(&self) -> &Layout {
        &self.layout
    }

    pub fn training(&self) -> &Training {
        &self.training
    }

    pub fn train_iterator(&self) -> &BatchIterator {
        &self.train_iterator
    }

    pub fn test_iterator(&self) -> &BatchIterator {
        &self.test_iterator
    }

    pub fn environment(&self) -> &Environment {
        &self.environment
    }

    pub fn parameters(&self) -> &ExperimentParameters {
        &self.parameters
    }

    pub fn parameters_mut(&mut self) -> &mut ExperimentParameters {
        &mut self.parameters
    }
}

fn invalid(message: String) -> NsError {
    ConfigError::InvalidExperiment { message }.into()
}
