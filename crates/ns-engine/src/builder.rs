use ns_design::Blueprint;
use ns_types::{ConfigError, Device, Environment, NsResult, TrainingError};
use rand::rngs::StdRng;
use rand::SeedableRng;
use rayon::ThreadPoolBuilder;
use tracing::info;

use crate::model::Model;
use crate::network::Network;
use crate::optimizer::OptimizerState;

/// Turns validated blueprints into trainable models.
#[derive(Debug, Clone)]
pub struct ModelBuilder {
    threads: usize,
    seed: Option<u64>,
}

impl Default for ModelBuilder {
    fn default() -> Self {
        Self::new()
    }
}

impl ModelBuilder {
    /// Single-threaded builder with random initial weights.
    pub fn new() -> Self {
        Self {
            threads: 1,
            seed: None,
        }
    }

    /// Thread count taken from the environment's `n_jobs`.
    pub fn for_environment(environment: &Environment) -> Self {
        Self::new().with_threads(environment.n_jobs)
    }

    pub fn with_threads(mut self, threads: usize) -> Self {
        self.threads = threads;
        self
    }

    /// Fixed seed for weight initialization and dropout masks.
    pub fn with_seed(mut self, seed: u64) -> Self {
        self.seed = Some(seed);
        self
    }

    pub fn threads(&self) -> usize {
        self.threads
    }

    pub fn build(&self, blueprint: &Blueprint, device: Device) -> NsResult<Model> {
        blueprint.validate()?;
        if !device.is_cpu() {
            return Err(ConfigError::UnsupportedDevice {
                device: device.to_string(),
            }
            .into());
        }
        if self.threads == 0 {
            return Err(ConfigError::InvalidExperiment {
                message: "model builder needs at least one thread".to_string(),
            }
            .into());
        }

        let pool = ThreadPoolBuilder::new()
            .num_threads(self.threads)
            .thread_name(|i| format!("ns-model-{i}"))
            .build()
            .map_err(|e| TrainingError::ThreadPool {
                message: e.to_string(),
            })?;

        let mut rng = match self.seed {
            Some(seed) => StdRng::seed_from_u64(seed),
            None => StdRng::from_rng(&mut rand::rng()),
        };
        let network = Network::from_blueprint(blueprint, &mut rng);
        let training = &blueprint.training;
        let optimizer = OptimizerState::new(
            training.optimizer,
            training.learning_rate,
            training.momentum,
            &network.layers,
        );

        info!(
            "Built model {} on {}: {} layers, {} weights, {} optimizer (lr {}), {} threads",
            blueprint.id,
            device,
            blueprint.layer_count(),
            network.parameter_count(),
            training.optimizer.as_str(),
            optimizer.learning_rate(),
            self.threads
        );
        Ok(Model::new(
            blueprint.clone(),
            network,
            optimizer,
            device,
            pool,
            rng,
        ))
    }
}
