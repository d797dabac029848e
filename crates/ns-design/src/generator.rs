//! Random blueprint generation driven by experiment parameters.

use ns_types::{
    Activation, ConfigError, Experiment, NsError, NsResult, LAYER, LAYOUT, OPTIMIZER,
};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use tracing::debug;

use crate::blueprint::{Block, Blueprint, BlueprintTraining, LayerSpec, Row};

/// Common trait for blueprint generators.
pub trait BlueprintGenerator: Send {
    /// Produce one candidate architecture for `experiment`.
    fn generate(&mut self, experiment: &Experiment) -> NsResult<Blueprint>;

    /// Produce `count` independent candidates.
    fn generate_batch(&mut self, experiment: &Experiment, count: usize) -> NsResult<Vec<Blueprint>> {
        (0..count).map(|_| self.generate(experiment)).collect()
    }

    /// Human-readable generator name.
    fn name(&self) -> &str;
}

// ---- Random generator ----

/// Independent random sampling of every structural parameter.
#[derive(Debug, Clone)]
pub struct RandomBlueprintGenerator {
    rng: StdRng,
}

impl RandomBlueprintGenerator {
    pub fn new() -> Self {
        Self {
            rng: StdRng::from_rng(&mut rand::rng()),
        }
    }

    /// Reproducible sequence of blueprints.
    pub fn with_seed(seed: u64) -> Self {
        Self {
            rng: StdRng::seed_from_u64(seed),
        }
    }
}

impl Default for RandomBlueprintGenerator {
    fn default() -> Self {
        Self::new()
    }
}

impl BlueprintGenerator for RandomBlueprintGenerator {
    fn generate(&mut self, experiment: &Experiment) -> NsResult<Blueprint> {
        create_random_blueprint_with_rng(experiment, &mut self.rng)
    }

    fn name(&self) -> &str {
        "random"
    }
}

/// Sample one blueprint using the thread RNG.
pub fn create_random_blueprint(experiment: &Experiment) -> NsResult<Blueprint> {
    create_random_blueprint_with_rng(experiment, &mut rand::rng())
}

/// Sample one blueprint from `rng`.
///
/// Row, block and layer counts come from the `layout` category; layer
/// settings from `layer`; an optimizer without an explicit learning rate
/// gets one from `optimizer.learning_rate`.
pub fn create_random_blueprint_with_rng<R: Rng>(
    experiment: &Experiment,
    rng: &mut R,
) -> NsResult<Blueprint> {
    let params = experiment.parameters();
    let layout = experiment.layout().clone();

    let n_rows = sample_count(experiment, LAYOUT, "rows", rng)?;
    let mut rows = Vec::with_capacity(n_rows);
    for _ in 0..n_rows {
        let n_blocks = sample_count(experiment, LAYOUT, "blocks", rng)?;
        let mut blocks = Vec::with_capacity(n_blocks);
        for _ in 0..n_blocks {
            let n_layers = sample_count(experiment, LAYOUT, "layers", rng)?;
            let mut layers = Vec::with_capacity(n_layers);
            for i in 0..n_layers {
                // Blocks always open with a dense layer.
                let kind = if i == 0 {
                    "Dense".to_string()
                } else {
                    params.sample_text(LAYER, "types", rng)?
                };
                layers.push(sample_layer(experiment, &kind, rng)?);
            }
            blocks.push(Block { layers });
        }
        rows.push(Row { blocks });
    }

    let training = experiment.training();
    let learning_rate = match training.optimizer.learning_rate {
        Some(lr) => lr,
        None => params.sample_float(OPTIMIZER, "learning_rate", rng)?,
    };
    let blueprint_training = BlueprintTraining {
        objective: training.objective,
        optimizer: training.optimizer.optimizer,
        learning_rate,
        momentum: training.optimizer.momentum,
        metric: training.metric,
        stopping: training.stopping.clone(),
        batch_size: training.batch_size,
    };

    let output = LayerSpec::Dense {
        units: layout.output_size,
        activation: layout.output_activation,
    };
    let blueprint = Blueprint::new(layout, rows, output, blueprint_training);
    blueprint.validate()?;

    debug!(
        "Generated blueprint {} for {}: {} rows, {} layers, {} weights",
        blueprint.id,
        experiment.name(),
        blueprint.rows.len(),
        blueprint.layer_count(),
        blueprint.parameter_count()
    );
    Ok(blueprint)
}

fn sample_count<R: Rng>(
    experiment: &Experiment,
    category: &str,
    name: &str,
    rng: &mut R,
) -> NsResult<usize> {
    let value = experiment.parameters().sample_int(category, name, rng)?;
    if value < 1 {
        return Err(invalid(category, name, format!("count must be at least 1, got {value}")));
    }
    Ok(value as usize)
}

fn sample_layer<R: Rng>(experiment: &Experiment, kind: &str, rng: &mut R) -> NsResult<LayerSpec> {
    let params = experiment.parameters();
    match kind.to_ascii_lowercase().as_str() {
        "dense" => {
            let units = sample_count(experiment, LAYER, "dense.units", rng)?;
            let activation: Activation = params.sample_text(LAYER, "dense.activation", rng)?.parse()?;
            Ok(LayerSpec::Dense { units, activation })
        }
        "dropout" => {
            let rate = params.sample_float(LAYER, "dropout.rate", rng)?;
            if !(0.0..1.0).contains(&rate) {
                return Err(invalid(LAYER, "dropout.rate", format!("rate {rate} outside [0, 1)")));
            }
            Ok(LayerSpec::Dropout { rate })
        }
        _ => Err(ConfigError::UnknownName {
            kind: "layer type".to_string(),
            name: kind.to_string(),
        }
        .into()),
    }
}

fn invalid(category: &str, name: &str, message: String) -> NsError {
    ConfigError::InvalidParameter {
        category: category.to_string(),
        name: name.to_string(),
        message,
    }
    .into()
}

#[cfg(test)]
mod tests {
    use super::*;
    use ns_types::{
        synthetic_classification, BatchIterator, EpochStoppingCondition, Environment,
        ExperimentParameters, Layout, Metric, Objective, Optimizer, Parameter, Training,
    };
    use std::sync::Arc;

    fn experiment_with(params: ExperimentParameters, optimizer: Optimizer) -> Experiment {
        let data = Arc::new(synthetic_classification(20, 12, 3, 11).unwrap());
        let training = Training::new(
            Objective::CategoricalCrossentropy,
            optimizer,
            Metric::CategoricalAccuracy,
            EpochStoppingCondition::new(2).unwrap(),
            5,
        )
        .unwrap();
        Experiment::new(
            "generator_test",
            Layout::new(12, 3, Activation::Softmax).unwrap(),
            training,
            BatchIterator::new(Arc::clone(&data), 5).unwrap(),
            BatchIterator::new(data, 5).unwrap(),
            Environment::cpu(1, "/tmp").unwrap(),
            params,
        )
        .unwrap()
    }

    fn minimal_params() -> ExperimentParameters {
        let mut params = ExperimentParameters::new(true);
        params
            .layout_parameter("rows", 1)
            .layout_parameter("blocks", 1)
            .layout_parameter("layers", 1);
        params
    }

    #[test]
    fn fixed_structure_is_respected() {
        let experiment = experiment_with(minimal_params(), Optimizer::new("Adam").unwrap());
        for _ in 0..10 {
            let blueprint = create_random_blueprint(&experiment).unwrap();
            assert_eq!(blueprint.rows.len(), 1);
            assert_eq!(blueprint.rows[0].blocks.len(), 1);
            assert_eq!(blueprint.rows[0].blocks[0].layers.len(), 1);
            assert!(matches!(
                blueprint.rows[0].blocks[0].layers[0],
                LayerSpec::Dense { .. }
            ));
            assert_eq!(
                blueprint.output,
                LayerSpec::Dense { units: 3, activation: Activation::Softmax }
            );
        }
    }

    #[test]
    fn ranges_are_respected() {
        let mut params = ExperimentParameters::new(true);
        params
            .layout_parameter("rows", Parameter::int_range(1, 2))
            .layout_parameter("blocks", Parameter::int_range(2, 3))
            .parameter(LAYER, "dense.units", Parameter::int_range(4, 6));
        let experiment = experiment_with(params, Optimizer::new("SGD").unwrap());

        let mut generator = RandomBlueprintGenerator::with_seed(5);
        for blueprint in generator.generate_batch(&experiment, 25).unwrap() {
            assert!((1..=2).contains(&blueprint.rows.len()));
            for row in &blueprint.rows {
                assert!((2..=3).contains(&row.blocks.len()));
                for block in &row.blocks {
                    assert!((1..=3).contains(&block.layers.len()));
                    for layer in &block.layers {
                        match layer {
                            LayerSpec::Dense { units, .. } => assert!((4..=6).contains(units)),
                            LayerSpec::Dropout { rate } => assert!((0.0..=0.5).contains(rate)),
                        }
                    }
                }
            }
            let lr = blueprint.training.learning_rate;
            assert!((1e-4..=1e-1).contains(&lr));
        }
    }

    #[test]
    fn explicit_learning_rate_is_kept() {
        let optimizer = Optimizer::new("Adam").unwrap().with_learning_rate(0.005);
        let experiment = experiment_with(minimal_params(), optimizer);
        let blueprint = create_random_blueprint(&experiment).unwrap();
        assert_eq!(blueprint.training.learning_rate, 0.005);
    }

    #[test]
    fn seeded_generators_agree() {
        let experiment = experiment_with(ExperimentParameters::new(true), Optimizer::new("Adam").unwrap());
        let a = RandomBlueprintGenerator::with_seed(99).generate(&experiment).unwrap();
        let b = RandomBlueprintGenerator::with_seed(99).generate(&experiment).unwrap();
        assert_eq!(a.rows, b.rows);
        assert_eq!(a.training.learning_rate, b.training.learning_rate);
    }

    #[test]
    fn missing_parameters_fail() {
        let experiment = experiment_with(ExperimentParameters::new(false), Optimizer::new("Adam").unwrap());
        let err = create_random_blueprint(&experiment).unwrap_err();
        assert!(err.to_string().contains("layout.rows"));
    }

    #[test]
    fn zero_count_rejected() {
        let mut params = minimal_params();
        params.layout_parameter("blocks", 0);
        let experiment = experiment_with(params, Optimizer::new("Adam").unwrap());
        assert!(create_random_blueprint(&experiment).unwrap_err().is_config());
    }

    #[test]
    fn huge_layer_width_rejected() {
        let mut params = minimal_params();
        params.parameter(LAYER, "dense.units", i64::MAX);
        let experiment = experiment_with(params, Optimizer::new("Adam").unwrap());
        let err = create_random_blueprint(&experiment).unwrap_err();
        assert!(err.is_config());
        assert!(err.to_string().contains("exceed"));
    }

    #[test]
    fn unknown_layer_type_rejected() {
        let mut params = minimal_params();
        params
            .layout_parameter("layers", 2)
            .parameter(LAYER, "types", "Conv2D");
        let experiment = experiment_with(params, Optimizer::new("Adam").unwrap());
        let err = create_random_blueprint(&experiment).unwrap_err();
        assert!(err.to_string().contains("Conv2D"));
    }
}
