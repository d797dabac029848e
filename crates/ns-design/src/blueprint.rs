//! Architecture descriptions produced by the generator.
//!
//! A blueprint is a stack of rows. Every block of a row reads the row input
//! and the block outputs are concatenated into the row output. A final dense
//! layer maps the last row onto the layout's outputs.

use chrono::{DateTime, Utc};
use ns_types::{
    blueprint_error, Activation, ConfigError, Layout, Metric, NsResult, Objective, OptimizerKind,
    StoppingSpec,
};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Unique blueprint identifier.
pub type BlueprintId = Uuid;

/// Upper bound on trainable weights of one blueprint.
pub const MAX_PARAMETERS: usize = 1 << 28;

/// One layer of a block.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum LayerSpec {
    Dense { units: usize, activation: Activation },
    Dropout { rate: f64 },
}

impl LayerSpec {
    /// Width of the layer output for an input of `input` values.
    pub fn output_width(&self, input: usize) -> usize {
        match self {
            LayerSpec::Dense { units, .. } => *units,
            LayerSpec::Dropout { .. } => input,
        }
    }

    /// Number of trainable weights for an input of `input` values.
    pub fn parameter_count(&self, input: usize) -> usize {
        match self {
            LayerSpec::Dense { units, .. } => units.saturating_mul(input).saturating_add(*units),
            LayerSpec::Dropout { .. } => 0,
        }
    }

    fn validate(&self) -> NsResult<()> {
        match self {
            LayerSpec::Dense { units: 0, .. } => Err(blueprint_error!("dense layer with 0 units")),
            LayerSpec::Dropout { rate } if !(0.0..1.0).contains(rate) => {
                Err(blueprint_error!("dropout rate {rate} outside [0, 1)"))
            }
            _ => Ok(()),
        }
    }
}

/// Sequential layers.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Block {
    pub layers: Vec<LayerSpec>,
}

impl Block {
    pub fn output_width(&self, input: usize) -> usize {
        self.layers
            .iter()
            .fold(input, |width, layer| layer.output_width(width))
    }
}

/// Parallel blocks with concatenated outputs.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Row {
    pub blocks: Vec<Block>,
}

impl Row {
    pub fn output_width(&self, input: usize) -> usize {
        self.blocks
            .iter()
            .fold(0, |width, block| width.saturating_add(block.output_width(input)))
    }
}

/// Training settings resolved for one blueprint.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BlueprintTraining {
    pub objective: Objective,
    pub optimizer: OptimizerKind,
    pub learning_rate: f64,
    pub momentum: Option<f64>,
    pub metric: Metric,
    pub stopping: StoppingSpec,
    pub batch_size: usize,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Blueprint {
    pub id: BlueprintId,
    pub layout: Layout,
    pub rows: Vec<Row>,
    pub output: LayerSpec,
    pub training: BlueprintTraining,
    pub created_at: DateTime<Utc>,
}

impl Blueprint {
    pub fn new(
        layout: Layout,
        rows: Vec<Row>,
        output: LayerSpec,
        training: BlueprintTraining,
    ) -> Self {
        Self {
            id: Uuid::new_v4(),
            layout,
            rows,
            output,
            training,
            created_at: Utc::now(),
        }
    }

    /// Structural consistency with the embedded layout.
    pub fn validate(&self) -> NsResult<()> {
        self.layout.validate()?;
        if self.rows.is_empty() {
            return Err(blueprint_error!("blueprint has no rows"));
        }
        for (r, row) in self.rows.iter().enumerate() {
            if row.blocks.is_empty() {
                return Err(blueprint_error!("row {r} has no blocks"));
            }
            for (b, block) in row.blocks.iter().enumerate() {
                if block.layers.is_empty() {
                    return Err(blueprint_error!("block {b} of row {r} has no layers"));
                }
                for layer in &block.layers {
                    layer.validate()?;
                }
            }
        }

        match &self.output {
            LayerSpec::Dense { units, activation } => {
                if *units != self.layout.output_size {
                    return Err(mismatch(format!(
                        "output layer has {units} units, layout expects {}",
                        self.layout.output_size
                    )));
                }
                if *activation != self.layout.output_activation {
                    return Err(mismatch(format!(
                        "output activation {activation}, layout expects {}",
                        self.layout.output_activation
                    )));
                }
            }
            LayerSpec::Dropout { .. } => {
                return Err(mismatch("output layer must be dense".to_string()));
            }
        }

        let weights = self.parameter_count();
        if weights > MAX_PARAMETERS {
            return Err(blueprint_error!(
                "{weights} weights exceed the limit of {MAX_PARAMETERS}"
            ));
        }

        let training = &self.training;
        if !(training.learning_rate.is_finite() && training.learning_rate > 0.0) {
            return Err(ns_types::training_config_error!(
                "learning_rate must be positive, got {}",
                training.learning_rate
            ));
        }
        if training.batch_size == 0 {
            return Err(ns_types::training_config_error!("batch_size must be positive"));
        }
        training.stopping.validate()
    }

    /// Width of the input fed to the output layer.
    pub fn feature_width(&self) -> usize {
        self.rows
            .iter()
            .fold(self.layout.input_size, |width, row| row.output_width(width))
    }

    pub fn layer_count(&self) -> usize {
        self.rows
            .iter()
            .flat_map(|row| &row.blocks)
            .map(|block| block.layers.len())
            .sum::<usize>()
            + 1
    }

    /// Trainable weights of the whole network.
    pub fn parameter_count(&self) -> usize {
        let mut width = self.layout.input_size;
        let mut total: usize = 0;
        for row in &self.rows {
            for block in &row.blocks {
                let mut block_width = width;
                for layer in &block.layers {
                    total = total.saturating_add(layer.parameter_count(block_width));
                    block_width = layer.output_width(block_width);
                }
            }
            width = row.output_width(width);
        }
        total.saturating_add(self.output.parameter_count(width))
    }

    pub fn to_json(&self) -> NsResult<String> {
        Ok(serde_json::to_string_pretty(self)?)
    }

    pub fn from_json(json: &str) -> NsResult<Self> {
        Ok(serde_json::from_str(json)?)
    }
}

fn mismatch(message: String) -> ns_types::NsError {
    ConfigError::LayoutMismatch { message }.into()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_blueprint() -> Blueprint {
        let layout = Layout::new(10, 3, Activation::Softmax).unwrap();
        let rows = vec![
            Row {
                blocks: vec![
                    Block {
                        layers: vec![LayerSpec::Dense { units: 4, activation: Activation::Relu }],
                    },
                    Block {
                        layers: vec![
                            LayerSpec::Dense { units: 2, activation: Activation::Tanh },
                            LayerSpec::Dropout { rate: 0.25 },
                        ],
                    },
                ],
            },
            Row {
                blocks: vec![Block {
                    layers: vec![LayerSpec::Dense { units: 5, activation: Activation::Sigmoid }],
                }],
            },
        ];
        let training = BlueprintTraining {
            objective: Objective::CategoricalCrossentropy,
            optimizer: OptimizerKind::Adam,
            learning_rate: 0.01,
            momentum: None,
            metric: Metric::CategoricalAccuracy,
            stopping: StoppingSpec::Epoch { max_epochs: 3 },
            batch_size: 8,
        };
        Blueprint::new(
            layout,
            rows,
            LayerSpec::Dense { units: 3, activation: Activation::Softmax },
            training,
        )
    }

    #[test]
    fn widths_and_counts() {
        let blueprint = sample_blueprint();
        blueprint.validate().unwrap();
        assert_eq!(blueprint.rows[0].output_width(10), 6);
        assert_eq!(blueprint.feature_width(), 5);
        assert_eq!(blueprint.layer_count(), 5);
        // 10*4+4 + 10*2+2 + 6*5+5 + 5*3+3
        assert_eq!(blueprint.parameter_count(), 44 + 22 + 35 + 18);
    }

    #[test]
    fn output_mismatch_is_config_error() {
        let mut blueprint = sample_blueprint();
        blueprint.output = LayerSpec::Dense { units: 4, activation: Activation::Softmax };
        let err = blueprint.validate().unwrap_err();
        assert!(matches!(
            err,
            ns_types::NsError::Config(ConfigError::LayoutMismatch { .. })
        ));

        let mut blueprint = sample_blueprint();
        blueprint.output = LayerSpec::Dense { units: 3, activation: Activation::Sigmoid };
        assert!(blueprint.validate().is_err());
    }

    #[test]
    fn empty_structures_rejected() {
        let mut blueprint = sample_blueprint();
        blueprint.rows[1].blocks.clear();
        assert!(blueprint.validate().unwrap_err().to_string().contains("row 1"));

        let mut blueprint = sample_blueprint();
        blueprint.rows[0].blocks[1].layers[1] = LayerSpec::Dropout { rate: 1.0 };
        assert!(blueprint.validate().is_err());
    }

    #[test]
    fn oversized_layers_rejected() {
        let mut blueprint = sample_blueprint();
        blueprint.rows[1].blocks[0].layers[0] =
            LayerSpec::Dense { units: usize::MAX / 2, activation: Activation::Sigmoid };
        assert_eq!(blueprint.parameter_count(), usize::MAX);
        let err = blueprint.validate().unwrap_err();
        assert!(matches!(
            err,
            ns_types::NsError::Config(ConfigError::InvalidBlueprint { .. })
        ));
        assert!(err.to_string().contains("exceed"));
    }

    #[test]
    fn json_round_trip() {
        let blueprint = sample_blueprint();
        let json = blueprint.to_json().unwrap();
        assert!(json.contains("\"type\": \"Dropout\""));
        let back = Blueprint::from_json(&json).unwrap();
        assert_eq!(back, blueprint);
    }
}
