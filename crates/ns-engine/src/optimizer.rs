//! First-order update rules applied to the network weights.

use ns_types::OptimizerKind;

use crate::network::{DenseParams, Gradients};

const ADAM_BETA1: f64 = 0.9;
const ADAM_BETA2: f64 = 0.999;
const ADAM_EPSILON: f64 = 1e-8;
const RMSPROP_RHO: f64 = 0.9;
const RMSPROP_EPSILON: f64 = 1e-7;

/// Optimizer with its per-weight state. Slot `2 * layer` holds the state of
/// the layer weights, `2 * layer + 1` the biases.
#[derive(Debug, Clone)]
pub(crate) struct OptimizerState {
    kind: OptimizerKind,
    learning_rate: f64,
    momentum: f64,
    step: i32,
    first: Vec<Vec<f64>>,
    second: Vec<Vec<f64>>,
}

impl OptimizerState {
    pub fn new(
        kind: OptimizerKind,
        learning_rate: f64,
        momentum: Option<f64>,
        layers: &[DenseParams],
    ) -> Self {
        let zeros = || -> Vec<Vec<f64>> {
            layers
                .iter()
                .flat_map(|l| [vec![0.0; l.weights.len()], vec![0.0; l.biases.len()]])
                .collect()
        };
        let second = match kind {
            OptimizerKind::Adam => zeros(),
            _ => Vec::new(),
        };
        Self {
            kind,
            learning_rate,
            momentum: momentum.unwrap_or(0.0),
            step: 0,
            first: zeros(),
            second,
        }
    }

    pub fn learning_rate(&self) -> f64 {
        self.learning_rate
    }

    /// Apply one update from averaged gradients.
    pub fn apply(&mut self, layers: &mut [DenseParams], grads: &Gradients) {
        self.step = self.step.saturating_add(1);
        for (l, (layer, grad)) in layers.iter_mut().zip(&grads.layers).enumerate() {
            self.update(2 * l, &mut layer.weights, &grad.weights);
            self.update(2 * l + 1, &mut layer.biases, &grad.biases);
        }
    }

    fn update(&mut self, slot: usize, params: &mut [f64], grads: &[f64]) {
        let lr = self.learning_rate;
        match self.kind {
            OptimizerKind::Sgd => {
                let momentum = self.momentum;
                let velocity = &mut self.first[slot];
                for ((p, g), v) in params.iter_mut().zip(grads).zip(velocity.iter_mut()) {
                    *v = momentum * *v - lr * g;
                    *p += *v;
                }
            }
            OptimizerKind::Adam => {
                let correction1 = 1.0 - ADAM_BETA1.powi(self.step);
                let correction2 = 1.0 - ADAM_BETA2.powi(self.step);
                let m = &mut self.first[slot];
                let v = &mut self.second[slot];
                for (i, (p, g)) in params.iter_mut().zip(grads).enumerate() {
                    m[i] = ADAM_BETA1 * m[i] + (1.0 - ADAM_BETA1) * g;
                    v[i] = ADAM_BETA2 * v[i] + (1.0 - ADAM_BETA2) * g * g;
                    let m_hat = m[i] / correction1;
                    let v_hat = v[i] / correction2;
                    *p -= lr * m_hat / (v_hat.sqrt() + ADAM_EPSILON);
                }
            }
            OptimizerKind::RmsProp => {
                let cache = &mut self.first[slot];
                for ((p, g), c) in params.iter_mut().zip(grads).zip(cache.iter_mut()) {
                    *c = RMSPROP_RHO * *c + (1.0 - RMSPROP_RHO) * g * g;
                    *p -= lr * g / (c.sqrt() + RMSPROP_EPSILON);
                }
            }
        }
    }
}
