//! Dense CPU network assembled from a blueprint.

use ns_design::{Blueprint, LayerSpec};
use ns_types::{Activation, Metric, Objective, Sample};
use rand::rngs::StdRng;
use rand::Rng;

const EPSILON: f64 = 1e-7;

/// Weights of one dense layer, row-major `units x inputs`.
#[derive(Debug, Clone)]
pub(crate) struct DenseParams {
    pub inputs: usize,
    pub units: usize,
    pub weights: Vec<f64>,
    pub biases: Vec<f64>,
}

impl DenseParams {
    /// Glorot-uniform weights, zero biases.
    fn init(inputs: usize, units: usize, rng: &mut StdRng) -> Self {
        let limit = (6.0 / (inputs + units) as f64).sqrt();
        let weights = (0..inputs * units)
            .map(|_| rng.random_range(-limit..=limit))
            .collect();
        Self {
            inputs,
            units,
            weights,
            biases: vec![0.0; units],
        }
    }
}

/// Gradients with the same shape as the network weights.
#[derive(Debug, Clone)]
pub(crate) struct Gradients {
    pub layers: Vec<DenseParams>,
}

impl Gradients {
    fn zeros(layers: &[DenseParams]) -> Self {
        Self {
            layers: layers
                .iter()
                .map(|l| DenseParams {
                    inputs: l.inputs,
                    units: l.units,
                    weights: vec![0.0; l.weights.len()],
                    biases: vec![0.0; l.biases.len()],
                })
                .collect(),
        }
    }

    pub fn accumulate(&mut self, other: &Gradients) {
        for (mine, theirs) in self.layers.iter_mut().zip(&other.layers) {
            add_assign(&mut mine.weights, &theirs.weights);
            add_assign(&mut mine.biases, &theirs.biases);
        }
    }

    pub fn scale(&mut self, factor: f64) {
        for layer in &mut self.layers {
            layer.weights.iter_mut().for_each(|g| *g *= factor);
            layer.biases.iter_mut().for_each(|g| *g *= factor);
        }
    }
}

fn push_dense(layers: &mut Vec<DenseParams>, inputs: usize, units: usize, rng: &mut StdRng) -> usize {
    layers.push(DenseParams::init(inputs, units, rng));
    layers.len() - 1
}

fn add_assign(target: &mut [f64], source: &[f64]) {
    for (t, s) in target.iter_mut().zip(source) {
        *t += s;
    }
}

#[derive(Debug, Clone, Copy)]
enum Node {
    Dense { layer: usize, activation: Activation },
    Dropout { rate: f64 },
}

/// Values recorded during a training forward pass.
struct NodeTrace {
    input: Vec<f64>,
    output: Vec<f64>,
    mask: Option<Vec<f64>>,
}

type BlockTrace = Vec<NodeTrace>;

#[derive(Debug, Clone)]
pub(crate) struct Network {
    pub layers: Vec<DenseParams>,
    rows: Vec<Vec<Vec<Node>>>,
    output: Node,
    input_size: usize,
    output_size: usize,
}

impl Network {
    /// Assumes `blueprint` has been validated.
    pub fn from_blueprint(blueprint: &Blueprint, rng: &mut StdRng) -> Self {
        let mut layers = Vec::new();

        let mut width = blueprint.layout.input_size;
        let mut rows = Vec::with_capacity(blueprint.rows.len());
        for row in &blueprint.rows {
            let mut blocks = Vec::with_capacity(row.blocks.len());
            let mut row_width = 0;
            for block in &row.blocks {
                let mut nodes = Vec::with_capacity(block.layers.len());
                let mut block_width = width;
                for spec in &block.layers {
                    let node = match *spec {
                        LayerSpec::Dense { units, activation } => Node::Dense {
                            layer: push_dense(&mut layers, block_width, units, rng),
                            activation,
                        },
                        LayerSpec::Dropout { rate } => Node::Dropout { rate },
                    };
                    block_width = spec.output_width(block_width);
                    nodes.push(node);
                }
                row_width += block_width;
                blocks.push(nodes);
            }
            width = row_width;
            rows.push(blocks);
        }

        let output = match blueprint.output {
            LayerSpec::Dense { units, activation } => Node::Dense {
                layer: push_dense(&mut layers, width, units, rng),
                activation,
            },
            LayerSpec::Dropout { rate } => Node::Dropout { rate },
        };

        Self {
            layers,
            rows,
            output,
            input_size: blueprint.layout.input_size,
            output_size: blueprint.layout.output_size,
        }
    }

    pub fn input_size(&self) -> usize {
        self.input_size
    }

    pub fn output_size(&self) -> usize {
        self.output_size
    }

    pub fn parameter_count(&self) -> usize {
        self.layers
            .iter()
            .map(|l| l.weights.len() + l.biases.len())
            .sum()
    }

    pub fn zero_gradients(&self) -> Gradients {
        Gradients::zeros(&self.layers)
    }

    /// Inference pass: dropout disabled.
    pub fn predict(&self, input: &[f64]) -> Vec<f64> {
        let mut x = input.to_vec();
        for row in &self.rows {
            let mut next = Vec::new();
            for block in row {
                let mut h = x.clone();
                for node in block {
                    h = self.apply(node, &h, None).0;
                }
                next.extend(h);
            }
            x = next;
        }
        self.apply(&self.output, &x, None).0
    }

    /// Loss and metric of one sample without touching any gradient.
    pub fn evaluate_sample(&self, sample: &Sample, objective: Objective, metric: Metric) -> (f64, f64) {
        let y = self.predict(&sample.input);
        (loss(objective, &y, &sample.target), score(metric, &y, &sample.target))
    }

    /// Forward and backward pass of one training sample. Gradients are added
    /// to `grads`; returns the sample's loss and metric.
    pub fn backprop_into(
        &self,
        sample: &Sample,
        objective: Objective,
        metric: Metric,
        rng: &mut StdRng,
        grads: &mut Gradients,
    ) -> (f64, f64) {
        // Forward, keeping traces.
        let mut x = sample.input.clone();
        let mut row_traces: Vec<Vec<BlockTrace>> = Vec::with_capacity(self.rows.len());
        for row in &self.rows {
            let mut next = Vec::new();
            let mut block_traces = Vec::with_capacity(row.len());
            for block in row {
                let mut h = x.clone();
                let mut traces = Vec::with_capacity(block.len());
                for node in block {
                    let (out, mask) = self.apply(node, &h, Some(&mut *rng));
                    traces.push(NodeTrace {
                        input: h,
                        output: out.clone(),
                        mask,
                    });
                    h = out;
                }
                next.extend_from_slice(&h);
                block_traces.push(traces);
            }
            row_traces.push(block_traces);
            x = next;
        }
        let (y, mask) = self.apply(&self.output, &x, Some(&mut *rng));
        let output_trace = NodeTrace {
            input: x,
            output: y,
            mask,
        };

        let y = &output_trace.output;
        let sample_loss = loss(objective, y, &sample.target);
        let sample_metric = score(metric, y, &sample.target);

        // Backward.
        let dy = loss_gradient(objective, y, &sample.target);
        let mut dx = self.backward_node(&self.output, &output_trace, &dy, grads, true);
        for (r, (row, traces)) in self.rows.iter().zip(&row_traces).enumerate().rev() {
            let input_width = traces
                .first()
                .and_then(|t| t.first())
                .map_or(0, |t| t.input.len());
            let mut d_input = vec![0.0; input_width];
            let mut offset = 0;
            for (block, block_traces) in row.iter().zip(traces) {
                let width = block_traces.last().map_or(0, |t| t.output.len());
                let mut d = dx[offset..offset + width].to_vec();
                offset += width;
                for (n, (node, trace)) in block.iter().zip(block_traces).enumerate().rev() {
                    // The network input needs no gradient.
                    d = self.backward_node(node, trace, &d, grads, r > 0 || n > 0);
                }
                add_assign(&mut d_input, &d);
            }
            dx = d_input;
        }

        (sample_loss, sample_metric)
    }

    fn apply(&self, node: &Node, x: &[f64], rng: Option<&mut StdRng>) -> (Vec<f64>, Option<Vec<f64>>) {
        match *node {
            Node::Dense { layer, activation } => {
                let params = &self.layers[layer];
                let mut z: Vec<f64> = params
                    .weights
                    .chunks_exact(params.inputs)
                    .zip(&params.biases)
                    .map(|(w, b)| w.iter().zip(x).map(|(w, x)| w * x).sum::<f64>() + b)
                    .collect();
                activate(activation, &mut z);
                (z, None)
            }
            Node::Dropout { rate } => match rng {
                Some(rng) if rate > 0.0 => {
                    let keep = 1.0 / (1.0 - rate);
                    let mask: Vec<f64> = x
                        .iter()
                        .map(|_| if rng.random::<f64>() < rate { 0.0 } else { keep })
                        .collect();
                    let out = x.iter().zip(&mask).map(|(x, m)| x * m).collect();
                    (out, Some(mask))
                }
                _ => (x.to_vec(), None),
            },
        }
    }

    /// Accumulates parameter gradients and returns the gradient of the input,
    /// or an empty vector when `input_grad` is false.
    fn backward_node(
        &self,
        node: &Node,
        trace: &NodeTrace,
        dy: &[f64],
        grads: &mut Gradients,
        input_grad: bool,
    ) -> Vec<f64> {
        match *node {
            Node::Dense { layer, activation } => {
                let dz = activation_gradient(activation, &trace.output, dy);
                let params = &self.layers[layer];
                let grad = &mut grads.layers[layer];
                let mut dx = if input_grad { vec![0.0; params.inputs] } else { Vec::new() };
                for (j, &dz_j) in dz.iter().enumerate() {
                    if dz_j == 0.0 {
                        continue;
                    }
                    let row = j * params.inputs;
                    let gw = &mut grad.weights[row..row + params.inputs];
                    for (g, x) in gw.iter_mut().zip(&trace.input) {
                        *g += dz_j * x;
                    }
                    if input_grad {
                        let w = &params.weights[row..row + params.inputs];
                        for (d, w) in dx.iter_mut().zip(w) {
                            *d += w * dz_j;
                        }
                    }
                    grad.biases[j] += dz_j;
                }
                dx
            }
            Node::Dropout { .. } => match &trace.mask {
                Some(mask) => dy.iter().zip(mask).map(|(d, m)| d * m).collect(),
                None => dy.to_vec(),
            },
        }
    }
}

fn activate(activation: Activation, z: &mut [f64]) {
    match activation {
        Activation::Linear => {}
        Activation::Relu => z.iter_mut().for_each(|v| *v = v.max(0.0)),
        Activation::Tanh => z.iter_mut().for_each(|v| *v = v.tanh()),
        Activation::Sigmoid => z.iter_mut().for_each(|v| *v = 1.0 / (1.0 + (-*v).exp())),
        Activation::Softmax => {
            let max = z.iter().cloned().fold(f64::NEG_INFINITY, f64::max);
            let mut sum = 0.0;
            for v in z.iter_mut() {
                *v = (*v - max).exp();
                sum += *v;
            }
            z.iter_mut().for_each(|v| *v /= sum);
        }
    }
}

/// dL/dz from dL/dy, using the activation output `y`.
fn activation_gradient(activation: Activation, y: &[f64], dy: &[f64]) -> Vec<f64> {
    match activation {
        Activation::Linear => dy.to_vec(),
        Activation::Relu => y
            .iter()
            .zip(dy)
            .map(|(y, d)| if *y > 0.0 { *d } else { 0.0 })
            .collect(),
        Activation::Tanh => y.iter().zip(dy).map(|(y, d)| d * (1.0 - y * y)).collect(),
        Activation::Sigmoid => y.iter().zip(dy).map(|(y, d)| d * y * (1.0 - y)).collect(),
        Activation::Softmax => {
            let dot: f64 = y.iter().zip(dy).map(|(y, d)| y * d).sum();
            y.iter().zip(dy).map(|(y, d)| y * (d - dot)).collect()
        }
    }
}

pub(crate) fn loss(objective: Objective, y: &[f64], t: &[f64]) -> f64 {
    let n = y.len().max(1) as f64;
    match objective {
        Objective::CategoricalCrossentropy => -y
            .iter()
            .zip(t)
            .map(|(y, t)| t * y.max(EPSILON).ln())
            .sum::<f64>(),
        Objective::BinaryCrossentropy => {
            -y.iter()
                .zip(t)
                .map(|(y, t)| {
                    let y = y.clamp(EPSILON, 1.0 - EPSILON);
                    t * y.ln() + (1.0 - t) * (1.0 - y).ln()
                })
                .sum::<f64>()
                / n
        }
        Objective::MeanSquaredError => y.iter().zip(t).map(|(y, t)| (y - t).powi(2)).sum::<f64>() / n,
    }
}

fn loss_gradient(objective: Objective, y: &[f64], t: &[f64]) -> Vec<f64> {
    let n = y.len().max(1) as f64;
    match objective {
        Objective::CategoricalCrossentropy => y
            .iter()
            .zip(t)
            .map(|(y, t)| -t / y.max(EPSILON))
            .collect(),
        Objective::BinaryCrossentropy => y
            .iter()
            .zip(t)
            .map(|(y, t)| {
                let y = y.clamp(EPSILON, 1.0 - EPSILON);
                (-t / y + (1.0 - t) / (1.0 - y)) / n
            })
            .collect(),
        Objective::MeanSquaredError => y.iter().zip(t).map(|(y, t)| 2.0 * (y - t) / n).collect(),
    }
}

pub(crate) fn score(metric: Metric, y: &[f64], t: &[f64]) -> f64 {
    match metric {
        Metric::CategoricalAccuracy => {
            if argmax(y) == argmax(t) {
                1.0
            } else {
                0.0
            }
        }
        Metric::Accuracy => {
            let hits = y
                .iter()
                .zip(t)
                .filter(|(y, t)| (if **y >= 0.5 { 1.0 } else { 0.0 }) == **t)
                .count();
            hits as f64 / y.len().max(1) as f64
        }
        Metric::MeanSquaredError => {
            y.iter().zip(t).map(|(y, t)| (y - t).powi(2)).sum::<f64>() / y.len().max(1) as f64
        }
    }
}

fn argmax(values: &[f64]) -> usize {
    values
        .iter()
        .enumerate()
        .fold((0, f64::NEG_INFINITY), |best, (i, v)| if *v > best.1 { (i, *v) } else { best })
        .0
}
