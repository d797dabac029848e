//! In-memory datasets and the batch iterators models train on.

use rand::rngs::StdRng;
use rand::seq::SliceRandom;
use rand::{Rng, SeedableRng};
use serde::{Deserialize, Serialize};
use std::sync::Arc;

use crate::errors::{NsResult, TrainingError};

/// One input vector with its target vector (one-hot for classification).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Sample {
    pub input: Vec<f64>,
    pub target: Vec<f64>,
}

/// Fixed-width samples held in memory
#[derive(Debug, Clone, PartialEq)]
pub struct Dataset {
    samples: Vec<Sample>,
    input_size: usize,
    output_size: usize,
}

impl Dataset {
    pub fn new(samples: Vec<Sample>) -> NsResult<Self> {
        let first = samples.first().ok_or_else(|| TrainingError::EmptyData {
            message: "dataset has no samples".to_string(),
        })?;
        let input_size = first.input.len();
        let output_size = first.target.len();

        for (i, sample) in samples.iter().enumerate() {
            if sample.input.len() != input_size {
                return Err(TrainingError::ShapeMismatch {
                    expected: input_size,
                    actual: sample.input.len(),
                    context: format!("input of sample {i}"),
                }
                .into());
            }
            if sample.target.len() != output_size {
                return Err(TrainingError::ShapeMismatch {
                    expected: output_size,
                    actual: sample.target.len(),
                    context: format!("target of sample {i}"),
                }
                .into());
            }
        }

        Ok(Self {
            samples,
            input_size,
            output_size,
        })
    }

    /// Build a classification dataset with one-hot targets.
    pub fn from_labels(inputs: Vec<Vec<f64>>, labels: &[usize], n_classes: usize) -> NsResult<Self> {
        if inputs.len() != labels.len() {
            return Err(TrainingError::ShapeMismatch {
                expected: inputs.len(),
                actual: labels.len(),
                context: "labels".to_string(),
            }
            .into());
        }
        let samples = inputs
            .into_iter()
            .zip(labels)
            .map(|(input, &label)| {
                if label >= n_classes {
                    return Err(TrainingError::ShapeMismatch {
                        expected: n_classes,
                        actual: label + 1,
                        context: "label out of range".to_string(),
                    });
                }
                let mut target = vec![0.0; n_classes];
                target[label] = 1.0;
                Ok(Sample { input, target })
            })
            .collect::<Result<Vec<_>, _>>()?;
        Self::new(samples)
    }

    pub fn len(&self) -> usize {
        self.samples.len()
    }

    pub fn is_empty(&self) -> bool {
        self.samples.is_empty()
    }

    pub fn input_size(&self) -> usize {
        self.input_size
    }

    pub fn output_size(&self) -> usize {
        self.output_size
    }

    pub fn samples(&self) -> &[Sample] {
        &self.samples
    }

    /// Split off the last `len - at` samples into a second dataset.
    pub fn split_at(mut self, at: usize) -> NsResult<(Dataset, Dataset)> {
        let tail = self.samples.split_off(at.min(self.samples.len()));
        Ok((Dataset::new(self.samples)?, Dataset::new(tail)?))
    }
}

/// Sparse binary bag-of-features classification data.
///
/// Each class owns a random prototype; samples are the prototype of their
/// class with a few features flipped.
pub fn synthetic_classification(
    n_samples: usize,
    input_size: usize,
    n_classes: usize,
    seed: u64,
) -> NsResult<Dataset> {
    if n_classes == 0 || input_size == 0 {
        return Err(TrainingError::EmptyData {
            message: "synthetic data needs at least one class and one feature".to_string(),
        }
        .into());
    }
    let mut rng = StdRng::seed_from_u64(seed);
    let density = (10.0 / input_size as f64).min(0.5);
    let prototypes: Vec<Vec<f64>> = (0..n_classes)
        .map(|_| {
            (0..input_size)
                .map(|_| if rng.random_bool(density) { 1.0 } else { 0.0 })
                .collect()
        })
        .collect();

    let flip = density / 4.0;
    let mut inputs = Vec::with_capacity(n_samples);
    let mut labels = Vec::with_capacity(n_samples);
    for i in 0..n_samples {
        let label = i % n_classes;
        let input = prototypes[label]
            .iter()
            .map(|&x| if rng.random_bool(flip) { 1.0 - x } else { x })
            .collect();
        inputs.push(input);
        labels.push(label);
    }
    Dataset::from_labels(inputs, &labels, n_classes)
}

/// A batch: indices into a shared dataset.
#[derive(Debug, Clone)]
pub struct Batch {
    dataset: Arc<Dataset>,
    indices: Vec<usize>,
}

impl Batch {
    pub fn len(&self) -> usize {
        self.indices.len()
    }

    pub fn is_empty(&self) -> bool {
        self.indices.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &Sample> + '_ {
        self.indices.iter().map(move |&i| &self.dataset.samples[i])
    }

    pub fn samples(&self) -> Vec<&Sample> {
        self.iter().collect()
    }
}

/// Endless batch source over a shared dataset.
///
/// Wraps around at the end of the data, reshuffling first when shuffling is
/// enabled. The last batch of a pass may be short.
#[derive(Debug, Clone)]
pub struct BatchIterator {
    dataset: Arc<Dataset>,
    batch_size: usize,
    order: Vec<usize>,
    cursor: usize,
    rng: Option<StdRng>,
}

impl BatchIterator {
    pub fn new(dataset: Arc<Dataset>, batch_size: usize) -> NsResult<Self> {
        if batch_size == 0 {
            return Err(crate::training_config_error!("batch_size must be positive"));
        }
        if dataset.is_empty() {
            return Err(TrainingError::EmptyData {
                message: "batch iterator over an empty dataset".to_string(),
            }
            .into());
        }
        let order = (0..dataset.len()).collect();
        Ok(Self {
            dataset,
            batch_size,
            order,
            cursor: 0,
            rng: None,
        })
    }

    /// Shuffle the sample order on every pass.
    pub fn with_shuffle(mut self, seed: u64) -> Self {
        let mut rng = StdRng::seed_from_u64(seed);
        self.order.shuffle(&mut rng);
        self.rng = Some(rng);
        self
    }

    /// Samples in one pass over the data.
    pub fn samples_per_epoch(&self) -> usize {
        self.dataset.len()
    }

    pub fn sample_count(&self) -> usize {
        self.dataset.len()
    }

    pub fn batch_size(&self) -> usize {
        self.batch_size
    }

    pub fn input_size(&self) -> usize {
        self.dataset.input_size()
    }

    pub fn output_size(&self) -> usize {
        self.dataset.output_size()
    }

    pub fn dataset(&self) -> &Arc<Dataset> {
        &self.dataset
    }

    pub fn next_batch(&mut self) -> Batch {
        let end = (self.cursor + self.batch_size).min(self.order.len());
        let indices = self.order[self.cursor..end].to_vec();
        self.cursor = end;
        if self.cursor >= self.order.len() {
            self.start_pass();
        }
        Batch {
            dataset: Arc::clone(&self.dataset),
            indices,
        }
    }

    /// Restart at the beginning of a pass.
    pub fn reset(&mut self) {
        self.start_pass();
    }

    fn start_pass(&mut self) {
        self.cursor = 0;
        if let Some(rng) = self.rng.as_mut() {
            self.order.shuffle(rng);
        }
    }
}
