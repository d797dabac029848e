// Trainable model built from one blueprint
// Fits over batch iterators, consulting the blueprint's stopping condition each epoch

use crossbeam_channel::Sender;
use ns_design::{Blueprint, BlueprintId};
use ns_types::{
    training_config_error, BatchIterator, Device, EpochMetrics, NsResult, Sample, TrainingError,
};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use rayon::prelude::*;
use rayon::ThreadPool;
use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use crate::network::Network;
use crate::optimizer::OptimizerState;

/// Loss and metric averaged over evaluated samples.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Score {
    pub loss: f64,
    pub metric: f64,
}

/// History of one `fit_generator` call.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FitResult {
    pub epochs: Vec<EpochMetrics>,
    pub requested_epochs: usize,
    /// True when the stopping condition ended the run before `requested_epochs`.
    pub stopped_early: bool,
}

impl FitResult {
    pub fn epochs_run(&self) -> usize {
        self.epochs.len()
    }

    pub fn last(&self) -> Option<&EpochMetrics> {
        self.epochs.last()
    }

    /// Best monitored value over the run, respecting the metric direction.
    pub fn best(&self) -> Option<&EpochMetrics> {
        self.epochs
            .iter()
            .max_by(|a, b| a.monitored_score().total_cmp(&b.monitored_score()))
    }
}

/// Dense network plus optimizer state and the pool it trains on.
pub struct Model {
    blueprint: Blueprint,
    network: Network,
    optimizer: OptimizerState,
    device: Device,
    pool: ThreadPool,
    rng: StdRng,
    progress: Option<Sender<EpochMetrics>>,
}

impl std::fmt::Debug for Model {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Model")
            .field("blueprint", &self.blueprint.id)
            .field("device", &self.device)
            .field("parameters", &self.network.parameter_count())
            .field("threads", &self.pool.current_num_threads())
            .finish()
    }
}

impl Model {
    pub(crate) fn new(
        blueprint: Blueprint,
        network: Network,
        optimizer: OptimizerState,
        device: Device,
        pool: ThreadPool,
        rng: StdRng,
    ) -> Self {
        Self {
            blueprint,
            network,
            optimizer,
            device,
            pool,
            rng,
            progress: None,
        }
    }

    /// Send a copy of every epoch's metrics to `sender`.
    pub fn with_progress(mut self, sender: Sender<EpochMetrics>) -> Self {
        self.progress = Some(sender);
        self
    }

    pub fn blueprint(&self) -> &Blueprint {
        &self.blueprint
    }

    pub fn blueprint_id(&self) -> BlueprintId {
        self.blueprint.id
    }

    pub fn device(&self) -> Device {
        self.device
    }

    pub fn parameter_count(&self) -> usize {
        self.network.parameter_count()
    }

    pub fn threads(&self) -> usize {
        self.pool.current_num_threads()
    }

    pub fn predict(&self, input: &[f64]) -> NsResult<Vec<f64>> {
        if input.len() != self.network.input_size() {
            return Err(TrainingError::ShapeMismatch {
                expected: self.network.input_size(),
                actual: input.len(),
                context: "model input".to_string(),
            }
            .into());
        }
        Ok(self.network.predict(input))
    }

    /// Train for at most `nb_epoch` epochs.
    ///
    /// Each epoch draws whole batches until at least `samples_per_epoch`
    /// samples were seen, then scores `nb_val_samples` of the validation data
    /// when given. A fresh stopping condition is instantiated per call.
    pub fn fit_generator(
        &mut self,
        generator: &mut BatchIterator,
        samples_per_epoch: usize,
        nb_epoch: usize,
        mut validation_data: Option<&mut BatchIterator>,
        nb_val_samples: usize,
    ) -> NsResult<FitResult> {
        if nb_epoch == 0 {
            return Err(training_config_error!("nb_epoch must be positive"));
        }
        if samples_per_epoch == 0 {
            return Err(TrainingError::EmptyData {
                message: "samples_per_epoch is 0".to_string(),
            }
            .into());
        }
        self.check_widths(generator, "training data")?;
        if let Some(validation) = validation_data.as_deref() {
            self.check_widths(validation, "validation data")?;
        }

        let mut stopping = self.blueprint.training.stopping.instantiate()?;
        stopping.reset();
        let direction = self.blueprint.training.metric.direction();

        info!(
            "Fitting model {} for up to {} epochs ({} stopping, {} samples per epoch)",
            self.blueprint.id,
            nb_epoch,
            stopping.name(),
            samples_per_epoch
        );

        let mut epochs = Vec::with_capacity(nb_epoch);
        let mut stopped_early = false;
        for epoch in 1..=nb_epoch {
            let (loss, metric) = self.train_epoch(generator, samples_per_epoch)?;
            if !loss.is_finite() {
                return Err(TrainingError::Diverged { epoch, loss }.into());
            }

            let mut metrics = EpochMetrics::new(epoch, loss, metric).with_direction(direction);
            if let Some(validation) = validation_data.as_deref_mut() {
                let score = self.evaluate_generator(validation, nb_val_samples)?;
                metrics = metrics.with_validation(score.loss, score.metric);
            }
            debug!(
                "Epoch {}/{}: loss {:.4}, {} {:.4}, val {:?}",
                epoch,
                nb_epoch,
                loss,
                self.blueprint.training.metric,
                metric,
                metrics.val_metric
            );

            if let Some(sender) = &self.progress {
                // A dropped receiver only means nobody is watching.
                let _ = sender.send(metrics.clone());
            }

            let decision = stopping.decide(&metrics);
            epochs.push(metrics);
            if decision.should_stop() {
                stopped_early = epoch < nb_epoch;
                info!(
                    "Stopping condition {} ended training after epoch {} ({:?})",
                    stopping.name(),
                    epoch,
                    stopping.state()
                );
                break;
            }
        }

        Ok(FitResult {
            epochs,
            requested_epochs: nb_epoch,
            stopped_early,
        })
    }

    /// Average loss and metric over exactly `val_samples` samples, starting
    /// from the beginning of the iterator's pass.
    pub fn evaluate_generator(
        &mut self,
        generator: &mut BatchIterator,
        val_samples: usize,
    ) -> NsResult<Score> {
        if val_samples == 0 {
            return Err(TrainingError::EmptyData {
                message: "val_samples is 0".to_string(),
            }
            .into());
        }
        self.check_widths(generator, "evaluation data")?;

        generator.reset();
        let objective = self.blueprint.training.objective;
        let metric = self.blueprint.training.metric;
        let network = &self.network;

        let mut seen = 0;
        let mut loss_sum = 0.0;
        let mut metric_sum = 0.0;
        while seen < val_samples {
            let batch = generator.next_batch();
            let take = batch.len().min(val_samples - seen);
            let samples: Vec<&Sample> = batch.iter().take(take).collect();
            let (loss, score) = self.pool.install(|| {
                samples
                    .par_iter()
                    .map(|sample| network.evaluate_sample(sample, objective, metric))
                    .reduce(|| (0.0, 0.0), |a, b| (a.0 + b.0, a.1 + b.1))
            });
            loss_sum += loss;
            metric_sum += score;
            seen += take;
        }

        Ok(Score {
            loss: loss_sum / seen as f64,
            metric: metric_sum / seen as f64,
        })
    }

    fn train_epoch(
        &mut self,
        generator: &mut BatchIterator,
        samples_per_epoch: usize,
    ) -> NsResult<(f64, f64)> {
        let mut seen = 0;
        let mut loss_sum = 0.0;
        let mut metric_sum = 0.0;
        while seen < samples_per_epoch {
            let batch = generator.next_batch();
            if batch.is_empty() {
                return Err(TrainingError::EmptyData {
                    message: "iterator returned an empty batch".to_string(),
                }
                .into());
            }
            let samples = batch.samples();
            let (loss, metric) = self.train_batch(&samples);
            loss_sum += loss;
            metric_sum += metric;
            seen += samples.len();
        }
        Ok((loss_sum / seen as f64, metric_sum / seen as f64))
    }

    /// One optimizer step on the mean gradient of `samples`. Returns summed
    /// loss and metric.
    fn train_batch(&mut self, samples: &[&Sample]) -> (f64, f64) {
        let objective = self.blueprint.training.objective;
        let metric = self.blueprint.training.metric;
        let seed: u64 = self.rng.random();
        let network = &self.network;

        let (mut grads, loss, score) = self.pool.install(|| {
            samples
                .par_iter()
                .enumerate()
                .fold(
                    || (network.zero_gradients(), 0.0, 0.0),
                    |(mut grads, loss, score), (i, sample)| {
                        let mut rng = StdRng::seed_from_u64(seed.wrapping_add(i as u64));
                        let (l, m) =
                            network.backprop_into(sample, objective, metric, &mut rng, &mut grads);
                        (grads, loss + l, score + m)
                    },
                )
                .reduce(
                    || (network.zero_gradients(), 0.0, 0.0),
                    |(mut a, la, ma), (b, lb, mb)| {
                        a.accumulate(&b);
                        (a, la + lb, ma + mb)
                    },
                )
        });

        grads.scale(1.0 / samples.len() as f64);
        self.optimizer.apply(&mut self.network.layers, &grads);
        (loss, score)
    }

    fn check_widths(&self, generator: &BatchIterator, context: &str) -> NsResult<()> {
        if generator.input_size() != self.network.input_size() {
            return Err(TrainingError::ShapeMismatch {
                expected: self.network.input_size(),
                actual: generator.input_size(),
                context: format!("{context} inputs"),
            }
            .into());
        }
        if generator.output_size() != self.network.output_size() {
            return Err(TrainingError::ShapeMismatch {
                expected: self.network.output_size(),
                actual: generator.output_size(),
                context: format!("{context} outputs"),
            }
            .into());
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::builder::ModelBuilder;
    use ns_design::{Block, BlueprintTraining, LayerSpec, Row};
    use ns_types::{
        synthetic_classification, Activation, Dataset, Layout, Metric, NsError, Objective,
        OptimizerKind, StoppingSpec,
    };
    use std::sync::Arc;

    fn blueprint(input: usize, classes: usize, optimizer: OptimizerKind, stopping: StoppingSpec) -> Blueprint {
        Blueprint::new(
            Layout::new(input, classes, Activation::Softmax).unwrap(),
            vec![Row {
                blocks: vec![
                    Block {
                        layers: vec![LayerSpec::Dense { units: 16, activation: Activation::Relu }],
                    },
                    Block {
                        layers: vec![
                            LayerSpec::Dense { units: 8, activation: Activation::Tanh },
                            LayerSpec::Dropout { rate: 0.1 },
                        ],
                    },
                ],
            }],
            LayerSpec::Dense { units: classes, activation: Activation::Softmax },
            BlueprintTraining {
                objective: Objective::CategoricalCrossentropy,
                optimizer,
                learning_rate: 0.01,
                momentum: None,
                metric: Metric::CategoricalAccuracy,
                stopping,
                batch_size: 16,
            },
        )
    }

    fn iterator(samples: usize, input: usize, classes: usize, seed: u64) -> BatchIterator {
        let data = synthetic_classification(samples, input, classes, seed).unwrap();
        BatchIterator::new(Arc::new(data), 16).unwrap()
    }

    #[test]
    fn test_fit_runs_requested_epochs() {
        let bp = blueprint(10, 3, OptimizerKind::Adam, StoppingSpec::Epoch { max_epochs: 4 });
        let mut model = ModelBuilder::new().with_seed(7).build(&bp, Device::Cpu { index: 0 }).unwrap();
        let mut train = iterator(64, 10, 3, 1);
        let mut test = iterator(32, 10, 3, 1);

        let fit = model.fit_generator(&mut train, 64, 10, Some(&mut test), 32).unwrap();
        assert_eq!(fit.epochs_run(), 4);
        assert_eq!(fit.requested_epochs, 10);
        assert!(fit.stopped_early);
        for (i, epoch) in fit.epochs.iter().enumerate() {
            assert_eq!(epoch.epoch, i + 1);
            assert!(epoch.loss.is_finite());
            assert!(epoch.val_metric.is_some());
        }
    }

    #[test]
    fn test_training_reduces_loss() {
        let bp = blueprint(10, 3, OptimizerKind::Adam, StoppingSpec::Epoch { max_epochs: 30 });
        let mut model = ModelBuilder::new().with_seed(3).build(&bp, Device::Cpu { index: 0 }).unwrap();
        let mut train = iterator(90, 10, 3, 4);

        let fit = model.fit_generator(&mut train, 90, 30, None, 0).unwrap();
        assert!(!fit.stopped_early);
        let first = fit.epochs[0].loss;
        let last = fit.last().unwrap().loss;
        assert!(last < first, "loss went from {first} to {last}");
    }

    #[test]
    fn test_stopping_state_not_shared_between_fits() {
        let bp = blueprint(6, 2, OptimizerKind::Sgd, StoppingSpec::Epoch { max_epochs: 2 });
        let mut model = ModelBuilder::new().with_seed(1).build(&bp, Device::Cpu { index: 0 }).unwrap();
        let mut train = iterator(32, 6, 2, 9);

        let mut samples = train.samples_per_epoch();
        assert_eq!(model.fit_generator(&mut train, samples, 5, None, 0).unwrap().epochs_run(), 2);
        samples = train.samples_per_epoch();
        assert_eq!(model.fit_generator(&mut train, samples, 5, None, 0).unwrap().epochs_run(), 2);
    }

    #[test]
    fn test_best_epoch_follows_metric_direction() {
        let epoch = |n, metric| EpochMetrics::new(n, 1.0, metric);
        let mut fit = FitResult {
            epochs: vec![epoch(1, 0.4), epoch(2, 0.7), epoch(3, 0.5)],
            requested_epochs: 3,
            stopped_early: false,
        };
        assert_eq!(fit.best().unwrap().epoch, 2);

        fit.epochs = fit
            .epochs
            .into_iter()
            .map(|m| m.with_direction(Metric::MeanSquaredError.direction()))
            .collect();
        assert_eq!(fit.best().unwrap().epoch, 1);

        // Validation metric wins over the training metric.
        fit.epochs[2] = epoch(3, 0.9)
            .with_validation(1.0, 0.05)
            .with_direction(Metric::MeanSquaredError.direction());
        assert_eq!(fit.best().unwrap().epoch, 3);

        fit.epochs.clear();
        assert!(fit.best().is_none());
    }

    #[test]
    fn test_progress_channel_receives_every_epoch() {
        let (tx, rx) = crossbeam_channel::unbounded();
        let bp = blueprint(6, 2, OptimizerKind::RmsProp, StoppingSpec::Epoch { max_epochs: 3 });
        let mut model = ModelBuilder::new()
            .build(&bp, Device::Cpu { index: 0 })
            .unwrap()
            .with_progress(tx);
        let mut train = iterator(32, 6, 2, 2);

        model.fit_generator(&mut train, 32, 3, None, 0).unwrap();
        let received: Vec<EpochMetrics> = rx.try_iter().collect();
        assert_eq!(received.iter().map(|m| m.epoch).collect::<Vec<_>>(), vec![1, 2, 3]);
    }

    #[test]
    fn test_evaluate_counts_exact_samples() {
        let bp = blueprint(10, 3, OptimizerKind::Adam, StoppingSpec::Epoch { max_epochs: 1 });
        let mut model = ModelBuilder::new().with_seed(5).build(&bp, Device::Cpu { index: 0 }).unwrap();
        let mut test = iterator(40, 10, 3, 8);

        let a = model.evaluate_generator(&mut test, 25).unwrap();
        let b = model.evaluate_generator(&mut test, 25).unwrap();
        assert_eq!(a, b);
        assert!((0.0..=1.0).contains(&a.metric));
        assert!(a.loss > 0.0);
    }

    #[test]
    fn test_empty_and_mismatched_inputs() {
        let bp = blueprint(10, 3, OptimizerKind::Adam, StoppingSpec::Epoch { max_epochs: 1 });
        let mut model = ModelBuilder::new().build(&bp, Device::Cpu { index: 0 }).unwrap();

        let mut train = iterator(16, 10, 3, 0);
        let err = model.fit_generator(&mut train, 0, 1, None, 0).unwrap_err();
        assert!(matches!(err, NsError::Training(TrainingError::EmptyData { .. })));

        let mut wrong = iterator(16, 12, 3, 0);
        let err = model.fit_generator(&mut wrong, 16, 1, None, 0).unwrap_err();
        assert!(matches!(
            err,
            NsError::Training(TrainingError::ShapeMismatch { expected: 10, actual: 12, .. })
        ));

        assert!(model.evaluate_generator(&mut train, 0).is_err());
        assert!(model.predict(&[0.0; 3]).is_err());
        assert_eq!(model.predict(&[0.0; 10]).unwrap().len(), 3);
    }

    #[test]
    fn test_divergence_is_reported() {
        let mut bp = blueprint(2, 1, OptimizerKind::Sgd, StoppingSpec::Epoch { max_epochs: 20 });
        bp.layout = Layout::new(2, 1, Activation::Linear).unwrap();
        bp.output = LayerSpec::Dense { units: 1, activation: Activation::Linear };
        bp.rows = vec![Row {
            blocks: vec![Block {
                layers: vec![LayerSpec::Dense { units: 4, activation: Activation::Linear }],
            }],
        }];
        bp.training.objective = Objective::MeanSquaredError;
        bp.training.metric = Metric::MeanSquaredError;
        bp.training.learning_rate = 1e6;

        let samples = (0..8)
            .map(|i| Sample {
                input: vec![i as f64, 1.0],
                target: vec![100.0 * i as f64],
            })
            .collect();
        let mut train = BatchIterator::new(Arc::new(Dataset::new(samples).unwrap()), 4).unwrap();
        let mut model = ModelBuilder::new().with_seed(2).build(&bp, Device::Cpu { index: 0 }).unwrap();

        let err = model.fit_generator(&mut train, 8, 20, None, 0).unwrap_err();
        assert!(matches!(err, NsError::Training(TrainingError::Diverged { .. })));
    }
}
