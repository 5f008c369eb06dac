//! Supervised training loop and the metric tracker it reports to.

use tracing::{debug, info};

use crate::data::DataLoader;
use crate::error::{HebbError, Result};
use crate::layers::Mode;
use crate::model::Model;
use crate::optim::{correct_predictions, cross_entropy, Adam, StepLr};

/// Loss/accuracy of one evaluation pass.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct EvalPoint {
    pub epoch: usize,
    pub loss: f32,
    pub accuracy: f32,
}

/// Evaluates a model over a loader and keeps the history.
#[derive(Debug, Clone)]
pub struct SupervisedEvaluator {
    loader: DataLoader,
    pub losses: Vec<f32>,
    pub accuracies: Vec<f32>,
    pub epochs: Vec<usize>,
}

impl SupervisedEvaluator {
    pub fn new(loader: DataLoader) -> Self {
        Self {
            loader,
            losses: Vec::new(),
            accuracies: Vec::new(),
            epochs: Vec::new(),
        }
    }

    /// Runs the model in eval mode over every batch and appends the mean
    /// loss and accuracy.
    pub fn run(&mut self, model: &mut Model, epoch: usize) -> Result<EvalPoint> {
        let mut loss_sum = 0.0f64;
        let mut correct = 0usize;
        let mut seen = 0usize;
        for batch in self.loader.epoch() {
            let logits = model.forward(batch.inputs, Mode::Eval)?;
            let (loss, _) = cross_entropy(&logits, &batch.labels)?;
            loss_sum += loss as f64 * batch.labels.len() as f64;
            correct += correct_predictions(&logits, &batch.labels);
            seen += batch.labels.len();
        }
        let point = EvalPoint {
            epoch,
            loss: (loss_sum / seen.max(1) as f64) as f32,
            accuracy: correct as f32 / seen.max(1) as f32,
        };
        self.losses.push(point.loss);
        self.accuracies.push(point.accuracy);
        self.epochs.push(epoch);
        info!(epoch, loss = point.loss, acc = point.accuracy, "evaluation");
        Ok(point)
    }

    pub fn history(&self) -> Vec<EvalPoint> {
        self.epochs
            .iter()
            .zip(&self.losses)
            .zip(&self.accuracies)
            .map(|((&epoch, &loss), &accuracy)| EvalPoint {
                epoch,
                loss,
                accuracy,
            })
            .collect()
    }

    pub fn best_loss(&self) -> Option<f32> {
        self.losses.iter().copied().reduce(f32::min)
    }

    pub fn best_accuracy(&self) -> Option<f32> {
        self.accuracies.iter().copied().reduce(f32::max)
    }
}

/// Drives epochs of minibatch gradient descent.
pub struct SupervisedEngine {
    pub optimizer: Adam,
    pub lr_scheduler: StepLr,
    pub evaluator: SupervisedEvaluator,
}

impl SupervisedEngine {
    pub fn new(optimizer: Adam, lr_scheduler: StepLr, evaluator: SupervisedEvaluator) -> Self {
        Self {
            optimizer,
            lr_scheduler,
            evaluator,
        }
    }

    /// Trains for `epochs` and evaluates after every `eval_every`-th epoch
    /// (1-based). Returns the mean training loss of each epoch.
    pub fn train(
        &mut self,
        model: &mut Model,
        loader: &mut DataLoader,
        epochs: usize,
        eval_every: usize,
    ) -> Result<Vec<f32>> {
        if epochs == 0 {
            return Err(HebbError::config("epochs must be at least 1"));
        }
        if eval_every == 0 {
            return Err(HebbError::config("eval_every must be at least 1"));
        }

        let mut train_losses = Vec::with_capacity(epochs);
        for epoch in 1..=epochs {
            let mut loss_sum = 0.0f64;
            let mut seen = 0usize;
            for (step, batch) in loader.epoch().enumerate() {
                model.zero_grad();
                let logits = model.forward(batch.inputs, Mode::Train)?;
                let (loss, grad) = cross_entropy(&logits, &batch.labels)?;
                model.backward(grad)?;
                self.optimizer.step(model);

                loss_sum += loss as f64 * batch.labels.len() as f64;
                seen += batch.labels.len();
                debug!(epoch, step, loss, "train batch");
            }
            self.lr_scheduler.step(&mut self.optimizer);

            let mean = (loss_sum / seen.max(1) as f64) as f32;
            train_losses.push(mean);
            info!(epoch, train_loss = mean, lr = self.optimizer.lr(), "epoch done");

            if epoch % eval_every == 0 {
                self.evaluator.run(model, epoch)?;
            }
        }
        Ok(train_losses)
    }
}
