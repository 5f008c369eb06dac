//! Hebbian evaluator: measures representation quality of a pretrained
//! network by fine-tuning only its readout with supervised gradient descent.

use serde::{Deserialize, Serialize};
use tracing::info;

use crate::data::DataLoader;
use crate::engine::{EvalPoint, SupervisedEngine, SupervisedEvaluator};
use crate::error::{HebbError, Result};
use crate::model::Model;
use crate::optim::{Adam, AdamConfig, StepLr};

/// Best values seen over a run. Serializes to exactly `{"loss", "acc"}`.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct EvalReport {
    pub loss: f32,
    pub acc: f32,
}

impl EvalReport {
    /// Minimum loss and maximum accuracy of the recorded sequences.
    pub fn from_history(losses: &[f32], accuracies: &[f32]) -> Result<Self> {
        let loss = losses.iter().copied().reduce(f32::min);
        let acc = accuracies.iter().copied().reduce(f32::max);
        match (loss, acc) {
            (Some(loss), Some(acc)) => Ok(Self { loss, acc }),
            _ => Err(HebbError::config("no evaluation was recorded")),
        }
    }
}

/// Anything that scores a model.
pub trait Evaluator {
    fn run(&mut self, model: &mut Model) -> Result<EvalReport>;
}

/// Which layers keep their parameters trainable during fine-tuning.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TrainableLayers {
    /// The last layer that owns parameters.
    #[default]
    Last,
    Named(Vec<String>),
}

impl TrainableLayers {
    /// Resolves to concrete layer names. Needs at least two parameterized
    /// layers so that something stays frozen.
    pub fn resolve(&self, model: &Model) -> Result<Vec<String>> {
        let params = model.parameterized_layers();
        if params.len() < 2 {
            return Err(HebbError::config(format!(
                "model needs at least two parameterized layers to freeze features, has {}",
                params.len()
            )));
        }
        match self {
            TrainableLayers::Last => Ok(vec![params[params.len() - 1].to_string()]),
            TrainableLayers::Named(names) => {
                if names.is_empty() {
                    return Err(HebbError::config("trainable layer list is empty"));
                }
                for n in names {
                    if !params.contains(&n.as_str()) {
                        return Err(HebbError::config(format!(
                            "'{n}' is not a parameterized layer of the model"
                        )));
                    }
                }
                Ok(names.clone())
            }
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct EvaluatorConfig {
    pub epochs: usize,
    pub eval_every: usize,
    pub adam: AdamConfig,
    pub lr_step_size: usize,
    pub lr_gamma: f32,
    pub trainable: TrainableLayers,
}

impl Default for EvaluatorConfig {
    fn default() -> Self {
        Self {
            epochs: 100,
            eval_every: 10,
            adam: AdamConfig::default(),
            lr_step_size: 100,
            lr_gamma: 0.1,
            trainable: TrainableLayers::Last,
        }
    }
}

impl EvaluatorConfig {
    pub fn with_epochs(mut self, epochs: usize) -> Self {
        self.epochs = epochs;
        self
    }

    pub fn with_eval_every(mut self, eval_every: usize) -> Self {
        self.eval_every = eval_every;
        self
    }

    pub fn with_trainable(mut self, trainable: TrainableLayers) -> Self {
        self.trainable = trainable;
        self
    }

    pub fn with_lr(mut self, lr: f32) -> Self {
        self.adam.lr = lr;
        self
    }

    fn validate(&self) -> Result<()> {
        if self.epochs == 0 || self.eval_every == 0 {
            return Err(HebbError::config("epochs and eval_every must be at least 1"));
        }
        if self.eval_every > self.epochs {
            return Err(HebbError::config(format!(
                "eval_every ({}) exceeds epochs ({}), nothing would be evaluated",
                self.eval_every, self.epochs
            )));
        }
        Ok(())
    }
}

pub struct HebbianEvaluator {
    cfg: EvaluatorConfig,
    train_loader: DataLoader,
    eval_loader: DataLoader,
    history: Vec<EvalPoint>,
}

impl HebbianEvaluator {
    /// Trains and evaluates on the same loader.
    pub fn new(loader: DataLoader, cfg: EvaluatorConfig) -> Self {
        Self {
            cfg,
            eval_loader: loader.clone(),
            train_loader: loader,
            history: Vec::new(),
        }
    }

    pub fn with_eval_loader(mut self, loader: DataLoader) -> Self {
        self.eval_loader = loader;
        self
    }

    pub fn config(&self) -> &EvaluatorConfig {
        &self.cfg
    }

    /// Evaluation points of the last run.
    pub fn history(&self) -> &[EvalPoint] {
        &self.history
    }
}

impl Evaluator for HebbianEvaluator {
    fn run(&mut self, model: &mut Model) -> Result<EvalReport> {
        self.cfg.validate()?;

        // Setup
        let optimizer = Adam::new(self.cfg.adam);
        let lr_scheduler = StepLr::new(self.cfg.lr_step_size, self.cfg.lr_gamma)?;
        let evaluator = SupervisedEvaluator::new(self.eval_loader.clone());
        let mut engine = SupervisedEngine::new(optimizer, lr_scheduler, evaluator);

        // Freeze
        let trainable = self.cfg.trainable.resolve(model)?;
        model.set_trainable(&trainable)?;
        info!(?trainable, epochs = self.cfg.epochs, "fine-tuning readout");

        // Train / eval
        engine.train(
            model,
            &mut self.train_loader,
            self.cfg.epochs,
            self.cfg.eval_every,
        )?;

        // Report
        self.history = engine.evaluator.history();
        let report = EvalReport::from_history(&engine.evaluator.losses, &engine.evaluator.accuracies)?;
        info!(loss = report.loss, acc = report.acc, evaluations = self.history.len(), "hebbian evaluation done");
        Ok(report)
    }
}
