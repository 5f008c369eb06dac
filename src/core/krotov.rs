//! Unsupervised competitive Hebbian learning (Krotov & Hopfield, 2019).
//!
//! Each example drives the hidden units through `sign(W)|W|^(p-1)`. The
//! strongest unit is pulled toward the input (Hebbian), the k-th strongest
//! is pushed away (anti-Hebbian), and a decay term keeps each row's p-norm
//! bounded.

use ndarray::{Array1, Array2, ArrayView2, Axis};
use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use crate::data::DataLoader;
use crate::error::{HebbError, Result};
use crate::model::Model;
use crate::prng::Prng;

const PRECISION: f32 = 1e-30;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct HebbianConfig {
    /// Lebesgue norm exponent.
    pub p: f32,
    /// Rank of the unit that receives the anti-Hebbian push.
    pub k: usize,
    /// Strength of the anti-Hebbian push.
    pub delta: f32,
    /// Initial learning rate, decayed linearly to zero over `epochs`.
    pub lr: f32,
    pub epochs: usize,
    /// Layer the rule trains.
    pub layer: String,
    pub init_seed: u64,
}

impl Default for HebbianConfig {
    fn default() -> Self {
        Self {
            p: 3.0,
            k: 2,
            delta: 0.4,
            lr: 0.04,
            epochs: 100,
            layer: "linear1".to_string(),
            init_seed: 0,
        }
    }
}

impl HebbianConfig {
    pub fn with_epochs(mut self, epochs: usize) -> Self {
        self.epochs = epochs;
        self
    }

    pub fn with_lr(mut self, lr: f32) -> Self {
        self.lr = lr;
        self
    }
}

/// The learning rule itself, independent of any model.
#[derive(Debug, Clone, Copy)]
pub struct KrotovRule {
    pub p: f32,
    pub k: usize,
    pub delta: f32,
}

impl KrotovRule {
    pub fn new(cfg: &HebbianConfig) -> Result<Self> {
        if cfg.k < 2 {
            return Err(HebbError::config("krotov rank k must be at least 2"));
        }
        if cfg.p < 1.0 {
            return Err(HebbError::config("krotov norm p must be at least 1"));
        }
        Ok(Self {
            p: cfg.p,
            k: cfg.k,
            delta: cfg.delta,
        })
    }

    /// Normalized weight change for `weights` (`[units, in]`) given a batch
    /// `inputs` (`[batch, in]`). The largest absolute entry is 1.
    pub fn delta_weights(&self, inputs: ArrayView2<'_, f32>, weights: ArrayView2<'_, f32>) -> Result<Array2<f32>> {
        let (units, fan_in) = weights.dim();
        if inputs.ncols() != fan_in {
            return Err(HebbError::shape(format!(
                "inputs have {} features, weights expect {fan_in}",
                inputs.ncols()
            )));
        }
        if units < self.k {
            return Err(HebbError::config(format!(
                "layer has {units} units, rank k={} needs at least that many",
                self.k
            )));
        }

        let pm1 = self.p - 1.0;
        let shaped = weights.mapv(|w| w.signum() * w.abs().powf(pm1));
        // [units, batch]
        let currents = shaped.dot(&inputs.t());

        let mut g = Array2::<f32>::zeros(currents.raw_dim());
        for (b, column) in currents.axis_iter(Axis(1)).enumerate() {
            let mut order: Vec<usize> = (0..units).collect();
            order.sort_by(|&i, &j| column[j].total_cmp(&column[i]));
            g[[order[0], b]] = 1.0;
            g[[order[self.k - 1], b]] = -self.delta;
        }

        // Per-unit sum over the batch of g * current.
        let xx: Array1<f32> = (&g * &currents).sum_axis(Axis(1));
        let ds = g.dot(&inputs) - &(&weights * &xx.insert_axis(Axis(1)));

        let nc = ds.fold(0.0f32, |m, &v| m.max(v.abs())).max(PRECISION);
        Ok(ds / nc)
    }
}

/// Unsupervised training loop for one linear layer.
pub struct HebbianEngine {
    cfg: HebbianConfig,
    rule: KrotovRule,
}

impl HebbianEngine {
    pub fn new(cfg: HebbianConfig) -> Result<Self> {
        let rule = KrotovRule::new(&cfg)?;
        Ok(Self { cfg, rule })
    }

    /// Replaces the layer's weights with standard-normal samples.
    pub fn init_weights(&self, model: &mut Model) -> Result<()> {
        let linear = model.linear_mut(&self.cfg.layer)?;
        let mut rng = Prng::new(self.cfg.init_seed);
        let w = Array2::from_shape_simple_fn((linear.out_features(), linear.in_features()), || {
            rng.next_normal()
        });
        linear.set_weight_matrix(w)
    }

    /// Trains the configured layer. Returns mean |ΔW| per epoch.
    pub fn train(&self, model: &mut Model, loader: &mut DataLoader) -> Result<Vec<f32>> {
        if self.cfg.epochs == 0 {
            return Err(HebbError::config("epochs must be at least 1"));
        }
        let epochs = self.cfg.epochs;
        let mut history = Vec::with_capacity(epochs);
        for epoch in 0..epochs {
            let lr = self.cfg.lr * (1.0 - epoch as f32 / epochs as f32);
            let mut change = 0.0f64;
            let mut steps = 0usize;
            for batch in loader.epoch() {
                let linear = model.linear_mut(&self.cfg.layer)?;
                let dw = self.rule.delta_weights(batch.inputs.view(), linear.weight_matrix()?)?;
                let updated = &linear.weight_matrix()? + &(dw * lr);
                change += updated
                    .iter()
                    .zip(linear.weight_matrix()?.iter())
                    .map(|(a, b)| (a - b).abs() as f64)
                    .sum::<f64>()
                    / updated.len() as f64;
                linear.set_weight_matrix(updated)?;
                steps += 1;
            }
            let mean_change = (change / steps.max(1) as f64) as f32;
            history.push(mean_change);
            if (epoch + 1) % 10 == 0 || epoch + 1 == epochs {
                info!(epoch = epoch + 1, lr, mean_change, "hebbian epoch");
            } else {
                debug!(epoch = epoch + 1, lr, mean_change, "hebbian epoch");
            }
        }
        Ok(history)
    }
}
