//! Loss, optimizer and learning-rate schedule for supervised fine-tuning.

use hashbrown::HashMap;
use ndarray::{Array2, ArrayD, Axis, Zip};
use serde::{Deserialize, Serialize};

use crate::error::{HebbError, Result};
use crate::model::Model;

/// Mean cross-entropy of `logits` (`[batch, classes]`) against `labels`,
/// and its gradient with respect to the logits.
pub fn cross_entropy(logits: &Array2<f32>, labels: &[usize]) -> Result<(f32, Array2<f32>)> {
    let (batch, classes) = logits.dim();
    if batch != labels.len() {
        return Err(HebbError::shape(format!(
            "{batch} logits rows but {} labels",
            labels.len()
        )));
    }
    if batch == 0 {
        return Err(HebbError::shape("cross entropy on an empty batch"));
    }
    if let Some(&bad) = labels.iter().find(|&&l| l >= classes) {
        return Err(HebbError::shape(format!("label {bad} out of range for {classes} classes")));
    }

    let mut grad = Array2::<f32>::zeros((batch, classes));
    let mut total = 0.0f32;
    for ((row, mut g), &label) in logits
        .axis_iter(Axis(0))
        .zip(grad.axis_iter_mut(Axis(0)))
        .zip(labels)
    {
        let max = row.fold(f32::NEG_INFINITY, |m, &v| m.max(v));
        let sum_exp: f32 = row.iter().map(|&v| (v - max).exp()).sum();
        let log_z = max + sum_exp.ln();
        total += log_z - row[label];
        Zip::from(&mut g).and(&row).for_each(|g, &v| *g = (v - log_z).exp());
        g[label] -= 1.0;
    }
    grad /= batch as f32;
    Ok((total / batch as f32, grad))
}

/// Number of rows whose argmax equals the label.
pub fn correct_predictions(logits: &Array2<f32>, labels: &[usize]) -> usize {
    logits
        .axis_iter(Axis(0))
        .zip(labels)
        .filter(|(row, &label)| {
            let mut best = 0;
            for (i, &v) in row.iter().enumerate() {
                if v > row[best] {
                    best = i;
                }
            }
            best == label
        })
        .count()
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct AdamConfig {
    pub lr: f32,
    pub beta1: f32,
    pub beta2: f32,
    pub eps: f32,
}

impl Default for AdamConfig {
    fn default() -> Self {
        Self {
            lr: 1e-3,
            beta1: 0.9,
            beta2: 0.999,
            eps: 1e-8,
        }
    }
}

#[derive(Debug, Clone)]
struct Moments {
    m: ArrayD<f32>,
    v: ArrayD<f32>,
    step: i32,
}

/// Adam with bias correction. Parameters whose trainable flag is off (or
/// that have no gradient) are left alone.
#[derive(Debug, Clone)]
pub struct Adam {
    cfg: AdamConfig,
    lr: f32,
    state: HashMap<String, Moments>,
}

impl Adam {
    pub fn new(cfg: AdamConfig) -> Self {
        Self {
            cfg,
            lr: cfg.lr,
            state: HashMap::new(),
        }
    }

    pub fn lr(&self) -> f32 {
        self.lr
    }

    pub fn set_lr(&mut self, lr: f32) {
        self.lr = lr;
    }

    pub fn base_lr(&self) -> f32 {
        self.cfg.lr
    }

    pub fn step(&mut self, model: &mut Model) {
        let AdamConfig {
            beta1, beta2, eps, ..
        } = self.cfg;
        let lr = self.lr;
        for (layer, pname, p) in model.named_parameters_mut() {
            if !p.trainable {
                continue;
            }
            let Some(grad) = p.grad.as_ref() else {
                continue;
            };
            let st = self
                .state
                .entry(format!("{layer}.{pname}"))
                .or_insert_with(|| Moments {
                    m: ArrayD::zeros(grad.raw_dim()),
                    v: ArrayD::zeros(grad.raw_dim()),
                    step: 0,
                });
            st.step += 1;
            let bc1 = 1.0 - beta1.powi(st.step);
            let bc2 = 1.0 - beta2.powi(st.step);

            Zip::from(&mut p.value)
                .and(&mut st.m)
                .and(&mut st.v)
                .and(grad)
                .for_each(|w, m, v, &g| {
                    *m = beta1 * *m + (1.0 - beta1) * g;
                    *v = beta2 * *v + (1.0 - beta2) * g * g;
                    let m_hat = *m / bc1;
                    let v_hat = *v / bc2;
                    *w -= lr * m_hat / (v_hat.sqrt() + eps);
                });
        }
    }
}

/// Multiplies the learning rate by `gamma` every `step_size` epochs.
#[derive(Debug, Clone, Copy)]
pub struct StepLr {
    pub step_size: usize,
    pub gamma: f32,
    epoch: usize,
}

impl StepLr {
    pub fn new(step_size: usize, gamma: f32) -> Result<Self> {
        if step_size == 0 {
            return Err(HebbError::config("lr step_size must be at least 1"));
        }
        Ok(Self {
            step_size,
            gamma,
            epoch: 0,
        })
    }

    pub fn lr_at(&self, base: f32, epoch: usize) -> f32 {
        base * self.gamma.powi((epoch / self.step_size) as i32)
    }

    /// Call once per finished epoch.
    pub fn step(&mut self, opt: &mut Adam) {
        self.epoch += 1;
        opt.set_lr(self.lr_at(opt.base_lr(), self.epoch));
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::layers::{Layer, Linear, Mode};
    use crate::prng::Prng;
    use ndarray::array;

    #[test]
    fn uniform_logits_give_log_classes() {
        let (loss, grad) = cross_entropy(&Array2::zeros((2, 4)), &[0, 3]).unwrap();
        assert!((loss - 4f32.ln()).abs() < 1e-6);
        assert!((grad[[0, 0]] - (0.25 - 1.0) / 2.0).abs() < 1e-6);
        assert!((grad[[0, 1]] - 0.125).abs() < 1e-6);
    }

    #[test]
    fn cross_entropy_grad_matches_finite_difference() {
        let logits = array![[0.2, -1.0, 0.7], [1.5, 0.1, -0.3]];
        let labels = [2, 0];
        let (_, grad) = cross_entropy(&logits, &labels).unwrap();
        let h = 1e-3;
        for i in 0..2 {
            for j in 0..3 {
                let mut p = logits.clone();
                p[[i, j]] += h;
                let mut m = logits.clone();
                m[[i, j]] -= h;
                let num = (cross_entropy(&p, &labels).unwrap().0 - cross_entropy(&m, &labels).unwrap().0)
                    / (2.0 * h);
                assert!((num - grad[[i, j]]).abs() < 1e-3, "({i},{j})");
            }
        }
    }

    #[test]
    fn label_out_of_range_is_rejected() {
        assert!(cross_entropy(&Array2::zeros((1, 3)), &[3]).is_err());
    }

    #[test]
    fn counts_argmax_hits() {
        let logits = array![[0.1, 0.9], [0.8, 0.2], [0.3, 0.7]];
        assert_eq!(correct_predictions(&logits, &[1, 1, 1]), 2);
    }

    #[test]
    fn adam_skips_frozen_parameters() {
        let mut rng = Prng::new(4);
        let mut model = Model::from_layers(vec![
            ("a".into(), Layer::Linear(Linear::new(3, 3, true, &mut rng))),
            ("b".into(), Layer::Linear(Linear::new(3, 2, true, &mut rng))),
        ])
        .unwrap();
        model.set_trainable(&["b".to_string()]).unwrap();
        let before_a = model.layer_state("a").unwrap();
        let before_b = model.layer_state("b").unwrap();

        let out = model.forward(Array2::ones((2, 3)), Mode::Train).unwrap();
        let (_, grad) = cross_entropy(&out, &[0, 1]).unwrap();
        model.backward(grad).unwrap();
        Adam::new(AdamConfig::default()).step(&mut model);

        assert_eq!(model.layer_state("a").unwrap(), before_a);
        assert_ne!(model.layer_state("b").unwrap(), before_b);
    }

    #[test]
    fn adam_first_step_moves_by_lr() {
        // With bias correction the first update is lr * sign(g).
        let mut rng = Prng::new(8);
        let mut model =
            Model::from_layers(vec![("l".into(), Layer::Linear(Linear::new(1, 1, false, &mut rng)))])
                .unwrap();
        let w0 = model.linear("l").unwrap().weight_matrix().unwrap()[[0, 0]];
        let out = model.forward(array![[1.0]], Mode::Train).unwrap();
        model.backward(Array2::from_elem(out.dim(), 2.0)).unwrap();
        Adam::new(AdamConfig { lr: 0.01, ..AdamConfig::default() }).step(&mut model);
        let w1 = model.linear("l").unwrap().weight_matrix().unwrap()[[0, 0]];
        assert!((w0 - w1 - 0.01).abs() < 1e-5);
    }

    #[test]
    fn step_lr_decays_every_step_size_epochs() {
        let mut opt = Adam::new(AdamConfig::default());
        let mut sched = StepLr::new(100, 0.1).unwrap();
        for _ in 0..99 {
            sched.step(&mut opt);
        }
        assert!((opt.lr() - 1e-3).abs() < 1e-9);
        sched.step(&mut opt);
        assert!((opt.lr() - 1e-4).abs() < 1e-9);
        assert!(StepLr::new(0, 0.1).is_err());
    }
}
