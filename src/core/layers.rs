//! Layers with hand-written backward passes.
//!
//! Only the three layer kinds used by the fc networks are provided. Every
//! layer caches what its backward pass needs during a `Mode::Train` forward;
//! gradients are accumulated only into parameters whose `trainable` flag is
//! set.

use ndarray::{Array1, Array2, ArrayD, ArrayView1, ArrayView2, Axis, Ix1, Ix2, IxDyn};

use crate::error::{HebbError, Result};
use crate::prng::Prng;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Mode {
    /// Batch statistics, caches for backward, running-stat updates.
    Train,
    /// Running statistics, no caching.
    Eval,
}

/// A learnable tensor plus its accumulated gradient.
#[derive(Debug, Clone)]
pub struct Parameter {
    pub value: ArrayD<f32>,
    pub grad: Option<ArrayD<f32>>,
    pub trainable: bool,
}

impl Parameter {
    fn new(value: ArrayD<f32>) -> Self {
        Self {
            value,
            grad: None,
            trainable: true,
        }
    }

    fn view2(&self) -> Result<ArrayView2<'_, f32>> {
        Ok(self.value.view().into_dimensionality::<Ix2>()?)
    }

    fn view1(&self) -> Result<ArrayView1<'_, f32>> {
        Ok(self.value.view().into_dimensionality::<Ix1>()?)
    }

    fn accumulate(&mut self, g: ArrayD<f32>) {
        match &mut self.grad {
            Some(acc) => *acc += &g,
            None => self.grad = Some(g),
        }
    }

    pub fn zero_grad(&mut self) {
        self.grad = None;
    }
}

/// Flat, shape-tagged copy of one parameter or buffer. This is the unit of
/// exchange with checkpoints.
#[derive(Debug, Clone, PartialEq)]
pub struct NamedTensor {
    pub name: String,
    pub shape: Vec<usize>,
    pub data: Vec<f32>,
}

impl NamedTensor {
    pub fn from_array(name: &str, a: &ArrayD<f32>) -> Self {
        Self {
            name: name.to_string(),
            shape: a.shape().to_vec(),
            data: a.iter().copied().collect(),
        }
    }

    pub fn to_array(&self) -> Result<ArrayD<f32>> {
        Ok(ArrayD::from_shape_vec(IxDyn(&self.shape), self.data.clone())?)
    }
}

fn check_shape(layer: &str, t: &NamedTensor, expected: &[usize]) -> Result<()> {
    if t.shape != expected {
        return Err(HebbError::shape(format!(
            "{layer}.{}: checkpoint shape {:?} does not match model shape {:?}",
            t.name, t.shape, expected
        )));
    }
    Ok(())
}

// ---------------------------------------------------------------------------

#[derive(Debug, Clone)]
pub struct Linear {
    pub weight: Parameter,
    pub bias: Option<Parameter>,
    cache_input: Option<Array2<f32>>,
}

impl Linear {
    /// Uniform init in ±1/sqrt(in_features) for weight and bias.
    pub fn new(in_features: usize, out_features: usize, bias: bool, rng: &mut Prng) -> Self {
        let bound = 1.0 / (in_features.max(1) as f32).sqrt();
        let w = Array2::from_shape_simple_fn((out_features, in_features), || {
            rng.gen_range_f32(-bound, bound)
        });
        let b = bias.then(|| {
            Parameter::new(
                Array1::from_shape_simple_fn(out_features, || rng.gen_range_f32(-bound, bound))
                    .into_dyn(),
            )
        });
        Self {
            weight: Parameter::new(w.into_dyn()),
            bias: b,
            cache_input: None,
        }
    }

    pub fn in_features(&self) -> usize {
        self.weight.value.shape()[1]
    }

    pub fn out_features(&self) -> usize {
        self.weight.value.shape()[0]
    }

    /// Weight matrix `[out, in]`.
    pub fn weight_matrix(&self) -> Result<ArrayView2<'_, f32>> {
        self.weight.view2()
    }

    pub fn set_weight_matrix(&mut self, w: Array2<f32>) -> Result<()> {
        if w.dim() != (self.out_features(), self.in_features()) {
            return Err(HebbError::shape(format!(
                "weight {:?} does not fit linear {}x{}",
                w.dim(),
                self.out_features(),
                self.in_features()
            )));
        }
        self.weight.value = w.into_dyn();
        Ok(())
    }

    fn forward(&mut self, x: Array2<f32>, mode: Mode) -> Result<Array2<f32>> {
        if x.ncols() != self.in_features() {
            return Err(HebbError::shape(format!(
                "linear expects {} input features, got {}",
                self.in_features(),
                x.ncols()
            )));
        }
        let mut y = x.dot(&self.weight.view2()?.t());
        if let Some(b) = &self.bias {
            y += &b.view1()?;
        }
        self.cache_input = (mode == Mode::Train).then_some(x);
        Ok(y)
    }

    fn backward(&mut self, grad: &Array2<f32>, need_input_grad: bool) -> Result<Option<Array2<f32>>> {
        let x = self.cache_input.as_ref().ok_or_else(|| {
            HebbError::config("linear backward without a training forward pass")
        })?;
        if self.weight.trainable {
            let gw = grad.t().dot(x);
            self.weight.accumulate(gw.into_dyn());
        }
        if let Some(b) = &mut self.bias {
            if b.trainable {
                b.accumulate(grad.sum_axis(Axis(0)).into_dyn());
            }
        }
        if need_input_grad {
            Ok(Some(grad.dot(&self.weight.view2()?)))
        } else {
            Ok(None)
        }
    }

    fn state(&self) -> Vec<NamedTensor> {
        let mut out = vec![NamedTensor::from_array("weight", &self.weight.value)];
        if let Some(b) = &self.bias {
            out.push(NamedTensor::from_array("bias", &b.value));
        }
        out
    }

    fn load(&mut self, layer: &str, t: &NamedTensor) -> Result<()> {
        let slot = match (t.name.as_str(), &mut self.bias) {
            ("weight", _) => &mut self.weight,
            ("bias", Some(b)) => b,
            _ => {
                return Err(HebbError::config(format!(
                    "layer '{layer}' has no tensor named '{}'",
                    t.name
                )))
            }
        };
        check_shape(layer, t, slot.value.shape())?;
        slot.value = t.to_array()?;
        Ok(())
    }
}

// ---------------------------------------------------------------------------

#[derive(Debug, Clone)]
struct BatchNormCache {
    x_hat: Array2<f32>,
    inv_std: Array1<f32>,
}

/// Batch normalization over the feature axis of `[batch, features]` inputs.
#[derive(Debug, Clone)]
pub struct BatchNorm1d {
    pub weight: Parameter,
    pub bias: Parameter,
    pub running_mean: Array1<f32>,
    pub running_var: Array1<f32>,
    pub momentum: f32,
    pub eps: f32,
    cache: Option<BatchNormCache>,
}

impl BatchNorm1d {
    pub fn new(features: usize) -> Self {
        Self {
            weight: Parameter::new(Array1::<f32>::ones(features).into_dyn()),
            bias: Parameter::new(Array1::<f32>::zeros(features).into_dyn()),
            running_mean: Array1::zeros(features),
            running_var: Array1::ones(features),
            momentum: 0.1,
            eps: 1e-5,
            cache: None,
        }
    }

    pub fn features(&self) -> usize {
        self.running_mean.len()
    }

    fn forward(&mut self, x: Array2<f32>, mode: Mode) -> Result<Array2<f32>> {
        if x.ncols() != self.features() {
            return Err(HebbError::shape(format!(
                "batch norm expects {} features, got {}",
                self.features(),
                x.ncols()
            )));
        }
        let gamma = self.weight.view1()?;
        let beta = self.bias.view1()?;

        match mode {
            Mode::Eval => {
                let inv_std = self.running_var.mapv(|v| 1.0 / (v + self.eps).sqrt());
                let x_hat = (&x - &self.running_mean) * &inv_std;
                Ok(x_hat * &gamma + &beta)
            }
            Mode::Train => {
                let n = x.nrows();
                if n < 2 {
                    return Err(HebbError::shape(format!(
                        "batch norm in training mode needs more than one example per batch, got {n}"
                    )));
                }
                let mean = x.sum_axis(Axis(0)) / n as f32;
                let centered = &x - &mean;
                let var = centered.mapv(|v| v * v).sum_axis(Axis(0)) / n as f32;
                let inv_std = var.mapv(|v| 1.0 / (v + self.eps).sqrt());
                let x_hat = &centered * &inv_std;
                let y = &x_hat * &gamma + &beta;

                let m = self.momentum;
                let unbiased = &var * (n as f32 / (n - 1) as f32);
                self.running_mean = &self.running_mean * (1.0 - m) + &mean * m;
                self.running_var = &self.running_var * (1.0 - m) + &unbiased * m;

                self.cache = Some(BatchNormCache { x_hat, inv_std });
                Ok(y)
            }
        }
    }

    fn backward(&mut self, grad: &Array2<f32>, need_input_grad: bool) -> Result<Option<Array2<f32>>> {
        let cache = self.cache.as_ref().ok_or_else(|| {
            HebbError::config("batch norm backward without a training forward pass")
        })?;
        if self.weight.trainable {
            let gg = (grad * &cache.x_hat).sum_axis(Axis(0));
            self.weight.accumulate(gg.into_dyn());
        }
        if self.bias.trainable {
            self.bias.accumulate(grad.sum_axis(Axis(0)).into_dyn());
        }
        if !need_input_grad {
            return Ok(None);
        }
        let n = grad.nrows() as f32;
        let dx_hat = grad * &self.weight.view1()?;
        let sum_dx_hat = dx_hat.sum_axis(Axis(0));
        let sum_dx_hat_xhat = (&dx_hat * &cache.x_hat).sum_axis(Axis(0));
        let dx = (&dx_hat * n - &sum_dx_hat - &cache.x_hat * &sum_dx_hat_xhat) * &cache.inv_std / n;
        Ok(Some(dx))
    }

    fn state(&self) -> Vec<NamedTensor> {
        vec![
            NamedTensor::from_array("weight", &self.weight.value),
            NamedTensor::from_array("bias", &self.bias.value),
            NamedTensor::from_array("running_mean", &self.running_mean.clone().into_dyn()),
            NamedTensor::from_array("running_var", &self.running_var.clone().into_dyn()),
        ]
    }

    fn load(&mut self, layer: &str, t: &NamedTensor) -> Result<()> {
        let expected = [self.features()];
        check_shape(layer, t, &expected)?;
        let arr = t.to_array()?;
        match t.name.as_str() {
            "weight" => self.weight.value = arr,
            "bias" => self.bias.value = arr,
            "running_mean" => self.running_mean = arr.into_dimensionality::<Ix1>()?,
            "running_var" => self.running_var = arr.into_dimensionality::<Ix1>()?,
            other => {
                return Err(HebbError::config(format!(
                    "layer '{layer}' has no tensor named '{other}'"
                )))
            }
        }
        Ok(())
    }
}

// ---------------------------------------------------------------------------

/// Rectified power unit: `max(x, 0)^n`.
#[derive(Debug, Clone)]
pub struct RePU {
    pub n: f32,
    cache_input: Option<Array2<f32>>,
}

impl RePU {
    pub fn new(n: f32) -> Self {
        Self {
            n,
            cache_input: None,
        }
    }

    fn forward(&mut self, x: Array2<f32>, mode: Mode) -> Array2<f32> {
        let n = self.n;
        let y = x.mapv(|v| if v > 0.0 { v.powf(n) } else { 0.0 });
        self.cache_input = (mode == Mode::Train).then_some(x);
        y
    }

    fn backward(&mut self, grad: &Array2<f32>) -> Result<Array2<f32>> {
        let x = self.cache_input.as_ref().ok_or_else(|| {
            HebbError::config("repu backward without a training forward pass")
        })?;
        let n = self.n;
        let d = x.mapv(|v| if v > 0.0 { n * v.powf(n - 1.0) } else { 0.0 });
        Ok(grad * &d)
    }
}

// ---------------------------------------------------------------------------

#[derive(Debug, Clone)]
pub enum Layer {
    Linear(Linear),
    BatchNorm(BatchNorm1d),
    RePU(RePU),
}

impl Layer {
    pub fn kind(&self) -> &'static str {
        match self {
            Layer::Linear(_) => "linear",
            Layer::BatchNorm(_) => "batch_norm",
            Layer::RePU(_) => "repu",
        }
    }

    pub fn forward(&mut self, x: Array2<f32>, mode: Mode) -> Result<Array2<f32>> {
        match self {
            Layer::Linear(l) => l.forward(x, mode),
            Layer::BatchNorm(b) => b.forward(x, mode),
            Layer::RePU(r) => Ok(r.forward(x, mode)),
        }
    }

    /// Accumulates parameter gradients and, if asked, returns the gradient
    /// with respect to the layer input.
    pub fn backward(
        &mut self,
        grad: &Array2<f32>,
        need_input_grad: bool,
    ) -> Result<Option<Array2<f32>>> {
        match self {
            Layer::Linear(l) => l.backward(grad, need_input_grad),
            Layer::BatchNorm(b) => b.backward(grad, need_input_grad),
            Layer::RePU(r) => {
                if need_input_grad {
                    r.backward(grad).map(Some)
                } else {
                    Ok(None)
                }
            }
        }
    }

    pub fn parameters(&self) -> Vec<(&'static str, &Parameter)> {
        match self {
            Layer::Linear(l) => {
                let mut v = vec![("weight", &l.weight)];
                if let Some(b) = &l.bias {
                    v.push(("bias", b));
                }
                v
            }
            Layer::BatchNorm(b) => vec![("weight", &b.weight), ("bias", &b.bias)],
            Layer::RePU(_) => Vec::new(),
        }
    }

    pub fn parameters_mut(&mut self) -> Vec<(&'static str, &mut Parameter)> {
        match self {
            Layer::Linear(l) => {
                let mut v = vec![("weight", &mut l.weight)];
                if let Some(b) = &mut l.bias {
                    v.push(("bias", b));
                }
                v
            }
            Layer::BatchNorm(b) => vec![("weight", &mut b.weight), ("bias", &mut b.bias)],
            Layer::RePU(_) => Vec::new(),
        }
    }

    pub fn has_parameters(&self) -> bool {
        !matches!(self, Layer::RePU(_))
    }

    /// Parameters and buffers, for checkpointing.
    pub fn state(&self) -> Vec<NamedTensor> {
        match self {
            Layer::Linear(l) => l.state(),
            Layer::BatchNorm(b) => b.state(),
            Layer::RePU(_) => Vec::new(),
        }
    }

    pub fn load_tensor(&mut self, layer: &str, t: &NamedTensor) -> Result<()> {
        match self {
            Layer::Linear(l) => l.load(layer, t),
            Layer::BatchNorm(b) => b.load(layer, t),
            Layer::RePU(_) => Err(HebbError::config(format!(
                "layer '{layer}' has no tensors, got '{}'",
                t.name
            ))),
        }
    }
}
