use hashbrown::HashMap;
use ndarray::Array2;
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::error::{HebbError, Result};
use crate::layers::{BatchNorm1d, Layer, Linear, Mode, NamedTensor, Parameter, RePU};
use crate::prng::Prng;

/// Architecture descriptor for the fully connected Hebbian networks.
///
/// `layer_sizes = [784, 2000]` with `classes = 10` builds
/// `linear1 -> batch_norm -> repu -> linear2`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ModelSpec {
    /// Input width followed by each hidden width.
    pub layer_sizes: Vec<usize>,
    /// RePU exponent.
    pub n: f32,
    pub batch_norm: bool,
    pub classes: usize,
    /// Hidden linear layers carry a bias. Hebbian-trained layers do not.
    pub hidden_bias: bool,
    pub seed: u64,
}

impl Default for ModelSpec {
    fn default() -> Self {
        Self {
            layer_sizes: vec![28 * 28, 2000],
            n: 1.5,
            batch_norm: true,
            classes: 10,
            hidden_bias: false,
            seed: 0,
        }
    }
}

impl ModelSpec {
    pub fn fc1(layer_sizes: &[usize], n: f32, batch_norm: bool) -> Self {
        Self {
            layer_sizes: layer_sizes.to_vec(),
            n,
            batch_norm,
            ..Self::default()
        }
    }

    pub fn with_classes(mut self, classes: usize) -> Self {
        self.classes = classes;
        self
    }

    pub fn with_seed(mut self, seed: u64) -> Self {
        self.seed = seed;
        self
    }
}

/// Output of a forward pass plus any intermediate activations that were
/// asked for by layer name.
#[derive(Debug, Clone)]
pub struct ForwardTrace {
    pub output: Array2<f32>,
    pub taps: HashMap<String, Array2<f32>>,
}

impl ForwardTrace {
    pub fn tap(&self, layer: &str) -> Option<&Array2<f32>> {
        self.taps.get(layer)
    }
}

#[derive(Debug, Clone)]
pub struct NamedLayer {
    pub name: String,
    pub layer: Layer,
}

/// An ordered stack of named layers.
#[derive(Debug, Clone)]
pub struct Model {
    spec: Option<ModelSpec>,
    layers: Vec<NamedLayer>,
}

impl Model {
    /// Builds the fc network described by `spec`.
    pub fn from_spec(spec: &ModelSpec) -> Result<Self> {
        if spec.layer_sizes.len() < 2 {
            return Err(HebbError::config(
                "layer_sizes needs an input width and at least one hidden width",
            ));
        }
        if spec.layer_sizes.iter().any(|&s| s == 0) || spec.classes == 0 {
            return Err(HebbError::config("layer widths must be non-zero"));
        }

        let mut rng = Prng::new(spec.seed);
        let mut layers = Vec::new();
        let blocks = spec.layer_sizes.len() - 1;
        for k in 1..=blocks {
            let (fan_in, fan_out) = (spec.layer_sizes[k - 1], spec.layer_sizes[k]);
            let suffix = if k == 1 { String::new() } else { k.to_string() };
            layers.push(NamedLayer {
                name: format!("linear{k}"),
                layer: Layer::Linear(Linear::new(fan_in, fan_out, spec.hidden_bias, &mut rng)),
            });
            if spec.batch_norm {
                layers.push(NamedLayer {
                    name: format!("batch_norm{suffix}"),
                    layer: Layer::BatchNorm(BatchNorm1d::new(fan_out)),
                });
            }
            layers.push(NamedLayer {
                name: format!("repu{suffix}"),
                layer: Layer::RePU(RePU::new(spec.n)),
            });
        }
        let last_hidden = spec.layer_sizes[blocks];
        layers.push(NamedLayer {
            name: format!("linear{}", blocks + 1),
            layer: Layer::Linear(Linear::new(last_hidden, spec.classes, true, &mut rng)),
        });

        debug!(
            layers = ?layers.iter().map(|l| l.name.as_str()).collect::<Vec<_>>(),
            "built model"
        );
        Ok(Self {
            spec: Some(spec.clone()),
            layers,
        })
    }

    /// Builds a model from explicit layers. Names must be unique.
    pub fn from_layers(layers: Vec<(String, Layer)>) -> Result<Self> {
        {
            let mut seen = hashbrown::HashSet::new();
            for (name, _) in &layers {
                if !seen.insert(name.as_str()) {
                    return Err(HebbError::config(format!("duplicate layer name '{name}'")));
                }
            }
        }
        Ok(Self {
            spec: None,
            layers: layers
                .into_iter()
                .map(|(name, layer)| NamedLayer { name, layer })
                .collect(),
        })
    }

    pub fn spec(&self) -> Option<&ModelSpec> {
        self.spec.as_ref()
    }

    pub fn layers(&self) -> &[NamedLayer] {
        &self.layers
    }

    pub fn layer_names(&self) -> impl Iterator<Item = &str> {
        self.layers.iter().map(|l| l.name.as_str())
    }

    pub fn layer(&self, name: &str) -> Option<&Layer> {
        self.layers.iter().find(|l| l.name == name).map(|l| &l.layer)
    }

    pub fn layer_mut(&mut self, name: &str) -> Option<&mut Layer> {
        self.layers
            .iter_mut()
            .find(|l| l.name == name)
            .map(|l| &mut l.layer)
    }

    pub fn require_layer(&self, name: &str) -> Result<&Layer> {
        self.layer(name)
            .ok_or_else(|| HebbError::config(format!("model has no layer named '{name}'")))
    }

    pub fn linear(&self, name: &str) -> Result<&Linear> {
        match self.require_layer(name)? {
            Layer::Linear(l) => Ok(l),
            other => Err(HebbError::config(format!(
                "layer '{name}' is {}, not linear",
                other.kind()
            ))),
        }
    }

    pub fn linear_mut(&mut self, name: &str) -> Result<&mut Linear> {
        match self.layer_mut(name) {
            Some(Layer::Linear(l)) => Ok(l),
            Some(other) => Err(HebbError::config(format!(
                "layer '{name}' is {}, not linear",
                other.kind()
            ))),
            None => Err(HebbError::config(format!("model has no layer named '{name}'"))),
        }
    }

    /// Layers that own parameters, in order.
    pub fn parameterized_layers(&self) -> Vec<&str> {
        self.layers
            .iter()
            .filter(|l| l.layer.has_parameters())
            .map(|l| l.name.as_str())
            .collect()
    }

    pub fn forward(&mut self, x: Array2<f32>, mode: Mode) -> Result<Array2<f32>> {
        let mut h = x;
        for l in &mut self.layers {
            h = l.layer.forward(h, mode)?;
        }
        Ok(h)
    }

    /// Forward pass that also returns copies of the named layers' outputs.
    pub fn forward_traced(&mut self, x: Array2<f32>, mode: Mode, taps: &[&str]) -> Result<ForwardTrace> {
        for name in taps {
            self.require_layer(name)?;
        }
        let mut captured = HashMap::new();
        let mut h = x;
        for l in &mut self.layers {
            h = l.layer.forward(h, mode)?;
            if taps.contains(&l.name.as_str()) {
                captured.insert(l.name.clone(), h.clone());
            }
        }
        Ok(ForwardTrace {
            output: h,
            taps: captured,
        })
    }

    /// Back-propagates `grad` (w.r.t. the model output) and accumulates
    /// gradients into trainable parameters. Stops at the earliest layer that
    /// still has something trainable.
    pub fn backward(&mut self, grad: Array2<f32>) -> Result<()> {
        let earliest = self
            .layers
            .iter()
            .position(|l| l.layer.parameters().iter().any(|(_, p)| p.trainable));
        let Some(earliest) = earliest else {
            return Ok(());
        };

        let mut g = grad;
        for idx in (earliest..self.layers.len()).rev() {
            let need_input_grad = idx > earliest;
            match self.layers[idx].layer.backward(&g, need_input_grad)? {
                Some(next) => g = next,
                None => break,
            }
        }
        Ok(())
    }

    pub fn zero_grad(&mut self) {
        for l in &mut self.layers {
            for (_, p) in l.layer.parameters_mut() {
                p.zero_grad();
            }
        }
    }

    /// `(layer, param, parameter)` in layer order.
    pub fn named_parameters(&self) -> Vec<(&str, &'static str, &Parameter)> {
        self.layers
            .iter()
            .flat_map(|l| {
                l.layer
                    .parameters()
                    .into_iter()
                    .map(move |(pname, p)| (l.name.as_str(), pname, p))
            })
            .collect()
    }

    pub fn named_parameters_mut(&mut self) -> Vec<(&str, &'static str, &mut Parameter)> {
        self.layers
            .iter_mut()
            .flat_map(|l| {
                let NamedLayer { name, layer } = l;
                let name = name.as_str();
                layer
                    .parameters_mut()
                    .into_iter()
                    .map(move |(pname, p)| (name, pname, p))
            })
            .collect()
    }

    /// Sets every parameter's trainable flag: on for layers in `trainable`,
    /// off for all others.
    pub fn set_trainable(&mut self, trainable: &[String]) -> Result<()> {
        for name in trainable {
            if !self.require_layer(name)?.has_parameters() {
                return Err(HebbError::config(format!(
                    "layer '{name}' has no parameters to train"
                )));
            }
        }
        for l in &mut self.layers {
            let on = trainable.iter().any(|t| *t == l.name);
            for (_, p) in l.layer.parameters_mut() {
                p.trainable = on;
                if !on {
                    p.zero_grad();
                }
            }
        }
        Ok(())
    }

    /// Names of layers with at least one trainable parameter.
    pub fn trainable_layers(&self) -> Vec<&str> {
        self.layers
            .iter()
            .filter(|l| l.layer.parameters().iter().any(|(_, p)| p.trainable))
            .map(|l| l.name.as_str())
            .collect()
    }

    pub fn layer_state(&self, name: &str) -> Result<Vec<NamedTensor>> {
        Ok(self.require_layer(name)?.state())
    }

    pub fn load_layer_tensor(&mut self, name: &str, t: &NamedTensor) -> Result<()> {
        let layer = self
            .layer_mut(name)
            .ok_or_else(|| HebbError::config(format!("model has no layer named '{name}'")))?;
        layer.load_tensor(name, t)
    }
}
