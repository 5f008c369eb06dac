//! Captures one layer's output across forward passes.
//!
//! The recorder never touches the model's computation: it asks the model for
//! a traced forward and keeps the tapped activation. Each recorder owns its
//! own slot, so two recorders (or two models) never share state.

use ndarray::{Array2, ArrayView1, Axis};
use tracing::debug;

use crate::error::{HebbError, Result};
use crate::layers::Mode;
use crate::model::{ForwardTrace, Model};

/// Output of the recorded layer for one batch, `[batch, units]`.
#[derive(Debug, Clone)]
pub struct ActivationRecord {
    pub layer: String,
    /// 1-based count of recorded passes when this record was taken.
    pub pass: u64,
    pub values: Array2<f32>,
}

impl ActivationRecord {
    pub fn batch_len(&self) -> usize {
        self.values.nrows()
    }

    pub fn units(&self) -> usize {
        self.values.ncols()
    }

    pub fn example(&self, index: usize) -> Result<ArrayView1<'_, f32>> {
        if index >= self.batch_len() {
            return Err(HebbError::shape(format!(
                "example {index} out of range for batch of {}",
                self.batch_len()
            )));
        }
        Ok(self.values.index_axis(Axis(0), index))
    }
}

#[derive(Debug, Clone)]
pub struct ActivationRecorder {
    layer: String,
    passes: u64,
    last: Option<ActivationRecord>,
}

impl ActivationRecorder {
    /// Fails if `model` has no layer called `layer`.
    pub fn attach(model: &Model, layer: &str) -> Result<Self> {
        model.require_layer(layer)?;
        Ok(Self {
            layer: layer.to_string(),
            passes: 0,
            last: None,
        })
    }

    pub fn layer(&self) -> &str {
        &self.layer
    }

    pub fn passes(&self) -> u64 {
        self.passes
    }

    /// Runs `model` on `x`, records the tapped output and returns the model
    /// output unchanged.
    pub fn forward(&mut self, model: &mut Model, x: Array2<f32>, mode: Mode) -> Result<Array2<f32>> {
        let trace = model.forward_traced(x, mode, &[self.layer.as_str()])?;
        self.observe(&trace)?;
        Ok(trace.output)
    }

    /// Records from a trace produced elsewhere. Last write wins.
    pub fn observe(&mut self, trace: &ForwardTrace) -> Result<()> {
        let values = trace.tap(&self.layer).ok_or_else(|| {
            HebbError::config(format!("trace has no tap for layer '{}'", self.layer))
        })?;
        self.passes += 1;
        debug!(layer = %self.layer, pass = self.passes, shape = ?values.dim(), "recorded activations");
        self.last = Some(ActivationRecord {
            layer: self.layer.clone(),
            pass: self.passes,
            values: values.clone(),
        });
        Ok(())
    }

    pub fn last(&self) -> Option<&ActivationRecord> {
        self.last.as_ref()
    }

    pub fn take(&mut self) -> Option<ActivationRecord> {
        self.last.take()
    }
}
