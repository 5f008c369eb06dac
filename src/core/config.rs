//! Run configuration. Every section has defaults so a config file only
//! needs to name what it changes.

use std::fs;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use tracing::info;

use crate::data::{Batch, DataLoader, Dataset, ImageShape, Split};
use crate::error::{HebbError, Result};
use crate::evaluator::EvaluatorConfig;
use crate::krotov::HebbianConfig;
use crate::model::ModelSpec;
use crate::visualize::VisualizerConfig;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct DataConfig {
    /// Directory with the IDX files (`train-images-idx3-ubyte`, ...).
    pub dir: PathBuf,
    pub batch_size: usize,
    /// Batch size of the evaluation loader.
    pub eval_batch_size: usize,
    pub shuffle: bool,
    pub seed: u64,
    /// Keep only the first `limit` examples of each split.
    pub limit: Option<usize>,
}

impl Default for DataConfig {
    fn default() -> Self {
        Self {
            dir: PathBuf::from("data/mnist"),
            batch_size: 64,
            eval_batch_size: 256,
            shuffle: true,
            seed: 0,
            limit: None,
        }
    }
}

impl DataConfig {
    pub fn dataset(&self, split: Split) -> Result<Dataset> {
        let ds = Dataset::load_idx(&self.dir, split)?;
        Ok(match self.limit {
            Some(n) => ds.truncate(n),
            None => ds,
        })
    }

    pub fn loader(&self, split: Split) -> Result<DataLoader> {
        let shuffle = self.shuffle && split == Split::Train;
        let batch = match split {
            Split::Train => self.batch_size,
            Split::Test => self.eval_batch_size,
        };
        DataLoader::new(self.dataset(split)?, batch, shuffle, self.seed)
    }

    /// The first batch of `size` examples from `split`, drawn in shuffled
    /// order when `shuffle` is set.
    pub fn sample(&self, split: Split, size: usize) -> Result<(Batch, ImageShape)> {
        let dataset = self.dataset(split)?;
        let shape = dataset.shape;
        let mut loader = DataLoader::new(dataset, size, self.shuffle, self.seed)?;
        let batch = loader
            .epoch()
            .next()
            .ok_or_else(|| HebbError::Dataset(format!("{split:?} split is empty")))?;
        Ok((batch, shape))
    }
}

#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct AppConfig {
    pub model: ModelSpec,
    pub data: DataConfig,
    pub hebbian: HebbianConfig,
    pub evaluator: EvaluatorConfig,
    pub visualizer: VisualizerConfig,
}

impl AppConfig {
    /// Reads a JSON config file.
    pub fn load(path: &Path) -> Result<Self> {
        let text = fs::read_to_string(path)?;
        let cfg: Self = serde_json::from_str(&text)?;
        cfg.validate()?;
        info!(path = %path.display(), "loaded config");
        Ok(cfg)
    }

    pub fn load_or_default(path: Option<&Path>) -> Result<Self> {
        match path {
            Some(p) => Self::load(p),
            None => Ok(Self::default()),
        }
    }

    pub fn validate(&self) -> Result<()> {
        if self.model.layer_sizes.len() < 2 {
            return Err(HebbError::config("model needs an input size and at least one hidden size"));
        }
        if self.data.batch_size == 0 || self.data.eval_batch_size == 0 {
            return Err(HebbError::config("batch sizes must be at least 1"));
        }
        if self.hebbian.layer != self.visualizer.weight_layer {
            tracing::debug!(
                hebbian = %self.hebbian.layer,
                visualized = %self.visualizer.weight_layer,
                "visualizing a layer other than the pretrained one"
            );
        }
        Ok(())
    }

    pub fn to_json(&self) -> Result<String> {
        Ok(serde_json::to_string_pretty(self)?)
    }
}
