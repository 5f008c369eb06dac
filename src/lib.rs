//! Hebbian-pretrained networks: unsupervised Krotov–Hopfield pretraining,
//! readout fine-tuning as a representation-quality score, and rendering of
//! which units fire for a given input and what their weights look like.
//!
//! ```no_run
//! use hebbscope::prelude::*;
//!
//! # fn main() -> hebbscope::error::Result<()> {
//! let cfg = AppConfig::default();
//! let mut model = Model::from_spec(&cfg.model)?;
//! let loader = cfg.data.loader(Split::Train)?;
//! let report = HebbianEvaluator::new(loader, cfg.evaluator.clone()).run(&mut model)?;
//! println!("{}", serde_json::to_string(&report)?);
//! # Ok(())
//! # }
//! ```

#[path = "core/error.rs"]
pub mod error;

#[path = "core/prng.rs"]
pub mod prng;

#[path = "core/layers.rs"]
pub mod layers;

#[path = "core/model.rs"]
pub mod model;

#[path = "core/recorder.rs"]
pub mod recorder;

#[path = "core/select.rs"]
pub mod select;

#[path = "core/checkpoint.rs"]
pub mod checkpoint;

#[path = "core/data.rs"]
pub mod data;

#[path = "core/optim.rs"]
pub mod optim;

#[path = "core/engine.rs"]
pub mod engine;

#[path = "core/evaluator.rs"]
pub mod evaluator;

#[path = "core/krotov.rs"]
pub mod krotov;

#[path = "core/visualize.rs"]
pub mod visualize;

#[path = "core/config.rs"]
pub mod config;

pub mod prelude {
    pub use crate::checkpoint::{load_model, load_weights, Checkpoint, LayerMapping};
    pub use crate::config::{AppConfig, DataConfig};
    pub use crate::data::{DataLoader, Dataset, ImageShape, Split};
    pub use crate::error::{HebbError, Result};
    pub use crate::evaluator::{EvalReport, Evaluator, EvaluatorConfig, HebbianEvaluator, TrainableLayers};
    pub use crate::krotov::{HebbianConfig, HebbianEngine, KrotovRule};
    pub use crate::layers::Mode;
    pub use crate::model::{Model, ModelSpec};
    pub use crate::recorder::{ActivationRecord, ActivationRecorder};
    pub use crate::select::{select, ActivationSelection};
    pub use crate::visualize::{Visualizer, VisualizerConfig};
}
