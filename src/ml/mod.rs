pub mod ml_model;
pub mod dataset;
pub mod batcher;
pub mod training;
pub mod evaluation;
pub mod inference;

pub use ml_model::{Classifier, ModelConfig, IMAGE_SIZE, load_and_normalize_image_with_size};
pub use dataset::{ImageFolderDataset, ImageItem};
pub use batcher::{AugmentConfig, ImageBatch, ImageBatcher};
pub use training::{train, export_model, run_pipeline, TrainingHistory, TrainingOutcome};
pub use evaluation::{evaluate, ClassificationReport, ConfusionMatrix};
pub use inference::InferenceEngine;
