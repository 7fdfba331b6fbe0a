//! # Sample Preparation Pipeline
//!
//! Turns concept directories of (image, optional mask, prompt) files into
//! cached, aspect-bucketed, batch-ready latent records for training an
//! inpainting or depth-conditioned image model.
//!
//! ## Core Features
//!
//! - **Stage Pipeline**: per-sample stages with declared input/output fields,
//!   validated when the pipeline is built
//! - **Mask-Guided Augmentation**: one random rotation and crop shared by
//!   every co-registered raster
//! - **Aspect Bucketing**: stride-aligned buckets around a pixel budget, with
//!   a shared scale and center crop per sample
//! - **Disk Cache**: atomic, fingerprinted entries so later epochs skip the
//!   expensive stages
//! - **Batch Iteration**: same-resolution batches streamed by a background
//!   loader with bounded prefetch
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use sample_pipeline::{Concept, DatasetConfig, TrainDataset, collaborators::reference_context};
//!
//! let config = DatasetConfig {
//!     batch_size: 4,
//!     concepts: vec![Concept::new("cat", "data/cat")],
//!     ..DatasetConfig::default()
//! };
//! let dataset = TrainDataset::new(config, reference_context(4, 8, 77, 49408))?;
//!
//! for epoch in 0..2 {
//!     let batches = dataset.epoch(epoch)?;
//!     println!("{} samples skipped", batches.report().skipped.len());
//!     for batch in batches {
//!         let batch = batch?;
//!         let latents = batch.stack(sample_pipeline::Field::LatentImage)?;
//!         println!("{} -> {:?}", batch.crop_resolution, latents.shape);
//!     }
//! }
//! # Ok::<(), Box<dyn std::error::Error>>(())
//! ```

pub mod batching;
pub mod cache;
pub mod collaborators;
pub mod config;
pub mod dataset;
pub mod error;
pub mod hash;
pub mod pipeline;
pub mod record;
pub mod stages;
pub mod traits;
pub mod types;

pub use batching::{AspectBatchSorting, Batch, BatchPlanEntry, Tensor};
pub use cache::DiskCache;
pub use config::{DatasetConfig, ModelVariant, RemainderPolicy, SamplingMode};
pub use dataset::{EpochIter, EpochReport, SkipReport, TrainDataset};
pub use error::{PipelineError, Result};
pub use pipeline::{Pipeline, Prepared, builder::PipelineBuilder};
pub use record::{Field, Record, Value};
pub use sample_kit_common::{CropBox, Resolution, ValueRange};
pub use traits::*;
pub use types::{Concept, Device, LatentDistribution, Raster};
