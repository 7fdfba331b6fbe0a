use std::sync::Arc;

use rand::rngs::StdRng;

use crate::{
    error::{PipelineError, Result},
    record::{Field, Record},
    types::{Device, LatentDistribution, Raster},
};

/// A unit of per-sample work over a [`Record`]
pub trait Stage: Send + Sync {
    /// Stage name used in errors and logs
    fn name(&self) -> &'static str;

    /// Fields that must be present before the stage runs
    fn requires(&self) -> Vec<Field>;

    /// Fields guaranteed present after the stage runs
    fn produces(&self) -> Vec<Field>;

    /// Read and mutate the record in place
    fn apply(&self, record: &mut Record, ctx: &mut SampleContext<'_>) -> Result<()>;
}

/// Image encoder collaborator (e.g. a VAE)
pub trait LatentEncoder: Send + Sync {
    /// Stable identity; part of the cache fingerprint
    fn identity(&self) -> String;

    /// Spatial reduction between raster and latent
    fn downsample_factor(&self) -> u32;

    fn latent_channels(&self) -> u32;

    /// Encode a raster in [-1, 1] into a latent distribution
    fn encode(&self, raster: &Raster, device: &Device) -> Result<LatentDistribution>;

    /// Decode a latent back into a raster in [-1, 1]
    fn decode(&self, latent: &Raster, device: &Device) -> Result<Raster>;
}

/// Depth estimator collaborator
pub trait DepthEstimator: Send + Sync {
    fn identity(&self) -> String;

    /// Estimate a single-channel depth map the size of `image`
    fn estimate(&self, image: &Raster, device: &Device) -> Result<Raster>;
}

/// Text tokenizer collaborator
pub trait Tokenizer: Send + Sync {
    fn identity(&self) -> String;

    fn tokenize(&self, text: &str) -> Result<Vec<u32>>;
}

/// Device handle and collaborators shared by every stage of a pipeline
#[derive(Clone)]
pub struct PipelineContext {
    pub device: Device,
    pub encoder: Arc<dyn LatentEncoder>,
    pub depth_estimator: Option<Arc<dyn DepthEstimator>>,
    pub tokenizer: Arc<dyn Tokenizer>,
}

impl PipelineContext {
    pub fn new(
        device: Device,
        encoder: Arc<dyn LatentEncoder>,
        tokenizer: Arc<dyn Tokenizer>,
    ) -> Self {
        Self {
            device,
            encoder,
            depth_estimator: None,
            tokenizer,
        }
    }

    pub fn with_depth_estimator(mut self, estimator: Arc<dyn DepthEstimator>) -> Self {
        self.depth_estimator = Some(estimator);
        self
    }

    /// The depth estimator, or a configuration error naming the stage
    pub fn depth_estimator(&self) -> Result<&dyn DepthEstimator> {
        self.depth_estimator
            .as_deref()
            .ok_or_else(|| PipelineError::Config("no depth estimator configured".to_string()))
    }

    /// Identities of every collaborator, in a fixed order
    pub fn identities(&self) -> Vec<String> {
        let mut identities = vec![
            format!("device:{}", self.device.label()),
            format!("encoder:{}", self.encoder.identity()),
            format!("tokenizer:{}", self.tokenizer.identity()),
        ];
        if let Some(estimator) = &self.depth_estimator {
            identities.push(format!("depth:{}", estimator.identity()));
        }
        identities
    }
}

impl std::fmt::Debug for PipelineContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PipelineContext")
            .field("device", &self.device)
            .field("encoder", &self.encoder.identity())
            .field(
                "depth_estimator",
                &self.depth_estimator.as_ref().map(|e| e.identity()),
            )
            .field("tokenizer", &self.tokenizer.identity())
            .finish()
    }
}

/// Per-sample execution state handed to every stage
pub struct SampleContext<'a> {
    /// Seeded from (seed, sample key, variation), so draws repeat across runs
    pub rng: StdRng,
    /// Cache variation being produced
    pub variation: u32,
    pub pipeline: &'a PipelineContext,
}

impl<'a> SampleContext<'a> {
    pub fn new(rng: StdRng, variation: u32, pipeline: &'a PipelineContext) -> Self {
        Self {
            rng,
            variation,
            pipeline,
        }
    }

    pub fn device(&self) -> &Device {
        &self.pipeline.device
    }
}
