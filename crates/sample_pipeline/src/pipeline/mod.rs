pub mod builder;

use sample_kit_common::Resolution;
use tracing::{debug, warn};

use crate::{
    batching::AspectBatchSorting,
    cache::DiskCache,
    config::DatasetConfig,
    error::{PipelineError, Result},
    hash::sample_rng,
    record::{Field, Record},
    stages::CollectPaths,
    traits::{PipelineContext, SampleContext, Stage},
};

/// Outcome of preparing one sample for an epoch
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Prepared {
    pub key: String,
    pub crop_resolution: Resolution,
    pub cache_hit: bool,
}

/// A validated stage sequence split around the disk cache
pub struct Pipeline {
    config: DatasetConfig,
    context: PipelineContext,
    collector: CollectPaths,
    pre_cache: Vec<Box<dyn Stage>>,
    cache: DiskCache,
    post_cache: Vec<Box<dyn Stage>>,
    sorter: AspectBatchSorting,
}

impl Pipeline {
    /// Create a new pipeline builder
    pub fn builder(config: DatasetConfig, context: PipelineContext) -> builder::PipelineBuilder {
        builder::PipelineBuilder::new(config, context)
    }

    /// The fixed stage sequence for the configured variant
    pub fn for_variant(config: DatasetConfig, context: PipelineContext) -> Result<Self> {
        builder::PipelineBuilder::for_variant(config, context)
    }

    pub(crate) fn new(
        config: DatasetConfig,
        context: PipelineContext,
        collector: CollectPaths,
        pre_cache: Vec<Box<dyn Stage>>,
        cache: DiskCache,
        post_cache: Vec<Box<dyn Stage>>,
        sorter: AspectBatchSorting,
    ) -> Self {
        Self {
            config,
            context,
            collector,
            pre_cache,
            cache,
            post_cache,
            sorter,
        }
    }

    pub fn config(&self) -> &DatasetConfig {
        &self.config
    }

    pub fn context(&self) -> &PipelineContext {
        &self.context
    }

    pub fn cache(&self) -> &DiskCache {
        &self.cache
    }

    pub fn sorter(&self) -> &AspectBatchSorting {
        &self.sorter
    }

    /// Names of the per-sample stages in execution order, cache included
    pub fn stage_names(&self) -> Vec<&'static str> {
        let mut names: Vec<_> = self.pre_cache.iter().map(|s| s.name()).collect();
        names.push("disk_cache");
        names.extend(self.post_cache.iter().map(|s| s.name()));
        names
    }

    /// One identity record per source image across all concepts
    pub fn discover(&self) -> Result<Vec<Record>> {
        self.collector.collect(&self.config.concepts)
    }

    /// Run every stage before the cache on a discovered record
    pub fn process(&self, mut record: Record, variation: u32) -> Result<Record> {
        let rng = sample_rng(self.config.seed, record.key(), variation, None);
        let mut ctx = SampleContext::new(rng, variation, &self.context);
        for stage in &self.pre_cache {
            stage.apply(&mut record, &mut ctx)?;
        }
        Ok(record)
    }

    /// Make sure the sample is cached and report its bucket.
    ///
    /// A hit reads only the aggregate entry; a miss runs the full pipeline
    /// and writes both entries.
    pub fn prepare(&self, record: &Record, variation: u32) -> Result<Prepared> {
        let key = record.key().to_string();
        if let Some(hit) = self.cache.lookup(&key, variation) {
            let crop_resolution = *hit.resolution("disk_cache", Field::CropResolution)?;
            debug!("Cache hit for {}", key);
            return Ok(Prepared {
                key,
                crop_resolution,
                cache_hit: true,
            });
        }

        let processed = self.process(record.clone(), variation)?;
        self.cache.write(&processed, variation)?;
        let crop_resolution = *processed.resolution("disk_cache", Field::CropResolution)?;
        Ok(Prepared {
            key,
            crop_resolution,
            cache_hit: false,
        })
    }

    /// Read a prepared sample back from the cache and run the post-cache
    /// stages for `epoch`. An unusable entry is recomputed and rewritten.
    pub fn load(&self, record: &Record, variation: u32, epoch: u64) -> Result<Record> {
        let key = record.key();
        let mut loaded = match self.cache.read(key, variation) {
            Ok(loaded) => loaded,
            Err(PipelineError::CacheCorrupt { path, reason }) => {
                warn!("Recomputing {}: {} ({})", key, reason, path.display());
                let processed = self.process(record.clone(), variation)?;
                self.cache.write(&processed, variation)?;
                self.cache.project(&processed)
            }
            Err(e) => return Err(e),
        };

        let rng = sample_rng(self.config.seed, key, variation, Some(epoch));
        let mut ctx = SampleContext::new(rng, variation, &self.context);
        for stage in &self.post_cache {
            stage.apply(&mut loaded, &mut ctx)?;
        }
        Ok(loaded)
    }

    /// Variation used for `epoch`
    pub fn variation_for(&self, epoch: u64) -> u32 {
        (epoch % self.config.cache_variations.max(1) as u64) as u32
    }

    /// Get information about the pipeline configuration
    pub fn info(&self) -> String {
        format!(
            "Pipeline ({}): {} stages before cache, {} after, cache at {}",
            self.config.variant,
            self.pre_cache.len(),
            self.post_cache.len(),
            self.cache.root().display()
        )
    }
}
