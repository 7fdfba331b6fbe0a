use std::collections::BTreeSet;

use sample_kit_common::ValueRange;
use tracing::debug;

use crate::{
    batching::AspectBatchSorting,
    cache::{DiskCache, IDENTITY_FIELDS},
    config::DatasetConfig,
    error::{PipelineError, Result},
    pipeline::Pipeline,
    record::Field,
    stages::{
        AspectBucketer, AspectBucketing, CalcAspect, CollectPaths, Downscale, EncodeLatent,
        GenerateDepth, GenerateMaskedConditioningImage, LoadImage, LoadText, MissingPolicy,
        ModifyPath, RandomMaskRotateCrop, SampleDistribution, ScaleCropImage, Tokenize,
    },
    traits::{PipelineContext, Stage},
};

/// Builder for creating processing pipelines with a fluent API
pub struct PipelineBuilder {
    config: DatasetConfig,
    context: PipelineContext,
    pre_cache: Vec<Box<dyn Stage>>,
    cache_fields: Option<(Vec<Field>, Vec<Field>)>,
    post_cache: Vec<Box<dyn Stage>>,
    sorter_fields: Vec<Field>,
}

impl PipelineBuilder {
    pub fn new(config: DatasetConfig, context: PipelineContext) -> Self {
        Self {
            config,
            context,
            pre_cache: Vec::new(),
            cache_fields: None,
            post_cache: Vec::new(),
            sorter_fields: Vec::new(),
        }
    }

    /// Append a stage that runs before the cache
    pub fn add_stage<S>(mut self, stage: S) -> Self
    where
        S: Stage + 'static,
    {
        self.pre_cache.push(Box::new(stage));
        self
    }

    /// Set the cached split and aggregate fields (replaces any existing ones)
    pub fn set_cache(mut self, split: Vec<Field>, aggregate: Vec<Field>) -> Self {
        self.cache_fields = Some((split, aggregate));
        self
    }

    /// Append a stage that runs on cached records every epoch
    pub fn add_post_cache_stage<S>(mut self, stage: S) -> Self
    where
        S: Stage + 'static,
    {
        self.post_cache.push(Box::new(stage));
        self
    }

    /// Fields carried into emitted batches
    pub fn set_batch_fields(mut self, fields: Vec<Field>) -> Self {
        self.sorter_fields = fields;
        self
    }

    /// The stage sequence of one model variant, fully configured from `config`
    pub fn for_variant(config: DatasetConfig, context: PipelineContext) -> Result<Pipeline> {
        config.validate()?;
        let depth = config.variant.uses_depth();

        let bucketer = AspectBucketer::new(
            config.target_resolution,
            config.bucket_stride,
            config.max_crop_loss,
        )?;
        let augmentation = RandomMaskRotateCrop::new(
            Field::Mask,
            if depth {
                vec![Field::Image, Field::Depth]
            } else {
                vec![Field::Image]
            },
        )
        .with_padding(config.min_padding_percent, config.max_padding_percent)
        .with_max_rotate_angle(config.max_rotate_angle)
        .with_min_size(config.min_size);
        let scale_crop_fields = if depth {
            vec![Field::Image, Field::Mask, Field::Depth]
        } else {
            vec![Field::Image, Field::Mask]
        };

        let mask_postfix = config.mask_postfix.clone();
        let prompt_extension = config.prompt_extension.clone();
        let sampling = config.latent_sampling;

        let mut builder = Self::new(config, context)
            .add_stage(ModifyPath::new(Field::ImagePath, Field::MaskPath, mask_postfix, ".png"))
            .add_stage(ModifyPath::new(Field::ImagePath, Field::PromptPath, "", prompt_extension))
            .add_stage(LoadText::new(Field::PromptPath, Field::Prompt))
            .add_stage(LoadImage::new(Field::ImagePath, Field::Image, 3, ValueRange::SIGNED))
            .add_stage(
                LoadImage::new(Field::MaskPath, Field::Mask, 1, ValueRange::UNIT)
                    .with_missing_policy(MissingPolicy::FillLike {
                        reference: Field::Image,
                        value: 1.0,
                    }),
            );
        if depth {
            builder = builder.add_stage(GenerateDepth::new(Field::Image, Field::Depth));
        }
        builder = builder
            .add_stage(augmentation)
            .add_stage(CalcAspect::new(Field::Image, Field::OriginalResolution))
            .add_stage(AspectBucketing::new(bucketer))
            .add_stage(ScaleCropImage::new(scale_crop_fields))
            .add_stage(GenerateMaskedConditioningImage::new(
                Field::Image,
                Field::Mask,
                Field::ConditioningImage,
            ))
            .add_stage(EncodeLatent::new(Field::Image, Field::LatentImageDistribution))
            .add_stage(Downscale::new(Field::Mask, Field::LatentMask))
            .add_stage(EncodeLatent::new(
                Field::ConditioningImage,
                Field::LatentConditioningImageDistribution,
            ));
        if depth {
            builder = builder.add_stage(Downscale::new(Field::Depth, Field::LatentDepth));
        }
        builder = builder.add_stage(Tokenize::new(Field::Prompt, Field::Tokens));

        let mut split = vec![
            Field::LatentImageDistribution,
            Field::LatentMask,
            Field::LatentConditioningImageDistribution,
        ];
        let mut batch_fields = vec![Field::LatentImage, Field::LatentConditioningImage, Field::LatentMask];
        if depth {
            split.push(Field::LatentDepth);
            batch_fields.push(Field::LatentDepth);
        }
        split.push(Field::Tokens);
        batch_fields.extend([Field::Tokens, Field::CropResolution, Field::ConceptName, Field::ImagePath]);

        builder
            .set_cache(split, vec![Field::CropResolution])
            .add_post_cache_stage(SampleDistribution::new(
                Field::LatentImageDistribution,
                Field::LatentImage,
                sampling,
            ))
            .add_post_cache_stage(SampleDistribution::new(
                Field::LatentConditioningImageDistribution,
                Field::LatentConditioningImage,
                sampling,
            ))
            .set_batch_fields(batch_fields)
            .build()
    }

    /// Validate the stage contracts and open the cache.
    ///
    /// Every failure here is a configuration error raised before any sample
    /// is touched.
    pub fn build(self) -> Result<Pipeline> {
        self.config.validate()?;

        let factor = self.context.encoder.downsample_factor();
        if factor == 0 || self.config.bucket_stride % factor != 0 {
            return Err(PipelineError::Config(format!(
                "bucket_stride {} is not a multiple of the encoder downsample factor {}",
                self.config.bucket_stride, factor
            )));
        }
        if self.context.encoder.latent_channels() == 0 {
            return Err(PipelineError::Config(format!(
                "encoder '{}' produces no latent channels",
                self.context.encoder.identity()
            )));
        }
        if self.config.variant.uses_depth() && self.context.depth_estimator.is_none() {
            return Err(PipelineError::Config(format!(
                "variant '{}' needs a depth estimator",
                self.config.variant
            )));
        }

        let (split, aggregate) = self
            .cache_fields
            .clone()
            .ok_or_else(|| PipelineError::Config("no cache fields configured".to_string()))?;

        let mut available: BTreeSet<Field> = IDENTITY_FIELDS.into_iter().collect();
        check_stages(&self.pre_cache, &mut available)?;
        for field in split.iter().chain(&aggregate) {
            if !available.contains(field) {
                return Err(PipelineError::Config(format!(
                    "cache field '{}' is not produced before the cache",
                    field
                )));
            }
        }
        if !aggregate.contains(&Field::CropResolution) {
            return Err(PipelineError::Config(
                "crop_resolution must be an aggregate cache field".to_string(),
            ));
        }

        let mut after_cache: BTreeSet<Field> = IDENTITY_FIELDS.into_iter().collect();
        after_cache.extend(split.iter().copied());
        after_cache.extend(aggregate.iter().copied());
        check_stages(&self.post_cache, &mut after_cache)?;
        for field in &self.sorter_fields {
            if !after_cache.contains(field) {
                return Err(PipelineError::Config(format!(
                    "batch field '{}' is not available after the cache",
                    field
                )));
            }
        }

        let mut identities = self.context.identities();
        if !self.config.variant.uses_depth() {
            identities.retain(|id| !id.starts_with("depth:"));
        }
        let fingerprint = self.config.fingerprint(&identities)?;
        let cache = DiskCache::new(&self.config.cache_dir, fingerprint, split, aggregate)?;
        debug!("Cache directory {}", cache.root().display());

        let collector = CollectPaths::new(self.config.extensions.clone(), self.config.mask_postfix.clone());
        let sorter = AspectBatchSorting::new(self.config.batch_size, self.sorter_fields)
            .with_remainder(self.config.remainder)
            .with_shuffle(self.config.shuffle, self.config.seed);

        Ok(Pipeline::new(
            self.config,
            self.context,
            collector,
            self.pre_cache,
            cache,
            self.post_cache,
            sorter,
        ))
    }
}

/// Walk `stages` in order, failing on the first requirement nothing upstream produces
fn check_stages(stages: &[Box<dyn Stage>], available: &mut BTreeSet<Field>) -> Result<()> {
    for stage in stages {
        for field in stage.requires() {
            if !available.contains(&field) {
                return Err(PipelineError::Config(format!(
                    "stage '{}' requires '{}' which no earlier stage produces",
                    stage.name(),
                    field
                )));
            }
        }
        available.extend(stage.produces());
    }
    Ok(())
}
