use std::fs;
use std::path::{Path, PathBuf};

use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use strum::{Display, EnumIter, EnumString, IntoStaticStr, VariantNames};

use crate::{
    error::{PipelineError, Result},
    hash::hex_digest,
    types::Concept,
};

/// Bumped whenever the cached byte layout changes
pub const CACHE_FORMAT_VERSION: u32 = 1;

/// Model variant the samples are prepared for
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, Default,
    Serialize, Deserialize, JsonSchema,
    Display, EnumString, EnumIter, VariantNames, IntoStaticStr,
)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum ModelVariant {
    /// Image, mask and prompt only
    #[default]
    Standard,
    /// Adds an estimated depth channel
    #[serde(alias = "depth2img")]
    #[strum(serialize = "depth_conditioned", serialize = "depth2img")]
    DepthConditioned,
}

impl ModelVariant {
    pub fn uses_depth(&self) -> bool {
        matches!(self, ModelVariant::DepthConditioned)
    }
}

/// How a latent distribution becomes a concrete latent
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, Default,
    Serialize, Deserialize, JsonSchema,
    Display, EnumString, EnumIter, VariantNames, IntoStaticStr,
)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum SamplingMode {
    /// Use the mean; reproducible
    #[default]
    Mean,
    /// One stochastic draw per access; never cached
    Sample,
}

/// What to do with a bucket's trailing members that do not fill a batch
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, Default,
    Serialize, Deserialize, JsonSchema,
    Display, EnumString, EnumIter, VariantNames, IntoStaticStr,
)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum RemainderPolicy {
    /// Discard the partial batch
    #[default]
    Drop,
    /// Emit a shorter batch
    Emit,
    /// Fill the batch by repeating members of the same bucket
    Repeat,
}

/// Everything the pipeline builder consumes
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, JsonSchema)]
#[serde(default)]
pub struct DatasetConfig {
    pub variant: ModelVariant,
    /// Samples per emitted batch
    pub batch_size: usize,
    /// Side of the reference square defining the pixel budget, e.g. 512
    pub target_resolution: u32,
    /// Every bucket dimension is a multiple of this
    pub bucket_stride: u32,
    /// Largest fraction of the scaled area a bucket crop may discard
    pub max_crop_loss: f64,
    pub min_padding_percent: f32,
    pub max_padding_percent: f32,
    /// Degrees; 0 disables rotation
    pub max_rotate_angle: f32,
    /// Minimum side of the augmentation crop
    pub min_size: u32,
    /// Accepted image extensions
    pub extensions: Vec<String>,
    /// Postfix marking mask files, e.g. `-masklabel`
    pub mask_postfix: String,
    pub prompt_extension: String,
    pub cache_dir: PathBuf,
    pub seed: u64,
    /// Distinct cached augmentation draws per sample; epoch `e` uses `e % n`
    pub cache_variations: u32,
    /// Worker threads for the prepare phase; 0 uses the available cores
    pub workers: usize,
    /// Batches loaded ahead of the consumer
    pub prefetch: usize,
    pub latent_sampling: SamplingMode,
    pub remainder: RemainderPolicy,
    /// Reshuffle bucket members and batch order every epoch
    pub shuffle: bool,
    pub concepts: Vec<Concept>,
}

impl Default for DatasetConfig {
    fn default() -> Self {
        Self {
            variant: ModelVariant::Standard,
            batch_size: 1,
            target_resolution: 512,
            bucket_stride: 64,
            max_crop_loss: 0.5,
            min_padding_percent: 10.0,
            max_padding_percent: 30.0,
            max_rotate_angle: 20.0,
            min_size: 512,
            extensions: vec![".png".to_string(), ".jpg".to_string()],
            mask_postfix: "-masklabel".to_string(),
            prompt_extension: ".txt".to_string(),
            cache_dir: PathBuf::from("cache"),
            seed: 42,
            cache_variations: 1,
            workers: 0,
            prefetch: 2,
            latent_sampling: SamplingMode::Mean,
            remainder: RemainderPolicy::Drop,
            shuffle: false,
            concepts: Vec::new(),
        }
    }
}

impl DatasetConfig {
    /// Reject out-of-range settings before any sample is processed
    pub fn validate(&self) -> Result<()> {
        let mut problems = Vec::new();

        if self.batch_size == 0 {
            problems.push("batch_size must be positive".to_string());
        }
        if self.target_resolution == 0 {
            problems.push("target_resolution must be positive".to_string());
        }
        if self.bucket_stride == 0 || self.bucket_stride > self.target_resolution {
            problems.push(format!(
                "bucket_stride {} must be in 1..={}",
                self.bucket_stride, self.target_resolution
            ));
        }
        if !(0.0..1.0).contains(&self.max_crop_loss) {
            problems.push(format!("max_crop_loss {} must be in [0, 1)", self.max_crop_loss));
        }
        let percent = 0.0..=100.0;
        if !percent.contains(&self.min_padding_percent) || !percent.contains(&self.max_padding_percent) {
            problems.push("padding percentages must be within 0..=100".to_string());
        } else if self.min_padding_percent > self.max_padding_percent {
            problems.push(format!(
                "min_padding_percent {} exceeds max_padding_percent {}",
                self.min_padding_percent, self.max_padding_percent
            ));
        }
        if !self.max_rotate_angle.is_finite() || !(0.0..=180.0).contains(&self.max_rotate_angle) {
            problems.push(format!("max_rotate_angle {} must be within 0..=180", self.max_rotate_angle));
        }
        if self.min_size == 0 {
            problems.push("min_size must be positive".to_string());
        }
        if self.extensions.iter().all(|ext| ext.trim_start_matches('.').is_empty()) {
            problems.push("at least one image extension is required".to_string());
        }
        if self.mask_postfix.is_empty() {
            problems.push("mask_postfix must not be empty".to_string());
        }
        if self.prompt_extension.trim_start_matches('.').is_empty() {
            problems.push("prompt_extension must not be empty".to_string());
        }
        if self.cache_variations == 0 {
            problems.push("cache_variations must be at least 1".to_string());
        }
        if self.prefetch == 0 {
            problems.push("prefetch must be at least 1".to_string());
        }
        if self.concepts.is_empty() {
            problems.push("no concepts configured".to_string());
        }
        for concept in &self.concepts {
            if concept.name.trim().is_empty() {
                problems.push(format!("concept at {} has an empty name", concept.path.display()));
            }
        }

        if problems.is_empty() {
            Ok(())
        } else {
            Err(PipelineError::Config(problems.join("; ")))
        }
    }

    /// Hash of every setting that changes cached content, plus the identities
    /// of the collaborators that produced it.
    pub fn fingerprint(&self, collaborators: &[String]) -> Result<String> {
        #[derive(Serialize)]
        struct FingerprintInputs<'a> {
            format_version: u32,
            variant: ModelVariant,
            target_resolution: u32,
            bucket_stride: u32,
            max_crop_loss: f64,
            min_padding_percent: f32,
            max_padding_percent: f32,
            max_rotate_angle: f32,
            min_size: u32,
            mask_postfix: &'a str,
            prompt_extension: &'a str,
            seed: u64,
            collaborators: &'a [String],
        }

        let inputs = FingerprintInputs {
            format_version: CACHE_FORMAT_VERSION,
            variant: self.variant,
            target_resolution: self.target_resolution,
            bucket_stride: self.bucket_stride,
            max_crop_loss: self.max_crop_loss,
            min_padding_percent: self.min_padding_percent,
            max_padding_percent: self.max_padding_percent,
            max_rotate_angle: self.max_rotate_angle,
            min_size: self.min_size,
            mask_postfix: &self.mask_postfix,
            prompt_extension: &self.prompt_extension,
            seed: self.seed,
            collaborators,
        };
        let bytes = serde_json::to_vec(&inputs)?;
        Ok(hex_digest(&bytes)[..24].to_string())
    }

    /// Load configuration from a TOML string
    pub fn from_toml(content: &str) -> Result<Self> {
        toml::from_str(content).map_err(|e| PipelineError::Config(e.to_string()))
    }

    /// Load configuration from a JSON string
    pub fn from_json(content: &str) -> Result<Self> {
        Ok(serde_json::from_str(content)?)
    }

    /// Auto-detect file format and load configuration
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        let content = fs::read_to_string(path).map_err(PipelineError::io(path))?;
        match path.extension().and_then(|ext| ext.to_str()) {
            Some("toml") => Self::from_toml(&content),
            Some("json") => Self::from_json(&content),
            _ => Err(PipelineError::Config(format!(
                "unsupported config format {}; use .toml or .json",
                path.display()
            ))),
        }
    }

    /// Schema of the configuration file
    pub fn schema() -> schemars::schema::RootSchema {
        schemars::schema_for!(DatasetConfig)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn configured() -> DatasetConfig {
        DatasetConfig {
            concepts: vec![Concept::new("cat", "data/cat")],
            ..DatasetConfig::default()
        }
    }

    #[test]
    fn test_default_with_concept_is_valid() {
        configured().validate().expect("defaults should validate");
    }

    #[test]
    fn test_padding_order_is_checked() {
        let config = DatasetConfig {
            min_padding_percent: 40.0,
            max_padding_percent: 30.0,
            ..configured()
        };
        let err = config.validate().unwrap_err();
        assert!(err.to_string().contains("min_padding_percent"));
        assert!(!err.is_sample_local());
    }

    #[test]
    fn test_zero_batch_size_is_rejected() {
        let config = DatasetConfig {
            batch_size: 0,
            ..configured()
        };
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_variant_parsing() {
        assert_eq!("depth2img".parse::<ModelVariant>().unwrap(), ModelVariant::DepthConditioned);
        assert_eq!("standard".parse::<ModelVariant>().unwrap(), ModelVariant::Standard);
        assert!("inpainting".parse::<ModelVariant>().is_err());

        let config = DatasetConfig::from_toml(
            r#"
            variant = "depth2img"
            batch_size = 4
            [[concepts]]
            name = "cat"
            path = "data/cat"
            "#,
        )
        .unwrap();
        assert_eq!(config.variant, ModelVariant::DepthConditioned);
        assert_eq!(config.batch_size, 4);
        assert_eq!(config.target_resolution, 512);

        assert!(DatasetConfig::from_toml(r#"variant = "video""#).is_err());
    }

    #[test]
    fn test_fingerprint_tracks_output_settings() {
        let base = configured();
        let collaborators = vec!["encoder".to_string()];
        let a = base.fingerprint(&collaborators).unwrap();
        assert_eq!(a, base.fingerprint(&collaborators).unwrap());

        let resized = DatasetConfig {
            target_resolution: 768,
            ..base.clone()
        };
        assert_ne!(a, resized.fingerprint(&collaborators).unwrap());

        let depth = DatasetConfig {
            variant: ModelVariant::DepthConditioned,
            ..base.clone()
        };
        assert_ne!(a, depth.fingerprint(&collaborators).unwrap());

        let batched = DatasetConfig {
            batch_size: 8,
            ..base.clone()
        };
        assert_eq!(a, batched.fingerprint(&collaborators).unwrap());
    }
}
