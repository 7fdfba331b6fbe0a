use std::fs;
use std::path::Path;
use std::sync::Arc;

use sample_pipeline::{
    DatasetConfig, Device, PipelineContext,
    collaborators::{AreaPoolEncoder, HashTokenizer, LuminanceDepthEstimator},
};
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use thiserror::Error;

#[derive(Error, Debug)]
pub enum RunFileError {
    #[error(transparent)]
    SerdeError(#[from] serde_json::Error),
    #[error(transparent)]
    TomlDeError(#[from] toml::de::Error),
    #[error(transparent)]
    TomlSerError(#[from] toml::ser::Error),
    #[error(transparent)]
    IoError(#[from] std::io::Error),
    #[error("Unsupported file format. Please use .toml or .json files")]
    UnsupportedFileFormat,
    #[error("Invalid collaborator settings: {0}")]
    InvalidCollaborators(String),
}

/// Settings of the reference collaborators the CLI runs with
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema, PartialEq)]
#[serde(default)]
pub struct CollaboratorSettings {
    /// Label of the device handed to every collaborator
    pub device: String,
    pub latent_channels: u32,
    /// Spatial reduction of the encoder; must divide the bucket stride
    pub downsample_factor: u32,
    pub max_token_length: usize,
    pub vocab_size: u32,
}

impl Default for CollaboratorSettings {
    fn default() -> Self {
        Self {
            device: "cpu".to_string(),
            latent_channels: 4,
            downsample_factor: 8,
            max_token_length: 77,
            vocab_size: 49408,
        }
    }
}

impl CollaboratorSettings {
    /// Reject settings the reference collaborators cannot run with
    pub fn validate(&self) -> Result<(), RunFileError> {
        let mut problems = Vec::new();
        if self.latent_channels == 0 {
            problems.push("latent_channels must be at least 1".to_string());
        }
        if self.downsample_factor == 0 {
            problems.push("downsample_factor must be at least 1".to_string());
        }
        if self.max_token_length < 2 {
            problems.push(format!(
                "max_token_length {} leaves no room for BOS and EOS",
                self.max_token_length
            ));
        }
        if self.vocab_size <= HashTokenizer::RESERVED {
            problems.push(format!(
                "vocab_size {} must exceed the {} reserved ids",
                self.vocab_size,
                HashTokenizer::RESERVED
            ));
        }

        if problems.is_empty() {
            Ok(())
        } else {
            Err(RunFileError::InvalidCollaborators(problems.join("; ")))
        }
    }

    /// Pipeline context wired with the reference collaborators
    pub fn context(&self) -> Result<PipelineContext, RunFileError> {
        self.validate()?;
        Ok(PipelineContext::new(
            Device::new(self.device.clone()),
            Arc::new(AreaPoolEncoder::new(self.latent_channels, self.downsample_factor)),
            Arc::new(HashTokenizer::new(self.max_token_length, self.vocab_size)),
        )
        .with_depth_estimator(Arc::new(LuminanceDepthEstimator)))
    }
}

/// A run file: dataset configuration plus collaborator settings
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema, PartialEq, Default)]
pub struct RunConfig {
    pub dataset: DatasetConfig,
    #[serde(default)]
    pub collaborators: CollaboratorSettings,
}

impl RunConfig {
    /// Load a run configuration from a TOML file
    pub fn from_toml_file<P: AsRef<Path>>(path: P) -> Result<Self, RunFileError> {
        let content = fs::read_to_string(path)?;
        Self::from_toml(&content)
    }

    /// Load a run configuration from TOML string
    pub fn from_toml(content: &str) -> Result<Self, RunFileError> {
        Ok(toml::from_str(content)?)
    }

    /// Load a run configuration from a JSON file
    pub fn from_json_file<P: AsRef<Path>>(path: P) -> Result<Self, RunFileError> {
        let content = fs::read_to_string(path)?;
        Self::from_json(&content)
    }

    /// Load a run configuration from JSON string
    pub fn from_json(content: &str) -> Result<Self, RunFileError> {
        Ok(serde_json::from_str(content)?)
    }

    /// Auto-detect file format and load configuration
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self, RunFileError> {
        let path_ref = path.as_ref();
        match path_ref.extension().and_then(|ext| ext.to_str()) {
            Some("toml") => Self::from_toml_file(path),
            Some("json") => Self::from_json_file(path),
            _ => Err(RunFileError::UnsupportedFileFormat),
        }
    }

    /// Convert the run configuration to a TOML string
    pub fn to_toml(&self) -> Result<String, RunFileError> {
        Ok(toml::to_string_pretty(&self)?)
    }

    /// Convert the run configuration to a JSON string
    pub fn to_json(&self) -> Result<String, RunFileError> {
        Ok(serde_json::to_string_pretty(&self)?)
    }

    /// JSON schema of the run file
    pub fn schema_json() -> Result<String, RunFileError> {
        Ok(serde_json::to_string_pretty(&schemars::schema_for!(RunConfig))?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use sample_pipeline::{Concept, ModelVariant};

    #[test]
    fn test_toml_run_file() {
        let config = RunConfig::from_toml(
            r#"
            [dataset]
            variant = "depth2img"
            batch_size = 2
            cache_dir = "/tmp/cache"

            [[dataset.concepts]]
            name = "cat"
            path = "data/cat"

            [collaborators]
            downsample_factor = 4
            "#,
        )
        .unwrap();
        assert_eq!(config.dataset.variant, ModelVariant::DepthConditioned);
        assert_eq!(config.dataset.concepts.len(), 1);
        assert_eq!(config.collaborators.downsample_factor, 4);
        assert_eq!(config.collaborators.latent_channels, 4);
    }

    #[test]
    fn test_round_trip_through_files() {
        let dir = tempfile::tempdir().unwrap();
        let config = RunConfig {
            dataset: DatasetConfig {
                concepts: vec![Concept::new("dog", "data/dog")],
                ..DatasetConfig::default()
            },
            collaborators: CollaboratorSettings::default(),
        };

        let toml_path = dir.path().join("run.toml");
        fs::write(&toml_path, config.to_toml().unwrap()).unwrap();
        assert_eq!(RunConfig::from_file(&toml_path).unwrap(), config);

        let json_path = dir.path().join("run.json");
        fs::write(&json_path, config.to_json().unwrap()).unwrap();
        assert_eq!(RunConfig::from_file(&json_path).unwrap(), config);

        assert!(matches!(
            RunConfig::from_file(dir.path().join("run.yaml")),
            Err(RunFileError::UnsupportedFileFormat)
        ));
    }

    #[test]
    fn test_collaborator_settings_are_checked() {
        assert!(CollaboratorSettings::default().context().is_ok());

        for broken in [
            CollaboratorSettings { latent_channels: 0, ..Default::default() },
            CollaboratorSettings { max_token_length: 1, ..Default::default() },
            CollaboratorSettings { vocab_size: 3, ..Default::default() },
        ] {
            assert!(matches!(
                broken.context(),
                Err(RunFileError::InvalidCollaborators(_))
            ));
        }
    }

    #[test]
    fn test_schema_mentions_sections() {
        let schema = RunConfig::schema_json().unwrap();
        assert!(schema.contains("collaborators"));
        assert!(schema.contains("target_resolution"));
    }
}
