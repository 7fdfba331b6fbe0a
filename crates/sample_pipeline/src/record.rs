use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use sample_kit_common::Resolution;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use strum::{Display, EnumIter, EnumString, IntoStaticStr, VariantNames};

use crate::{
    error::{PipelineError, Result},
    types::{LatentDistribution, Raster},
};

/// Every key a record may carry. The set is closed so stage contracts can be
/// checked when a pipeline is built.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord,
    Serialize, Deserialize, JsonSchema,
    Display, EnumString, EnumIter, VariantNames, IntoStaticStr,
)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum Field {
    ConceptName,
    ImagePath,
    MaskPath,
    PromptPath,
    Image,
    Mask,
    Depth,
    OriginalResolution,
    ScaleResolution,
    CropResolution,
    Prompt,
    ConditioningImage,
    LatentImageDistribution,
    LatentMask,
    LatentConditioningImageDistribution,
    LatentDepth,
    Tokens,
    LatentImage,
    LatentConditioningImage,
}

/// A value held under a [`Field`]
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum Value {
    Path(#[serde(with = "os_path")] PathBuf),
    Text(String),
    Raster(Raster),
    Resolution(Resolution),
    Distribution(LatentDistribution),
    Tokens(Vec<u32>),
}

impl Value {
    /// Short name of the variant, for error messages
    pub fn kind(&self) -> &'static str {
        match self {
            Value::Path(_) => "path",
            Value::Text(_) => "text",
            Value::Raster(_) => "raster",
            Value::Resolution(_) => "resolution",
            Value::Distribution(_) => "distribution",
            Value::Tokens(_) => "tokens",
        }
    }
}

/// Paths stored as their raw OS bytes so names that are not valid UTF-8
/// survive both the bincode and the JSON cache files.
mod os_path {
    use std::path::{Path, PathBuf};

    use serde::{Deserialize, Deserializer, Serialize, Serializer, de::Error as _, ser::Error as _};

    #[cfg(unix)]
    fn to_bytes(path: &Path) -> Option<Vec<u8>> {
        use std::os::unix::ffi::OsStrExt;
        Some(path.as_os_str().as_bytes().to_vec())
    }

    #[cfg(not(unix))]
    fn to_bytes(path: &Path) -> Option<Vec<u8>> {
        path.to_str().map(|s| s.as_bytes().to_vec())
    }

    #[cfg(unix)]
    fn from_bytes(bytes: Vec<u8>) -> Option<PathBuf> {
        use std::os::unix::ffi::OsStringExt;
        Some(PathBuf::from(std::ffi::OsString::from_vec(bytes)))
    }

    #[cfg(not(unix))]
    fn from_bytes(bytes: Vec<u8>) -> Option<PathBuf> {
        String::from_utf8(bytes).ok().map(PathBuf::from)
    }

    pub fn serialize<S: Serializer>(path: &Path, serializer: S) -> Result<S::Ok, S::Error> {
        to_bytes(path)
            .ok_or_else(|| S::Error::custom(format!("path {} is not representable", path.display())))?
            .serialize(serializer)
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<PathBuf, D::Error> {
        let bytes = Vec::<u8>::deserialize(deserializer)?;
        from_bytes(bytes).ok_or_else(|| D::Error::custom("stored path is not valid on this platform"))
    }
}

/// One sample in flight: a stable key plus its named fields.
#[derive(Debug, Clone, PartialEq)]
pub struct Record {
    key: String,
    fields: BTreeMap<Field, Value>,
}

macro_rules! typed_accessor {
    ($name:ident, $variant:ident, $ty:ty, $expected:literal) => {
        pub fn $name(&self, stage: &'static str, field: Field) -> Result<&$ty> {
            match self.require(stage, field)? {
                Value::$variant(inner) => Ok(inner),
                other => Err(PipelineError::FieldType {
                    field,
                    expected: $expected,
                    found: other.kind(),
                }),
            }
        }
    };
}

impl Record {
    pub fn new(key: impl Into<String>) -> Self {
        Self {
            key: key.into(),
            fields: BTreeMap::new(),
        }
    }

    /// Stable sample identity
    pub fn key(&self) -> &str {
        &self.key
    }

    pub fn insert(&mut self, field: Field, value: Value) {
        self.fields.insert(field, value);
    }

    pub fn get(&self, field: Field) -> Option<&Value> {
        self.fields.get(&field)
    }

    pub fn contains(&self, field: Field) -> bool {
        self.fields.contains_key(&field)
    }

    pub fn remove(&mut self, field: Field) -> Option<Value> {
        self.fields.remove(&field)
    }

    pub fn fields(&self) -> impl Iterator<Item = (&Field, &Value)> {
        self.fields.iter()
    }

    /// Fetch a field a stage cannot run without
    pub fn require(&self, stage: &'static str, field: Field) -> Result<&Value> {
        self.fields
            .get(&field)
            .ok_or(PipelineError::MissingField { stage, field })
    }

    typed_accessor!(raster, Raster, Raster, "raster");
    typed_accessor!(text, Text, String, "text");
    typed_accessor!(resolution, Resolution, Resolution, "resolution");
    typed_accessor!(distribution, Distribution, LatentDistribution, "distribution");
    typed_accessor!(tokens, Tokens, Vec<u32>, "tokens");

    pub fn path(&self, stage: &'static str, field: Field) -> Result<&Path> {
        match self.require(stage, field)? {
            Value::Path(path) => Ok(path.as_path()),
            other => Err(PipelineError::FieldType {
                field,
                expected: "path",
                found: other.kind(),
            }),
        }
    }

    /// A copy holding only `fields` (those present)
    pub fn project(&self, fields: &[Field]) -> Record {
        let mut projected = Record::new(self.key.clone());
        for field in fields {
            if let Some(value) = self.fields.get(field) {
                projected.insert(*field, value.clone());
            }
        }
        projected
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_missing_field_fails() {
        let record = Record::new("k");
        let err = record.raster("load_image", Field::Image).unwrap_err();
        assert!(matches!(
            err,
            PipelineError::MissingField {
                stage: "load_image",
                field: Field::Image
            }
        ));
    }

    #[test]
    fn test_wrong_type_fails() {
        let mut record = Record::new("k");
        record.insert(Field::Prompt, Value::Text("a cat".into()));
        assert_eq!(record.text("tokenize", Field::Prompt).unwrap(), "a cat");
        let err = record.raster("encode", Field::Prompt).unwrap_err();
        assert!(matches!(
            err,
            PipelineError::FieldType {
                expected: "raster",
                found: "text",
                ..
            }
        ));
    }

    #[test]
    fn test_project_keeps_named_fields() {
        let mut record = Record::new("k");
        record.insert(Field::Prompt, Value::Text("a cat".into()));
        record.insert(Field::CropResolution, Value::Resolution(Resolution::new(64, 64)));
        let projected = record.project(&[Field::CropResolution, Field::Tokens]);
        assert_eq!(projected.key(), "k");
        assert!(projected.contains(Field::CropResolution));
        assert!(!projected.contains(Field::Prompt));
        assert!(!projected.contains(Field::Tokens));
    }

    #[cfg(unix)]
    #[test]
    fn test_non_utf8_path_survives_serialization() {
        use std::ffi::OsStr;
        use std::os::unix::ffi::OsStrExt;

        let path = Path::new("data").join(OsStr::from_bytes(b"cats\xff/1.png"));
        let value = Value::Path(path.clone());

        let json = serde_json::to_vec(&value).unwrap();
        assert_eq!(serde_json::from_slice::<Value>(&json).unwrap(), value);

        let bytes = bincode::serde::encode_to_vec(&value, bincode::config::standard()).unwrap();
        let (decoded, _): (Value, usize) =
            bincode::serde::decode_from_slice(&bytes, bincode::config::standard()).unwrap();
        assert_eq!(decoded, Value::Path(path));
    }

    #[test]
    fn test_field_names() {
        assert_eq!(Field::LatentImageDistribution.to_string(), "latent_image_distribution");
        assert_eq!("crop_resolution".parse::<Field>().unwrap(), Field::CropResolution);
    }
}
