use std::fs;

use sample_kit_common::ValueRange;
use tracing::debug;

use crate::{
    error::{PipelineError, Result},
    record::{Field, Record, Value},
    traits::{SampleContext, Stage},
    types::Raster,
};

/// What [`LoadImage`] does when its file does not exist
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum MissingPolicy {
    /// The sample cannot be used without this raster
    Required,
    /// Substitute a constant raster the size of `reference`
    FillLike { reference: Field, value: f32 },
}

/// Decodes a raster file into a fixed channel count and value range
#[derive(Debug, Clone)]
pub struct LoadImage {
    pub path_field: Field,
    pub output: Field,
    pub channels: u32,
    pub range: ValueRange,
    pub missing: MissingPolicy,
}

impl LoadImage {
    pub fn new(path_field: Field, output: Field, channels: u32, range: ValueRange) -> Self {
        Self {
            path_field,
            output,
            channels,
            range,
            missing: MissingPolicy::Required,
        }
    }

    pub fn with_missing_policy(mut self, missing: MissingPolicy) -> Self {
        self.missing = missing;
        self
    }
}

impl Stage for LoadImage {
    fn name(&self) -> &'static str {
        "load_image"
    }

    fn requires(&self) -> Vec<Field> {
        match self.missing {
            MissingPolicy::Required => vec![self.path_field],
            MissingPolicy::FillLike { reference, .. } => vec![self.path_field, reference],
        }
    }

    fn produces(&self) -> Vec<Field> {
        vec![self.output]
    }

    fn apply(&self, record: &mut Record, _ctx: &mut SampleContext<'_>) -> Result<()> {
        let path = record.path(self.name(), self.path_field)?.to_path_buf();

        if !path.is_file() {
            return match self.missing {
                MissingPolicy::Required => Err(PipelineError::MissingInput {
                    field: self.output,
                    path,
                }),
                MissingPolicy::FillLike { reference, value } => {
                    let size = record.raster(self.name(), reference)?.resolution();
                    debug!(
                        "{} missing at {}; filling with {}",
                        self.output,
                        path.display(),
                        value
                    );
                    let filled = Raster::filled(size.width, size.height, self.channels, value);
                    record.insert(self.output, Value::Raster(filled));
                    Ok(())
                }
            };
        }

        let image = image::open(&path).map_err(|source| PipelineError::MalformedRaster {
            path: path.clone(),
            source,
        })?;
        let raster = Raster::from_image(&image, self.channels, self.range)?;
        record.insert(self.output, Value::Raster(raster));
        Ok(())
    }
}

/// Reads a UTF-8 text file, trimming surrounding whitespace
#[derive(Debug, Clone)]
pub struct LoadText {
    pub path_field: Field,
    pub output: Field,
}

impl LoadText {
    pub fn new(path_field: Field, output: Field) -> Self {
        Self { path_field, output }
    }
}

impl Stage for LoadText {
    fn name(&self) -> &'static str {
        "load_text"
    }

    fn requires(&self) -> Vec<Field> {
        vec![self.path_field]
    }

    fn produces(&self) -> Vec<Field> {
        vec![self.output]
    }

    fn apply(&self, record: &mut Record, _ctx: &mut SampleContext<'_>) -> Result<()> {
        let path = record.path(self.name(), self.path_field)?.to_path_buf();
        if !path.is_file() {
            return Err(PipelineError::MissingInput {
                field: self.output,
                path,
            });
        }
        let text = fs::read_to_string(&path).map_err(PipelineError::io(&path))?;
        record.insert(self.output, Value::Text(text.trim().to_string()));
        Ok(())
    }
}

/// Estimates a depth map from the image, normalized to [-1, 1]
#[derive(Debug, Clone)]
pub struct GenerateDepth {
    pub input: Field,
    pub output: Field,
}

impl GenerateDepth {
    pub fn new(input: Field, output: Field) -> Self {
        Self { input, output }
    }
}

impl Stage for GenerateDepth {
    fn name(&self) -> &'static str {
        "generate_depth"
    }

    fn requires(&self) -> Vec<Field> {
        vec![self.input]
    }

    fn produces(&self) -> Vec<Field> {
        vec![self.output]
    }

    fn apply(&self, record: &mut Record, ctx: &mut SampleContext<'_>) -> Result<()> {
        let image = record.raster(self.name(), self.input)?;
        let estimator = ctx.pipeline.depth_estimator()?;
        let depth = estimator.estimate(image, ctx.device())?;

        if depth.resolution() != image.resolution() || depth.channels() != 1 {
            return Err(PipelineError::Collaborator {
                name: estimator.identity(),
                message: format!(
                    "expected a 1x{} depth map, got {}x{}",
                    image.resolution(),
                    depth.channels(),
                    depth.resolution()
                ),
            });
        }

        let (lo, hi) = depth.value_bounds();
        let span = hi - lo;
        let resolution = depth.resolution();
        let data = depth
            .into_data()
            .into_iter()
            .map(|v| if span > 0.0 { (v - lo) / span * 2.0 - 1.0 } else { 0.0 })
            .collect();
        let normalized = Raster::new(resolution.width, resolution.height, 1, data)?;
        record.insert(self.output, Value::Raster(normalized));
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{collaborators::reference_context, hash::sample_rng, traits::PipelineContext};
    use image::{GrayImage, Luma, Rgb, RgbImage};

    fn context() -> PipelineContext {
        reference_context(4, 8, 16, 256)
    }

    #[test]
    fn test_load_image_normalizes_to_declared_range() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("img.png");
        RgbImage::from_fn(16, 8, |x, y| Rgb([(x * 16) as u8, (y * 30) as u8, 255]))
            .save(&path)
            .unwrap();

        let context = context();
        let mut ctx = SampleContext::new(sample_rng(0, "k", 0, None), 0, &context);
        let mut record = Record::new("k");
        record.insert(Field::ImagePath, Value::Path(path));

        LoadImage::new(Field::ImagePath, Field::Image, 3, ValueRange::SIGNED)
            .apply(&mut record, &mut ctx)
            .unwrap();
        let image = record.raster("test", Field::Image).unwrap();
        assert_eq!(image.channels(), 3);
        assert_eq!(image.resolution().to_string(), "16x8");
        let (lo, hi) = image.value_bounds();
        assert!(lo >= -1.0 && hi <= 1.0);
        assert_eq!(hi, 1.0);
    }

    #[test]
    fn test_missing_mask_fills_like_image() {
        let dir = tempfile::tempdir().unwrap();
        let context = context();
        let mut ctx = SampleContext::new(sample_rng(0, "k", 0, None), 0, &context);
        let mut record = Record::new("k");
        record.insert(Field::MaskPath, Value::Path(dir.path().join("none-masklabel.png")));
        record.insert(Field::Image, Value::Raster(Raster::filled(12, 6, 3, 0.0)));

        let stage = LoadImage::new(Field::MaskPath, Field::Mask, 1, ValueRange::UNIT)
            .with_missing_policy(MissingPolicy::FillLike {
                reference: Field::Image,
                value: 1.0,
            });
        stage.apply(&mut record, &mut ctx).unwrap();
        let mask = record.raster("test", Field::Mask).unwrap();
        assert_eq!((mask.width(), mask.height(), mask.channels()), (12, 6, 1));
        assert_eq!(mask.value_bounds(), (1.0, 1.0));
    }

    #[test]
    fn test_missing_required_input_is_sample_local() {
        let dir = tempfile::tempdir().unwrap();
        let context = context();
        let mut ctx = SampleContext::new(sample_rng(0, "k", 0, None), 0, &context);
        let mut record = Record::new("k");
        record.insert(Field::PromptPath, Value::Path(dir.path().join("none.txt")));

        let err = LoadText::new(Field::PromptPath, Field::Prompt)
            .apply(&mut record, &mut ctx)
            .unwrap_err();
        assert!(matches!(err, PipelineError::MissingInput { field: Field::Prompt, .. }));
        assert!(err.is_sample_local());
    }

    #[test]
    fn test_malformed_raster_is_reported() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("broken.png");
        fs::write(&path, b"not a png").unwrap();

        let context = context();
        let mut ctx = SampleContext::new(sample_rng(0, "k", 0, None), 0, &context);
        let mut record = Record::new("k");
        record.insert(Field::ImagePath, Value::Path(path));
        let err = LoadImage::new(Field::ImagePath, Field::Image, 3, ValueRange::SIGNED)
            .apply(&mut record, &mut ctx)
            .unwrap_err();
        assert!(matches!(err, PipelineError::MalformedRaster { .. }));
        assert!(err.is_sample_local());
    }

    #[test]
    fn test_load_text_trims() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("p.txt");
        fs::write(&path, "  a photo of a cat\n").unwrap();

        let context = context();
        let mut ctx = SampleContext::new(sample_rng(0, "k", 0, None), 0, &context);
        let mut record = Record::new("k");
        record.insert(Field::PromptPath, Value::Path(path));
        LoadText::new(Field::PromptPath, Field::Prompt)
            .apply(&mut record, &mut ctx)
            .unwrap();
        assert_eq!(record.text("test", Field::Prompt).unwrap(), "a photo of a cat");
    }

    #[test]
    fn test_generate_depth_is_normalized() {
        let context = context();
        let mut ctx = SampleContext::new(sample_rng(0, "k", 0, None), 0, &context);
        let gray = GrayImage::from_fn(8, 8, |x, _| Luma([(x * 20) as u8]));
        let image = Raster::from_image(
            &image::DynamicImage::ImageLuma8(gray),
            3,
            ValueRange::SIGNED,
        )
        .unwrap();
        let mut record = Record::new("k");
        record.insert(Field::Image, Value::Raster(image));

        GenerateDepth::new(Field::Image, Field::Depth)
            .apply(&mut record, &mut ctx)
            .unwrap();
        let depth = record.raster("test", Field::Depth).unwrap();
        assert_eq!(depth.channels(), 1);
        let (lo, hi) = depth.value_bounds();
        assert!((lo + 1.0).abs() < 1e-5 && (hi - 1.0).abs() < 1e-5);
    }
}
