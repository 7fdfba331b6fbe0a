use std::cmp::Ordering;

use sample_kit_common::{CropBox, Resolution};
use serde::{Deserialize, Serialize};

use crate::{
    error::{PipelineError, Result},
    record::{Field, Record, Value},
    traits::{SampleContext, Stage},
};

/// Landscape aspect ratios (width / height); portrait buckets use the reciprocals
pub const ASPECT_LADDER: [f64; 9] = [1.0, 1.25, 1.5, 1.75, 2.0, 2.5, 3.0, 3.5, 4.0];

/// Bucket chosen for one source resolution
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct BucketAssignment {
    /// Aspect-preserving size that covers `crop` on both axes
    pub scale: Resolution,
    /// The bucket itself
    pub crop: Resolution,
}

impl BucketAssignment {
    /// Fraction of the scaled area discarded by the crop
    pub fn crop_loss(&self) -> f64 {
        1.0 - self.crop.pixels() as f64 / self.scale.pixels() as f64
    }
}

/// Classifies resolutions into a fixed family of stride-aligned buckets
/// with roughly `target_resolution²` pixels each.
#[derive(Debug, Clone)]
pub struct AspectBucketer {
    target_resolution: u32,
    stride: u32,
    max_crop_loss: f64,
    candidates: Vec<Resolution>,
}

impl AspectBucketer {
    pub fn new(target_resolution: u32, stride: u32, max_crop_loss: f64) -> Result<Self> {
        if target_resolution == 0 || stride == 0 {
            return Err(PipelineError::Config(format!(
                "bucketing needs a positive target and stride, got {} and {}",
                target_resolution, stride
            )));
        }

        let snap = |value: f64| -> u32 {
            let steps = (value / stride as f64).round().max(1.0) as u32;
            steps * stride
        };

        let mut candidates = Vec::with_capacity(ASPECT_LADDER.len() * 2);
        for aspect in ASPECT_LADDER {
            for aspect in [aspect, 1.0 / aspect] {
                let root = aspect.sqrt();
                let target = target_resolution as f64;
                candidates.push(Resolution::new(snap(target * root), snap(target / root)));
            }
        }
        candidates.sort();
        candidates.dedup();

        Ok(Self {
            target_resolution,
            stride,
            max_crop_loss,
            candidates,
        })
    }

    /// Every bucket this bucketer can assign
    pub fn candidates(&self) -> &[Resolution] {
        &self.candidates
    }

    pub fn stride(&self) -> u32 {
        self.stride
    }

    pub fn target_resolution(&self) -> u32 {
        self.target_resolution
    }

    /// Candidate with the nearest aspect ratio, then the nearest pixel count,
    /// then the smaller width
    pub fn nearest(&self, original: Resolution) -> Result<Resolution> {
        if original.is_empty() {
            return Err(PipelineError::Bucket {
                resolution: original,
                reason: "zero-sized raster".to_string(),
            });
        }

        let native = original.aspect_ratio().ln();
        let budget = self.target_resolution as f64 * self.target_resolution as f64;
        let score = |candidate: &Resolution| {
            (
                (native - candidate.aspect_ratio().ln()).abs(),
                (candidate.pixels() as f64 - budget).abs(),
                candidate.width,
            )
        };

        self.candidates
            .iter()
            .copied()
            .min_by(|a, b| {
                let (a_aspect, a_pixels, a_width) = score(a);
                let (b_aspect, b_pixels, b_width) = score(b);
                a_aspect
                    .total_cmp(&b_aspect)
                    .then(a_pixels.total_cmp(&b_pixels))
                    .then(a_width.cmp(&b_width))
            })
            .ok_or_else(|| PipelineError::Bucket {
                resolution: original,
                reason: "no candidate buckets".to_string(),
            })
    }

    /// Bucket plus the scale resolution that reaches it by a covering crop
    pub fn assign(&self, original: Resolution) -> Result<BucketAssignment> {
        let crop = self.nearest(original)?;
        let scale = scale_to_cover(original, crop);
        let assignment = BucketAssignment { scale, crop };

        let loss = assignment.crop_loss();
        if loss.partial_cmp(&self.max_crop_loss) == Some(Ordering::Greater) {
            return Err(PipelineError::Bucket {
                resolution: original,
                reason: format!(
                    "bucket {} would discard {:.0}% of the image",
                    crop,
                    loss * 100.0
                ),
            });
        }
        Ok(assignment)
    }
}

/// Smallest aspect-preserving size of `original` covering `crop` on both axes
pub fn scale_to_cover(original: Resolution, crop: Resolution) -> Resolution {
    let (w, h) = (original.width as f64, original.height as f64);
    let s = (crop.width as f64 / w).max(crop.height as f64 / h);
    let axis = |value: f64, floor: u32| ((value * s - 1e-9).ceil() as u32).max(floor);
    Resolution::new(axis(w, crop.width), axis(h, crop.height))
}

/// Centered crop of `crop` inside `scale`
pub fn center_crop_box(scale: Resolution, crop: Resolution) -> CropBox {
    CropBox::new(
        scale.width.saturating_sub(crop.width) / 2,
        scale.height.saturating_sub(crop.height) / 2,
        crop.width,
        crop.height,
    )
}

/// Records the native size of a raster
#[derive(Debug, Clone)]
pub struct CalcAspect {
    pub input: Field,
    pub output: Field,
}

impl CalcAspect {
    pub fn new(input: Field, output: Field) -> Self {
        Self { input, output }
    }
}

impl Stage for CalcAspect {
    fn name(&self) -> &'static str {
        "calc_aspect"
    }

    fn requires(&self) -> Vec<Field> {
        vec![self.input]
    }

    fn produces(&self) -> Vec<Field> {
        vec![self.output]
    }

    fn apply(&self, record: &mut Record, _ctx: &mut SampleContext<'_>) -> Result<()> {
        let resolution = record.raster(self.name(), self.input)?.resolution();
        record.insert(self.output, Value::Resolution(resolution));
        Ok(())
    }
}

/// Assigns scale and crop resolution from the original resolution
#[derive(Debug, Clone)]
pub struct AspectBucketing {
    pub bucketer: AspectBucketer,
}

impl AspectBucketing {
    pub fn new(bucketer: AspectBucketer) -> Self {
        Self { bucketer }
    }
}

impl Stage for AspectBucketing {
    fn name(&self) -> &'static str {
        "aspect_bucketing"
    }

    fn requires(&self) -> Vec<Field> {
        vec![Field::OriginalResolution]
    }

    fn produces(&self) -> Vec<Field> {
        vec![Field::ScaleResolution, Field::CropResolution]
    }

    fn apply(&self, record: &mut Record, _ctx: &mut SampleContext<'_>) -> Result<()> {
        let original = *record.resolution(self.name(), Field::OriginalResolution)?;
        let assignment = self.bucketer.assign(original)?;
        record.insert(Field::ScaleResolution, Value::Resolution(assignment.scale));
        record.insert(Field::CropResolution, Value::Resolution(assignment.crop));
        Ok(())
    }
}

/// Resizes each field to the scale resolution, then center-crops it to the
/// bucket. Every field of a sample gets the same filter and offset.
#[derive(Debug, Clone)]
pub struct ScaleCropImage {
    pub fields: Vec<Field>,
}

impl ScaleCropImage {
    pub fn new(fields: Vec<Field>) -> Self {
        Self { fields }
    }
}

impl Stage for ScaleCropImage {
    fn name(&self) -> &'static str {
        "scale_crop_image"
    }

    fn requires(&self) -> Vec<Field> {
        let mut fields = self.fields.clone();
        fields.extend([Field::ScaleResolution, Field::CropResolution]);
        fields
    }

    fn produces(&self) -> Vec<Field> {
        self.fields.clone()
    }

    fn apply(&self, record: &mut Record, _ctx: &mut SampleContext<'_>) -> Result<()> {
        let scale = *record.resolution(self.name(), Field::ScaleResolution)?;
        let crop = *record.resolution(self.name(), Field::CropResolution)?;
        let crop_box = center_crop_box(scale, crop);

        for field in &self.fields {
            let resized = record.raster(self.name(), *field)?.resize(scale)?;
            record.insert(*field, Value::Raster(resized.crop(&crop_box)?));
        }
        Ok(())
    }
}
