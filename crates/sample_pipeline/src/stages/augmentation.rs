use image::{ImageBuffer, Luma, imageops};
use imageproc::geometric_transformations::{Interpolation, rotate_about_center};
use rand::Rng;
use sample_kit_common::{CropBox, Resolution};

use crate::{
    error::{PipelineError, Result},
    record::{Field, Record, Value},
    traits::{SampleContext, Stage},
    types::Raster,
};

/// Mask values above this count as part of the region of interest
pub const ACTIVE_MASK_THRESHOLD: f32 = 0.5;

/// How samples outside the source raster are resolved during rotation
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Border {
    /// Outside samples read as zero
    Zero,
    /// Outside samples read the nearest edge pixel
    Clamp,
}

/// Rotates the mask and its co-registered fields by one random angle, then
/// crops all of them to the padded bounding box of the active mask region.
#[derive(Debug, Clone)]
pub struct RandomMaskRotateCrop {
    pub mask: Field,
    pub additional: Vec<Field>,
    pub min_padding_percent: f32,
    pub max_padding_percent: f32,
    pub max_rotate_angle: f32,
    pub min_size: u32,
}

impl RandomMaskRotateCrop {
    pub fn new(mask: Field, additional: Vec<Field>) -> Self {
        Self {
            mask,
            additional,
            min_padding_percent: 10.0,
            max_padding_percent: 30.0,
            max_rotate_angle: 20.0,
            min_size: 512,
        }
    }

    pub fn with_padding(mut self, min_percent: f32, max_percent: f32) -> Self {
        self.min_padding_percent = min_percent;
        self.max_padding_percent = max_percent;
        self
    }

    pub fn with_max_rotate_angle(mut self, degrees: f32) -> Self {
        self.max_rotate_angle = degrees;
        self
    }

    pub fn with_min_size(mut self, min_size: u32) -> Self {
        self.min_size = min_size;
        self
    }

    /// Final crop box for a (possibly rotated) mask given the four padding
    /// percentages in left, top, right, bottom order.
    pub fn crop_box(&self, mask: &Raster, padding: [f32; 4]) -> CropBox {
        let bounds = mask.resolution();
        let active = mask
            .active_bounds(ACTIVE_MASK_THRESHOLD)
            .unwrap_or_else(|| CropBox::full(bounds));
        let padded = padded_box(&active, padding, bounds);
        let (x, width) = grow_to_min(padded.x, padded.width, self.min_size, bounds.width);
        let (y, height) = grow_to_min(padded.y, padded.height, self.min_size, bounds.height);
        CropBox::new(x, y, width, height)
    }
}

impl Stage for RandomMaskRotateCrop {
    fn name(&self) -> &'static str {
        "random_mask_rotate_crop"
    }

    fn requires(&self) -> Vec<Field> {
        let mut fields = vec![self.mask];
        fields.extend(self.additional.iter().copied());
        fields
    }

    fn produces(&self) -> Vec<Field> {
        self.requires()
    }

    fn apply(&self, record: &mut Record, ctx: &mut SampleContext<'_>) -> Result<()> {
        let mask = record.raster(self.name(), self.mask)?;
        let resolution = mask.resolution();
        for field in &self.additional {
            let other = record.raster(self.name(), *field)?;
            if other.resolution() != resolution {
                return Err(PipelineError::Shape(format!(
                    "{} is {} but {} is {}",
                    field,
                    other.resolution(),
                    self.mask,
                    resolution
                )));
            }
        }

        if !(self.min_padding_percent >= 0.0 && self.min_padding_percent <= self.max_padding_percent) {
            return Err(PipelineError::Config(format!(
                "padding range {}%..{}% is empty or negative",
                self.min_padding_percent, self.max_padding_percent
            )));
        }

        let angle = if self.max_rotate_angle > 0.0 {
            ctx.rng
                .random_range(-self.max_rotate_angle..=self.max_rotate_angle)
        } else {
            0.0
        };
        let mut padding = [0.0f32; 4];
        for side in padding.iter_mut() {
            *side = ctx
                .rng
                .random_range(self.min_padding_percent..=self.max_padding_percent);
        }

        let mask = rotate(mask, angle, Border::Zero)?;
        let crop_box = self.crop_box(&mask, padding);
        record.insert(self.mask, Value::Raster(mask.crop(&crop_box)?));

        for field in &self.additional {
            let rotated = rotate(record.raster(self.name(), *field)?, angle, Border::Clamp)?;
            record.insert(*field, Value::Raster(rotated.crop(&crop_box)?));
        }
        Ok(())
    }
}

/// Expand `bbox` by a percentage of its own extent on each side
/// (left, top, right, bottom), clamped to `bounds`.
pub fn padded_box(bbox: &CropBox, padding: [f32; 4], bounds: Resolution) -> CropBox {
    let pad = |extent: u32, percent: f32| (extent as f32 * percent / 100.0).round() as u32;
    let [left, top, right, bottom] = padding;

    let x0 = bbox.x.saturating_sub(pad(bbox.width, left));
    let y0 = bbox.y.saturating_sub(pad(bbox.height, top));
    let x1 = (bbox.right() + pad(bbox.width, right)).min(bounds.width);
    let y1 = (bbox.bottom() + pad(bbox.height, bottom)).min(bounds.height);
    CropBox::new(x0, y0, x1 - x0, y1 - y0)
}

/// Grow the span `[start, start + len)` symmetrically to at least `min_len`,
/// shifting it when it hits `0` or `limit`. Never exceeds `limit`.
pub fn grow_to_min(start: u32, len: u32, min_len: u32, limit: u32) -> (u32, u32) {
    let target = min_len.min(limit);
    if len >= target {
        return (start, len);
    }

    let deficit = (target - len) as i64;
    let mut lo = start as i64 - deficit / 2;
    let mut hi = start as i64 + len as i64 + (deficit - deficit / 2);
    if lo < 0 {
        hi -= lo;
        lo = 0;
    }
    if hi > limit as i64 {
        lo -= hi - limit as i64;
        hi = limit as i64;
    }
    let lo = lo.max(0);
    (lo as u32, (hi - lo) as u32)
}

/// Rotate every channel by `degrees` about the raster center with bilinear
/// interpolation.
///
/// imageproc fills pre-images outside the source with a constant, which is
/// what `Border::Zero` wants. For `Border::Clamp` each plane is first padded
/// with replicated edge pixels far enough that every pre-image lands inside,
/// rotated, then cropped back.
fn rotate(raster: &Raster, degrees: f32, border: Border) -> Result<Raster> {
    if degrees == 0.0 {
        return Ok(raster.clone());
    }

    let (w, h) = (raster.width(), raster.height());
    let theta = degrees.to_radians();
    let margin = match border {
        Border::Zero => 0,
        Border::Clamp => {
            let half_diagonal = ((w as f32).hypot(h as f32)) / 2.0;
            (half_diagonal - w.min(h) as f32 / 2.0).ceil() as u32 + 2
        }
    };

    let mut data = Vec::with_capacity(raster.data().len());
    for channel in 0..raster.channels() {
        let plane: ImageBuffer<Luma<f32>, Vec<f32>> = if margin == 0 {
            ImageBuffer::from_raw(w, h, raster.plane(channel).to_vec()).ok_or_else(|| {
                PipelineError::Shape(format!("plane does not match {}", raster.resolution()))
            })?
        } else {
            ImageBuffer::from_fn(w + 2 * margin, h + 2 * margin, |x, y| {
                let sx = x.saturating_sub(margin).min(w - 1);
                let sy = y.saturating_sub(margin).min(h - 1);
                Luma([raster.get(channel, sx, sy)])
            })
        };

        let rotated = rotate_about_center(&plane, theta, Interpolation::Bilinear, Luma([0.0]));
        if margin == 0 {
            data.extend(rotated.into_raw());
        } else {
            let window = imageops::crop_imm(&rotated, margin, margin, w, h).to_image();
            data.extend(window.into_raw());
        }
    }
    Raster::new(w, h, raster.channels(), data)
}
