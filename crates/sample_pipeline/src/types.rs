use std::path::PathBuf;

use image::{DynamicImage, ImageBuffer, Luma, imageops::FilterType};
use sample_kit_common::{CropBox, Resolution, ValueRange};
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

use crate::error::{PipelineError, Result};

/// A planar (CHW) `f32` raster: one image, mask, depth map or latent.
///
/// Deserialization goes through [`Raster::new`], so a restored raster always
/// has a buffer matching its shape.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(try_from = "RasterParts")]
pub struct Raster {
    width: u32,
    height: u32,
    channels: u32,
    data: Vec<f32>,
}

#[derive(Deserialize)]
struct RasterParts {
    width: u32,
    height: u32,
    channels: u32,
    data: Vec<f32>,
}

impl TryFrom<RasterParts> for Raster {
    type Error = PipelineError;

    fn try_from(parts: RasterParts) -> Result<Self> {
        Raster::new(parts.width, parts.height, parts.channels, parts.data)
    }
}

impl Raster {
    /// Wrap planar data, checking that the buffer length matches the shape
    pub fn new(width: u32, height: u32, channels: u32, data: Vec<f32>) -> Result<Self> {
        let expected = width as usize * height as usize * channels as usize;
        if data.len() != expected || channels == 0 {
            return Err(PipelineError::Shape(format!(
                "buffer of {} values does not match {}x{}x{}",
                data.len(),
                channels,
                height,
                width
            )));
        }
        Ok(Self {
            width,
            height,
            channels,
            data,
        })
    }

    /// Shape and buffer taken as given, for exercising corrupt-data paths
    #[cfg(test)]
    pub(crate) fn unchecked(width: u32, height: u32, channels: u32, data: Vec<f32>) -> Self {
        Self {
            width,
            height,
            channels,
            data,
        }
    }

    /// A raster with every value set to `value`
    pub fn filled(width: u32, height: u32, channels: u32, value: f32) -> Self {
        Self {
            width,
            height,
            channels,
            data: vec![value; width as usize * height as usize * channels as usize],
        }
    }

    /// Decode an image into `channels` channels normalized into `range`.
    ///
    /// Three channels replicate gray sources; one channel extracts luminance.
    /// The source bit depth never leaks into the output range.
    pub fn from_image(image: &DynamicImage, channels: u32, range: ValueRange) -> Result<Self> {
        let (width, height) = (image.width(), image.height());
        let interleaved: Vec<f32> = match channels {
            1 => image.to_luma32f().into_raw(),
            3 => image.to_rgb32f().into_raw(),
            4 => image.to_rgba32f().into_raw(),
            other => {
                return Err(PipelineError::Shape(format!(
                    "cannot load an image into {} channels",
                    other
                )));
            }
        };

        let plane_len = width as usize * height as usize;
        let stride = channels as usize;
        let mut data = vec![0.0; plane_len * stride];
        for (i, value) in interleaved.into_iter().enumerate() {
            let channel = i % stride;
            let pixel = i / stride;
            data[channel * plane_len + pixel] = range.from_unit(value);
        }

        Self::new(width, height, channels, data)
    }

    pub fn width(&self) -> u32 {
        self.width
    }

    pub fn height(&self) -> u32 {
        self.height
    }

    pub fn channels(&self) -> u32 {
        self.channels
    }

    pub fn resolution(&self) -> Resolution {
        Resolution::new(self.width, self.height)
    }

    pub fn data(&self) -> &[f32] {
        &self.data
    }

    pub fn into_data(self) -> Vec<f32> {
        self.data
    }

    fn plane_len(&self) -> usize {
        self.width as usize * self.height as usize
    }

    /// One channel as a row-major slice
    pub fn plane(&self, channel: u32) -> &[f32] {
        let len = self.plane_len();
        let start = channel as usize * len;
        &self.data[start..start + len]
    }

    pub fn get(&self, channel: u32, x: u32, y: u32) -> f32 {
        self.data[channel as usize * self.plane_len() + y as usize * self.width as usize + x as usize]
    }

    pub fn set(&mut self, channel: u32, x: u32, y: u32, value: f32) {
        let index =
            channel as usize * self.plane_len() + y as usize * self.width as usize + x as usize;
        self.data[index] = value;
    }

    /// Smallest and largest value over all channels
    pub fn value_bounds(&self) -> (f32, f32) {
        self.data
            .iter()
            .fold((f32::INFINITY, f32::NEG_INFINITY), |(lo, hi), &v| {
                (lo.min(v), hi.max(v))
            })
    }

    /// Copy out the pixels inside `crop_box`, all channels
    pub fn crop(&self, crop_box: &CropBox) -> Result<Raster> {
        if !crop_box.fits_within(self.resolution()) || crop_box.width == 0 || crop_box.height == 0 {
            return Err(PipelineError::Shape(format!(
                "crop {}x{} at ({}, {}) outside raster {}",
                crop_box.width,
                crop_box.height,
                crop_box.x,
                crop_box.y,
                self.resolution()
            )));
        }

        let mut data = Vec::with_capacity(crop_box.area() as usize * self.channels as usize);
        for channel in 0..self.channels {
            let plane = self.plane(channel);
            for y in crop_box.y..crop_box.bottom() {
                let row = y as usize * self.width as usize;
                data.extend_from_slice(&plane[row + crop_box.x as usize..row + crop_box.right() as usize]);
            }
        }
        Raster::new(crop_box.width, crop_box.height, self.channels, data)
    }

    /// Resample every channel to `target` with a triangle (bilinear) filter.
    ///
    /// Each plane is mapped into [0, 1] before resampling and back afterwards,
    /// since the float resampler clamps to the unit range.
    pub fn resize(&self, target: Resolution) -> Result<Raster> {
        if target.is_empty() {
            return Err(PipelineError::Shape(format!("cannot resize to {}", target)));
        }
        if target == self.resolution() {
            return Ok(self.clone());
        }

        let mut data = Vec::with_capacity(target.pixels() as usize * self.channels as usize);
        for channel in 0..self.channels {
            let plane = self.plane(channel);
            let (lo, hi) = plane
                .iter()
                .fold((f32::INFINITY, f32::NEG_INFINITY), |(lo, hi), &v| {
                    (lo.min(v), hi.max(v))
                });
            let span = hi - lo;
            if span <= 0.0 {
                data.extend(std::iter::repeat_n(lo, target.pixels() as usize));
                continue;
            }

            let unit: Vec<f32> = plane.iter().map(|v| (v - lo) / span).collect();
            let buffer: ImageBuffer<Luma<f32>, Vec<f32>> =
                ImageBuffer::from_raw(self.width, self.height, unit).ok_or_else(|| {
                    PipelineError::Shape(format!("plane does not match {}", self.resolution()))
                })?;
            let resized =
                image::imageops::resize(&buffer, target.width, target.height, FilterType::Triangle);
            data.extend(resized.into_raw().into_iter().map(|v| lo + v * span));
        }
        Raster::new(target.width, target.height, self.channels, data)
    }

    /// Reduce each axis by `factor` using an exact area average
    pub fn downscale_area(&self, factor: u32) -> Result<Raster> {
        if factor == 0 || self.width % factor != 0 || self.height % factor != 0 {
            return Err(PipelineError::Shape(format!(
                "{} is not divisible by downscale factor {}",
                self.resolution(),
                factor
            )));
        }
        if factor == 1 {
            return Ok(self.clone());
        }

        let (out_w, out_h) = (self.width / factor, self.height / factor);
        let norm = 1.0 / (factor * factor) as f32;
        let mut data = Vec::with_capacity(out_w as usize * out_h as usize * self.channels as usize);
        for channel in 0..self.channels {
            for by in 0..out_h {
                for bx in 0..out_w {
                    let mut sum = 0.0;
                    for y in by * factor..(by + 1) * factor {
                        for x in bx * factor..(bx + 1) * factor {
                            sum += self.get(channel, x, y);
                        }
                    }
                    data.push(sum * norm);
                }
            }
        }
        Raster::new(out_w, out_h, self.channels, data)
    }

    /// Bounding box of pixels in channel 0 whose value exceeds `threshold`
    pub fn active_bounds(&self, threshold: f32) -> Option<CropBox> {
        let plane = self.plane(0);
        let (mut min_x, mut min_y) = (u32::MAX, u32::MAX);
        let (mut max_x, mut max_y) = (0u32, 0u32);
        let mut found = false;

        for y in 0..self.height {
            for x in 0..self.width {
                if plane[y as usize * self.width as usize + x as usize] > threshold {
                    found = true;
                    min_x = min_x.min(x);
                    min_y = min_y.min(y);
                    max_x = max_x.max(x);
                    max_y = max_y.max(y);
                }
            }
        }

        found.then(|| CropBox::new(min_x, min_y, max_x - min_x + 1, max_y - min_y + 1))
    }
}

/// Parametric encoder output; the draw happens later, in distribution sampling.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(try_from = "DistributionParts")]
pub struct LatentDistribution {
    pub mean: Raster,
    pub log_scale: Raster,
}

#[derive(Deserialize)]
struct DistributionParts {
    mean: Raster,
    log_scale: Raster,
}

impl TryFrom<DistributionParts> for LatentDistribution {
    type Error = PipelineError;

    fn try_from(parts: DistributionParts) -> Result<Self> {
        LatentDistribution::new(parts.mean, parts.log_scale)
    }
}

impl LatentDistribution {
    pub fn new(mean: Raster, log_scale: Raster) -> Result<Self> {
        if mean.resolution() != log_scale.resolution() || mean.channels() != log_scale.channels() {
            return Err(PipelineError::Shape(format!(
                "distribution mean {}x{} and scale {}x{} disagree",
                mean.channels(),
                mean.resolution(),
                log_scale.channels(),
                log_scale.resolution()
            )));
        }
        Ok(Self { mean, log_scale })
    }
}

/// A named group of source samples sharing a directory
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, JsonSchema)]
pub struct Concept {
    /// Concept identity, also used as the instance prompt identifier
    pub name: String,
    /// Directory holding the concept's images, masks and prompt files
    pub path: PathBuf,
    /// Descend into subdirectories when collecting images
    #[serde(default)]
    pub include_subdirectories: bool,
    /// Per-concept override of the accepted image extensions
    #[serde(default)]
    pub extensions: Option<Vec<String>>,
}

impl Concept {
    pub fn new(name: impl Into<String>, path: impl Into<PathBuf>) -> Self {
        Self {
            name: name.into(),
            path: path.into(),
            include_subdirectories: false,
            extensions: None,
        }
    }
}

/// Opaque accelerator handle handed to collaborators.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize, JsonSchema)]
pub struct Device {
    label: String,
}

impl Device {
    pub fn new(label: impl Into<String>) -> Self {
        Self {
            label: label.into(),
        }
    }

    pub fn cpu() -> Self {
        Self::new("cpu")
    }

    pub fn label(&self) -> &str {
        &self.label
    }
}

impl Default for Device {
    fn default() -> Self {
        Self::cpu()
    }
}
