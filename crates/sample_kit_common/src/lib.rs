//! # Sample Kit Common - Shared Types and Utilities
//!
//! Geometry and value types shared by the sample preparation crates: raster
//! resolutions, crop boxes inside a raster, and the numeric range a loaded
//! raster is normalized into.
//!
//! ## Example
//!
//! ```rust
//! use sample_kit_common::{CropBox, Resolution, ValueRange};
//!
//! let resolution = Resolution::new(1024, 768);
//! assert_eq!(resolution.aspect_ratio_tuple(), (4, 3));
//!
//! let full = CropBox::full(resolution);
//! assert!(full.contains(&CropBox::new(100, 100, 401, 301)));
//!
//! let range = ValueRange::new(-1.0, 1.0).unwrap();
//! assert_eq!(range.from_unit(0.5), 0.0);
//! ```

use std::fmt;
use std::str::FromStr;

use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Result type for sample kit operations
pub type Result<T> = std::result::Result<T, SampleKitError>;

/// Standard error type for sample kit operations
#[derive(Error, Debug)]
pub enum SampleKitError {
    #[error("Invalid resolution: {width}x{height}")]
    InvalidResolution { width: u32, height: u32 },

    #[error("Invalid value range: min {min} >= max {max}")]
    InvalidRange { min: f32, max: f32 },

    #[error("Configuration validation failed: {details}")]
    ValidationFailed { details: String },

    #[error("Invalid value: {message}")]
    InvalidValue { message: String },

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("Parse error: {0}")]
    Parse(String),
}

/// A raster size in pixels
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize, JsonSchema,
)]
pub struct Resolution {
    pub width: u32,
    pub height: u32,
}

impl Resolution {
    /// Create a new resolution
    pub const fn new(width: u32, height: u32) -> Self {
        Self { width, height }
    }

    /// Create a resolution, rejecting zero-sized axes
    pub fn checked(width: u32, height: u32) -> Result<Self> {
        if width == 0 || height == 0 {
            return Err(SampleKitError::InvalidResolution { width, height });
        }
        Ok(Self { width, height })
    }

    /// True when either axis is zero
    pub fn is_empty(&self) -> bool {
        self.width == 0 || self.height == 0
    }

    /// Total pixel count
    pub fn pixels(&self) -> u64 {
        self.width as u64 * self.height as u64
    }

    /// Aspect ratio (width / height)
    pub fn aspect_ratio(&self) -> f64 {
        self.width as f64 / self.height as f64
    }

    /// Aspect ratio reduced to its smallest integer terms, e.g. (4, 3)
    pub fn aspect_ratio_tuple(&self) -> (u32, u32) {
        let gcd = gcd(self.width, self.height).max(1);
        (self.width / gcd, self.height / gcd)
    }

    /// Swap width and height
    pub fn transposed(&self) -> Self {
        Self::new(self.height, self.width)
    }

    /// True when both axes are at least as large as `other`
    pub fn covers(&self, other: &Resolution) -> bool {
        self.width >= other.width && self.height >= other.height
    }
}

impl fmt::Display for Resolution {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}x{}", self.width, self.height)
    }
}

impl FromStr for Resolution {
    type Err = SampleKitError;

    /// Parse `WIDTHxHEIGHT`, e.g. `576x448`
    fn from_str(s: &str) -> Result<Self> {
        let (width, height) = s
            .trim()
            .split_once(['x', 'X'])
            .ok_or_else(|| SampleKitError::Parse(format!("Expected WIDTHxHEIGHT, got '{}'", s)))?;
        let width: u32 = width
            .trim()
            .parse()
            .map_err(|_| SampleKitError::Parse(format!("Invalid width in '{}'", s)))?;
        let height: u32 = height
            .trim()
            .parse()
            .map_err(|_| SampleKitError::Parse(format!("Invalid height in '{}'", s)))?;
        Self::checked(width, height)
    }
}

/// Axis-aligned pixel box inside a raster; `x`/`y` is the top-left corner
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, JsonSchema)]
pub struct CropBox {
    pub x: u32,
    pub y: u32,
    pub width: u32,
    pub height: u32,
}

impl CropBox {
    /// Create a new crop box
    pub const fn new(x: u32, y: u32, width: u32, height: u32) -> Self {
        Self {
            x,
            y,
            width,
            height,
        }
    }

    /// A box covering the whole raster
    pub const fn full(resolution: Resolution) -> Self {
        Self::new(0, 0, resolution.width, resolution.height)
    }

    /// Exclusive right edge
    pub fn right(&self) -> u32 {
        self.x + self.width
    }

    /// Exclusive bottom edge
    pub fn bottom(&self) -> u32 {
        self.y + self.height
    }

    /// Size of the box
    pub fn resolution(&self) -> Resolution {
        Resolution::new(self.width, self.height)
    }

    /// Check if `other` lies entirely inside this box
    pub fn contains(&self, other: &CropBox) -> bool {
        other.x >= self.x
            && other.y >= self.y
            && other.right() <= self.right()
            && other.bottom() <= self.bottom()
    }

    /// Check if the box lies inside a raster of the given size
    pub fn fits_within(&self, resolution: Resolution) -> bool {
        self.right() <= resolution.width && self.bottom() <= resolution.height
    }

    /// Get the area of this box
    pub fn area(&self) -> u64 {
        self.width as u64 * self.height as u64
    }
}

/// Closed numeric range a raster's values are normalized into
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize, JsonSchema)]
pub struct ValueRange {
    pub min: f32,
    pub max: f32,
}

impl ValueRange {
    /// Unit range [0, 1], used for masks
    pub const UNIT: ValueRange = ValueRange { min: 0.0, max: 1.0 };
    /// Signed range [-1, 1], used for color images and depth
    pub const SIGNED: ValueRange = ValueRange {
        min: -1.0,
        max: 1.0,
    };

    /// Create a new value range
    pub fn new(min: f32, max: f32) -> Result<Self> {
        if !(min < max) || !min.is_finite() || !max.is_finite() {
            return Err(SampleKitError::InvalidRange { min, max });
        }
        Ok(Self { min, max })
    }

    /// Width of the range
    pub fn span(&self) -> f32 {
        self.max - self.min
    }

    /// Map a value in [0, 1] into this range, clamping out-of-range input
    pub fn from_unit(&self, value: f32) -> f32 {
        self.min + value.clamp(0.0, 1.0) * self.span()
    }

    /// Check if a value lies within the range
    pub fn contains(&self, value: f32) -> bool {
        value >= self.min && value <= self.max
    }
}

/// Path helpers shared by path discovery and derivation
pub mod utils {
    use std::ffi::{OsStr, OsString};
    use std::path::{Path, PathBuf};

    /// Normalize an extension to its lowercase form without a leading dot
    pub fn normalize_extension(extension: &str) -> String {
        extension.trim_start_matches('.').to_lowercase()
    }

    /// Check whether a path carries one of the given extensions (case-insensitive,
    /// with or without the leading dot)
    pub fn has_extension(path: &Path, extensions: &[String]) -> bool {
        match path.extension().and_then(|ext| ext.to_str()) {
            Some(ext) => {
                let ext = ext.to_lowercase();
                extensions.iter().any(|candidate| normalize_extension(candidate) == ext)
            }
            None => false,
        }
    }

    /// Check whether the file stem ends with the given postfix. Compared on
    /// the raw OS bytes, so stems that are not valid UTF-8 still match.
    pub fn stem_has_postfix(path: &Path, postfix: &str) -> bool {
        if postfix.is_empty() {
            return false;
        }
        path.file_stem()
            .map(|stem| stem.as_encoded_bytes().ends_with(postfix.as_bytes()))
            .unwrap_or(false)
    }

    /// Derive a sibling path by appending `postfix` to the stem and replacing the
    /// extension. Pure name transformation on the OS string; nothing is checked
    /// on disk.
    pub fn with_postfix_extension(path: &Path, postfix: &str, extension: &str) -> PathBuf {
        let mut file_name: OsString = path.file_stem().map(OsStr::to_os_string).unwrap_or_default();
        file_name.push(postfix);
        let extension = extension.trim_start_matches('.');
        if !extension.is_empty() {
            file_name.push(".");
            file_name.push(extension);
        }
        path.with_file_name(file_name)
    }
}

/// Calculate greatest common divisor
fn gcd(a: u32, b: u32) -> u32 {
    if b == 0 {
        a
    } else {
        gcd(b, a % b)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::path::{Path, PathBuf};

    #[test]
    fn test_resolution_basics() {
        let resolution = Resolution::new(1024, 768);
        assert_eq!(resolution.pixels(), 786_432);
        assert_eq!(resolution.aspect_ratio_tuple(), (4, 3));
        assert!((resolution.aspect_ratio() - 4.0 / 3.0).abs() < 1e-9);
        assert_eq!(resolution.transposed(), Resolution::new(768, 1024));
        assert!(resolution.covers(&Resolution::new(576, 448)));
        assert!(!Resolution::new(500, 800).covers(&Resolution::new(576, 448)));
    }

    #[test]
    fn test_resolution_parse() {
        assert_eq!("576x448".parse::<Resolution>().unwrap(), Resolution::new(576, 448));
        assert_eq!(Resolution::new(576, 448).to_string(), "576x448");
        assert!("576".parse::<Resolution>().is_err());
        assert!("0x448".parse::<Resolution>().is_err());
    }

    #[test]
    fn test_crop_box_contains() {
        let outer = CropBox::new(10, 20, 100, 50);
        assert!(outer.contains(&CropBox::new(10, 20, 100, 50)));
        assert!(outer.contains(&CropBox::new(50, 30, 10, 10)));
        assert!(!outer.contains(&CropBox::new(5, 30, 10, 10)));
        assert!(!outer.contains(&CropBox::new(100, 60, 20, 20)));
        assert_eq!(outer.area(), 5000);
        assert!(outer.fits_within(Resolution::new(110, 70)));
        assert!(!outer.fits_within(Resolution::new(109, 70)));
    }

    #[test]
    fn test_value_range() {
        assert!(ValueRange::new(1.0, -1.0).is_err());
        assert!(ValueRange::new(0.0, 0.0).is_err());
        let range = ValueRange::SIGNED;
        assert_eq!(range.from_unit(0.0), -1.0);
        assert_eq!(range.from_unit(1.0), 1.0);
        assert_eq!(range.from_unit(7.0), 1.0);
        assert!(range.contains(0.25));
        assert!(!range.contains(1.5));
    }

    #[test]
    fn test_path_utilities() {
        let exts = vec![".png".to_string(), "JPG".to_string()];
        assert!(utils::has_extension(Path::new("a/b.PNG"), &exts));
        assert!(utils::has_extension(Path::new("a/b.jpg"), &exts));
        assert!(!utils::has_extension(Path::new("a/b.txt"), &exts));
        assert!(!utils::has_extension(Path::new("a/b"), &exts));

        assert!(utils::stem_has_postfix(Path::new("a/b-masklabel.png"), "-masklabel"));
        assert!(!utils::stem_has_postfix(Path::new("a/b.png"), "-masklabel"));
        assert!(!utils::stem_has_postfix(Path::new("a/b.png"), ""));
    }

    #[cfg(unix)]
    #[test]
    fn test_path_utilities_keep_non_utf8_stems() {
        use std::ffi::OsStr;
        use std::os::unix::ffi::OsStrExt;

        let dir = Path::new("data");
        let image = dir.join(OsStr::from_bytes(b"caf\xe9.png"));
        let mask = dir.join(OsStr::from_bytes(b"caf\xe9-masklabel.png"));
        assert!(utils::stem_has_postfix(&mask, "-masklabel"));
        assert!(!utils::stem_has_postfix(&image, "-masklabel"));

        assert_eq!(utils::with_postfix_extension(&image, "-masklabel", ".png"), mask);
        assert_eq!(
            utils::with_postfix_extension(&image, "", "txt"),
            dir.join(OsStr::from_bytes(b"caf\xe9.txt"))
        );
    }

    #[test]
    fn test_with_postfix_extension() {
        let image = Path::new("data/cat/001.jpg");
        assert_eq!(
            utils::with_postfix_extension(image, "-masklabel", ".png"),
            PathBuf::from("data/cat/001-masklabel.png")
        );
        assert_eq!(
            utils::with_postfix_extension(image, "", "txt"),
            PathBuf::from("data/cat/001.txt")
        );
    }
}
