//! Lightweight reference collaborators.
//!
//! These stand in for real models in the CLI and in tests: they honor the
//! collaborator contracts (shapes, ranges, determinism) without any weights.

use std::sync::Arc;

use sha2::{Digest, Sha256};

use crate::{
    error::{PipelineError, Result},
    traits::{DepthEstimator, LatentEncoder, PipelineContext, Tokenizer},
    types::{Device, LatentDistribution, Raster},
};

/// Smallest scale reported by [`AreaPoolEncoder`]
const MIN_SCALE: f32 = 1e-3;

/// Encodes by area pooling: each latent cell is the mean of its source block,
/// with the log of the block's standard deviation as the scale.
#[derive(Debug, Clone)]
pub struct AreaPoolEncoder {
    pub latent_channels: u32,
    pub downsample_factor: u32,
}

impl AreaPoolEncoder {
    pub fn new(latent_channels: u32, downsample_factor: u32) -> Self {
        Self {
            latent_channels,
            downsample_factor,
        }
    }
}

impl LatentEncoder for AreaPoolEncoder {
    fn identity(&self) -> String {
        format!("area-pool/c{}/f{}", self.latent_channels, self.downsample_factor)
    }

    fn downsample_factor(&self) -> u32 {
        self.downsample_factor
    }

    fn latent_channels(&self) -> u32 {
        self.latent_channels
    }

    fn encode(&self, raster: &Raster, _device: &Device) -> Result<LatentDistribution> {
        let factor = self.downsample_factor;
        if factor == 0 || raster.width() % factor != 0 || raster.height() % factor != 0 {
            return Err(PipelineError::Collaborator {
                name: self.identity(),
                message: format!("{} is not divisible by {}", raster.resolution(), factor),
            });
        }

        let (out_w, out_h) = (raster.width() / factor, raster.height() / factor);
        let cells = out_w as usize * out_h as usize;
        let block = (factor * factor) as f32;
        let mut mean = Vec::with_capacity(cells * self.latent_channels as usize);
        let mut log_scale = Vec::with_capacity(cells * self.latent_channels as usize);

        for k in 0..self.latent_channels {
            let source = k % raster.channels();
            for by in 0..out_h {
                for bx in 0..out_w {
                    let (mut sum, mut sum_sq) = (0.0f32, 0.0f32);
                    for y in by * factor..(by + 1) * factor {
                        for x in bx * factor..(bx + 1) * factor {
                            let v = raster.get(source, x, y);
                            sum += v;
                            sum_sq += v * v;
                        }
                    }
                    let mu = sum / block;
                    let variance = (sum_sq / block - mu * mu).max(0.0);
                    mean.push(mu);
                    log_scale.push(variance.sqrt().max(MIN_SCALE).ln());
                }
            }
        }

        LatentDistribution::new(
            Raster::new(out_w, out_h, self.latent_channels, mean)?,
            Raster::new(out_w, out_h, self.latent_channels, log_scale)?,
        )
    }

    fn decode(&self, latent: &Raster, _device: &Device) -> Result<Raster> {
        let factor = self.downsample_factor.max(1);
        let (w, h) = (latent.width() * factor, latent.height() * factor);
        let mut out = Raster::filled(w, h, 3, 0.0);
        for c in 0..3 {
            let source = c % latent.channels();
            for y in 0..h {
                for x in 0..w {
                    let v = latent.get(source, x / factor, y / factor);
                    out.set(c, x, y, v.clamp(-1.0, 1.0));
                }
            }
        }
        Ok(out)
    }
}

/// Uses luminance as a pseudo depth: brighter reads as nearer
#[derive(Debug, Clone, Default)]
pub struct LuminanceDepthEstimator;

impl DepthEstimator for LuminanceDepthEstimator {
    fn identity(&self) -> String {
        "luminance-depth".to_string()
    }

    fn estimate(&self, image: &Raster, _device: &Device) -> Result<Raster> {
        let (w, h) = (image.width(), image.height());
        let data = match image.channels() {
            1 | 2 => image.plane(0).to_vec(),
            _ => {
                let (r, g, b) = (image.plane(0), image.plane(1), image.plane(2));
                r.iter()
                    .zip(g)
                    .zip(b)
                    .map(|((r, g), b)| 0.299 * r + 0.587 * g + 0.114 * b)
                    .collect()
            }
        };
        Raster::new(w, h, 1, data)
    }
}

/// Whitespace tokenizer hashing lowercased words into a fixed vocabulary.
///
/// Output is always `max_length` ids: BOS, words, EOS, then padding.
#[derive(Debug, Clone)]
pub struct HashTokenizer {
    pub max_length: usize,
    pub vocab_size: u32,
}

impl HashTokenizer {
    pub const PAD: u32 = 0;
    pub const BOS: u32 = 1;
    pub const EOS: u32 = 2;
    /// Ids below this are special tokens
    pub const RESERVED: u32 = 3;

    pub fn new(max_length: usize, vocab_size: u32) -> Self {
        Self {
            max_length,
            vocab_size,
        }
    }

    fn word_id(&self, word: &str) -> u32 {
        let digest = Sha256::digest(word.as_bytes());
        let mut head = [0u8; 4];
        head.copy_from_slice(&digest[..4]);
        Self::RESERVED + u32::from_le_bytes(head) % (self.vocab_size - Self::RESERVED)
    }
}

impl Tokenizer for HashTokenizer {
    fn identity(&self) -> String {
        format!("hash-tokenizer/l{}/v{}", self.max_length, self.vocab_size)
    }

    fn tokenize(&self, text: &str) -> Result<Vec<u32>> {
        if self.max_length < 2 || self.vocab_size <= Self::RESERVED {
            return Err(PipelineError::Collaborator {
                name: self.identity(),
                message: "needs max_length >= 2 and vocab_size > 3".to_string(),
            });
        }

        let mut ids = Vec::with_capacity(self.max_length);
        ids.push(Self::BOS);
        ids.extend(
            text.split_whitespace()
                .map(|word| self.word_id(&word.to_lowercase()))
                .take(self.max_length - 2),
        );
        ids.push(Self::EOS);
        ids.resize(self.max_length, Self::PAD);
        Ok(ids)
    }
}

/// A CPU context wired with every reference collaborator
pub fn reference_context(
    latent_channels: u32,
    downsample_factor: u32,
    max_length: usize,
    vocab_size: u32,
) -> PipelineContext {
    PipelineContext::new(
        Device::cpu(),
        Arc::new(AreaPoolEncoder::new(latent_channels, downsample_factor)),
        Arc::new(HashTokenizer::new(max_length, vocab_size)),
    )
    .with_depth_estimator(Arc::new(LuminanceDepthEstimator))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_area_pool_round_trip_shape() {
        let encoder = AreaPoolEncoder::new(4, 8);
        let image = Raster::filled(64, 32, 3, 0.5);
        let distribution = encoder.encode(&image, &Device::cpu()).unwrap();
        assert_eq!(distribution.mean.resolution().to_string(), "8x4");
        assert_eq!(distribution.mean.channels(), 4);
        assert_eq!(distribution.mean.value_bounds(), (0.5, 0.5));
        assert_eq!(distribution.log_scale.value_bounds().0, MIN_SCALE.ln());

        let decoded = encoder.decode(&distribution.mean, &Device::cpu()).unwrap();
        assert_eq!(decoded.resolution(), image.resolution());
        assert_eq!(decoded.channels(), 3);

        assert!(encoder.encode(&Raster::filled(60, 32, 3, 0.0), &Device::cpu()).is_err());
    }

    #[test]
    fn test_hash_tokenizer_layout() {
        let tokenizer = HashTokenizer::new(6, 1000);
        let ids = tokenizer.tokenize("A cat").unwrap();
        assert_eq!(ids.len(), 6);
        assert_eq!(ids[0], HashTokenizer::BOS);
        assert_eq!(ids[3], HashTokenizer::EOS);
        assert_eq!(&ids[4..], &[HashTokenizer::PAD, HashTokenizer::PAD]);
        assert_eq!(ids, tokenizer.tokenize("a   CAT").unwrap());
        assert!(ids[1..3].iter().all(|id| (3..1000).contains(id)));

        let long = tokenizer.tokenize("one two three four five six seven").unwrap();
        assert_eq!(long.len(), 6);
        assert_eq!(long[5], HashTokenizer::EOS);
    }

    #[test]
    fn test_luminance_depth_shape() {
        let depth = LuminanceDepthEstimator
            .estimate(&Raster::filled(5, 3, 3, 1.0), &Device::cpu())
            .unwrap();
        assert_eq!(depth.channels(), 1);
        assert_eq!(depth.resolution().to_string(), "5x3");
    }

    #[test]
    fn test_reference_context_identities() {
        let context = reference_context(4, 8, 16, 256);
        let identities = context.identities();
        assert_eq!(identities.len(), 4);
        assert!(identities.iter().any(|id| id == "encoder:area-pool/c4/f8"));
    }
}
