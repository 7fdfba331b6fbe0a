use std::collections::BTreeMap;

use rand::{SeedableRng, rngs::StdRng, seq::SliceRandom};
use sample_kit_common::Resolution;
use serde::{Deserialize, Serialize};

use crate::{
    config::RemainderPolicy,
    error::{PipelineError, Result},
    hash::derive_seed,
    record::{Field, Record, Value},
};

/// One batch to be loaded: members share the crop resolution
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BatchPlanEntry {
    pub crop_resolution: Resolution,
    pub keys: Vec<String>,
}

/// A contiguous row-major buffer with its shape
#[derive(Debug, Clone, PartialEq)]
pub struct Tensor<T> {
    pub shape: Vec<usize>,
    pub data: Vec<T>,
}

/// Same-resolution samples ready for the training loop
#[derive(Debug, Clone, PartialEq)]
pub struct Batch {
    pub crop_resolution: Resolution,
    pub records: Vec<Record>,
}

impl Batch {
    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    pub fn keys(&self) -> Vec<&str> {
        self.records.iter().map(|r| r.key()).collect()
    }

    /// Values of `field` across the batch, in member order
    pub fn values(&self, field: Field) -> Result<Vec<&Value>> {
        self.records
            .iter()
            .map(|r| r.require("batch", field))
            .collect()
    }

    /// Stack a raster field into an NCHW buffer
    pub fn stack(&self, field: Field) -> Result<Tensor<f32>> {
        let mut shape = None;
        let mut data = Vec::new();
        for record in &self.records {
            let raster = record.raster("batch", field)?;
            let dims = (raster.channels() as usize, raster.height() as usize, raster.width() as usize);
            match shape {
                None => shape = Some(dims),
                Some(first) if first != dims => {
                    return Err(PipelineError::Shape(format!(
                        "{} of {} is {:?}, expected {:?}",
                        field,
                        record.key(),
                        dims,
                        first
                    )));
                }
                Some(_) => {}
            }
            data.extend_from_slice(raster.data());
        }

        let (c, h, w) = shape.unwrap_or((0, 0, 0));
        Ok(Tensor {
            shape: vec![self.records.len(), c, h, w],
            data,
        })
    }

    /// Stack a token field into an `[N, L]` buffer
    pub fn stack_tokens(&self, field: Field) -> Result<Tensor<u32>> {
        let mut length = None;
        let mut data = Vec::new();
        for record in &self.records {
            let tokens = record.tokens("batch", field)?;
            match length {
                None => length = Some(tokens.len()),
                Some(first) if first != tokens.len() => {
                    return Err(PipelineError::Shape(format!(
                        "{} of {} has {} ids, expected {}",
                        field,
                        record.key(),
                        tokens.len(),
                        first
                    )));
                }
                Some(_) => {}
            }
            data.extend_from_slice(tokens);
        }
        Ok(Tensor {
            shape: vec![self.records.len(), length.unwrap_or(0)],
            data,
        })
    }
}

/// Groups samples into batches whose members share one crop resolution
#[derive(Debug, Clone)]
pub struct AspectBatchSorting {
    pub batch_size: usize,
    pub remainder: RemainderPolicy,
    pub shuffle: bool,
    pub seed: u64,
    /// Fields kept on every emitted record
    pub fields: Vec<Field>,
}

impl AspectBatchSorting {
    pub fn new(batch_size: usize, fields: Vec<Field>) -> Self {
        Self {
            batch_size,
            remainder: RemainderPolicy::Drop,
            shuffle: false,
            seed: 0,
            fields,
        }
    }

    pub fn with_remainder(mut self, remainder: RemainderPolicy) -> Self {
        self.remainder = remainder;
        self
    }

    pub fn with_shuffle(mut self, shuffle: bool, seed: u64) -> Self {
        self.shuffle = shuffle;
        self.seed = seed;
        self
    }

    /// Batch plan for one epoch from `(key, crop resolution)` pairs.
    ///
    /// Buckets are visited in resolution order and members in key order,
    /// unless shuffling is on, in which case both are permuted by a seed
    /// derived from the epoch.
    pub fn plan(&self, samples: &[(String, Resolution)], epoch: u64) -> Vec<BatchPlanEntry> {
        let mut buckets: BTreeMap<Resolution, Vec<String>> = BTreeMap::new();
        for (key, resolution) in samples {
            buckets.entry(*resolution).or_default().push(key.clone());
        }

        let epoch_bytes = epoch.to_le_bytes();
        let mut rng = StdRng::seed_from_u64(derive_seed(
            self.seed,
            &[b"batch-order".as_slice(), epoch_bytes.as_slice()],
        ));

        let size = self.batch_size.max(1);
        let mut plan = Vec::new();
        for (resolution, mut keys) in buckets {
            keys.sort();
            keys.dedup();
            if self.shuffle {
                keys.shuffle(&mut rng);
            }

            for chunk in keys.chunks(size) {
                let keys = if chunk.len() == size {
                    chunk.to_vec()
                } else {
                    match self.remainder {
                        RemainderPolicy::Drop => continue,
                        RemainderPolicy::Emit => chunk.to_vec(),
                        RemainderPolicy::Repeat => {
                            let mut filled = chunk.to_vec();
                            filled.extend(keys.iter().cycle().take(size - chunk.len()).cloned());
                            filled
                        }
                    }
                };
                plan.push(BatchPlanEntry {
                    crop_resolution: resolution,
                    keys,
                });
            }
        }

        if self.shuffle {
            plan.shuffle(&mut rng);
        }
        plan
    }

    /// Build a batch from loaded records, refusing mixed resolutions
    pub fn assemble(&self, entry: &BatchPlanEntry, records: Vec<Record>) -> Result<Batch> {
        let mut projected = Vec::with_capacity(records.len());
        for record in records {
            let resolution = *record.resolution("aspect_batch_sorting", Field::CropResolution)?;
            if resolution != entry.crop_resolution {
                return Err(PipelineError::Bucket {
                    resolution,
                    reason: format!(
                        "sample {} does not belong in bucket {}",
                        record.key(),
                        entry.crop_resolution
                    ),
                });
            }
            projected.push(record.project(&self.fields));
        }
        Ok(Batch {
            crop_resolution: entry.crop_resolution,
            records: projected,
        })
    }
}
