use std::collections::BTreeMap;
use std::path::PathBuf;
use std::sync::Arc;
use std::thread::{self, JoinHandle};

use crossbeam_channel::{Receiver, bounded};
use rayon::prelude::*;
use sample_kit_common::Resolution;
use tracing::{debug, info, warn};

use crate::{
    batching::{Batch, BatchPlanEntry},
    config::DatasetConfig,
    error::{PipelineError, Result},
    pipeline::Pipeline,
    record::{Field, Record},
    traits::PipelineContext,
};

/// A sample left out of an epoch, with enough identity to reproduce it
#[derive(Debug, Clone, PartialEq)]
pub struct SkipReport {
    pub key: String,
    pub path: PathBuf,
    pub reason: String,
}

/// What the prepare phase of one epoch did
#[derive(Debug, Clone, Default, PartialEq)]
pub struct EpochReport {
    pub epoch: u64,
    pub variation: u32,
    pub discovered: usize,
    pub prepared: usize,
    pub cache_hits: usize,
    pub cache_misses: usize,
    pub skipped: Vec<SkipReport>,
    /// Prepared samples per crop resolution
    pub buckets: BTreeMap<Resolution, usize>,
    pub batches: usize,
}

/// Drives a pipeline over every discovered sample and yields batches.
pub struct TrainDataset {
    pipeline: Arc<Pipeline>,
    samples: Arc<BTreeMap<String, Record>>,
    pool: rayon::ThreadPool,
}

impl TrainDataset {
    /// Build the variant pipeline and discover every sample
    pub fn new(config: DatasetConfig, context: PipelineContext) -> Result<Self> {
        Self::from_pipeline(Pipeline::for_variant(config, context)?)
    }

    pub fn from_pipeline(pipeline: Pipeline) -> Result<Self> {
        let pool = rayon::ThreadPoolBuilder::new()
            .num_threads(pipeline.config().workers)
            .thread_name(|i| format!("sample-prepare-{}", i))
            .build()?;

        let samples: BTreeMap<String, Record> = pipeline
            .discover()?
            .into_iter()
            .map(|record| (record.key().to_string(), record))
            .collect();
        info!("{}; {} samples discovered", pipeline.info(), samples.len());

        Ok(Self {
            pipeline: Arc::new(pipeline),
            samples: Arc::new(samples),
            pool,
        })
    }

    pub fn pipeline(&self) -> &Pipeline {
        &self.pipeline
    }

    /// Number of discovered samples
    pub fn len(&self) -> usize {
        self.samples.len()
    }

    pub fn is_empty(&self) -> bool {
        self.samples.is_empty()
    }

    /// Prepare every sample for `epoch` and start streaming its batches.
    ///
    /// Per-sample failures are skipped and listed in the report; anything
    /// else aborts the epoch.
    pub fn epoch(&self, epoch: u64) -> Result<EpochIter> {
        let pipeline = &self.pipeline;
        let variation = pipeline.variation_for(epoch);

        let results: Vec<_> = self.pool.install(|| {
            self.samples
                .par_iter()
                .map(|(key, record)| (key, record, pipeline.prepare(record, variation)))
                .collect()
        });

        let mut report = EpochReport {
            epoch,
            variation,
            discovered: self.samples.len(),
            ..EpochReport::default()
        };
        let mut assignments = Vec::with_capacity(results.len());
        for (key, record, result) in results {
            match result {
                Ok(prepared) => {
                    if prepared.cache_hit {
                        report.cache_hits += 1;
                    } else {
                        report.cache_misses += 1;
                    }
                    *report.buckets.entry(prepared.crop_resolution).or_default() += 1;
                    assignments.push((prepared.key, prepared.crop_resolution));
                }
                Err(e) if e.is_sample_local() => {
                    let path = record
                        .path("dataset", Field::ImagePath)
                        .map(|p| p.to_path_buf())
                        .unwrap_or_default();
                    warn!("Skipping {}: {}", path.display(), e);
                    report.skipped.push(SkipReport {
                        key: key.clone(),
                        path,
                        reason: e.to_string(),
                    });
                }
                Err(e) => return Err(e),
            }
        }
        report.prepared = assignments.len();

        let plan = pipeline.sorter().plan(&assignments, epoch);
        report.batches = plan.len();
        info!(
            "Epoch {} (variation {}): {} prepared, {} skipped, {} cache hits, {} misses, {} buckets, {} batches",
            epoch,
            variation,
            report.prepared,
            report.skipped.len(),
            report.cache_hits,
            report.cache_misses,
            report.buckets.len(),
            report.batches
        );
        for (resolution, count) in &report.buckets {
            debug!("Bucket {}: {} samples", resolution, count);
        }

        Ok(EpochIter::spawn(
            Arc::clone(&self.pipeline),
            Arc::clone(&self.samples),
            plan,
            variation,
            epoch,
            report,
        ))
    }
}

/// Batches of one epoch, loaded ahead by a background thread.
///
/// Dropping the iterator stops the loader after its current batch and
/// joins it.
pub struct EpochIter {
    rx: Option<Receiver<Result<Batch>>>,
    handle: Option<JoinHandle<()>>,
    report: EpochReport,
}

impl EpochIter {
    fn spawn(
        pipeline: Arc<Pipeline>,
        samples: Arc<BTreeMap<String, Record>>,
        plan: Vec<BatchPlanEntry>,
        variation: u32,
        epoch: u64,
        report: EpochReport,
    ) -> Self {
        let (tx, rx) = bounded(pipeline.config().prefetch.max(1));
        let handle = thread::spawn(move || {
            for entry in plan {
                let batch = load_batch(&pipeline, &samples, &entry, variation, epoch);
                if tx.send(batch).is_err() {
                    debug!("Epoch {} consumer gone; loader stopping", epoch);
                    break;
                }
            }
        });

        Self {
            rx: Some(rx),
            handle: Some(handle),
            report,
        }
    }

    pub fn report(&self) -> &EpochReport {
        &self.report
    }
}

fn load_batch(
    pipeline: &Pipeline,
    samples: &BTreeMap<String, Record>,
    entry: &BatchPlanEntry,
    variation: u32,
    epoch: u64,
) -> Result<Batch> {
    let records = entry
        .keys
        .iter()
        .map(|key| {
            let record = samples.get(key).ok_or_else(|| {
                PipelineError::Config(format!("planned sample {} was never discovered", key))
            })?;
            pipeline.load(record, variation, epoch)
        })
        .collect::<Result<Vec<_>>>()?;
    pipeline.sorter().assemble(entry, records)
}

impl Iterator for EpochIter {
    type Item = Result<Batch>;

    fn next(&mut self) -> Option<Self::Item> {
        self.rx.as_ref()?.recv().ok()
    }
}

impl Drop for EpochIter {
    fn drop(&mut self) {
        self.rx.take();
        if let Some(handle) = self.handle.take() {
            if handle.join().is_err() {
                warn!("Loader thread for epoch {} panicked", self.report.epoch);
            }
        }
    }
}
