use std::fs;
use std::path::{Path, PathBuf};

use image::{GrayImage, Luma, Rgb, RgbImage};
use sample_pipeline::{
    Batch, Concept, DatasetConfig, Field, ModelVariant, RemainderPolicy, TrainDataset,
    collaborators::reference_context,
};

fn write_sample(dir: &Path, stem: &str, size: (u32, u32), mask: Option<(u32, u32, u32, u32)>, prompt: Option<&str>) {
    let (w, h) = size;
    RgbImage::from_fn(w, h, |x, y| Rgb([(x * 255 / w) as u8, (y * 255 / h) as u8, 128]))
        .save(dir.join(format!("{}.png", stem)))
        .unwrap();
    if let Some((x0, y0, x1, y1)) = mask {
        GrayImage::from_fn(w, h, |x, y| {
            let inside = (x0..x1).contains(&x) && (y0..y1).contains(&y);
            Luma([if inside { 255 } else { 0 }])
        })
        .save(dir.join(format!("{}-masklabel.png", stem)))
        .unwrap();
    }
    if let Some(prompt) = prompt {
        fs::write(dir.join(format!("{}.txt", stem)), prompt).unwrap();
    }
}

fn config(data: &Path, cache: &Path) -> DatasetConfig {
    DatasetConfig {
        batch_size: 2,
        target_resolution: 64,
        bucket_stride: 16,
        min_size: 32,
        max_rotate_angle: 10.0,
        cache_dir: cache.to_path_buf(),
        workers: 2,
        remainder: RemainderPolicy::Emit,
        concepts: vec![Concept::new("cat", data)],
        ..DatasetConfig::default()
    }
}

fn dataset(config: DatasetConfig) -> TrainDataset {
    TrainDataset::new(config, reference_context(4, 8, 16, 512)).unwrap()
}

fn collect(dataset: &TrainDataset, epoch: u64) -> Vec<Batch> {
    dataset
        .epoch(epoch)
        .unwrap()
        .map(|batch| batch.expect("batch should load"))
        .collect()
}

fn split_files(dir: &Path) -> Vec<PathBuf> {
    let mut files: Vec<PathBuf> = walkdir::WalkDir::new(dir)
        .into_iter()
        .filter_map(|e| e.ok())
        .map(|e| e.into_path())
        .filter(|p| p.to_string_lossy().ends_with(".split.bin"))
        .collect();
    files.sort();
    files
}

fn populate(dir: &Path) {
    write_sample(dir, "a", (96, 64), Some((20, 10, 70, 50)), Some("a cat on a mat"));
    write_sample(dir, "b", (96, 64), Some((10, 10, 60, 40)), Some("a cat asleep"));
    write_sample(dir, "c", (64, 96), Some((10, 20, 50, 80)), Some("a tall cat"));
    write_sample(dir, "d", (80, 80), None, Some("a whole cat"));
}

#[test]
fn image_without_prompt_is_skipped_and_reported() {
    let data = tempfile::tempdir().unwrap();
    let cache = tempfile::tempdir().unwrap();
    populate(data.path());
    write_sample(data.path(), "orphan", (96, 64), Some((20, 10, 70, 50)), None);

    let dataset = dataset(config(data.path(), cache.path()));
    assert_eq!(dataset.len(), 5);

    let iter = dataset.epoch(0).unwrap();
    let report = iter.report().clone();
    assert_eq!(report.skipped.len(), 1);
    assert_eq!(report.skipped[0].path, data.path().join("orphan.png"));
    assert_eq!(report.prepared, 4);

    let batches: Vec<Batch> = iter.map(|b| b.unwrap()).collect();
    let total: usize = batches.iter().map(|b| b.len()).sum();
    assert_eq!(total, 4);
    for batch in &batches {
        for record in &batch.records {
            let path = record.path("test", Field::ImagePath).unwrap();
            assert_ne!(path, data.path().join("orphan.png"));
        }
    }
}

#[test]
fn every_batch_is_bucket_homogeneous() {
    let data = tempfile::tempdir().unwrap();
    let cache = tempfile::tempdir().unwrap();
    populate(data.path());
    for i in 0..6 {
        write_sample(data.path(), &format!("w{}", i), (128, 64), Some((10, 10, 100, 50)), Some("a wide cat"));
    }

    let dataset = dataset(config(data.path(), cache.path()));
    let batches = collect(&dataset, 0);
    assert!(!batches.is_empty());
    for batch in &batches {
        for record in &batch.records {
            assert_eq!(
                *record.resolution("test", Field::CropResolution).unwrap(),
                batch.crop_resolution
            );
        }
        let latents = batch.stack(Field::LatentImage).unwrap();
        let (w, h) = (batch.crop_resolution.width as usize, batch.crop_resolution.height as usize);
        assert_eq!(latents.shape, vec![batch.len(), 4, h / 8, w / 8]);
        let masks = batch.stack(Field::LatentMask).unwrap();
        assert_eq!(masks.shape, vec![batch.len(), 1, h / 8, w / 8]);
        let tokens = batch.stack_tokens(Field::Tokens).unwrap();
        assert_eq!(tokens.shape, vec![batch.len(), 16]);
    }
}

#[test]
fn second_run_hits_the_cache_with_identical_output() {
    let data = tempfile::tempdir().unwrap();
    let cache = tempfile::tempdir().unwrap();
    populate(data.path());

    let first = dataset(config(data.path(), cache.path()));
    let iter = first.epoch(0).unwrap();
    assert_eq!(iter.report().cache_misses, 4);
    assert_eq!(iter.report().cache_hits, 0);
    let first_batches: Vec<Batch> = iter.map(|b| b.unwrap()).collect();
    let first_bytes: Vec<Vec<u8>> = split_files(cache.path()).iter().map(|p| fs::read(p).unwrap()).collect();
    assert_eq!(first_bytes.len(), 4);

    // a fresh dataset over the same directory behaves like a restart
    let second = dataset(config(data.path(), cache.path()));
    let iter = second.epoch(0).unwrap();
    assert_eq!(iter.report().cache_hits, 4);
    assert_eq!(iter.report().cache_misses, 0);
    let second_batches: Vec<Batch> = iter.map(|b| b.unwrap()).collect();
    let second_bytes: Vec<Vec<u8>> = split_files(cache.path()).iter().map(|p| fs::read(p).unwrap()).collect();

    assert_eq!(first_batches, second_batches);
    assert_eq!(first_bytes, second_bytes);
}

#[test]
fn corrupt_entries_are_recomputed() {
    let data = tempfile::tempdir().unwrap();
    let cache = tempfile::tempdir().unwrap();
    populate(data.path());

    let dataset = dataset(config(data.path(), cache.path()));
    let clean = collect(&dataset, 0);
    let files = split_files(cache.path());
    let original = fs::read(&files[0]).unwrap();
    fs::write(&files[0], b"truncated").unwrap();

    let recovered = collect(&dataset, 0);
    assert_eq!(clean, recovered);
    assert_eq!(fs::read(&files[0]).unwrap(), original);
}

#[test]
fn changing_resolution_invalidates_the_cache() {
    let data = tempfile::tempdir().unwrap();
    let cache = tempfile::tempdir().unwrap();
    populate(data.path());

    let _ = collect(&dataset(config(data.path(), cache.path())), 0);
    let changed = DatasetConfig {
        target_resolution: 96,
        ..config(data.path(), cache.path())
    };
    let dataset = dataset(changed);
    let iter = dataset.epoch(0).unwrap();
    assert_eq!(iter.report().cache_hits, 0);
    assert_eq!(iter.report().cache_misses, 4);
}

#[test]
fn cache_variations_cycle_with_epochs() {
    let data = tempfile::tempdir().unwrap();
    let cache = tempfile::tempdir().unwrap();
    populate(data.path());

    let dataset = dataset(DatasetConfig {
        cache_variations: 2,
        ..config(data.path(), cache.path())
    });
    assert_eq!(dataset.epoch(0).unwrap().report().cache_misses, 4);
    assert_eq!(dataset.epoch(1).unwrap().report().cache_misses, 4);
    let third = dataset.epoch(2).unwrap();
    assert_eq!(third.report().variation, 0);
    assert_eq!(third.report().cache_hits, 4);
}

#[test]
fn dropping_the_iterator_early_stops_the_loader() {
    let data = tempfile::tempdir().unwrap();
    let cache = tempfile::tempdir().unwrap();
    populate(data.path());
    for i in 0..8 {
        write_sample(data.path(), &format!("x{}", i), (96, 64), Some((20, 10, 70, 50)), Some("more cats"));
    }

    let dataset = dataset(DatasetConfig {
        batch_size: 1,
        prefetch: 1,
        ..config(data.path(), cache.path())
    });
    let mut iter = dataset.epoch(0).unwrap();
    assert!(iter.next().unwrap().is_ok());
    drop(iter);

    // the dataset stays usable after an abandoned epoch
    assert_eq!(collect(&dataset, 1).len(), 12);
}

#[test]
fn depth_variant_carries_latent_depth() {
    let data = tempfile::tempdir().unwrap();
    let cache = tempfile::tempdir().unwrap();
    populate(data.path());

    let dataset = dataset(DatasetConfig {
        variant: ModelVariant::DepthConditioned,
        ..config(data.path(), cache.path())
    });
    for batch in collect(&dataset, 0) {
        let depth = batch.stack(Field::LatentDepth).unwrap();
        assert_eq!(depth.shape[1], 1);
        let latents = batch.stack(Field::LatentImage).unwrap();
        assert_eq!(depth.shape[2..], latents.shape[2..]);
    }
}

#[test]
fn missing_concept_directory_is_fatal() {
    let cache = tempfile::tempdir().unwrap();
    let config = DatasetConfig {
        concepts: vec![Concept::new("ghost", cache.path().join("nope"))],
        ..config(cache.path(), cache.path())
    };
    assert!(TrainDataset::new(config, reference_context(4, 8, 16, 512)).is_err());
}

#[cfg(unix)]
#[test]
fn non_utf8_names_are_prepared_like_any_other() {
    use std::ffi::OsStr;
    use std::os::unix::ffi::OsStrExt;

    let root = tempfile::tempdir().unwrap();
    let cache = tempfile::tempdir().unwrap();
    let data = root.path().join(OsStr::from_bytes(b"cats\xff"));
    fs::create_dir(&data).unwrap();
    write_sample(&data, "plain", (96, 64), Some((20, 10, 70, 50)), Some("a cat on a mat"));

    // "caf\xe9" with its mask and prompt
    let stem = OsStr::from_bytes(b"caf\xe9");
    let image = data.join(stem).with_extension("png");
    RgbImage::from_fn(96, 64, |x, y| Rgb([x as u8, y as u8, 7])).save(&image).unwrap();
    let mut mask_name = stem.to_os_string();
    mask_name.push("-masklabel.png");
    GrayImage::from_fn(96, 64, |x, _| Luma([if x < 48 { 255 } else { 0 }]))
        .save(data.join(mask_name))
        .unwrap();
    fs::write(data.join(stem).with_extension("txt"), "a french cat").unwrap();

    let dataset = dataset(config(&data, cache.path()));
    assert_eq!(dataset.len(), 2);

    let iter = dataset.epoch(0).unwrap();
    assert!(iter.report().skipped.is_empty(), "{:?}", iter.report().skipped);
    assert_eq!(iter.report().prepared, 2);
    let total: usize = iter.map(|b| b.unwrap().len()).sum();
    assert_eq!(total, 2);

    let again = dataset.epoch(0).unwrap();
    assert_eq!(again.report().cache_hits, 2);
}
