//! Data pipeline: image datasets, batching loaders and dataset providers.
//!
//! * **[`ImageDataset`]** - `N × C × H × W` f32 samples with class labels,
//!   loaded from CIFAR-10 binary batches or generated synthetically.
//! * **[`BatchLoader`]** - restartable batch iterator with optional
//!   shuffling, horizontal-flip augmentation and a rayon decode pool.
//! * **[`DatasetProvider`]** - hands out `(train, val)` loaders for a
//!   training phase.

use std::fs::File;
use std::io::Read;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use candle_core::{Device, Tensor};
use parking_lot::Mutex;
use rand::rngs::StdRng;
use rand::seq::SliceRandom;
use rand::{Rng, SeedableRng};
use rayon::prelude::*;

use crate::error::{QatError, Result};

// ── ImageDataset ────────────────────────────────────────────────────────────

/// In-memory labelled image set, stored channel-major per sample.
#[derive(Debug, Clone)]
pub struct ImageDataset {
    images: Vec<f32>,
    labels: Vec<u32>,
    sample_shape: [usize; 3],
    num_classes: usize,
}

impl ImageDataset {
    pub fn new(
        images: Vec<f32>,
        labels: Vec<u32>,
        sample_shape: [usize; 3],
        num_classes: usize,
    ) -> Result<Self> {
        let sample_len: usize = sample_shape.iter().product();
        if sample_len == 0 || images.len() != labels.len() * sample_len {
            return Err(QatError::config(format!(
                "dataset holds {} values for {} labels of shape {:?}",
                images.len(),
                labels.len(),
                sample_shape
            )));
        }
        if let Some(&bad) = labels.iter().find(|&&l| l as usize >= num_classes) {
            return Err(QatError::config(format!(
                "label {bad} out of range for {num_classes} classes"
            )));
        }
        Ok(Self {
            images,
            labels,
            sample_shape,
            num_classes,
        })
    }

    /// Linearly separable synthetic set: each class is a random ±1 prototype
    /// plus small uniform noise. Classes are interleaved so every batch of at
    /// least `num_classes` samples sees all of them.
    pub fn synthetic(
        num_classes: usize,
        per_class: usize,
        sample_shape: [usize; 3],
        seed: u64,
    ) -> Result<Self> {
        let sample_len: usize = sample_shape.iter().product();
        let mut rng = StdRng::seed_from_u64(seed);
        let prototypes: Vec<Vec<f32>> = (0..num_classes)
            .map(|_| {
                (0..sample_len)
                    .map(|_| if rng.gen::<bool>() { 1.0 } else { -1.0 })
                    .collect()
            })
            .collect();
        let mut images = Vec::with_capacity(num_classes * per_class * sample_len);
        let mut labels = Vec::with_capacity(num_classes * per_class);
        for _ in 0..per_class {
            for (class, proto) in prototypes.iter().enumerate() {
                images.extend(proto.iter().map(|v| v + rng.gen_range(-0.1f32..0.1)));
                labels.push(class as u32);
            }
        }
        Self::new(images, labels, sample_shape, num_classes)
    }

    pub fn len(&self) -> usize {
        self.labels.len()
    }

    pub fn is_empty(&self) -> bool {
        self.labels.is_empty()
    }

    pub fn sample_shape(&self) -> [usize; 3] {
        self.sample_shape
    }

    pub fn num_classes(&self) -> usize {
        self.num_classes
    }

    pub fn sample_len(&self) -> usize {
        self.sample_shape.iter().product()
    }

    pub fn sample(&self, index: usize) -> (&[f32], u32) {
        let n = self.sample_len();
        (&self.images[index * n..(index + 1) * n], self.labels[index])
    }

    /// Nearest-neighbour resize of every sample to `size × size`.
    pub fn resized(&self, size: usize) -> Result<Self> {
        let [c, h, w] = self.sample_shape;
        if h == size && w == size {
            return Ok(self.clone());
        }
        let mut images = Vec::with_capacity(self.len() * c * size * size);
        for i in 0..self.len() {
            let (src, _) = self.sample(i);
            for ch in 0..c {
                for y in 0..size {
                    let sy = y * h / size;
                    for x in 0..size {
                        let sx = x * w / size;
                        images.push(src[ch * h * w + sy * w + sx]);
                    }
                }
            }
        }
        Self::new(images, self.labels.clone(), [c, size, size], self.num_classes)
    }
}

// ── CIFAR-10 ────────────────────────────────────────────────────────────────

/// Source of the binary CIFAR-10 archive (`cifar-10-binary.tar.gz`).
pub const CIFAR10_URL: &str = "https://www.cs.toronto.edu/~kriz/cifar-10-binary.tar.gz";

const CIFAR10_SIDE: usize = 32;
const CIFAR10_RECORD: usize = 1 + 3 * CIFAR10_SIDE * CIFAR10_SIDE;
const CIFAR10_TRAIN_FILES: [&str; 5] = [
    "data_batch_1.bin",
    "data_batch_2.bin",
    "data_batch_3.bin",
    "data_batch_4.bin",
    "data_batch_5.bin",
];
const CIFAR10_TEST_FILE: &str = "test_batch.bin";

/// Directory holding the extracted batches: `root` itself or the
/// `cifar-10-batches-bin` folder the archive unpacks to.
fn cifar10_dir(root: &Path) -> Option<PathBuf> {
    [root.to_path_buf(), root.join("cifar-10-batches-bin")]
        .into_iter()
        .find(|dir| dir.join(CIFAR10_TEST_FILE).is_file())
}

/// Load one CIFAR-10 split with pixels scaled to `[0, 1]`.
pub fn load_cifar10(root: &Path, train: bool) -> Result<ImageDataset> {
    let dir = cifar10_dir(root).ok_or_else(|| {
        QatError::config(format!("no CIFAR-10 batches under {}", root.display()))
    })?;
    let files: Vec<&str> = if train {
        CIFAR10_TRAIN_FILES.to_vec()
    } else {
        vec![CIFAR10_TEST_FILE]
    };

    let mut images = Vec::new();
    let mut labels = Vec::new();
    for name in files {
        let mut bytes = Vec::new();
        File::open(dir.join(name))?.read_to_end(&mut bytes)?;
        if bytes.len() % CIFAR10_RECORD != 0 {
            return Err(QatError::config(format!(
                "{name}: {} bytes is not a whole number of records",
                bytes.len()
            )));
        }
        for record in bytes.chunks_exact(CIFAR10_RECORD) {
            labels.push(record[0] as u32);
            images.extend(record[1..].iter().map(|&p| p as f32 / 255.0));
        }
    }
    tracing::debug!(train, samples = labels.len(), "Loaded CIFAR-10 split");
    ImageDataset::new(images, labels, [3, CIFAR10_SIDE, CIFAR10_SIDE], 10)
}

// ── Normalisation ───────────────────────────────────────────────────────────

/// Per-channel `(x - mean) / std`; channel `c` uses entry `c % len`.
#[derive(Debug, Clone, PartialEq)]
pub struct Normalization {
    pub mean: Vec<f32>,
    pub std: Vec<f32>,
}

impl Normalization {
    /// CIFAR-10 channel statistics, for float training.
    pub fn cifar10() -> Self {
        Self {
            mean: vec![0.4914, 0.4822, 0.4465],
            std: vec![0.2470, 0.2435, 0.2616],
        }
    }

    /// Maps `[0, 1]` pixels to `[-1, 1]`, a range that quantizes cleanly.
    pub fn symmetric() -> Self {
        Self {
            mean: vec![0.5],
            std: vec![0.5],
        }
    }

    fn apply(&self, sample: &mut [f32], channels: usize) {
        let plane = sample.len() / channels;
        for (c, chunk) in sample.chunks_mut(plane).enumerate() {
            let mean = self.mean[c % self.mean.len()];
            let std = self.std[c % self.std.len()];
            for v in chunk {
                *v = (*v - mean) / std;
            }
        }
    }
}

// ── Batches ─────────────────────────────────────────────────────────────────

/// One decoded batch, row-major `(size, C, H, W)`.
#[derive(Debug, Clone)]
pub struct ImageBatch {
    pub images: Vec<f32>,
    pub labels: Vec<u32>,
    pub sample_shape: [usize; 3],
}

impl ImageBatch {
    pub fn len(&self) -> usize {
        self.labels.len()
    }

    pub fn is_empty(&self) -> bool {
        self.labels.is_empty()
    }

    /// Convert to `(images, labels)` tensors on `device`.
    pub fn to_tensors(&self, device: &Device) -> candle_core::Result<(Tensor, Tensor)> {
        let [c, h, w] = self.sample_shape;
        let images = Tensor::from_vec(self.images.clone(), (self.len(), c, h, w), device)?;
        let labels = Tensor::from_vec(self.labels.clone(), self.len(), device)?;
        Ok((images, labels))
    }
}

/// Restartable source of batches. Every call to [`batches`](Self::batches)
/// starts a fresh pass over the data.
pub trait DataLoader: Send + Sync {
    fn num_samples(&self) -> usize;
    fn batch_size(&self) -> usize;
    fn sample_shape(&self) -> [usize; 3];

    fn num_batches(&self) -> usize {
        let bs = self.batch_size().max(1);
        (self.num_samples() + bs - 1) / bs
    }

    fn batches(&self) -> Box<dyn Iterator<Item = Result<ImageBatch>> + '_>;
}

/// Loader over an [`ImageDataset`].
pub struct BatchLoader {
    dataset: Arc<ImageDataset>,
    batch_size: usize,
    shuffle: bool,
    augment: bool,
    normalization: Option<Normalization>,
    seed: u64,
    pass: AtomicU64,
    pool: Option<rayon::ThreadPool>,
}

impl BatchLoader {
    pub fn new(dataset: Arc<ImageDataset>, batch_size: usize) -> Result<Self> {
        if batch_size == 0 {
            return Err(QatError::config("batch size must be positive"));
        }
        Ok(Self {
            dataset,
            batch_size,
            shuffle: false,
            augment: false,
            normalization: None,
            seed: 0,
            pass: AtomicU64::new(0),
            pool: None,
        })
    }

    /// Reshuffle on every pass, seeded by `seed` and the pass number.
    pub fn with_shuffle(mut self, seed: u64) -> Self {
        self.shuffle = true;
        self.seed = seed;
        self
    }

    /// Random horizontal flips (train split only).
    pub fn with_augmentation(mut self) -> Self {
        self.augment = true;
        self
    }

    pub fn with_normalization(mut self, normalization: Normalization) -> Self {
        self.normalization = Some(normalization);
        self
    }

    /// Decode batches on a dedicated pool of `workers` threads.
    pub fn with_workers(mut self, workers: usize) -> Result<Self> {
        if workers > 1 {
            let pool = rayon::ThreadPoolBuilder::new()
                .num_threads(workers)
                .build()
                .map_err(|e| QatError::config(format!("data loader pool: {e}")))?;
            self.pool = Some(pool);
        }
        Ok(self)
    }

    fn decode(&self, index: usize, flip: bool) -> (Vec<f32>, u32) {
        let (src, label) = self.dataset.sample(index);
        let [c, h, w] = self.dataset.sample_shape();
        let mut out = src.to_vec();
        if flip {
            for row in out.chunks_mut(w).take(c * h) {
                row.reverse();
            }
        }
        if let Some(norm) = &self.normalization {
            norm.apply(&mut out, c);
        }
        (out, label)
    }

    fn decode_batch(&self, items: &[(usize, bool)]) -> ImageBatch {
        let decoded: Vec<(Vec<f32>, u32)> = match &self.pool {
            Some(pool) => pool.install(|| {
                items
                    .par_iter()
                    .map(|&(i, flip)| self.decode(i, flip))
                    .collect()
            }),
            None => items.iter().map(|&(i, flip)| self.decode(i, flip)).collect(),
        };
        let mut images = Vec::with_capacity(items.len() * self.dataset.sample_len());
        let mut labels = Vec::with_capacity(items.len());
        for (pixels, label) in decoded {
            images.extend(pixels);
            labels.push(label);
        }
        ImageBatch {
            images,
            labels,
            sample_shape: self.dataset.sample_shape(),
        }
    }
}

impl DataLoader for BatchLoader {
    fn num_samples(&self) -> usize {
        self.dataset.len()
    }

    fn batch_size(&self) -> usize {
        self.batch_size
    }

    fn sample_shape(&self) -> [usize; 3] {
        self.dataset.sample_shape()
    }

    fn batches(&self) -> Box<dyn Iterator<Item = Result<ImageBatch>> + '_> {
        let pass = self.pass.fetch_add(1, Ordering::Relaxed);
        let mut rng = StdRng::seed_from_u64(self.seed ^ pass.wrapping_mul(0x9E37_79B9_7F4A_7C15));
        let mut order: Vec<usize> = (0..self.dataset.len()).collect();
        if self.shuffle {
            order.shuffle(&mut rng);
        }
        // Flip decisions are drawn up front so parallel decoding stays deterministic.
        let items: Vec<(usize, bool)> = order
            .into_iter()
            .map(|i| (i, self.augment && rng.gen::<bool>()))
            .collect();
        let batch_size = self.batch_size;
        let mut start = 0usize;
        Box::new(std::iter::from_fn(move || {
            if start >= items.len() {
                return None;
            }
            let end = (start + batch_size).min(items.len());
            let batch = self.decode_batch(&items[start..end]);
            start = end;
            Some(Ok(batch))
        }))
    }
}

// ── Dataset providers ───────────────────────────────────────────────────────

/// Which training phase the loaders feed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LoaderPurpose {
    /// Float validation and fine-tuning.
    Float,
    /// Quantization-aware training of the instrumented model.
    Quantization,
}

pub type LoaderPair = (Box<dyn DataLoader>, Box<dyn DataLoader>);

/// Yields `(train, val)` loaders for a phase.
pub trait DatasetProvider {
    fn loaders(&self, purpose: LoaderPurpose) -> Result<LoaderPair>;
}

type Splits = (Arc<ImageDataset>, Arc<ImageDataset>);

/// CIFAR-10 from the binary batch files.
///
/// The splits are decoded and resized once; later calls (every phase asks
/// for loaders) reuse them until `data_path` or `image_size` change.
/// Clones share the cache.
#[derive(Debug, Clone)]
pub struct Cifar10Provider {
    pub data_path: PathBuf,
    pub image_size: usize,
    pub batch_size: usize,
    pub workers: usize,
    pub download: bool,
    pub seed: u64,
    cache: Arc<Mutex<Option<((PathBuf, usize), Splits)>>>,
}

impl Cifar10Provider {
    /// Eight decode workers, no download, shuffle seed 0.
    pub fn new(data_path: impl Into<PathBuf>, image_size: usize, batch_size: usize) -> Self {
        Self {
            data_path: data_path.into(),
            image_size,
            batch_size,
            workers: 8,
            download: false,
            seed: 0,
            cache: Arc::default(),
        }
    }

    fn ensure_present(&self) -> Result<()> {
        if cifar10_dir(&self.data_path).is_some() {
            return Ok(());
        }
        if self.download {
            return Err(QatError::config(format!(
                "CIFAR-10 not found under {} and this build cannot download it; \
                 fetch {CIFAR10_URL} and extract it there",
                self.data_path.display()
            )));
        }
        Err(QatError::config(format!(
            "CIFAR-10 not found under {}",
            self.data_path.display()
        )))
    }

    fn splits(&self) -> Result<Splits> {
        let key = (self.data_path.clone(), self.image_size);
        let mut cache = self.cache.lock();
        if let Some((cached, splits)) = cache.as_ref() {
            if *cached == key {
                return Ok(splits.clone());
            }
        }
        self.ensure_present()?;
        let train = Arc::new(load_cifar10(&self.data_path, true)?.resized(self.image_size)?);
        let val = Arc::new(load_cifar10(&self.data_path, false)?.resized(self.image_size)?);
        tracing::debug!(path = %self.data_path.display(), size = self.image_size, "Decoded CIFAR-10");
        *cache = Some((key, (Arc::clone(&train), Arc::clone(&val))));
        Ok((train, val))
    }
}

impl DatasetProvider for Cifar10Provider {
    fn loaders(&self, purpose: LoaderPurpose) -> Result<LoaderPair> {
        let (train, val) = self.splits()?;
        let norm = match purpose {
            LoaderPurpose::Float => Normalization::cifar10(),
            LoaderPurpose::Quantization => Normalization::symmetric(),
        };
        tracing::info!(
            ?purpose,
            train = train.len(),
            val = val.len(),
            batch_size = self.batch_size,
            "CIFAR-10 loaders ready"
        );
        let train_loader = BatchLoader::new(train, self.batch_size)?
            .with_shuffle(self.seed)
            .with_augmentation()
            .with_normalization(norm.clone())
            .with_workers(self.workers)?;
        let val_loader = BatchLoader::new(val, self.batch_size)?
            .with_normalization(norm)
            .with_workers(self.workers)?;
        Ok((Box::new(train_loader), Box::new(val_loader)))
    }
}

/// Serves pre-built datasets; the same data for both purposes.
#[derive(Debug, Clone)]
pub struct InMemoryProvider {
    pub train: Arc<ImageDataset>,
    pub val: Arc<ImageDataset>,
    pub batch_size: usize,
    /// Shuffle seed for the train split; `None` keeps dataset order.
    pub shuffle_seed: Option<u64>,
}

impl InMemoryProvider {
    pub fn new(train: ImageDataset, val: ImageDataset, batch_size: usize) -> Self {
        Self {
            train: Arc::new(train),
            val: Arc::new(val),
            batch_size,
            shuffle_seed: None,
        }
    }
}

impl DatasetProvider for InMemoryProvider {
    fn loaders(&self, _purpose: LoaderPurpose) -> Result<LoaderPair> {
        let mut train = BatchLoader::new(Arc::clone(&self.train), self.batch_size)?;
        if let Some(seed) = self.shuffle_seed {
            train = train.with_shuffle(seed);
        }
        let val = BatchLoader::new(Arc::clone(&self.val), self.batch_size)?;
        Ok((Box::new(train), Box::new(val)))
    }
}

// ── Tests ───────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    fn labels_of(loader: &dyn DataLoader) -> Vec<u32> {
        loader
            .batches()
            .flat_map(|b| b.unwrap().labels)
            .collect()
    }

    #[test]
    fn synthetic_interleaves_classes() {
        let ds = ImageDataset::synthetic(2, 3, [1, 2, 2], 7).unwrap();
        assert_eq!(ds.len(), 6);
        assert_eq!(ds.sample(0).1, 0);
        assert_eq!(ds.sample(1).1, 1);
        assert_eq!(ds.sample(2).1, 0);
    }

    #[test]
    fn dataset_rejects_bad_lengths() {
        let err = ImageDataset::new(vec![0.0; 5], vec![0], [1, 2, 2], 2).unwrap_err();
        assert_eq!(err.kind(), crate::ErrorKind::Configuration);
        assert!(ImageDataset::new(vec![0.0; 4], vec![3], [1, 2, 2], 2).is_err());
    }

    #[test]
    fn loader_is_restartable_and_keeps_last_partial_batch() {
        let ds = Arc::new(ImageDataset::synthetic(2, 5, [1, 2, 2], 1).unwrap());
        let loader = BatchLoader::new(ds, 4).unwrap();
        assert_eq!(loader.num_batches(), 3);
        let sizes: Vec<usize> = loader.batches().map(|b| b.unwrap().len()).collect();
        assert_eq!(sizes, vec![4, 4, 2]);
        assert_eq!(labels_of(&loader), labels_of(&loader));
    }

    #[test]
    fn shuffle_is_seeded_per_pass() {
        let ds = Arc::new(ImageDataset::synthetic(4, 16, [1, 1, 1], 3).unwrap());
        let a = BatchLoader::new(Arc::clone(&ds), 8).unwrap().with_shuffle(11);
        let b = BatchLoader::new(ds, 8).unwrap().with_shuffle(11);
        let a1 = labels_of(&a);
        assert_eq!(a1, labels_of(&b));
        let mut sorted = a1.clone();
        sorted.sort_unstable();
        assert_eq!(sorted.len(), 64);
        assert_eq!(sorted.iter().filter(|&&l| l == 3).count(), 16);
    }

    #[test]
    fn flip_and_normalize() {
        let ds = ImageDataset::new(vec![0.0, 1.0, 0.5, 0.25], vec![0], [1, 2, 2], 1).unwrap();
        let loader = BatchLoader::new(Arc::new(ds), 1)
            .unwrap()
            .with_normalization(Normalization::symmetric());
        let (pixels, _) = loader.decode(0, true);
        assert_eq!(pixels, vec![1.0, -1.0, -0.5, 0.0]);
    }

    #[test]
    fn worker_pool_matches_serial_decode() {
        let ds = Arc::new(ImageDataset::synthetic(3, 10, [2, 3, 3], 5).unwrap());
        let serial = BatchLoader::new(Arc::clone(&ds), 7).unwrap();
        let pooled = BatchLoader::new(ds, 7).unwrap().with_workers(3).unwrap();
        let a: Vec<f32> = serial.batches().flat_map(|b| b.unwrap().images).collect();
        let b: Vec<f32> = pooled.batches().flat_map(|b| b.unwrap().images).collect();
        assert_eq!(a, b);
    }

    #[test]
    fn resize_nearest() {
        let ds = ImageDataset::new((0..16).map(|v| v as f32).collect(), vec![0], [1, 4, 4], 1)
            .unwrap();
        let small = ds.resized(2).unwrap();
        assert_eq!(small.sample(0).0, &[0.0, 2.0, 8.0, 10.0]);
    }

    #[test]
    fn batch_tensors_have_nchw_shape() {
        let ds = Arc::new(ImageDataset::synthetic(2, 2, [3, 4, 4], 0).unwrap());
        let loader = BatchLoader::new(ds, 4).unwrap();
        let batch = loader.batches().next().unwrap().unwrap();
        let (x, y) = batch.to_tensors(&Device::Cpu).unwrap();
        assert_eq!(x.dims(), &[4, 3, 4, 4]);
        assert_eq!(y.dims(), &[4]);
    }

    #[test]
    fn missing_cifar_is_a_configuration_error() {
        let dir = tempfile::tempdir().unwrap();
        let mut provider = Cifar10Provider::new(dir.path(), 32, 8);
        provider.workers = 1;
        provider.download = true;
        let err = provider.loaders(LoaderPurpose::Float).err().unwrap();
        assert_eq!(err.kind(), crate::ErrorKind::Configuration);
        assert!(err.to_string().contains("cifar-10-binary"));
    }

    #[test]
    fn cifar_splits_are_decoded_once() {
        let dir = tempfile::tempdir().unwrap();
        let mut record = vec![3u8];
        record.extend(std::iter::repeat(0u8).take(CIFAR10_RECORD - 1));
        for name in CIFAR10_TRAIN_FILES.iter().chain([&CIFAR10_TEST_FILE]) {
            std::fs::write(dir.path().join(name), &record).unwrap();
        }
        let mut provider = Cifar10Provider::new(dir.path(), 16, 2);
        provider.workers = 1;
        let (train, _) = provider.loaders(LoaderPurpose::Float).unwrap();
        assert_eq!(train.num_samples(), 5);

        // Later phases keep working from the decoded copy.
        for name in CIFAR10_TRAIN_FILES.iter().chain([&CIFAR10_TEST_FILE]) {
            std::fs::remove_file(dir.path().join(name)).unwrap();
        }
        let (train, val) = provider.clone().loaders(LoaderPurpose::Quantization).unwrap();
        assert_eq!(train.num_samples(), 5);
        assert_eq!(val.num_samples(), 1);

        provider.image_size = 8;
        let err = provider.loaders(LoaderPurpose::Float).err().unwrap();
        assert_eq!(err.kind(), crate::ErrorKind::Configuration);
    }

    #[test]
    fn cifar_binary_records_parse() {
        let dir = tempfile::tempdir().unwrap();
        let mut record = vec![7u8];
        record.extend(std::iter::repeat(255u8).take(CIFAR10_RECORD - 1));
        std::fs::write(dir.path().join(CIFAR10_TEST_FILE), &record).unwrap();
        let ds = load_cifar10(dir.path(), false).unwrap();
        assert_eq!(ds.len(), 1);
        assert_eq!(ds.sample(0).1, 7);
        assert!(ds.sample(0).0.iter().all(|&p| (p - 1.0).abs() < 1e-6));
    }
}
