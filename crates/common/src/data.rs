//! Data pipeline: labelled feature datasets and the batch loader.
//!
//! Samples are dense `f32` feature vectors with a `u32` class label. Batches
//! are `(inputs: (b, feature_dim) f32, targets: (b,) u32)` tensors.
//!
//! * **[`InMemoryDataset`]** — everything in RAM; built from vectors, CSV or
//!   [`gaussian_blobs`].
//! * **[`MmapDataset`]** — zero-copy access to a `CVD1` binary file via `memmap2`.
//! * **[`DataLoader`]** — restartable batch iterator with optional seeded shuffling.

use std::cell::Cell;
use std::f64::consts::PI;
use std::fs::File;
use std::io::{BufRead, BufReader, BufWriter, Write};
use std::path::Path;

use anyhow::{Context, Result as AnyhowResult};
use candle_core::{Device, Result, Tensor};
use memmap2::Mmap;
use rand::rngs::StdRng;
use rand::seq::SliceRandom;
use rand::{Rng, SeedableRng};

// ── Binary dataset format ────────────────────────────────────────────────────

/// Magic bytes for the binary dataset format (version 1).
const DATASET_MAGIC: &[u8; 4] = b"CVD1";
/// Header size: magic (4) + num_samples (8) + feature_dim (8).
const DATASET_HEADER_LEN: usize = 4 + 8 + 8;

/// Write a labelled dataset to a binary file for use with [`MmapDataset`].
///
/// Format: magic "CVD1", `num_samples` u64 LE, `feature_dim` u64 LE, then
/// `num_samples × feature_dim` f32 LE features, then `num_samples` u32 LE labels.
pub fn write_dataset_file(
    path: &Path,
    features: &[f32],
    labels: &[u32],
    feature_dim: usize,
) -> AnyhowResult<()> {
    if feature_dim == 0 || features.len() != labels.len() * feature_dim {
        anyhow::bail!(
            "feature buffer of {} values does not match {} labels × {} features",
            features.len(),
            labels.len(),
            feature_dim
        );
    }
    let f = File::create(path).context("create dataset file")?;
    let mut w = BufWriter::new(f);
    w.write_all(DATASET_MAGIC)?;
    w.write_all(&(labels.len() as u64).to_le_bytes())?;
    w.write_all(&(feature_dim as u64).to_le_bytes())?;
    for &x in features {
        w.write_all(&x.to_le_bytes())?;
    }
    for &y in labels {
        w.write_all(&y.to_le_bytes())?;
    }
    let f = w.into_inner().map_err(|e| e.into_error())?;
    f.sync_all().context("sync dataset file")?;
    Ok(())
}

// ── LabeledDataset trait ────────────────────────────────────────────────────

/// Random-access labelled dataset.
pub trait LabeledDataset {
    fn num_samples(&self) -> usize;
    fn feature_dim(&self) -> usize;
    /// Append the features of sample `index` to `buf`.
    fn extend_features(&self, index: usize, buf: &mut Vec<f32>);
    fn label(&self, index: usize) -> u32;

    /// Largest label + 1 (0 for an empty dataset).
    fn num_classes(&self) -> usize {
        (0..self.num_samples())
            .map(|i| self.label(i) as usize + 1)
            .max()
            .unwrap_or(0)
    }
}

// ── InMemoryDataset ─────────────────────────────────────────────────────────

#[derive(Debug, Clone)]
pub struct InMemoryDataset {
    features: Vec<f32>,
    labels: Vec<u32>,
    feature_dim: usize,
}

impl InMemoryDataset {
    pub fn new(features: Vec<f32>, labels: Vec<u32>, feature_dim: usize) -> AnyhowResult<Self> {
        if feature_dim == 0 {
            anyhow::bail!("feature_dim must be positive");
        }
        if features.len() != labels.len() * feature_dim {
            anyhow::bail!(
                "feature buffer of {} values does not match {} labels × {} features",
                features.len(),
                labels.len(),
                feature_dim
            );
        }
        Ok(Self {
            features,
            labels,
            feature_dim,
        })
    }

    /// Load a CSV file: every row is `f_0,…,f_{d-1},label`. A non-numeric
    /// first row is treated as a header and skipped.
    pub fn load_csv(path: &Path) -> AnyhowResult<Self> {
        let reader = BufReader::new(File::open(path).context("open csv file")?);
        let mut features = Vec::new();
        let mut labels = Vec::new();
        let mut feature_dim = None;
        for (line_no, line) in reader.lines().enumerate() {
            let line = line?;
            let line = line.trim();
            if line.is_empty() {
                continue;
            }
            let fields: Vec<&str> = line.split(',').map(str::trim).collect();
            let parsed: Option<Vec<f32>> = fields.iter().map(|f| f.parse().ok()).collect();
            let Some(values) = parsed else {
                if line_no == 0 {
                    continue;
                }
                anyhow::bail!("{}:{}: non-numeric field", path.display(), line_no + 1);
            };
            if values.len() < 2 {
                anyhow::bail!("{}:{}: need features and a label", path.display(), line_no + 1);
            }
            let d = values.len() - 1;
            match feature_dim {
                None => feature_dim = Some(d),
                Some(prev) if prev != d => anyhow::bail!(
                    "{}:{}: expected {} features, found {}",
                    path.display(),
                    line_no + 1,
                    prev,
                    d
                ),
                Some(_) => {}
            }
            let label = values[d];
            if label < 0.0 || label.fract() != 0.0 {
                anyhow::bail!("{}:{}: label {label} is not a class index", path.display(), line_no + 1);
            }
            features.extend_from_slice(&values[..d]);
            labels.push(label as u32);
        }
        let feature_dim = feature_dim.context("csv file has no rows")?;
        Self::new(features, labels, feature_dim)
    }

    /// Write to the binary `CVD1` format.
    pub fn write(&self, path: &Path) -> AnyhowResult<()> {
        write_dataset_file(path, &self.features, &self.labels, self.feature_dim)
    }

    pub fn labels(&self) -> &[u32] {
        &self.labels
    }
}

impl LabeledDataset for InMemoryDataset {
    fn num_samples(&self) -> usize {
        self.labels.len()
    }
    fn feature_dim(&self) -> usize {
        self.feature_dim
    }
    fn extend_features(&self, index: usize, buf: &mut Vec<f32>) {
        let start = index * self.feature_dim;
        buf.extend_from_slice(&self.features[start..start + self.feature_dim]);
    }
    fn label(&self, index: usize) -> u32 {
        self.labels[index]
    }
}

/// Synthetic classification data: `num_classes` Gaussian clusters whose
/// centres sit on a circle of radius `spread` in the first two dimensions.
pub fn gaussian_blobs(
    num_samples: usize,
    feature_dim: usize,
    num_classes: usize,
    spread: f64,
    seed: u64,
) -> AnyhowResult<InMemoryDataset> {
    if num_classes == 0 {
        anyhow::bail!("num_classes must be positive");
    }
    let mut rng = StdRng::seed_from_u64(seed);
    let mut features = Vec::with_capacity(num_samples * feature_dim);
    let mut labels = Vec::with_capacity(num_samples);
    for i in 0..num_samples {
        let class = i % num_classes;
        let angle = 2.0 * PI * class as f64 / num_classes as f64;
        for d in 0..feature_dim {
            let centre = match d {
                0 => spread * angle.cos(),
                1 => spread * angle.sin(),
                _ => 0.0,
            };
            features.push((centre + standard_normal(&mut rng)) as f32);
        }
        labels.push(class as u32);
    }
    InMemoryDataset::new(features, labels, feature_dim)
}

/// Box–Muller sample from N(0, 1).
fn standard_normal(rng: &mut impl Rng) -> f64 {
    let u1: f64 = rng.gen::<f64>().max(f64::MIN_POSITIVE);
    let u2: f64 = rng.gen();
    (-2.0 * u1.ln()).sqrt() * (2.0 * PI * u2).cos()
}

// ── MmapDataset (zero-copy) ──────────────────────────────────────────────────

/// Zero-copy dataset over a `CVD1` binary file.
///
/// The file is memory-mapped; only the pages touched for each batch are paged in.
pub struct MmapDataset {
    mmap: Mmap,
    num_samples: usize,
    feature_dim: usize,
}

impl MmapDataset {
    pub fn open(path: &Path) -> AnyhowResult<Self> {
        let file = File::open(path).context("open dataset file for mmap")?;
        let mmap = unsafe { Mmap::map(&file).context("mmap dataset file")? };
        if mmap.len() < DATASET_HEADER_LEN {
            anyhow::bail!("dataset file too short");
        }
        if &mmap[0..4] != DATASET_MAGIC {
            anyhow::bail!("invalid dataset file: bad magic");
        }
        let num_samples = read_u64(&mmap[4..12]) as usize;
        let feature_dim = read_u64(&mmap[12..20]) as usize;
        let expected_len = feature_dim
            .checked_add(1)
            .and_then(|words| words.checked_mul(num_samples))
            .and_then(|words| words.checked_mul(4))
            .and_then(|bytes| bytes.checked_add(DATASET_HEADER_LEN))
            .with_context(|| {
                format!("dataset header overflows: {num_samples} samples × {feature_dim} features")
            })?;
        if mmap.len() < expected_len {
            anyhow::bail!(
                "dataset file truncated: expected {} bytes, got {}",
                expected_len,
                mmap.len()
            );
        }
        Ok(Self {
            mmap,
            num_samples,
            feature_dim,
        })
    }

    #[inline]
    fn word_at(&self, byte_offset: usize) -> [u8; 4] {
        let i = DATASET_HEADER_LEN + byte_offset;
        let mut out = [0u8; 4];
        out.copy_from_slice(&self.mmap[i..i + 4]);
        out
    }
}

fn read_u64(bytes: &[u8]) -> u64 {
    let mut out = [0u8; 8];
    out.copy_from_slice(&bytes[..8]);
    u64::from_le_bytes(out)
}

impl LabeledDataset for MmapDataset {
    fn num_samples(&self) -> usize {
        self.num_samples
    }
    fn feature_dim(&self) -> usize {
        self.feature_dim
    }
    fn extend_features(&self, index: usize, buf: &mut Vec<f32>) {
        let base = index * self.feature_dim * 4;
        for j in 0..self.feature_dim {
            buf.push(f32::from_le_bytes(self.word_at(base + j * 4)));
        }
    }
    fn label(&self, index: usize) -> u32 {
        let labels_start = self.num_samples * self.feature_dim * 4;
        u32::from_le_bytes(self.word_at(labels_start + index * 4))
    }
}

/// Either an [`InMemoryDataset`] or an [`MmapDataset`].
pub enum AnyDataset {
    Memory(InMemoryDataset),
    Mmap(MmapDataset),
}

impl AnyDataset {
    /// `.csv` files are parsed into memory; anything else is opened as `CVD1`.
    pub fn open(path: &Path) -> AnyhowResult<Self> {
        if path.extension().map(|e| e == "csv").unwrap_or(false) {
            Ok(Self::Memory(InMemoryDataset::load_csv(path)?))
        } else {
            Ok(Self::Mmap(MmapDataset::open(path)?))
        }
    }
}

impl LabeledDataset for AnyDataset {
    fn num_samples(&self) -> usize {
        match self {
            AnyDataset::Memory(d) => d.num_samples(),
            AnyDataset::Mmap(d) => d.num_samples(),
        }
    }
    fn feature_dim(&self) -> usize {
        match self {
            AnyDataset::Memory(d) => d.feature_dim(),
            AnyDataset::Mmap(d) => d.feature_dim(),
        }
    }
    fn extend_features(&self, index: usize, buf: &mut Vec<f32>) {
        match self {
            AnyDataset::Memory(d) => d.extend_features(index, buf),
            AnyDataset::Mmap(d) => d.extend_features(index, buf),
        }
    }
    fn label(&self, index: usize) -> u32 {
        match self {
            AnyDataset::Memory(d) => d.label(index),
            AnyDataset::Mmap(d) => d.label(index),
        }
    }
}

// ── DataLoader ──────────────────────────────────────────────────────────────

/// Finite, restartable batch sequence over a [`LabeledDataset`].
///
/// The final batch may be smaller than `batch_size`. With a shuffle seed,
/// every call to [`iter`](Self::iter) draws a fresh permutation derived from
/// the seed and the pass number, so runs are reproducible.
pub struct DataLoader<'a, D: LabeledDataset + ?Sized> {
    dataset: &'a D,
    batch_size: usize,
    shuffle_seed: Option<u64>,
    passes: Cell<u64>,
    device: Device,
}

impl<'a, D: LabeledDataset + ?Sized> DataLoader<'a, D> {
    pub fn new(dataset: &'a D, batch_size: usize, device: &Device) -> Self {
        Self {
            dataset,
            batch_size: batch_size.max(1),
            shuffle_seed: None,
            passes: Cell::new(0),
            device: device.clone(),
        }
    }

    pub fn shuffle(mut self, seed: u64) -> Self {
        self.shuffle_seed = Some(seed);
        self
    }

    /// Total number of samples (the normaliser of every epoch metric).
    pub fn num_samples(&self) -> usize {
        self.dataset.num_samples()
    }

    pub fn num_batches(&self) -> usize {
        self.num_samples().div_ceil(self.batch_size)
    }

    pub fn batch_size(&self) -> usize {
        self.batch_size
    }

    pub fn device(&self) -> &Device {
        &self.device
    }

    /// Start a new pass over the dataset.
    pub fn iter(&self) -> impl Iterator<Item = Result<(Tensor, Tensor)>> + '_ {
        let n = self.num_samples();
        let mut order: Vec<usize> = (0..n).collect();
        if let Some(seed) = self.shuffle_seed {
            let pass = self.passes.get();
            let mut rng = StdRng::seed_from_u64(seed.wrapping_add(pass));
            order.shuffle(&mut rng);
        }
        self.passes.set(self.passes.get() + 1);

        let mut start = 0usize;
        std::iter::from_fn(move || {
            if start >= n {
                return None;
            }
            let end = (start + self.batch_size).min(n);
            let batch = self.collate(&order[start..end]);
            start = end;
            Some(batch)
        })
    }

    fn collate(&self, indices: &[usize]) -> Result<(Tensor, Tensor)> {
        let d = self.dataset.feature_dim();
        let mut features = Vec::with_capacity(indices.len() * d);
        let mut labels = Vec::with_capacity(indices.len());
        for &i in indices {
            self.dataset.extend_features(i, &mut features);
            labels.push(self.dataset.label(i));
        }
        batch_to_tensors(features, labels, d, &self.device)
    }
}

// ── Helpers ─────────────────────────────────────────────────────────────────

/// Convert a raw batch of features and labels to Candle tensors.
pub fn batch_to_tensors(
    features: Vec<f32>,
    labels: Vec<u32>,
    feature_dim: usize,
    device: &Device,
) -> Result<(Tensor, Tensor)> {
    let b = labels.len();
    let inputs = Tensor::from_vec(features, (b, feature_dim), device)?;
    let targets = Tensor::from_vec(labels, b, device)?;
    Ok((inputs, targets))
}

// ── Tests ───────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    fn tiny() -> InMemoryDataset {
        InMemoryDataset::new(
            vec![0.0, 1.0, 2.0, 3.0, 4.0, 5.0, 6.0, 7.0, 8.0, 9.0],
            vec![0, 1, 0, 1, 2],
            2,
        )
        .unwrap()
    }

    #[test]
    fn mmap_rejects_overflowing_header() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("huge.cvd");
        let mut bytes = DATASET_MAGIC.to_vec();
        bytes.extend_from_slice(&u64::MAX.to_le_bytes());
        bytes.extend_from_slice(&(u64::MAX / 2).to_le_bytes());
        bytes.extend_from_slice(&[0u8; 16]);
        std::fs::write(&path, bytes).unwrap();
        let err = MmapDataset::open(&path).err().expect("header must be rejected");
        assert!(err.to_string().contains("overflows"), "{err}");
    }

    #[test]
    fn new_rejects_mismatched_buffers() {
        assert!(InMemoryDataset::new(vec![0.0; 5], vec![0, 1], 2).is_err());
        assert!(InMemoryDataset::new(vec![], vec![], 0).is_err());
    }

    #[test]
    fn loader_keeps_partial_last_batch() {
        let ds = tiny();
        let loader = DataLoader::new(&ds, 2, &Device::Cpu);
        assert_eq!(loader.num_batches(), 3);
        let sizes: Vec<usize> = loader
            .iter()
            .map(|b| b.unwrap().1.dims1().unwrap())
            .collect();
        assert_eq!(sizes, vec![2, 2, 1]);
    }

    #[test]
    fn loader_is_restartable() {
        let ds = tiny();
        let loader = DataLoader::new(&ds, 3, &Device::Cpu);
        let first: Vec<u32> = loader
            .iter()
            .flat_map(|b| b.unwrap().1.to_vec1::<u32>().unwrap())
            .collect();
        let second: Vec<u32> = loader
            .iter()
            .flat_map(|b| b.unwrap().1.to_vec1::<u32>().unwrap())
            .collect();
        assert_eq!(first, vec![0, 1, 0, 1, 2]);
        assert_eq!(first, second);
    }

    #[test]
    fn shuffled_loader_visits_every_sample() {
        let ds = gaussian_blobs(37, 3, 4, 3.0, 7).unwrap();
        let loader = DataLoader::new(&ds, 8, &Device::Cpu).shuffle(11);
        let mut seen: Vec<f32> = Vec::new();
        for batch in loader.iter() {
            let (xs, _) = batch.unwrap();
            let rows = xs.to_vec2::<f32>().unwrap();
            seen.extend(rows.iter().map(|r| r[2]));
        }
        let mut expected: Vec<f32> = (0..37)
            .map(|i| {
                let mut buf = Vec::new();
                ds.extend_features(i, &mut buf);
                buf[2]
            })
            .collect();
        seen.sort_by(|a, b| a.partial_cmp(b).unwrap());
        expected.sort_by(|a, b| a.partial_cmp(b).unwrap());
        assert_eq!(seen, expected);
    }

    #[test]
    fn batch_shapes() {
        let ds = tiny();
        let loader = DataLoader::new(&ds, 4, &Device::Cpu);
        let (xs, ys) = loader.iter().next().unwrap().unwrap();
        assert_eq!(xs.dims(), &[4, 2]);
        assert_eq!(ys.dims(), &[4]);
        assert_eq!(xs.to_vec2::<f32>().unwrap()[1], vec![2.0, 3.0]);
    }

    #[test]
    fn binary_file_through_mmap() {
        let ds = tiny();
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("tiny.cvd");
        ds.write(&path).unwrap();

        let mm = MmapDataset::open(&path).unwrap();
        assert_eq!(mm.num_samples(), 5);
        assert_eq!(mm.feature_dim(), 2);
        assert_eq!(mm.label(4), 2);
        let mut buf = Vec::new();
        mm.extend_features(3, &mut buf);
        assert_eq!(buf, vec![6.0, 7.0]);
        assert_eq!(mm.num_classes(), 3);
    }

    #[test]
    fn mmap_rejects_bad_magic() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("bad.cvd");
        std::fs::write(&path, b"NOPE0000000000000000").unwrap();
        assert!(MmapDataset::open(&path).is_err());
    }

    #[test]
    fn csv_with_header() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("d.csv");
        std::fs::write(&path, "x,y,label\n0.5,1.5,1\n-1,2,0\n").unwrap();
        let ds = AnyDataset::open(&path).unwrap();
        assert_eq!(ds.num_samples(), 2);
        assert_eq!(ds.feature_dim(), 2);
        assert_eq!(ds.label(0), 1);
    }

    #[test]
    fn csv_rejects_fractional_label() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("d.csv");
        std::fs::write(&path, "0.5,1.5,0.5\n").unwrap();
        assert!(InMemoryDataset::load_csv(&path).is_err());
    }

    #[test]
    fn blobs_are_balanced() {
        let ds = gaussian_blobs(30, 2, 3, 4.0, 1).unwrap();
        let counts = ds.labels().iter().fold([0usize; 3], |mut acc, &y| {
            acc[y as usize] += 1;
            acc
        });
        assert_eq!(counts, [10, 10, 10]);
    }
}
