// Paired signal/image data: samples, collation, loading.
//
// A dataset may report a malformed entry as `None`; collation drops those
// before stacking, and a batch made only of dropped entries is skipped.

use anyhow::{Context, Result};
use candle_core::{DType, Device, Tensor};
use std::collections::HashMap;
use std::path::Path;
use tracing::{debug, info};

use crate::rng::SeededRng;

#[derive(Debug, Clone)]
pub struct SignalSample {
    /// (C, T)
    pub signal: Tensor,
    /// (H, W, 3) in [-1, 1]
    pub image: Tensor,
    /// Input of the image embedder.
    pub image_raw: Tensor,
    pub label: Option<u32>,
}

#[derive(Debug, Clone)]
pub struct Batch {
    pub signal: Tensor,
    pub image: Tensor,
    pub image_raw: Tensor,
    /// Present only when every sample in the batch carries a label.
    pub label: Option<Tensor>,
}

impl Batch {
    pub fn len(&self) -> usize {
        self.signal.dim(0).unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn to_device(&self, device: &Device) -> Result<Self> {
        Ok(Self {
            signal: self.signal.to_device(device)?,
            image: self.image.to_device(device)?,
            image_raw: self.image_raw.to_device(device)?,
            label: self.label.as_ref().map(|l| l.to_device(device)).transpose()?,
        })
    }
}

pub trait SignalDataset {
    fn len(&self) -> usize;

    fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// `Ok(None)` marks a malformed entry.
    fn get(&self, index: usize) -> Result<Option<SignalSample>>;
}

/// Stack the well-formed samples; `None` when nothing is left.
pub fn collate(items: Vec<Option<SignalSample>>) -> Result<Option<Batch>> {
    let total = items.len();
    let samples: Vec<SignalSample> = items.into_iter().flatten().collect();
    if samples.len() < total {
        debug!("[ELDM] Dropped {} malformed samples", total - samples.len());
    }
    if samples.is_empty() {
        return Ok(None);
    }
    let signal: Vec<&Tensor> = samples.iter().map(|s| &s.signal).collect();
    let image: Vec<&Tensor> = samples.iter().map(|s| &s.image).collect();
    let image_raw: Vec<&Tensor> = samples.iter().map(|s| &s.image_raw).collect();
    let labels: Option<Vec<u32>> = samples.iter().map(|s| s.label).collect();
    let label = match labels {
        Some(l) => Some(Tensor::new(l, samples[0].signal.device())?),
        None => None,
    };
    Ok(Some(Batch {
        signal: Tensor::stack(&signal, 0)?,
        image: Tensor::stack(&image, 0)?,
        image_raw: Tensor::stack(&image_raw, 0)?,
        label,
    }))
}

// ---------------------------------------------------------------------------
// Loader
// ---------------------------------------------------------------------------

pub struct DataLoader<'a> {
    dataset: &'a dyn SignalDataset,
    batch_size: usize,
    shuffle: Option<SeededRng>,
}

impl<'a> DataLoader<'a> {
    pub fn new(dataset: &'a dyn SignalDataset, batch_size: usize) -> Self {
        Self {
            dataset,
            batch_size: batch_size.max(1),
            shuffle: None,
        }
    }

    /// Reshuffle every epoch from a seeded stream.
    pub fn with_shuffle(mut self, seed: u64) -> Self {
        self.shuffle = Some(SeededRng::new(seed));
        self
    }

    pub fn num_batches(&self) -> usize {
        self.dataset.len().div_ceil(self.batch_size)
    }

    pub fn epoch(&mut self) -> Batches<'a> {
        let n = self.dataset.len();
        let order = match self.shuffle.as_mut() {
            Some(rng) => rng.permutation(n),
            None => (0..n).collect(),
        };
        Batches {
            dataset: self.dataset,
            order,
            batch_size: self.batch_size,
            pos: 0,
        }
    }
}

pub struct Batches<'a> {
    dataset: &'a dyn SignalDataset,
    order: Vec<usize>,
    batch_size: usize,
    pos: usize,
}

impl Iterator for Batches<'_> {
    type Item = Result<Batch>;

    fn next(&mut self) -> Option<Self::Item> {
        while self.pos < self.order.len() {
            let end = (self.pos + self.batch_size).min(self.order.len());
            let items: Result<Vec<Option<SignalSample>>> = self.order[self.pos..end]
                .iter()
                .map(|&i| self.dataset.get(i))
                .collect();
            self.pos = end;
            match items.and_then(collate) {
                Ok(Some(batch)) => return Some(Ok(batch)),
                Ok(None) => continue,
                Err(e) => return Some(Err(e)),
            }
        }
        None
    }
}

// ---------------------------------------------------------------------------
// Safetensors-backed dataset
// ---------------------------------------------------------------------------

/// All samples of one split in a single safetensors file: `eeg` (N, C, T),
/// `image` (N, H, W, 3), `image_raw` (N, ...) and optionally `label` (N).
pub struct SafetensorsDataset {
    eeg: Tensor,
    image: Tensor,
    image_raw: Tensor,
    label: Option<Vec<u32>>,
}

impl SafetensorsDataset {
    pub fn open(path: &Path) -> Result<Self> {
        let tensors = candle_core::safetensors::load(path, &Device::Cpu)
            .with_context(|| format!("loading dataset {}", path.display()))?;
        let ds = Self::from_tensors(tensors)?;
        info!("[ELDM] Dataset {}: {} samples", path.display(), ds.len());
        Ok(ds)
    }

    pub fn from_tensors(mut tensors: HashMap<String, Tensor>) -> Result<Self> {
        let mut take = |key: &str| {
            tensors
                .remove(key)
                .with_context(|| format!("dataset has no '{key}' tensor"))
        };
        let eeg = take("eeg")?.to_dtype(DType::F32)?;
        let image = take("image")?.to_dtype(DType::F32)?;
        let image_raw = take("image_raw")?.to_dtype(DType::F32)?;
        let label = match tensors.remove("label") {
            Some(l) => Some(l.to_dtype(DType::U32)?.to_vec1::<u32>()?),
            None => None,
        };
        let n = eeg.dim(0)?;
        if image.dim(0)? != n || image_raw.dim(0)? != n || label.as_ref().is_some_and(|l| l.len() != n) {
            anyhow::bail!("dataset tensors disagree on sample count");
        }
        Ok(Self {
            eeg,
            image,
            image_raw,
            label,
        })
    }
}

impl SignalDataset for SafetensorsDataset {
    fn len(&self) -> usize {
        self.eeg.dim(0).unwrap_or(0)
    }

    fn get(&self, index: usize) -> Result<Option<SignalSample>> {
        let signal = self.eeg.get(index)?;
        let finite = signal
            .flatten_all()?
            .to_vec1::<f32>()?
            .iter()
            .all(|v| v.is_finite());
        if !finite {
            return Ok(None);
        }
        Ok(Some(SignalSample {
            signal,
            image: self.image.get(index)?,
            image_raw: self.image_raw.get(index)?,
            label: self.label.as_ref().map(|l| l[index]),
        }))
    }
}

// ---------------------------------------------------------------------------
// Image embeddings
// ---------------------------------------------------------------------------

/// Maps raw images to the shared embedding space the mapping head aligns to.
pub trait ImageEmbedder {
    /// (B, ...) -> (B, clip_dim)
    fn embed(&self, image_raw: &Tensor) -> Result<Tensor>;
}

/// `image_raw` already holds embeddings; they are only flattened.
#[derive(Debug, Clone, Copy, Default)]
pub struct PrecomputedEmbedder;

impl ImageEmbedder for PrecomputedEmbedder {
    fn embed(&self, image_raw: &Tensor) -> Result<Tensor> {
        image_raw.flatten_from(1).map_err(Into::into)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct Toy {
        broken: Vec<usize>,
        n: usize,
    }

    impl SignalDataset for Toy {
        fn len(&self) -> usize {
            self.n
        }

        fn get(&self, index: usize) -> Result<Option<SignalSample>> {
            if self.broken.contains(&index) {
                return Ok(None);
            }
            Ok(Some(SignalSample {
                signal: (Tensor::ones((2, 4), DType::F32, &Device::Cpu)? * index as f64)?,
                image: Tensor::zeros((3, 3, 3), DType::F32, &Device::Cpu)?,
                image_raw: Tensor::zeros(5, DType::F32, &Device::Cpu)?,
                label: Some(index as u32),
            }))
        }
    }

    fn first_values(batch: &Batch) -> Result<Vec<f32>> {
        Ok(batch.signal.narrow(1, 0, 1)?.narrow(2, 0, 1)?.flatten_all()?.to_vec1::<f32>()?)
    }

    #[test]
    fn test_collate_drops_none() -> Result<()> {
        let ds = Toy { broken: vec![1], n: 3 };
        let items = (0..3).map(|i| ds.get(i)).collect::<Result<Vec<_>>>()?;
        let batch = collate(items)?.ok_or_else(|| anyhow::anyhow!("empty batch"))?;
        assert_eq!(batch.len(), 2);
        assert_eq!(first_values(&batch)?, vec![0.0, 2.0]);
        assert_eq!(batch.label.map(|l| l.to_vec1::<u32>()).transpose()?, Some(vec![0, 2]));
        assert!(collate(vec![None, None])?.is_none());
        Ok(())
    }

    #[derive(Clone, Default)]
    struct Captured(std::sync::Arc<std::sync::Mutex<Vec<u8>>>);

    impl std::io::Write for Captured {
        fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
            self.0.lock().unwrap().extend_from_slice(buf);
            Ok(buf.len())
        }

        fn flush(&mut self) -> std::io::Result<()> {
            Ok(())
        }
    }

    #[test]
    fn test_collate_drops_without_reporting() -> Result<()> {
        let captured = Captured::default();
        let sink = captured.clone();
        let subscriber = tracing_subscriber::fmt()
            .with_max_level(tracing::Level::INFO)
            .with_writer(move || sink.clone())
            .finish();
        let ds = Toy { broken: vec![0], n: 2 };
        let items = (0..2).map(|i| ds.get(i)).collect::<Result<Vec<_>>>()?;
        let batch = tracing::subscriber::with_default(subscriber, || collate(items))?;
        assert_eq!(batch.map(|b| b.len()), Some(1));
        let logged = String::from_utf8(captured.0.lock().unwrap().clone())?;
        assert!(logged.is_empty(), "unexpected log output: {logged}");
        Ok(())
    }

    #[test]
    fn test_loader_skips_all_broken_batches() -> Result<()> {
        let ds = Toy { broken: vec![2, 3], n: 5 };
        let mut loader = DataLoader::new(&ds, 2);
        let batches = loader.epoch().collect::<Result<Vec<_>>>()?;
        let sizes: Vec<usize> = batches.iter().map(Batch::len).collect();
        assert_eq!(sizes, vec![2, 1]);
        Ok(())
    }

    #[test]
    fn test_shuffle_is_seeded_and_complete() -> Result<()> {
        let ds = Toy { broken: vec![], n: 7 };
        let collect = |seed| -> Result<Vec<f32>> {
            let mut loader = DataLoader::new(&ds, 3).with_shuffle(seed);
            let mut seen = Vec::new();
            for b in loader.epoch() {
                seen.extend(first_values(&b?)?);
            }
            Ok(seen)
        };
        let a = collect(9)?;
        assert_eq!(a, collect(9)?);
        let mut sorted = a.clone();
        sorted.sort_by(|x, y| x.total_cmp(y));
        assert_eq!(sorted, (0..7).map(|i| i as f32).collect::<Vec<_>>());
        Ok(())
    }

    #[test]
    fn test_safetensors_dataset_flags_non_finite() -> Result<()> {
        let dir = tempfile::tempdir()?;
        let path = dir.path().join("split.safetensors");
        let mut eeg = vec![0f32; 3 * 2 * 4];
        eeg[8] = f32::NAN;
        let mut tensors = HashMap::new();
        tensors.insert("eeg".to_string(), Tensor::from_vec(eeg, (3, 2, 4), &Device::Cpu)?);
        tensors.insert("image".to_string(), Tensor::zeros((3, 4, 4, 3), DType::F32, &Device::Cpu)?);
        tensors.insert("image_raw".to_string(), Tensor::ones((3, 6), DType::F32, &Device::Cpu)?);
        tensors.insert("label".to_string(), Tensor::new(&[4u32, 1, 0], &Device::Cpu)?);
        candle_core::safetensors::save(&tensors, &path)?;

        let ds = SafetensorsDataset::open(&path)?;
        assert_eq!(ds.len(), 3);
        assert!(ds.get(1)?.is_none());
        let s = ds.get(2)?.ok_or_else(|| anyhow::anyhow!("sample 2 missing"))?;
        assert_eq!(s.signal.dims2()?, (2, 4));
        assert_eq!(s.label, Some(0));
        Ok(())
    }

    #[test]
    fn test_precomputed_embedder_flattens() -> Result<()> {
        let raw = Tensor::ones((2, 1, 6), DType::F32, &Device::Cpu)?;
        assert_eq!(PrecomputedEmbedder.embed(&raw)?.dims2()?, (2, 6));
        Ok(())
    }
}
