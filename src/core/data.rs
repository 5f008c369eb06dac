//! Image-classification datasets and the batching loader.

use std::fs::File;
use std::io::{BufReader, Read};
use std::path::Path;
use std::sync::Arc;

use ndarray::{Array2, ArrayView1, Axis};
use serde::{Deserialize, Serialize};
use tracing::info;

use crate::error::{HebbError, Result};
use crate::prng::Prng;

const IDX_IMAGES_MAGIC: u32 = 0x0000_0803;
const IDX_LABELS_MAGIC: u32 = 0x0000_0801;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ImageShape {
    pub channels: usize,
    pub height: usize,
    pub width: usize,
}

impl ImageShape {
    pub const MNIST: ImageShape = ImageShape {
        channels: 1,
        height: 28,
        width: 28,
    };

    pub fn new(channels: usize, height: usize, width: usize) -> Self {
        Self {
            channels,
            height,
            width,
        }
    }

    pub fn numel(&self) -> usize {
        self.channels * self.height * self.width
    }

    pub fn plane(&self) -> usize {
        self.height * self.width
    }
}

impl Default for ImageShape {
    fn default() -> Self {
        Self::MNIST
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Split {
    Train,
    Test,
}

impl Split {
    fn prefix(self) -> &'static str {
        match self {
            Split::Train => "train",
            Split::Test => "t10k",
        }
    }
}

/// Flattened images (`[n, C*H*W]`, values in [0, 1]) and their labels.
#[derive(Debug, Clone)]
pub struct Dataset {
    pub images: Array2<f32>,
    pub labels: Vec<usize>,
    pub shape: ImageShape,
    pub classes: usize,
}

impl Dataset {
    pub fn new(images: Array2<f32>, labels: Vec<usize>, shape: ImageShape) -> Result<Self> {
        if images.nrows() != labels.len() {
            return Err(HebbError::Dataset(format!(
                "{} images but {} labels",
                images.nrows(),
                labels.len()
            )));
        }
        if images.ncols() != shape.numel() {
            return Err(HebbError::Dataset(format!(
                "image width {} does not match shape {:?}",
                images.ncols(),
                shape
            )));
        }
        let classes = labels.iter().max().map_or(0, |&m| m + 1);
        Ok(Self {
            images,
            labels,
            shape,
            classes,
        })
    }

    pub fn len(&self) -> usize {
        self.labels.len()
    }

    pub fn is_empty(&self) -> bool {
        self.labels.is_empty()
    }

    pub fn image(&self, index: usize) -> ArrayView1<'_, f32> {
        self.images.index_axis(Axis(0), index)
    }

    /// Keeps the first `n` examples.
    pub fn truncate(mut self, n: usize) -> Self {
        if n < self.len() {
            self.images = self.images.slice_axis(Axis(0), (0..n).into()).to_owned();
            self.labels.truncate(n);
        }
        self
    }

    /// Reads `{train,t10k}-images-idx3-ubyte` and `-labels-idx1-ubyte` from
    /// `dir` (MNIST and FashionMNIST share the layout).
    pub fn load_idx(dir: &Path, split: Split) -> Result<Self> {
        let prefix = split.prefix();
        let images_path = dir.join(format!("{prefix}-images-idx3-ubyte"));
        let labels_path = dir.join(format!("{prefix}-labels-idx1-ubyte"));

        let (images, shape) = read_idx_images(&images_path)?;
        let labels = read_idx_labels(&labels_path)?;
        let ds = Self::new(images, labels, shape)?;
        info!(dir = %dir.display(), ?split, examples = ds.len(), "loaded idx dataset");
        Ok(ds)
    }
}

fn open_idx(path: &Path) -> Result<BufReader<File>> {
    File::open(path)
        .map(BufReader::new)
        .map_err(|e| HebbError::Dataset(format!("cannot open {}: {e}", path.display())))
}

fn read_be_u32<R: Read>(r: &mut R) -> Result<u32> {
    let mut buf = [0u8; 4];
    r.read_exact(&mut buf)?;
    Ok(u32::from_be_bytes(buf))
}

pub fn read_idx_images(path: &Path) -> Result<(Array2<f32>, ImageShape)> {
    let mut r = open_idx(path)?;
    parse_idx_images(&mut r)
}

pub fn read_idx_labels(path: &Path) -> Result<Vec<usize>> {
    let mut r = open_idx(path)?;
    parse_idx_labels(&mut r)
}

pub fn parse_idx_images<R: Read>(r: &mut R) -> Result<(Array2<f32>, ImageShape)> {
    let magic = read_be_u32(r)?;
    if magic != IDX_IMAGES_MAGIC {
        return Err(HebbError::Dataset(format!("bad idx image magic {magic:#x}")));
    }
    let n = read_be_u32(r)? as usize;
    let h = read_be_u32(r)? as usize;
    let w = read_be_u32(r)? as usize;
    let shape = ImageShape::new(1, h, w);
    let mut raw = vec![0u8; n * shape.numel()];
    r.read_exact(&mut raw)?;
    let pixels = raw.into_iter().map(|p| p as f32 / 255.0).collect();
    Ok((Array2::from_shape_vec((n, shape.numel()), pixels)?, shape))
}

pub fn parse_idx_labels<R: Read>(r: &mut R) -> Result<Vec<usize>> {
    let magic = read_be_u32(r)?;
    if magic != IDX_LABELS_MAGIC {
        return Err(HebbError::Dataset(format!("bad idx label magic {magic:#x}")));
    }
    let n = read_be_u32(r)? as usize;
    let mut raw = vec![0u8; n];
    r.read_exact(&mut raw)?;
    Ok(raw.into_iter().map(usize::from).collect())
}

/// One minibatch.
#[derive(Debug, Clone)]
pub struct Batch {
    pub inputs: Array2<f32>,
    pub labels: Vec<usize>,
}

impl Batch {
    pub fn len(&self) -> usize {
        self.labels.len()
    }

    pub fn is_empty(&self) -> bool {
        self.labels.is_empty()
    }
}

/// Splits a dataset into minibatches, optionally reshuffled every epoch.
/// The last partial batch is kept.
///
/// The dataset sits behind an [`Arc`], so cloning a loader shares the images.
#[derive(Debug, Clone)]
pub struct DataLoader {
    dataset: Arc<Dataset>,
    batch_size: usize,
    shuffle: bool,
    rng: Prng,
}

impl DataLoader {
    pub fn new(
        dataset: impl Into<Arc<Dataset>>,
        batch_size: usize,
        shuffle: bool,
        seed: u64,
    ) -> Result<Self> {
        let dataset = dataset.into();
        if batch_size == 0 {
            return Err(HebbError::config("batch_size must be at least 1"));
        }
        if dataset.is_empty() {
            return Err(HebbError::Dataset("dataset is empty".into()));
        }
        Ok(Self {
            dataset,
            batch_size,
            shuffle,
            rng: Prng::new(seed),
        })
    }

    pub fn dataset(&self) -> &Dataset {
        &self.dataset
    }

    pub fn batch_size(&self) -> usize {
        self.batch_size
    }

    pub fn num_batches(&self) -> usize {
        self.dataset.len().div_ceil(self.batch_size)
    }

    /// One pass over the data. Each batch is gathered when it is pulled.
    pub fn epoch(&mut self) -> Batches {
        let mut order: Vec<usize> = (0..self.dataset.len()).collect();
        if self.shuffle {
            self.rng.shuffle(&mut order);
        }
        Batches {
            dataset: Arc::clone(&self.dataset),
            order,
            batch_size: self.batch_size,
            cursor: 0,
        }
    }
}

/// Iterator over the minibatches of one epoch.
#[derive(Debug)]
pub struct Batches {
    dataset: Arc<Dataset>,
    order: Vec<usize>,
    batch_size: usize,
    cursor: usize,
}

impl Iterator for Batches {
    type Item = Batch;

    fn next(&mut self) -> Option<Batch> {
        if self.cursor >= self.order.len() {
            return None;
        }
        let end = (self.cursor + self.batch_size).min(self.order.len());
        let idx = &self.order[self.cursor..end];
        self.cursor = end;
        Some(Batch {
            inputs: self.dataset.images.select(Axis(0), idx),
            labels: idx.iter().map(|&i| self.dataset.labels[i]).collect(),
        })
    }

    fn size_hint(&self) -> (usize, Option<usize>) {
        let left = (self.order.len() - self.cursor).div_ceil(self.batch_size);
        (left, Some(left))
    }
}

impl ExactSizeIterator for Batches {}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Cursor;

    fn idx_images(n: u32, h: u32, w: u32, fill: u8) -> Vec<u8> {
        let mut v = Vec::new();
        v.extend_from_slice(&IDX_IMAGES_MAGIC.to_be_bytes());
        v.extend_from_slice(&n.to_be_bytes());
        v.extend_from_slice(&h.to_be_bytes());
        v.extend_from_slice(&w.to_be_bytes());
        v.extend(std::iter::repeat(fill).take((n * h * w) as usize));
        v
    }

    fn toy(n: usize) -> Dataset {
        let images = Array2::from_shape_fn((n, 4), |(i, j)| (i * 4 + j) as f32);
        let labels = (0..n).map(|i| i % 3).collect();
        Dataset::new(images, labels, ImageShape::new(1, 2, 2)).unwrap()
    }

    #[test]
    fn parses_idx_images_and_scales() {
        let bytes = idx_images(2, 3, 3, 255);
        let (images, shape) = parse_idx_images(&mut Cursor::new(bytes)).unwrap();
        assert_eq!(shape, ImageShape::new(1, 3, 3));
        assert_eq!(images.dim(), (2, 9));
        assert!(images.iter().all(|&p| p == 1.0));
    }

    #[test]
    fn parses_idx_labels() {
        let mut v = IDX_LABELS_MAGIC.to_be_bytes().to_vec();
        v.extend_from_slice(&3u32.to_be_bytes());
        v.extend_from_slice(&[7, 0, 9]);
        assert_eq!(parse_idx_labels(&mut Cursor::new(v)).unwrap(), vec![7, 0, 9]);
    }

    #[test]
    fn bad_magic_is_a_dataset_error() {
        let mut bytes = idx_images(1, 2, 2, 0);
        bytes[3] = 0x01;
        assert!(matches!(
            parse_idx_images(&mut Cursor::new(bytes)),
            Err(HebbError::Dataset(_))
        ));
    }

    #[test]
    fn truncated_file_is_an_io_error() {
        let mut bytes = idx_images(2, 2, 2, 0);
        bytes.truncate(bytes.len() - 1);
        assert!(matches!(parse_idx_images(&mut Cursor::new(bytes)), Err(HebbError::Io(_))));
    }

    #[test]
    fn count_mismatch_is_rejected() {
        let err = Dataset::new(Array2::zeros((3, 4)), vec![0, 1], ImageShape::new(1, 2, 2));
        assert!(matches!(err, Err(HebbError::Dataset(_))));
    }

    #[test]
    fn loader_covers_every_example_once() {
        let mut loader = DataLoader::new(toy(10), 4, true, 5).unwrap();
        assert_eq!(loader.num_batches(), 3);
        let batches: Vec<Batch> = loader.epoch().collect();
        assert_eq!(batches.iter().map(Batch::len).collect::<Vec<_>>(), vec![4, 4, 2]);

        let mut firsts: Vec<usize> = batches
            .iter()
            .flat_map(|b| b.inputs.column(0).iter().map(|&v| v as usize / 4).collect::<Vec<_>>())
            .collect();
        firsts.sort_unstable();
        assert_eq!(firsts, (0..10).collect::<Vec<_>>());

        for b in &batches {
            for (row, &label) in b.inputs.rows().into_iter().zip(&b.labels) {
                assert_eq!((row[0] as usize / 4) % 3, label);
            }
        }
    }

    #[test]
    fn unshuffled_loader_keeps_order() {
        let mut loader = DataLoader::new(toy(5), 2, false, 0).unwrap();
        let batches: Vec<Batch> = loader.epoch().collect();
        assert_eq!(batches[0].labels, vec![0, 1]);
        assert_eq!(batches[2].labels, vec![1]);
    }

    #[test]
    fn clones_share_one_dataset() {
        let ds = Arc::new(toy(9));
        let loader = DataLoader::new(Arc::clone(&ds), 4, true, 1).unwrap();
        let copy = loader.clone();
        assert!(std::ptr::eq(loader.dataset(), copy.dataset()));
        assert!(std::ptr::eq(loader.dataset(), &*ds));
        assert_eq!(Arc::strong_count(&ds), 3);
    }

    #[test]
    fn epoch_gathers_batches_on_demand() {
        let mut loader = DataLoader::new(toy(9), 4, false, 0).unwrap();
        let mut batches = loader.epoch();
        assert_eq!(batches.len(), 3);
        let first = batches.next().unwrap();
        assert_eq!(first.labels, vec![0, 1, 2, 0]);
        assert_eq!(batches.len(), 2);
        assert_eq!(batches.last().unwrap().len(), 1);
    }

    #[test]
    fn zero_batch_size_is_rejected() {
        assert!(matches!(DataLoader::new(toy(2), 0, false, 0), Err(HebbError::Config(_))));
    }
}
