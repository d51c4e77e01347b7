//! Reads MNIST style datasets stored in the IDX binary format
//!
//! Both MNIST digits and Fashion-MNIST ship as four files per dataset:
//! ```text
//! train-images-idx3-ubyte  train-labels-idx1-ubyte
//! t10k-images-idx3-ubyte   t10k-labels-idx1-ubyte
//! ```
//! Image files start with the magic number `0x00000803` followed by the big-endian
//! `u32`s `n_items`, `rows`, `cols`, then `n_items * rows * cols` pixel bytes.
//! Label files start with `0x00000801`, then `n_items`, then one byte per label.

use std::{
    fmt::{self, Display},
    fs,
    path::{Path, PathBuf},
};

use clap::ValueEnum;
use thiserror::Error;

const IMAGES_MAGIC: u32 = 0x0000_0803;
const LABELS_MAGIC: u32 = 0x0000_0801;

/// Errors while reading an IDX dataset
#[derive(Debug, Error)]
pub enum MnistError {
    #[error("Failed to read '{path}': {source}")]
    Io {
        path: PathBuf,
        source: std::io::Error,
    },
    #[error("Bad magic number in {kind} file: expected {expected:#010x}, got {got:#010x}")]
    BadMagic {
        kind: &'static str,
        expected: u32,
        got: u32,
    },
    #[error("{kind} file is truncated: need {needed} bytes, got {got}")]
    Truncated {
        kind: &'static str,
        needed: usize,
        got: usize,
    },
    #[error("Image file holds {images} items but label file holds {labels}")]
    CountMismatch { images: usize, labels: usize },
    #[error("Image header of {n_items} items of {rows}x{cols} pixels does not fit in memory")]
    HeaderTooLarge {
        n_items: usize,
        rows: usize,
        cols: usize,
    },
    #[error("Images of {rows}x{cols} hold no pixels")]
    EmptyImage { rows: usize, cols: usize },
}

/// Which dataset the files hold, only affects the class names
#[derive(Debug, ValueEnum, Clone, Copy, PartialEq, Eq)]
pub enum DatasetKind {
    Mnist,
    FashionMnist,
}

impl DatasetKind {
    pub fn class_names(&self) -> [&'static str; 10] {
        match self {
            DatasetKind::Mnist => ["0", "1", "2", "3", "4", "5", "6", "7", "8", "9"],
            DatasetKind::FashionMnist => [
                "T-shirt/top",
                "Trouser",
                "Pullover",
                "Dress",
                "Coat",
                "Sandal",
                "Shirt",
                "Sneaker",
                "Bag",
                "Ankle Boot",
            ],
        }
    }

    /// Class name for a raw label, or the label itself when it names no class
    pub fn label_name(&self, label: u8) -> String {
        self.class_names()
            .get(label as usize)
            .map_or_else(|| label.to_string(), |name| name.to_string())
    }
}

impl Display for DatasetKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DatasetKind::Mnist => write!(f, "mnist"),
            DatasetKind::FashionMnist => write!(f, "fashion-mnist"),
        }
    }
}

/// Training or test portion of the dataset
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Split {
    Train,
    Test,
}

impl Split {
    fn file_prefix(&self) -> &'static str {
        match self {
            Split::Train => "train",
            Split::Test => "t10k",
        }
    }

    pub fn images_path(&self, dir: &Path) -> PathBuf {
        dir.join(format!("{}-images-idx3-ubyte", self.file_prefix()))
    }

    pub fn labels_path(&self, dir: &Path) -> PathBuf {
        dir.join(format!("{}-labels-idx1-ubyte", self.file_prefix()))
    }
}

/// Per-pixel normalization applied after scaling bytes to `[0, 1]`, like
/// `transforms.Normalize((mean,), (std,))`
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Normalize {
    pub mean: f32,
    pub std: f32,
}

impl Default for Normalize {
    /// Maps pixels to `[-1, 1]`
    fn default() -> Self {
        Self {
            mean: 0.5,
            std: 0.5,
        }
    }
}

impl Normalize {
    pub fn apply(&self, pixel: u8) -> f32 {
        (pixel as f32 / 255.0 - self.mean) / self.std
    }

    /// Inverse of [`Normalize::apply`] back to `[0, 1]` intensity, used for display
    pub fn invert(&self, value: f32) -> f32 {
        (value * self.std + self.mean).clamp(0.0, 1.0)
    }
}

/// Normalized images and their class labels
#[derive(Debug, Clone)]
pub struct Mnist {
    pub rows: usize,
    pub cols: usize,
    /// one flattened, row-major image per item
    pub images: Vec<Vec<f32>>,
    pub labels: Vec<u8>,
}

impl Mnist {
    pub fn len(&self) -> usize {
        self.labels.len()
    }

    pub fn is_empty(&self) -> bool {
        self.labels.is_empty()
    }

    /// Number of pixels per image
    pub fn n_features(&self) -> usize {
        self.rows * self.cols
    }
}

fn read_u32(bytes: &[u8], offset: usize) -> u32 {
    u32::from_be_bytes([
        bytes[offset],
        bytes[offset + 1],
        bytes[offset + 2],
        bytes[offset + 3],
    ])
}

fn check_header(
    bytes: &[u8],
    kind: &'static str,
    magic: u32,
    header_len: usize,
) -> Result<(), MnistError> {
    if bytes.len() < header_len {
        return Err(MnistError::Truncated {
            kind,
            needed: header_len,
            got: bytes.len(),
        });
    }
    let got = read_u32(bytes, 0);
    if got != magic {
        return Err(MnistError::BadMagic {
            kind,
            expected: magic,
            got,
        });
    }
    Ok(())
}

/// Parses an image file and a label file already in memory, keeping at most `limit` items
pub fn parse_idx(
    image_bytes: &[u8],
    label_bytes: &[u8],
    normalize: Normalize,
    limit: Option<usize>,
) -> Result<Mnist, MnistError> {
    check_header(image_bytes, "image", IMAGES_MAGIC, 16)?;
    check_header(label_bytes, "label", LABELS_MAGIC, 8)?;

    let n_images = read_u32(image_bytes, 4) as usize;
    let rows = read_u32(image_bytes, 8) as usize;
    let cols = read_u32(image_bytes, 12) as usize;
    let n_labels = read_u32(label_bytes, 4) as usize;
    if n_images != n_labels {
        return Err(MnistError::CountMismatch {
            images: n_images,
            labels: n_labels,
        });
    }

    let n_pixels = rows.checked_mul(cols).ok_or(MnistError::HeaderTooLarge {
        n_items: n_images,
        rows,
        cols,
    })?;
    if n_pixels == 0 {
        return Err(MnistError::EmptyImage { rows, cols });
    }
    let needed = n_images
        .checked_mul(n_pixels)
        .and_then(|n| n.checked_add(16))
        .ok_or(MnistError::HeaderTooLarge {
            n_items: n_images,
            rows,
            cols,
        })?;
    if image_bytes.len() < needed {
        return Err(MnistError::Truncated {
            kind: "image",
            needed,
            got: image_bytes.len(),
        });
    }
    let needed = n_labels.saturating_add(8);
    if label_bytes.len() < needed {
        return Err(MnistError::Truncated {
            kind: "label",
            needed,
            got: label_bytes.len(),
        });
    }

    let n_items = limit.map_or(n_images, |l| l.min(n_images));
    // n_items <= n_images, so this fits inside the checked size above
    let images = image_bytes[16..16 + n_items * n_pixels]
        .chunks_exact(n_pixels)
        .map(|chunk| chunk.iter().map(|&p| normalize.apply(p)).collect())
        .collect();
    let labels = label_bytes[8..8 + n_items].to_vec();

    Ok(Mnist {
        rows,
        cols,
        images,
        labels,
    })
}

fn read_file(path: &Path) -> Result<Vec<u8>, MnistError> {
    fs::read(path).map_err(|source| MnistError::Io {
        path: path.to_path_buf(),
        source,
    })
}

/// Loads one split from `dir`, see the module docs for the expected file names
pub fn load_split(
    dir: &Path,
    split: Split,
    normalize: Normalize,
    limit: Option<usize>,
) -> Result<Mnist, MnistError> {
    let images = read_file(&split.images_path(dir))?;
    let labels = read_file(&split.labels_path(dir))?;
    let dataset = parse_idx(&images, &labels, normalize, limit)?;
    log::info!(
        "Loaded {} {:?} images of {}x{} from '{}'",
        dataset.len(),
        split,
        dataset.rows,
        dataset.cols,
        dir.display()
    );
    Ok(dataset)
}

/// Encodes images and labels in the IDX format, the inverse of [`parse_idx`] on raw bytes
pub fn encode_idx(rows: usize, cols: usize, images: &[Vec<u8>], labels: &[u8]) -> (Vec<u8>, Vec<u8>) {
    let mut image_bytes = Vec::with_capacity(16 + images.len() * rows * cols);
    image_bytes.extend_from_slice(&IMAGES_MAGIC.to_be_bytes());
    image_bytes.extend_from_slice(&(images.len() as u32).to_be_bytes());
    image_bytes.extend_from_slice(&(rows as u32).to_be_bytes());
    image_bytes.extend_from_slice(&(cols as u32).to_be_bytes());
    for image in images {
        image_bytes.extend_from_slice(image);
    }

    let mut label_bytes = Vec::with_capacity(8 + labels.len());
    label_bytes.extend_from_slice(&LABELS_MAGIC.to_be_bytes());
    label_bytes.extend_from_slice(&(labels.len() as u32).to_be_bytes());
    label_bytes.extend_from_slice(labels);

    (image_bytes, label_bytes)
}
