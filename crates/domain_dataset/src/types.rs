//! Core types and error definitions for domain datasets.

use std::path::PathBuf;
use std::sync::Arc;
use thiserror::Error;

pub type DatasetResult<T> = Result<T, DatasetError>;

/// Side length of every image handed to the models.
pub const IMAGE_SIDE: usize = 28;
pub const IMAGE_CHANNELS: usize = 3;
pub const IMAGE_ELEMS: usize = IMAGE_CHANNELS * IMAGE_SIDE * IMAGE_SIDE;

#[derive(Debug, Error)]
pub enum DatasetError {
    #[error("io error at {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("image decode error at {path}: {source}")]
    Image {
        path: PathBuf,
        #[source]
        source: image::ImageError,
    },
    #[error("unknown domain '{domain}': no directory at {root}")]
    UnknownDomain { domain: String, root: PathBuf },
    #[error("class directory name is not a class index: {path}")]
    InvalidClass { path: PathBuf },
    #[error("sample has {actual} pixel values, expected {expected}")]
    SampleSize { expected: usize, actual: usize },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Split {
    Train,
    Test,
}

impl Split {
    pub fn dir_name(self) -> &'static str {
        match self {
            Split::Train => "train",
            Split::Test => "test",
        }
    }
}

/// One image in CHW layout, `IMAGE_ELEMS` bytes, plus its class if known.
#[derive(Debug, Clone, PartialEq)]
pub struct DomainSample {
    pub pixels: Vec<u8>,
    pub label: Option<usize>,
}

impl DomainSample {
    pub fn new(pixels: Vec<u8>, label: Option<usize>) -> DatasetResult<Self> {
        if pixels.len() != IMAGE_ELEMS {
            return Err(DatasetError::SampleSize {
                expected: IMAGE_ELEMS,
                actual: pixels.len(),
            });
        }
        Ok(Self { pixels, label })
    }
}

/// Both splits of one domain. Splits are shared so iterators never copy pixel data.
#[derive(Debug, Clone)]
pub struct DomainDataset {
    pub name: String,
    pub num_classes: usize,
    pub train: Arc<Vec<DomainSample>>,
    pub test: Arc<Vec<DomainSample>>,
}

impl DomainDataset {
    pub fn new(
        name: impl Into<String>,
        num_classes: usize,
        train: Vec<DomainSample>,
        test: Vec<DomainSample>,
    ) -> Self {
        Self {
            name: name.into(),
            num_classes,
            train: Arc::new(train),
            test: Arc::new(test),
        }
    }

    pub fn split(&self, split: Split) -> Arc<Vec<DomainSample>> {
        match split {
            Split::Train => Arc::clone(&self.train),
            Split::Test => Arc::clone(&self.test),
        }
    }
}
