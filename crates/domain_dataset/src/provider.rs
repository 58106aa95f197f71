//! Loading domains from a class-per-directory image tree.

use crate::types::{
    DatasetError, DatasetResult, DomainDataset, DomainSample, Split, IMAGE_CHANNELS, IMAGE_SIDE,
};
use image::imageops::FilterType;
use rayon::prelude::*;
use std::fs;
use std::path::{Path, PathBuf};
use tracing::{debug, info};

/// Resolves a domain name (e.g. `MNIST`, `MNIST_M`) to its dataset.
pub trait DatasetProvider {
    fn load(&self, domain: &str) -> DatasetResult<DomainDataset>;
}

/// Reads `<root>/<DOMAIN>/{train,test}/<class_index>/*.{png,jpg,jpeg}`.
///
/// Images are converted to RGB and resized to 28x28, so grayscale domains end up with the
/// same three-channel layout as color ones.
#[derive(Debug, Clone)]
pub struct ImageFolderProvider {
    root: PathBuf,
}

impl ImageFolderProvider {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    fn index_split(dir: &Path) -> DatasetResult<Vec<(PathBuf, usize)>> {
        let mut files = Vec::new();
        if !dir.exists() {
            return Ok(files);
        }
        for entry in read_dir(dir)? {
            let class_dir = entry.path();
            if !class_dir.is_dir() {
                continue;
            }
            let class = class_dir
                .file_name()
                .and_then(|s| s.to_str())
                .and_then(|s| s.parse::<usize>().ok())
                .ok_or_else(|| DatasetError::InvalidClass {
                    path: class_dir.clone(),
                })?;
            for image in read_dir(&class_dir)? {
                let path = image.path();
                let is_image = path
                    .extension()
                    .and_then(|s| s.to_str())
                    .map(|ext| {
                        let ext = ext.to_ascii_lowercase();
                        ext == "png" || ext == "jpg" || ext == "jpeg"
                    })
                    .unwrap_or(false);
                if is_image {
                    files.push((path, class));
                }
            }
        }
        // Directory iteration order is platform dependent.
        files.sort();
        Ok(files)
    }

    fn load_split(&self, domain_dir: &Path, split: Split) -> DatasetResult<Vec<DomainSample>> {
        let files = Self::index_split(&domain_dir.join(split.dir_name()))?;
        debug!(
            split = split.dir_name(),
            files = files.len(),
            "indexed {}",
            domain_dir.display()
        );
        files
            .par_iter()
            .map(|(path, class)| load_image(path).and_then(|px| DomainSample::new(px, Some(*class))))
            .collect()
    }
}

impl DatasetProvider for ImageFolderProvider {
    fn load(&self, domain: &str) -> DatasetResult<DomainDataset> {
        let domain_dir = self.root.join(domain);
        if !domain_dir.is_dir() {
            return Err(DatasetError::UnknownDomain {
                domain: domain.to_string(),
                root: self.root.clone(),
            });
        }
        let train = self.load_split(&domain_dir, Split::Train)?;
        let test = self.load_split(&domain_dir, Split::Test)?;
        let num_classes = train
            .iter()
            .chain(test.iter())
            .filter_map(|s| s.label)
            .max()
            .map(|max| max + 1)
            .unwrap_or(0);
        info!(
            domain,
            train = train.len(),
            test = test.len(),
            num_classes,
            "loaded domain"
        );
        Ok(DomainDataset::new(domain, num_classes, train, test))
    }
}

fn read_dir(dir: &Path) -> DatasetResult<Vec<fs::DirEntry>> {
    let io_err = |source| DatasetError::Io {
        path: dir.to_path_buf(),
        source,
    };
    fs::read_dir(dir)
        .map_err(io_err)?
        .collect::<Result<Vec<_>, _>>()
        .map_err(io_err)
}

/// Decode, resize to 28x28 and lay out in CHW order.
fn load_image(path: &Path) -> DatasetResult<Vec<u8>> {
    let img = image::open(path)
        .map_err(|source| DatasetError::Image {
            path: path.to_path_buf(),
            source,
        })?
        .to_rgb8();
    let side = IMAGE_SIDE as u32;
    let img = if img.dimensions() == (side, side) {
        img
    } else {
        image::imageops::resize(&img, side, side, FilterType::Triangle)
    };
    let mut chw = Vec::with_capacity(IMAGE_CHANNELS * IMAGE_SIDE * IMAGE_SIDE);
    for c in 0..IMAGE_CHANNELS {
        for y in 0..side {
            for x in 0..side {
                chw.push(img.get_pixel(x, y)[c]);
            }
        }
    }
    Ok(chw)
}
