use anyhow::{ensure, Context, Result};
use burn::{
    data::dataloader::{batcher::Batcher, Dataset},
    prelude::*,
};
use image::{imageops::FilterType, DynamicImage};
use mime_guess::MimeGuess;
use rand::{thread_rng, Rng};
use serde::{Deserialize, Serialize};
use std::{
    fs::File,
    path::{Path, PathBuf},
};

/// Annotation file: attribute vocabulary, optional landmark count and
/// one entry per image. Landmark coordinates are x,y pairs normalized
/// to `[0, 1]` image coordinates.
#[derive(Debug, Serialize, Deserialize)]
pub struct AttrAnnotations {
    pub attributes: Vec<String>,
    #[serde(default)]
    pub num_landmarks: Option<usize>,
    pub samples: Vec<AttrSample>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AttrSample {
    pub path: PathBuf,
    pub attributes: Vec<i64>,
    #[serde(default)]
    pub landmarks: Option<Vec<f32>>,
}

#[derive(Debug, Clone)]
pub struct AttrItem {
    image: Vec<f32>,
    targets: Vec<i64>,
    landmarks: Option<Vec<f32>>,
    path: PathBuf,
}

impl AttrItem {
    fn image_tensor<B: Backend>(&self) -> Tensor<B, 1> {
        Tensor::from_data(&self.image[..], &B::Device::default())
    }

    fn target_tensor<B: Backend>(&self) -> Tensor<B, 1, Int> {
        Tensor::from_data(&self.targets[..], &B::Device::default())
    }

    fn landmark_tensor<B: Backend>(&self) -> Option<Tensor<B, 1>> {
        self.landmarks
            .as_ref()
            .map(|coords| Tensor::from_data(&coords[..], &B::Device::default()))
    }
}

pub struct AttrDataSet {
    samples: Vec<AttrSample>,
    num_attributes: usize,
    num_landmarks: Option<usize>,
    image_size: usize,
    augment: bool,
}

impl AttrDataSet {
    /// Labeled set with flip augmentation, for the training split.
    pub fn train(annotations: &Path, image_size: usize) -> Result<Self> {
        Self::labeled(annotations, image_size, true)
    }

    /// Labeled set without augmentation, for validation and evaluation.
    pub fn eval(annotations: &Path, image_size: usize) -> Result<Self> {
        Self::labeled(annotations, image_size, false)
    }

    fn labeled(annotations: &Path, image_size: usize, augment: bool) -> Result<Self> {
        let file = File::open(annotations)
            .with_context(|| format!("failed to open annotations {}", annotations.display()))?;
        let parsed: AttrAnnotations = serde_json::from_reader(file)
            .with_context(|| format!("failed to parse annotations {}", annotations.display()))?;
        let num_attributes = parsed.attributes.len();
        ensure!(num_attributes > 0, "annotations declare no attributes");

        for sample in &parsed.samples {
            ensure!(
                sample.path.canonicalize().is_ok(),
                "expected {} to exist",
                sample.path.display()
            );
            ensure!(
                sample.attributes.len() == num_attributes,
                "{}: expected {num_attributes} attribute labels, got {}",
                sample.path.display(),
                sample.attributes.len()
            );
            match parsed.num_landmarks {
                Some(count) => {
                    let coords = sample.landmarks.as_ref().with_context(|| {
                        format!("{}: landmarks missing", sample.path.display())
                    })?;
                    ensure!(
                        coords.len() == 2 * count,
                        "{}: expected {} landmark coordinates, got {}",
                        sample.path.display(),
                        2 * count,
                        coords.len()
                    );
                }
                None => ensure!(
                    sample.landmarks.is_none(),
                    "{}: landmarks present but the annotation header declares none",
                    sample.path.display()
                ),
            }
        }

        Ok(Self {
            samples: parsed.samples,
            num_attributes,
            num_landmarks: parsed.num_landmarks,
            image_size,
            augment,
        })
    }

    /// Unlabeled set scanned from a directory tree, for raw prediction.
    pub fn unlabeled(root: &Path, image_size: usize) -> Result<Self> {
        let mut paths = walkdir::WalkDir::new(root)
            .into_iter()
            .filter_map(|res| res.ok())
            .filter_map(|entry| match MimeGuess::from_path(entry.path()).first() {
                Some(mime) if mime.type_() == "image" => Some(entry.into_path()),
                _ => None,
            })
            .collect::<Vec<_>>();
        paths.sort();
        ensure!(!paths.is_empty(), "no images found under {}", root.display());
        Ok(Self {
            samples: paths
                .into_iter()
                .map(|path| AttrSample {
                    path,
                    attributes: vec![],
                    landmarks: None,
                })
                .collect(),
            num_attributes: 0,
            num_landmarks: None,
            image_size,
            augment: false,
        })
    }

    /// Keeps every `world_size`-th sample starting at `rank`, so each
    /// worker of a distributed run evaluates a disjoint slice.
    pub fn shard(mut self, rank: usize, world_size: usize) -> Self {
        if world_size > 1 {
            self.samples = self
                .samples
                .into_iter()
                .enumerate()
                .filter(|(index, _)| index % world_size == rank)
                .map(|(_, sample)| sample)
                .collect();
        }
        self
    }

    pub fn num_attributes(&self) -> usize {
        self.num_attributes
    }

    pub fn num_landmarks(&self) -> Option<usize> {
        self.num_landmarks
    }
}

impl Dataset<AttrItem> for AttrDataSet {
    fn get(&self, index: usize) -> Option<AttrItem> {
        let sample = self.samples.get(index)?;
        let mut image = load_image(&sample.path, self.image_size)
            .unwrap_or_else(|| panic!("failed to load image {}", sample.path.display()));
        let mut landmarks = sample.landmarks.clone();
        if self.augment && thread_rng().gen_bool(0.5) {
            image = flip_horizontal(&image, self.image_size);
            if let Some(coords) = landmarks.as_mut() {
                for pair in coords.chunks_mut(2) {
                    pair[0] = 1.0 - pair[0];
                }
            }
        }
        Some(AttrItem {
            image,
            targets: sample.attributes.clone(),
            landmarks,
            path: sample.path.clone(),
        })
    }

    fn len(&self) -> usize {
        self.samples.len()
    }
}

#[derive(Clone)]
pub struct AttrBatcher<B: Backend> {
    device: B::Device,
    image_size: usize,
}

#[derive(Debug, Clone)]
pub struct AttrBatch<B: Backend> {
    pub images: Tensor<B, 4>,
    /// Absent for unlabeled directory scans.
    pub targets: Option<Tensor<B, 2, Int>>,
    pub landmarks: Option<Tensor<B, 2>>,
    pub paths: Vec<PathBuf>,
}

impl<B: Backend> AttrBatcher<B> {
    pub fn new(device: B::Device, image_size: usize) -> Self {
        Self { device, image_size }
    }
}

impl<B: Backend> Batcher<AttrItem, AttrBatch<B>> for AttrBatcher<B> {
    fn batch(&self, items: Vec<AttrItem>) -> AttrBatch<B> {
        let size = self.image_size;
        let images = items
            .iter()
            .map(|item| {
                // decoded buffers are HWC, the model expects NCHW
                item.image_tensor()
                    .reshape([1, size, size, 3])
                    .permute([0, 3, 1, 2])
            })
            .collect::<Vec<_>>();
        let images = Tensor::cat(images, 0).to_device(&self.device);

        let labeled = items.first().map(|item| !item.targets.is_empty()).unwrap_or(false);
        let targets = labeled.then(|| {
            let rows = items
                .iter()
                .map(|item| item.target_tensor().reshape([1, -1]))
                .collect::<Vec<_>>();
            Tensor::cat(rows, 0).to_device(&self.device)
        });

        let with_landmarks = items
            .first()
            .map(|item| item.landmarks.is_some())
            .unwrap_or(false);
        let landmarks = with_landmarks.then(|| {
            let rows = items
                .iter()
                .filter_map(|item| item.landmark_tensor())
                .map(|row| row.reshape([1, -1]))
                .collect::<Vec<_>>();
            Tensor::cat(rows, 0).to_device(&self.device)
        });

        let paths = items.into_iter().map(|item| item.path).collect();
        AttrBatch {
            images,
            targets,
            landmarks,
            paths,
        }
    }
}

fn load_image(path: impl AsRef<Path>, size: usize) -> Option<Vec<f32>> {
    Some(
        open_image_square(path, size)?
            .to_rgb8()
            .into_raw()
            .into_iter()
            .map(|p| p as f32 / 255.0)
            .collect(),
    )
}

/// Aspect-preserving resize onto a black square canvas.
fn open_image_square(path: impl AsRef<Path>, size: usize) -> Option<DynamicImage> {
    let size = size as u32;
    let half = (size / 2) as i64;
    let img = image::open(path.as_ref().canonicalize().ok()?).ok()?;
    let mut background = image::RgbImage::new(size, size);

    let factor = img.height().max(img.width()) as f64 / size as f64;
    if factor == 0. {
        // an invalid image
        return None;
    }
    let nheight = (img.height() as f64 / factor).min(size as f64) as u32;
    let nwidth = (img.width() as f64 / factor).min(size as f64) as u32;
    let img = img.resize(nwidth, nheight, FilterType::Gaussian);
    image::imageops::overlay(
        &mut background,
        &img.to_rgb8(),
        half - (nwidth / 2) as i64,
        half - (nheight / 2) as i64,
    );
    Some(DynamicImage::ImageRgb8(background))
}

/// Left-right mirrored copy of a normalized HWC pixel buffer.
fn flip_horizontal(pixels: &[f32], size: usize) -> Vec<f32> {
    let mut flipped = vec![0.0; pixels.len()];
    for row in 0..size {
        for col in 0..size {
            let src = (row * size + col) * 3;
            let dst = (row * size + (size - 1 - col)) * 3;
            flipped[dst..dst + 3].copy_from_slice(&pixels[src..src + 3]);
        }
    }
    flipped
}

#[cfg(test)]
mod tests {
    use super::*;

    type TB = burn::backend::NdArray<f32>;

    fn write_test_image(dir: &Path, name: &str) -> PathBuf {
        let path = dir.join(name);
        let mut img = image::RgbImage::new(8, 6);
        for (x, y, pixel) in img.enumerate_pixels_mut() {
            *pixel = image::Rgb([(x * 30) as u8, (y * 40) as u8, 128]);
        }
        img.save(&path).unwrap();
        path
    }

    fn write_annotations(dir: &Path, image: &Path, landmarks: Option<Vec<f32>>) -> PathBuf {
        let annotations = AttrAnnotations {
            attributes: vec!["floral".into(), "striped".into()],
            num_landmarks: landmarks.as_ref().map(|coords| coords.len() / 2),
            samples: vec![AttrSample {
                path: image.to_path_buf(),
                attributes: vec![1, 0],
                landmarks,
            }],
        };
        let path = dir.join("annotations.json");
        serde_json::to_writer(File::create(&path).unwrap(), &annotations).unwrap();
        path
    }

    #[test]
    fn labeled_dataset_yields_normalized_items() {
        let dir = tempfile::tempdir().unwrap();
        let image = write_test_image(dir.path(), "a.png");
        let annotations = write_annotations(dir.path(), &image, Some(vec![0.25, 0.5]));

        let dataset = AttrDataSet::eval(&annotations, 8).unwrap();
        assert_eq!(dataset.len(), 1);
        assert_eq!(dataset.num_attributes(), 2);
        assert_eq!(dataset.num_landmarks(), Some(1));

        let item = dataset.get(0).unwrap();
        assert_eq!(item.image.len(), 3 * 8 * 8);
        assert!(item.image.iter().all(|p| (0.0..=1.0).contains(p)));
        assert_eq!(item.targets, vec![1, 0]);
        assert_eq!(item.landmarks, Some(vec![0.25, 0.5]));
    }

    #[test]
    fn batcher_produces_expected_shapes() {
        let dir = tempfile::tempdir().unwrap();
        let image = write_test_image(dir.path(), "a.png");
        let annotations = write_annotations(dir.path(), &image, Some(vec![0.25, 0.5]));

        let dataset = AttrDataSet::eval(&annotations, 8).unwrap();
        let items = vec![dataset.get(0).unwrap(), dataset.get(0).unwrap()];
        let batch = AttrBatcher::<TB>::new(Default::default(), 8).batch(items);
        assert_eq!(batch.images.dims(), [2, 3, 8, 8]);
        assert_eq!(batch.targets.unwrap().dims(), [2, 2]);
        assert_eq!(batch.landmarks.unwrap().dims(), [2, 2]);
        assert_eq!(batch.paths.len(), 2);
    }

    #[test]
    fn unlabeled_scan_has_no_targets() {
        let dir = tempfile::tempdir().unwrap();
        write_test_image(dir.path(), "a.png");
        write_test_image(dir.path(), "b.png");

        let dataset = AttrDataSet::unlabeled(dir.path(), 8).unwrap();
        assert_eq!(dataset.len(), 2);
        let batch = AttrBatcher::<TB>::new(Default::default(), 8)
            .batch(vec![dataset.get(0).unwrap()]);
        assert!(batch.targets.is_none());
        assert!(batch.landmarks.is_none());
    }

    #[test]
    fn missing_landmarks_fail_validation() {
        let dir = tempfile::tempdir().unwrap();
        let image = write_test_image(dir.path(), "a.png");
        let annotations = AttrAnnotations {
            attributes: vec!["floral".into()],
            num_landmarks: Some(2),
            samples: vec![AttrSample {
                path: image,
                attributes: vec![1],
                landmarks: None,
            }],
        };
        let path = dir.path().join("annotations.json");
        serde_json::to_writer(File::create(&path).unwrap(), &annotations).unwrap();
        assert!(AttrDataSet::eval(&path, 8).is_err());
    }

    #[test]
    fn sharding_partitions_the_samples() {
        let dir = tempfile::tempdir().unwrap();
        let image = write_test_image(dir.path(), "a.png");
        let annotations = write_annotations(dir.path(), &image, None);

        let mut dataset = AttrDataSet::eval(&annotations, 8).unwrap();
        dataset.samples = std::iter::repeat(dataset.samples[0].clone()).take(5).collect();
        let shard = dataset.shard(1, 2);
        assert_eq!(shard.len(), 2);
    }

    #[test]
    fn horizontal_flip_mirrors_columns() {
        let pixels: Vec<f32> = (0..2 * 2 * 3).map(|v| v as f32).collect();
        let flipped = flip_horizontal(&pixels, 2);
        assert_eq!(&flipped[0..3], &pixels[3..6]);
        assert_eq!(&flipped[3..6], &pixels[0..3]);
    }
}
