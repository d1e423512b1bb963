//! Data collaborator: label conventions, batch types and dataset sources.
//!
//! Training consumes pairs of independently augmented views of the same
//! images plus labels, where [`NO_LABEL`] marks unlabeled items. Loading real
//! datasets from disk is left to implementors of [`DataSource`]; this module
//! provides the dataset registry and a deterministic synthetic source.

use std::fmt;

use burn::tensor::{Tensor, backend::Backend};
use rand::{Rng, SeedableRng, rngs::StdRng, seq::SliceRandom};
use rand_distr::{Distribution, StandardNormal};
use serde::{Deserialize, Serialize};

use crate::errors::FlowError;
use crate::layers::host;

/// Label value of an unlabeled item.
pub const NO_LABEL: i64 = -1;

/// Class index of a raw label, or `None` for [`NO_LABEL`] and any other
/// negative value. Run [`check_labels`] first to reject the latter.
pub fn label_from_raw(raw: i64) -> Option<usize> {
    usize::try_from(raw).ok()
}

/// Accepts labels that are [`NO_LABEL`] or a class in `[0, num_classes)`.
pub fn check_labels(labels: &[i64], num_classes: usize) -> Result<(), FlowError> {
    let valid = |l: i64| l == NO_LABEL || label_from_raw(l).is_some_and(|c| c < num_classes);
    match labels.iter().find(|&&l| !valid(l)) {
        Some(&label) => Err(FlowError::InvalidLabel { label, num_classes }),
        None => Ok(()),
    }
}

/// Hides the labels of every item whose class is in `unlabeled_classes`.
/// Returns how many labels were hidden.
pub fn mask_classes(labels: &mut [i64], unlabeled_classes: &[usize]) -> usize {
    let mut masked = 0;
    for label in labels.iter_mut() {
        if label_from_raw(*label).is_some_and(|class| unlabeled_classes.contains(&class)) {
            *label = NO_LABEL;
            masked += 1;
        }
    }
    masked
}

/// A training batch: two augmentations of the same images and their labels.
#[derive(Debug, Clone)]
pub struct TrainBatch<B: Backend> {
    pub x1: Tensor<B, 4>,
    pub x2: Tensor<B, 4>,
    pub labels: Vec<i64>,
}

impl<B: Backend> TrainBatch<B> {
    pub fn batch_size(&self) -> usize {
        self.labels.len()
    }

    /// Row indices of the labeled items.
    pub fn labeled_indices(&self) -> Vec<usize> {
        self.labels
            .iter()
            .enumerate()
            .filter(|(_, l)| label_from_raw(**l).is_some())
            .map(|(i, _)| i)
            .collect()
    }

    pub fn labeled_count(&self) -> usize {
        self.labeled_indices().len()
    }
}

/// An evaluation batch of un-augmented images.
#[derive(Debug, Clone)]
pub struct EvalBatch<B: Backend> {
    pub images: Tensor<B, 4>,
    pub labels: Vec<i64>,
}

/// Supplies training and evaluation batches.
pub trait DataSource<B: Backend> {
    /// Image shape `[C, H, W]`.
    fn image_shape(&self) -> [usize; 3];

    fn num_classes(&self) -> usize;

    /// Batches for one epoch; sources may reshuffle per epoch.
    fn train_batches(
        &mut self,
        epoch: usize,
        device: &B::Device,
    ) -> Result<Vec<TrainBatch<B>>, FlowError>;

    fn eval_batches(&self, device: &B::Device) -> Result<Vec<EvalBatch<B>>, FlowError>;

    /// Flattened labeled training images with their class, for data-driven
    /// mean placement. Empty by default.
    fn labeled_samples(&self) -> Vec<(Vec<f64>, usize)> {
        Vec::new()
    }

    /// Items per training batch, when the source batches uniformly.
    fn batch_size(&self) -> Option<usize> {
        None
    }
}

/// Known datasets and their shapes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Dataset {
    Mnist,
    Cifar10,
    Svhn,
    /// In-memory images from [`SyntheticSource`].
    Synthetic,
}

impl Dataset {
    pub const ALL: [Dataset; 4] = [
        Dataset::Mnist,
        Dataset::Cifar10,
        Dataset::Svhn,
        Dataset::Synthetic,
    ];

    pub fn name(&self) -> &'static str {
        match self {
            Dataset::Mnist => "mnist",
            Dataset::Cifar10 => "cifar10",
            Dataset::Svhn => "svhn",
            Dataset::Synthetic => "synthetic",
        }
    }

    pub fn from_name(name: &str) -> Result<Self, FlowError> {
        let lower = name.to_lowercase();
        Self::ALL
            .into_iter()
            .find(|dataset| dataset.name() == lower)
            .ok_or_else(|| FlowError::UnknownDataset {
                name: name.to_string(),
            })
    }

    pub fn image_shape(&self) -> [usize; 3] {
        match self {
            Dataset::Mnist => [1, 28, 28],
            Dataset::Cifar10 | Dataset::Svhn => [3, 32, 32],
            Dataset::Synthetic => [3, 8, 8],
        }
    }

    pub fn num_classes(&self) -> usize {
        match self {
            Dataset::Synthetic => 4,
            _ => 10,
        }
    }

    /// Classes whose labels are hidden during semi-supervised training.
    pub fn unlabeled_classes(&self) -> &'static [usize] {
        match self {
            Dataset::Mnist => &[1, 3, 5, 7, 9],
            _ => &[],
        }
    }

    pub fn labeled_classes(&self) -> Vec<usize> {
        let hidden = self.unlabeled_classes();
        (0..self.num_classes())
            .filter(|c| !hidden.contains(c))
            .collect()
    }
}

impl fmt::Display for Dataset {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// Configuration for a [`SyntheticSource`].
#[derive(Debug, Clone)]
pub struct SyntheticSourceConfig {
    pub image_shape: [usize; 3],
    pub num_classes: usize,
    pub samples_per_class: usize,
    pub eval_samples_per_class: usize,
    /// Share of each class's training samples that keep their label.
    pub labeled_fraction: f64,
    pub batch_size: usize,
    /// Standard deviation of per-view pixel noise.
    pub noise_std: f64,
    /// Largest circular shift, in pixels, applied per view.
    pub max_shift: usize,
    pub seed: u64,
}

impl Default for SyntheticSourceConfig {
    fn default() -> Self {
        Self {
            image_shape: Dataset::Synthetic.image_shape(),
            num_classes: Dataset::Synthetic.num_classes(),
            samples_per_class: 16,
            eval_samples_per_class: 8,
            labeled_fraction: 0.5,
            batch_size: 8,
            noise_std: 0.05,
            max_shift: 1,
            seed: 0,
        }
    }
}

impl SyntheticSourceConfig {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn image_shape(mut self, shape: [usize; 3]) -> Self {
        self.image_shape = shape;
        self
    }

    pub fn num_classes(mut self, num_classes: usize) -> Self {
        self.num_classes = num_classes;
        self
    }

    pub fn samples_per_class(mut self, samples: usize) -> Self {
        self.samples_per_class = samples;
        self
    }

    pub fn eval_samples_per_class(mut self, samples: usize) -> Self {
        self.eval_samples_per_class = samples;
        self
    }

    pub fn labeled_fraction(mut self, fraction: f64) -> Self {
        self.labeled_fraction = fraction;
        self
    }

    pub fn batch_size(mut self, batch_size: usize) -> Self {
        self.batch_size = batch_size;
        self
    }

    pub fn noise_std(mut self, noise_std: f64) -> Self {
        self.noise_std = noise_std;
        self
    }

    pub fn max_shift(mut self, max_shift: usize) -> Self {
        self.max_shift = max_shift;
        self
    }

    pub fn seed(mut self, seed: u64) -> Self {
        self.seed = seed;
        self
    }

    pub fn init(&self) -> Result<SyntheticSource, FlowError> {
        SyntheticSource::new(self.clone())
    }
}

/// Deterministic class-prototype images with stochastic two-view augmentation.
#[derive(Debug, Clone)]
pub struct SyntheticSource {
    config: SyntheticSourceConfig,
    train: Vec<(Vec<f64>, i64)>,
    eval: Vec<(Vec<f64>, i64)>,
}

/// Smooth, class-specific pattern in `[0.1, 0.9]`.
fn prototype(class: usize, [c, h, w]: [usize; 3]) -> Vec<f64> {
    let freq = (class + 1) as f64;
    let mut image = Vec::with_capacity(c * h * w);
    for ch in 0..c {
        for r in 0..h {
            for col in 0..w {
                let u = r as f64 / h as f64;
                let v = col as f64 / w as f64;
                let phase = std::f64::consts::TAU * (freq * u + (class % 2) as f64 * v) + ch as f64;
                image.push(0.5 + 0.4 * phase.sin());
            }
        }
    }
    image
}

impl SyntheticSource {
    pub fn new(config: SyntheticSourceConfig) -> Result<Self, FlowError> {
        if config.num_classes == 0 || config.batch_size == 0 || config.samples_per_class == 0 {
            return Err(FlowError::InvalidConfig {
                message: "synthetic source needs classes, samples and a batch size".to_string(),
            });
        }
        if !(0.0..=1.0).contains(&config.labeled_fraction) {
            return Err(FlowError::InvalidConfig {
                message: format!(
                    "labeled fraction must be in [0, 1], got {}",
                    config.labeled_fraction
                ),
            });
        }

        let mut rng = StdRng::seed_from_u64(config.seed);
        let labeled_per_class =
            (config.labeled_fraction * config.samples_per_class as f64).round() as usize;
        let mut sample = |class: usize, count: usize, labeled: usize| {
            let base = prototype(class, config.image_shape);
            (0..count)
                .map(|i| {
                    let image = base
                        .iter()
                        .map(|p| {
                            let n: f64 = StandardNormal.sample(&mut rng);
                            (p + 0.02 * n).clamp(0.0, 1.0)
                        })
                        .collect();
                    let label = if i < labeled { class as i64 } else { NO_LABEL };
                    (image, label)
                })
                .collect::<Vec<_>>()
        };

        let mut train = Vec::new();
        let mut eval = Vec::new();
        for class in 0..config.num_classes {
            train.extend(sample(class, config.samples_per_class, labeled_per_class));
            eval.extend(sample(
                class,
                config.eval_samples_per_class,
                config.eval_samples_per_class,
            ));
        }
        log::debug!(
            "Synthetic source: {} train ({} labeled per class), {} eval",
            train.len(),
            labeled_per_class,
            eval.len()
        );

        Ok(Self {
            config,
            train,
            eval,
        })
    }

    pub fn config(&self) -> &SyntheticSourceConfig {
        &self.config
    }

    /// Random circular shift plus pixel noise.
    fn augment(&self, image: &[f64], rng: &mut StdRng) -> Vec<f64> {
        let [c, h, w] = self.config.image_shape;
        let max = self.config.max_shift as i64;
        let dh = rng.gen_range(-max..=max).rem_euclid(h as i64) as usize;
        let dw = rng.gen_range(-max..=max).rem_euclid(w as i64) as usize;

        let mut out = vec![0.0; image.len()];
        for ch in 0..c {
            for r in 0..h {
                for col in 0..w {
                    let src = ch * h * w + ((r + dh) % h) * w + (col + dw) % w;
                    let n: f64 = StandardNormal.sample(rng);
                    out[ch * h * w + r * w + col] =
                        (image[src] + self.config.noise_std * n).clamp(0.0, 1.0);
                }
            }
        }
        out
    }

    fn images_to_tensor<B: Backend>(&self, images: &[Vec<f64>], device: &B::Device) -> Tensor<B, 4> {
        let [c, h, w] = self.config.image_shape;
        let flat: Vec<f64> = images.iter().flatten().copied().collect();
        host::from_host(&flat, [images.len(), c, h, w], device)
    }
}

impl<B: Backend> DataSource<B> for SyntheticSource {
    fn image_shape(&self) -> [usize; 3] {
        self.config.image_shape
    }

    fn num_classes(&self) -> usize {
        self.config.num_classes
    }

    fn train_batches(
        &mut self,
        epoch: usize,
        device: &B::Device,
    ) -> Result<Vec<TrainBatch<B>>, FlowError> {
        let mut rng = StdRng::seed_from_u64(self.config.seed.wrapping_add(1 + epoch as u64));
        let mut order: Vec<usize> = (0..self.train.len()).collect();
        order.shuffle(&mut rng);

        let batches = order
            .chunks(self.config.batch_size)
            .map(|chunk| {
                let mut x1 = Vec::with_capacity(chunk.len());
                let mut x2 = Vec::with_capacity(chunk.len());
                let mut labels = Vec::with_capacity(chunk.len());
                for &i in chunk {
                    let (image, label) = &self.train[i];
                    x1.push(self.augment(image, &mut rng));
                    x2.push(self.augment(image, &mut rng));
                    labels.push(*label);
                }
                TrainBatch {
                    x1: self.images_to_tensor(&x1, device),
                    x2: self.images_to_tensor(&x2, device),
                    labels,
                }
            })
            .collect();
        Ok(batches)
    }

    fn eval_batches(&self, device: &B::Device) -> Result<Vec<EvalBatch<B>>, FlowError> {
        Ok(self
            .eval
            .chunks(self.config.batch_size)
            .map(|chunk| {
                let images: Vec<Vec<f64>> = chunk.iter().map(|(img, _)| img.clone()).collect();
                EvalBatch {
                    images: self.images_to_tensor(&images, device),
                    labels: chunk.iter().map(|(_, l)| *l).collect(),
                }
            })
            .collect())
    }

    fn batch_size(&self) -> Option<usize> {
        Some(self.config.batch_size)
    }

    fn labeled_samples(&self) -> Vec<(Vec<f64>, usize)> {
        self.train
            .iter()
            .filter_map(|(image, label)| label_from_raw(*label).map(|c| (image.clone(), c)))
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use burn::backend::NdArray;

    type TestBackend = NdArray;

    fn device() -> <TestBackend as Backend>::Device {
        <TestBackend as Backend>::Device::default()
    }

    #[test]
    fn test_label_conventions() {
        assert_eq!(label_from_raw(NO_LABEL), None);
        assert_eq!(label_from_raw(3), Some(3));

        let mut labels = vec![0, 1, 2, 3, NO_LABEL, 1];
        assert_eq!(mask_classes(&mut labels, &[1, 3]), 3);
        assert_eq!(labels, vec![0, NO_LABEL, 2, NO_LABEL, NO_LABEL, NO_LABEL]);
    }

    #[test]
    fn test_only_no_label_marks_unlabeled() {
        assert!(check_labels(&[0, NO_LABEL, 3], 4).is_ok());
        assert!(matches!(
            check_labels(&[0, -2], 4),
            Err(FlowError::InvalidLabel { label: -2, num_classes: 4 })
        ));
        assert!(matches!(
            check_labels(&[4], 4),
            Err(FlowError::InvalidLabel { label: 4, .. })
        ));
    }

    #[test]
    fn test_dataset_registry() {
        assert_eq!(Dataset::from_name("MNIST").unwrap(), Dataset::Mnist);
        assert_eq!(Dataset::Mnist.image_shape(), [1, 28, 28]);
        assert_eq!(Dataset::Mnist.labeled_classes(), vec![0, 2, 4, 6, 8]);
        assert_eq!(Dataset::Cifar10.labeled_classes().len(), 10);
        match Dataset::from_name("imagenet") {
            Err(FlowError::UnknownDataset { name }) => assert_eq!(name, "imagenet"),
            other => panic!("expected UnknownDataset, got {other:?}"),
        }
    }

    #[test]
    fn test_synthetic_batches() {
        let mut source = SyntheticSourceConfig::new()
            .samples_per_class(4)
            .batch_size(8)
            .labeled_fraction(0.5)
            .seed(1)
            .init()
            .unwrap();

        let batches: Vec<TrainBatch<TestBackend>> = source.train_batches(0, &device()).unwrap();
        assert_eq!(batches.len(), 2);
        assert_eq!(batches[0].x1.dims(), [8, 3, 8, 8]);
        assert_eq!(batches[0].x2.dims(), [8, 3, 8, 8]);
        let labeled: usize = batches.iter().map(TrainBatch::labeled_count).sum();
        assert_eq!(labeled, 8);

        let views_differ = host::to_host(batches[0].x1.clone() - batches[0].x2.clone())
            .unwrap()
            .iter()
            .any(|v| v.abs() > 1e-3);
        assert!(views_differ);

        let samples = DataSource::<TestBackend>::labeled_samples(&source);
        assert_eq!(samples.len(), 8);
        assert!(samples.iter().all(|(img, class)| img.len() == 192 && *class < 4));
    }

    #[test]
    fn test_synthetic_epochs_are_reproducible() {
        let config = SyntheticSourceConfig::new().seed(3);
        let mut a = config.init().unwrap();
        let mut b = config.init().unwrap();
        let xa: Vec<TrainBatch<TestBackend>> = a.train_batches(2, &device()).unwrap();
        let xb: Vec<TrainBatch<TestBackend>> = b.train_batches(2, &device()).unwrap();

        assert_eq!(xa[0].labels, xb[0].labels);
        assert_eq!(
            host::to_host(xa[0].x1.clone()).unwrap(),
            host::to_host(xb[0].x1.clone()).unwrap()
        );
    }

    #[test]
    fn test_eval_batches_are_fully_labeled() {
        let source = SyntheticSourceConfig::new().eval_samples_per_class(3).init().unwrap();
        let batches: Vec<EvalBatch<TestBackend>> = source.eval_batches(&device()).unwrap();
        let labels: Vec<i64> = batches.iter().flat_map(|b| b.labels.clone()).collect();
        assert_eq!(labels.len(), 12);
        assert!(labels.iter().all(|l| *l >= 0));
    }
}
