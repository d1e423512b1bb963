//! Placement policies for the mixture means.

use std::fmt;

use rand::{SeedableRng, rngs::StdRng};
use rand_distr::{Distribution, StandardNormal};
use serde::{Deserialize, Serialize};

use crate::errors::FlowError;

/// How the `K` class means are placed in the `D`-dimensional latent space.
/// Every policy scales its means by the radius `r`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MeansInit {
    /// Independent standard normal vectors.
    Random,
    /// Mean `k` is the constant image `r * (2k / (K - 1) - 1)`.
    PixelConst,
    /// The dims are cut into `K` contiguous blocks; mean `k` is `r` on block
    /// `k` and zero elsewhere.
    SplitDims,
    /// Like `SplitDims` but dims are dealt round-robin (`d mod K`), so every
    /// class spreads over the whole image.
    SplitDimsV2,
    /// Per-class average of labeled training images.
    FromData,
}

impl MeansInit {
    pub const ALL: [MeansInit; 5] = [
        MeansInit::Random,
        MeansInit::PixelConst,
        MeansInit::SplitDims,
        MeansInit::SplitDimsV2,
        MeansInit::FromData,
    ];

    pub fn name(&self) -> &'static str {
        match self {
            MeansInit::Random => "random",
            MeansInit::PixelConst => "pixel_const",
            MeansInit::SplitDims => "split_dims",
            MeansInit::SplitDimsV2 => "split_dims_v2",
            MeansInit::FromData => "from_data",
        }
    }

    pub fn from_name(name: &str) -> Result<Self, FlowError> {
        let lower = name.to_lowercase();
        Self::ALL
            .into_iter()
            .find(|policy| policy.name() == lower)
            .ok_or_else(|| FlowError::UnknownOption {
                kind: "means policy",
                name: name.to_string(),
            })
    }

    /// Generates `num_classes` means of dimension `dim`.
    ///
    /// `labeled` is only read by [`MeansInit::FromData`] and holds flattened
    /// images with their class.
    pub fn generate(
        &self,
        num_classes: usize,
        dim: usize,
        r: f64,
        seed: u64,
        labeled: &[(Vec<f64>, usize)],
    ) -> Result<Vec<Vec<f64>>, FlowError> {
        if num_classes == 0 || dim == 0 {
            return Err(FlowError::DegeneratePrior {
                message: format!("cannot place {num_classes} means in {dim} dims"),
            });
        }
        let k = num_classes;
        let means = match self {
            MeansInit::Random => {
                let mut rng = StdRng::seed_from_u64(seed);
                (0..k)
                    .map(|_| {
                        (0..dim)
                            .map(|_| {
                                let v: f64 = StandardNormal.sample(&mut rng);
                                v * r
                            })
                            .collect()
                    })
                    .collect()
            }
            MeansInit::PixelConst => (0..k)
                .map(|class| {
                    let level = if k > 1 {
                        2.0 * class as f64 / (k - 1) as f64 - 1.0
                    } else {
                        0.0
                    };
                    vec![r * level; dim]
                })
                .collect(),
            MeansInit::SplitDims => {
                if dim < k {
                    return Err(FlowError::DegeneratePrior {
                        message: format!("split_dims needs at least {k} dims, got {dim}"),
                    });
                }
                let block = dim / k;
                (0..k)
                    .map(|class| {
                        let end = if class + 1 == k { dim } else { (class + 1) * block };
                        (0..dim)
                            .map(|d| if d >= class * block && d < end { r } else { 0.0 })
                            .collect()
                    })
                    .collect()
            }
            MeansInit::SplitDimsV2 => {
                if dim < k {
                    return Err(FlowError::DegeneratePrior {
                        message: format!("split_dims_v2 needs at least {k} dims, got {dim}"),
                    });
                }
                (0..k)
                    .map(|class| {
                        (0..dim)
                            .map(|d| if d % k == class { r } else { 0.0 })
                            .collect()
                    })
                    .collect()
            }
            MeansInit::FromData => class_averages(k, dim, labeled)?
                .into_iter()
                .map(|mean| mean.into_iter().map(|v| v * r).collect())
                .collect(),
        };
        Ok(means)
    }
}

fn class_averages(
    num_classes: usize,
    dim: usize,
    labeled: &[(Vec<f64>, usize)],
) -> Result<Vec<Vec<f64>>, FlowError> {
    let mut sums = vec![vec![0.0; dim]; num_classes];
    let mut counts = vec![0usize; num_classes];
    for (image, class) in labeled {
        if *class >= num_classes || image.len() != dim {
            return Err(FlowError::InvalidConfig {
                message: format!(
                    "labeled sample of class {class} with {} values does not fit {num_classes} classes of {dim} dims",
                    image.len()
                ),
            });
        }
        for (acc, v) in sums[*class].iter_mut().zip(image) {
            *acc += v;
        }
        counts[*class] += 1;
    }
    if let Some(empty) = counts.iter().position(|&c| c == 0) {
        return Err(FlowError::DegeneratePrior {
            message: format!("no labeled samples for class {empty}"),
        });
    }
    Ok(sums
        .into_iter()
        .zip(counts)
        .map(|(sum, count)| sum.into_iter().map(|v| v / count as f64).collect())
        .collect())
}

impl fmt::Display for MeansInit {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}
