//! # flowssl
//!
//! Semi-supervised image classification with normalizing flows.
//!
//! A flow maps images bijectively to a latent space whose density is a
//! Gaussian mixture with one component per class. The exact likelihood
//! trains the model on unlabeled images, the component posterior classifies,
//! and sampling a component then inverting the flow generates images of
//! that class.
//!
//! ## Features
//!
//! - **Invertible layers**: 1×1 channel mixing, circular 3×3 convolutions
//!   inverted and log-determined in the Fourier domain, spatially varying
//!   affine coordinate injection, squeeze, channel split and merge.
//! - **Composite flows**: a builder and named architectures with exact
//!   `forward`, `inverse` and summed log-determinants.
//! - **Training**: labeled cross-entropy, unsupervised likelihood and a
//!   pseudo-label consistency term, with checkpoints and metric sinks.
//! - **Burn Backend**: runs on NdArray by default, WGPU with the `wgpu`
//!   feature.
//!
//! ## Example
//!
//! ```
//! use flowssl::prelude::*;
//! use burn::backend::NdArray;
//! use burn::tensor::{Distribution, Tensor};
//!
//! type Backend = NdArray;
//!
//! let device = <Backend as burn::tensor::backend::Backend>::Device::default();
//!
//! let model: SemiSupervisedFlow<Backend> =
//!     SemiSupervisedFlowConfig::new(FlowArchitecture::ToyFlow, [1, 4, 4], 2)
//!         .with_means(MeansInit::SplitDims, 2.0)
//!         .init(&[], &device)
//!         .expect("Failed to build model");
//!
//! let x = Tensor::<Backend, 4>::random([3, 1, 4, 4], Distribution::Uniform(0.0, 1.0), &device);
//! let encoded = model.encode(x).unwrap();
//! assert_eq!(encoded.z.dims(), [3, 16]);
//!
//! let images = model.decode(encoded.z).unwrap();
//! assert_eq!(images.dims(), [3, 1, 4, 4]);
//! ```

pub mod data;
pub mod errors;
pub mod flow;
pub mod layers;
pub mod model;
pub mod prior;
pub mod training;

// Re-exports for convenience
pub use errors::FlowError;
pub use flow::{Flow, FlowArchitecture, FlowBuilder};
pub use model::{SemiSupervisedFlow, SemiSupervisedFlowConfig};
pub use training::{FlowLoss, TrainingConfig};

/// Backend type alias with autodiff support.
#[cfg(not(feature = "wgpu"))]
pub type Backend = burn::backend::Autodiff<burn::backend::NdArray>;

/// Backend type for inference (no autodiff).
#[cfg(not(feature = "wgpu"))]
pub type InferenceBackend = burn::backend::NdArray;

/// Backend type alias for WGPU with autodiff support.
#[cfg(feature = "wgpu")]
pub type Backend = burn::backend::Autodiff<burn::backend::Wgpu>;

/// Backend type for inference (no autodiff).
#[cfg(feature = "wgpu")]
pub type InferenceBackend = burn::backend::Wgpu;

/// Prelude module for convenient imports.
pub mod prelude {
    pub use crate::data::{DataSource, Dataset, NO_LABEL, SyntheticSourceConfig};
    pub use crate::errors::FlowError;
    pub use crate::flow::{Flow, FlowArchitecture, FlowBuilder};
    pub use crate::layers::InvertibleLayer;
    pub use crate::model::{SemiSupervisedFlow, SemiSupervisedFlowConfig};
    pub use crate::prior::{GaussianMixture, MeansInit};
    pub use crate::training::{FlowLoss, LogSink, MetricSink, TrainingConfig, fit, train};
    pub use crate::{Backend, InferenceBackend};
}
