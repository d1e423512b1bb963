//! Latent-space prior: a class-conditional Gaussian mixture.

mod gaussian_mixture;
mod means;

pub use gaussian_mixture::GaussianMixture;
pub use means::MeansInit;
