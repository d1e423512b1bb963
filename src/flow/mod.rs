//! Composite flows assembled from invertible layers.

mod architecture;
mod builder;
mod composite;

pub use architecture::FlowArchitecture;
pub use builder::FlowBuilder;
pub use composite::{Flow, FlowContext, FlowStep};
