//! Error types.

mod flow_error;

pub use flow_error::FlowError;
