//! Transfers between Burn tensors and host-side `f64` buffers.
//!
//! Matrix inverses, determinants and FFTs run on the host in double
//! precision; these helpers move data across that boundary.

use burn::tensor::{Tensor, TensorData, backend::Backend};

use crate::errors::FlowError;

/// Copies a float tensor to a row-major `f64` buffer.
pub fn to_host<B: Backend, const D: usize>(tensor: Tensor<B, D>) -> Result<Vec<f64>, FlowError> {
    let values: Vec<f32> = tensor
        .into_data()
        .convert::<f32>()
        .to_vec()
        .map_err(|err| FlowError::TensorData {
            message: format!("{err:?}"),
        })?;
    Ok(values.into_iter().map(f64::from).collect())
}

/// Copies an int tensor to host indices.
pub fn to_host_indices<B: Backend, const D: usize>(
    tensor: Tensor<B, D, burn::tensor::Int>,
) -> Result<Vec<usize>, FlowError> {
    let values: Vec<i64> = tensor
        .into_data()
        .convert::<i64>()
        .to_vec()
        .map_err(|err| FlowError::TensorData {
            message: format!("{err:?}"),
        })?;
    Ok(values.into_iter().map(|v| v.max(0) as usize).collect())
}

/// Uploads a row-major `f64` buffer as a float tensor of the given shape.
pub fn from_host<B: Backend, const D: usize>(
    values: &[f64],
    shape: [usize; D],
    device: &B::Device,
) -> Tensor<B, D> {
    let data: Vec<f32> = values.iter().map(|&v| v as f32).collect();
    Tensor::from_data(TensorData::new(data, shape), device)
}

/// Uploads host indices as an int tensor.
pub fn indices_to_device<B: Backend>(
    indices: &[usize],
    device: &B::Device,
) -> Tensor<B, 1, burn::tensor::Int> {
    let data: Vec<i64> = indices.iter().map(|&i| i as i64).collect();
    let len = data.len();
    Tensor::from_data(TensorData::new(data, [len]), device)
}

/// Reads a single-element tensor as `f64`.
pub fn scalar<B: Backend, const D: usize>(tensor: Tensor<B, D>) -> Result<f64, FlowError> {
    let values = to_host(tensor)?;
    values.first().copied().ok_or_else(|| FlowError::TensorData {
        message: "expected a non-empty tensor".to_string(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use burn::backend::NdArray;

    type TestBackend = NdArray;

    #[test]
    fn test_host_transfer_preserves_layout() {
        let device = <TestBackend as Backend>::Device::default();
        let values = vec![1.0, 2.0, 3.0, 4.0, 5.0, 6.0];
        let tensor = from_host::<TestBackend, 2>(&values, [2, 3], &device);
        assert_eq!(tensor.dims(), [2, 3]);

        let row = tensor.clone().narrow(0, 1, 1);
        assert_eq!(to_host(row).unwrap(), vec![4.0, 5.0, 6.0]);
        assert_eq!(to_host(tensor).unwrap(), values);
    }

    #[test]
    fn test_indices_roundtrip() {
        let device = <TestBackend as Backend>::Device::default();
        let indices = indices_to_device::<TestBackend>(&[3, 0, 2], &device);
        assert_eq!(to_host_indices(indices).unwrap(), vec![3, 0, 2]);
    }
}
