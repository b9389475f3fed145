//! Conversions between burn tensors and host-side buffers.

use burn::prelude::*;

use crate::error::{CoreError, Result};

/// Copy a tensor's values to the host as `f32`, in row-major order.
///
/// # Errors
///
/// Returns an error if the backend data cannot be read as `f32`.
pub fn tensor_to_vec<B: Backend, const D: usize>(tensor: Tensor<B, D>) -> Result<Vec<f32>> {
    tensor
        .into_data()
        .convert::<f32>()
        .to_vec::<f32>()
        .map_err(|e| CoreError::ShapeMismatch(format!("Failed to get tensor data: {e:?}")))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::NdArray;

    #[test]
    fn test_tensor_to_vec_row_major() {
        let device = Default::default();
        let tensor = Tensor::<NdArray, 1>::from_floats([1.0, 2.0, 3.0, 4.0], &device).reshape([2, 2]);
        let values = tensor_to_vec(tensor.transpose()).unwrap();
        assert_eq!(values, vec![1.0, 3.0, 2.0, 4.0]);
    }

    #[test]
    fn test_tensor_to_vec_keeps_trailing_axes_contiguous() {
        let device = Default::default();
        let values: Vec<f32> = (0..24).map(|v| v as f32).collect();
        let tensor = Tensor::<NdArray, 3>::from_data(TensorData::new(values.clone(), [2, 3, 4]), &device);
        assert_eq!(tensor_to_vec(tensor).unwrap(), values);
    }
}
