//! Canonical sequence layout and shape metadata.

use burn::prelude::*;
use serde::{Deserialize, Serialize};

use crate::error::{CoreError, Result};

/// Axis order of a 5D layer output as produced by an encoder.
///
/// The canonical order used everywhere in gaitscope is
/// `(batch, time, channel, height, width)`. Encoders whose layers emit
/// channel-before-time tensors (3D-convolution families) declare
/// [`TensorLayout::ChannelFirst`] and captured tensors are permuted once
/// on arrival.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
pub enum TensorLayout {
    /// `(B, T, C, H, W)`.
    #[default]
    TimeFirst,
    /// `(B, C, T, H, W)`.
    ChannelFirst,
}

impl TensorLayout {
    /// Permute a tensor in this layout into the canonical `(B, T, C, H, W)` order.
    pub fn to_canonical<B: Backend>(self, tensor: Tensor<B, 5>) -> Tensor<B, 5> {
        match self {
            Self::TimeFirst => tensor,
            Self::ChannelFirst => tensor.swap_dims(1, 2),
        }
    }

    /// Permute a canonical tensor back into this layout.
    pub fn from_canonical<B: Backend>(self, tensor: Tensor<B, 5>) -> Tensor<B, 5> {
        // A single axis swap is its own inverse.
        self.to_canonical(tensor)
    }
}

/// Shape of one captured sequence tensor in canonical order, batch included.
///
/// # Example
///
/// ```rust
/// use gaitscope_core::SequenceShape;
///
/// let shape = SequenceShape::new(1, 30, 64, 16, 11);
/// assert_eq!(shape.frames(), 30);
/// assert!(shape.is_concat_compatible(&SequenceShape::new(1, 30, 64, 8, 11)));
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct SequenceShape {
    batch: usize,
    frames: usize,
    channels: usize,
    height: usize,
    width: usize,
}

impl SequenceShape {
    /// Create a new shape from canonical dimensions.
    #[must_use]
    pub const fn new(batch: usize, frames: usize, channels: usize, height: usize, width: usize) -> Self {
        Self {
            batch,
            frames,
            channels,
            height,
            width,
        }
    }

    /// Create a shape from a slice of canonical dimensions.
    ///
    /// # Errors
    ///
    /// Returns an error if the slice doesn't contain exactly 5 elements.
    pub fn from_dims(dims: &[usize]) -> Result<Self> {
        if dims.len() != 5 {
            return Err(CoreError::DimensionError {
                expected: 5,
                got: dims.len(),
            });
        }
        Ok(Self::new(dims[0], dims[1], dims[2], dims[3], dims[4]))
    }

    /// Read the shape of a canonical tensor.
    pub fn of<B: Backend>(tensor: &Tensor<B, 5>) -> Self {
        let [batch, frames, channels, height, width] = tensor.dims();
        Self::new(batch, frames, channels, height, width)
    }

    /// Batch size.
    #[must_use]
    pub const fn batch(&self) -> usize {
        self.batch
    }

    /// Number of temporal slots.
    #[must_use]
    pub const fn frames(&self) -> usize {
        self.frames
    }

    /// Number of channels.
    #[must_use]
    pub const fn channels(&self) -> usize {
        self.channels
    }

    /// Spatial height.
    #[must_use]
    pub const fn height(&self) -> usize {
        self.height
    }

    /// Spatial width.
    #[must_use]
    pub const fn width(&self) -> usize {
        self.width
    }

    /// Check if any dimension is zero.
    #[must_use]
    pub const fn is_empty(&self) -> bool {
        self.batch == 0 || self.frames == 0 || self.channels == 0 || self.height == 0 || self.width == 0
    }

    /// Convert to an array.
    #[must_use]
    pub const fn as_array(&self) -> [usize; 5] {
        [self.batch, self.frames, self.channels, self.height, self.width]
    }

    /// Two partial tensors can be joined along the height axis when every
    /// other axis agrees.
    #[must_use]
    pub const fn is_concat_compatible(&self, other: &Self) -> bool {
        self.batch == other.batch
            && self.frames == other.frames
            && self.channels == other.channels
            && self.width == other.width
    }
}

impl std::fmt::Display for SequenceShape {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "(B={}, T={}, C={}, H={}, W={})",
            self.batch, self.frames, self.channels, self.height, self.width
        )
    }
}

impl From<[usize; 5]> for SequenceShape {
    fn from([batch, frames, channels, height, width]: [usize; 5]) -> Self {
        Self::new(batch, frames, channels, height, width)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::NdArray;

    #[test]
    fn test_shape_from_dims() {
        let shape = SequenceShape::from_dims(&[1, 30, 64, 16, 11]).unwrap();
        assert_eq!(shape.as_array(), [1, 30, 64, 16, 11]);

        assert!(SequenceShape::from_dims(&[1, 30, 64]).is_err());
        assert!(SequenceShape::from_dims(&[1, 30, 64, 16, 11, 1]).is_err());
    }

    #[test]
    fn test_shape_is_empty() {
        assert!(!SequenceShape::new(1, 8, 4, 16, 11).is_empty());
        assert!(SequenceShape::new(1, 0, 4, 16, 11).is_empty());
    }

    #[test]
    fn test_concat_compatibility_ignores_height() {
        let top = SequenceShape::new(1, 8, 4, 16, 11);
        let bottom = SequenceShape::new(1, 8, 4, 8, 11);
        let other_width = SequenceShape::new(1, 8, 4, 16, 12);

        assert!(top.is_concat_compatible(&bottom));
        assert!(!top.is_concat_compatible(&other_width));
    }

    #[test]
    fn test_channel_first_layout_is_normalized() {
        let device = Default::default();
        let native = Tensor::<NdArray, 5>::zeros([1, 4, 8, 16, 11], &device);

        let canonical = TensorLayout::ChannelFirst.to_canonical(native);
        assert_eq!(canonical.dims(), [1, 8, 4, 16, 11]);

        let back = TensorLayout::ChannelFirst.from_canonical(canonical);
        assert_eq!(back.dims(), [1, 4, 8, 16, 11]);
    }

    #[test]
    fn test_time_first_layout_is_untouched() {
        let device = Default::default();
        let native = Tensor::<NdArray, 5>::zeros([1, 8, 4, 16, 11], &device);
        assert_eq!(TensorLayout::TimeFirst.to_canonical(native).dims(), [1, 8, 4, 16, 11]);
    }

    #[test]
    fn test_layout_serialization() {
        let json = serde_json::to_string(&TensorLayout::ChannelFirst).unwrap();
        let restored: TensorLayout = serde_json::from_str(&json).unwrap();
        assert_eq!(restored, TensorLayout::ChannelFirst);
    }
}
