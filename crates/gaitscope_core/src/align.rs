//! Temporal alignment by adaptive average pooling along the leading axis.
//!
//! Output slot `i` of a `T_s -> T_d` alignment averages source slots in the
//! half-open bin `[floor(i*T_s/T_d), ceil((i+1)*T_s/T_d))`. All trailing
//! axes pass through unchanged.

use ndarray::{Array, ArrayBase, Axis, Data, Dimension, RemoveAxis, Zip};

use crate::error::{CoreError, Result};

/// Source bin `[start, end)` for every output slot.
///
/// # Errors
///
/// Returns an error if either length is zero.
pub fn temporal_bins(source_len: usize, target_len: usize) -> Result<Vec<(usize, usize)>> {
    if target_len == 0 {
        return Err(CoreError::Reconciliation(
            "target length must be at least 1".to_string(),
        ));
    }
    if source_len == 0 {
        return Err(CoreError::Reconciliation(
            "cannot align an empty sequence".to_string(),
        ));
    }

    Ok((0..target_len)
        .map(|i| {
            let start = i * source_len / target_len;
            let end = ((i + 1) * source_len + target_len - 1) / target_len;
            (start, end)
        })
        .collect())
}

/// Resample a sequence to `target_len` slots along axis 0.
///
/// Works in both directions: compressing a long sequence to a layer's
/// reduced temporal resolution, or stretching a short one (bins then
/// overlap and slots repeat). When `target_len` equals the source length
/// the result equals the input exactly.
///
/// # Errors
///
/// Returns [`CoreError::Reconciliation`] for a zero target length, an empty
/// source or a rank-0 source.
///
/// # Example
///
/// ```rust
/// use gaitscope_core::temporal_align;
/// use ndarray::array;
///
/// let frames = array![[0.0_f32], [2.0], [4.0], [6.0]];
/// let aligned = temporal_align(&frames, 2).unwrap();
/// assert_eq!(aligned, array![[1.0], [5.0]]);
/// ```
pub fn temporal_align<S, D>(source: &ArrayBase<S, D>, target_len: usize) -> Result<Array<f32, D>>
where
    S: Data<Elem = f32>,
    D: Dimension + RemoveAxis,
{
    if source.ndim() == 0 {
        return Err(CoreError::Reconciliation(
            "source has no temporal axis".to_string(),
        ));
    }
    let source_len = source.len_of(Axis(0));
    let bins = temporal_bins(source_len, target_len)?;

    if target_len == source_len {
        return Ok(source.to_owned());
    }

    let mut shape = source.raw_dim();
    shape[0] = target_len;
    let mut output = Array::<f32, D>::zeros(shape);

    for (mut slot, &(start, end)) in output.axis_iter_mut(Axis(0)).zip(bins.iter()) {
        let count = (end - start) as f32;
        for t in start..end {
            Zip::from(&mut slot)
                .and(&source.index_axis(Axis(0), t))
                .for_each(|acc, &v| *acc += v);
        }
        slot.mapv_inplace(|v| v / count);
    }

    Ok(output)
}

/// Resample `source` to the temporal length of `destination`.
///
/// # Errors
///
/// Returns [`CoreError::Reconciliation`] when the two arrays differ in rank.
pub fn temporal_align_like<S, T, D>(
    source: &ArrayBase<S, D>,
    destination: &ArrayBase<T, D>,
) -> Result<Array<f32, D>>
where
    S: Data<Elem = f32>,
    T: Data,
    D: Dimension + RemoveAxis,
{
    if source.ndim() != destination.ndim() {
        return Err(CoreError::Reconciliation(format!(
            "rank mismatch: source has {} axes, destination has {}",
            source.ndim(),
            destination.ndim()
        )));
    }
    if destination.ndim() == 0 {
        return Err(CoreError::Reconciliation(
            "destination has no temporal axis".to_string(),
        ));
    }
    temporal_align(source, destination.len_of(Axis(0)))
}

/// Resample an 8-bit image sequence, rounding back to 8 bits.
///
/// # Errors
///
/// See [`temporal_align`].
pub fn temporal_align_u8<S, D>(source: &ArrayBase<S, D>, target_len: usize) -> Result<Array<u8, D>>
where
    S: Data<Elem = u8>,
    D: Dimension + RemoveAxis,
{
    if source.ndim() > 0 && source.len_of(Axis(0)) == target_len {
        return Ok(source.to_owned());
    }
    let widened = source.mapv(f32::from);
    let aligned = temporal_align(&widened, target_len)?;
    Ok(aligned.mapv(|v| v.round().clamp(0.0, 255.0) as u8))
}
