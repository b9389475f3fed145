//! Dimensionality reduction capability and the built-in PCA reducer.

use gaitscope_core::Seed;
use ndarray::{Array1, Array2, ArrayView2, Axis};
use rand::Rng;
use thiserror::Error;

/// Failure reported by a reducer for one bucket.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ReduceError {
    /// The bucket did not fit in the reducer's memory budget.
    #[error("resource exhausted: {0}")]
    ResourceExhausted(String),
    /// Any other failure.
    #[error("{0}")]
    Failed(String),
}

/// Reduces one bucket of descriptors `(n, D_in)` to `(n, D_out)`.
///
/// Each bucket is reduced independently; `D_out` must be the same for
/// every bucket of a stream.
pub trait Reducer {
    /// Reduce one bucket.
    ///
    /// # Errors
    ///
    /// Returns [`ReduceError::ResourceExhausted`] when the bucket is too
    /// large to process.
    fn reduce(&mut self, bucket: ArrayView2<'_, f32>) -> Result<Array2<f32>, ReduceError>;
}

impl<F> Reducer for F
where
    F: FnMut(ArrayView2<'_, f32>) -> Result<Array2<f32>, ReduceError>,
{
    fn reduce(&mut self, bucket: ArrayView2<'_, f32>) -> Result<Array2<f32>, ReduceError> {
        self(bucket)
    }
}

/// Pin a closure's signature so it can be used as a [`Reducer`].
///
/// ```rust
/// use gaitscope_analysis::{reducer_fn, Reducer};
/// use ndarray::{s, array};
///
/// let mut first_two = reducer_fn(|bucket| Ok(bucket.slice(s![.., ..2]).to_owned()));
/// let reduced = first_two.reduce(array![[1.0_f32, 2.0, 3.0]].view()).unwrap();
/// assert_eq!(reduced, array![[1.0, 2.0]]);
/// ```
pub fn reducer_fn<F>(f: F) -> F
where
    F: FnMut(ArrayView2<'_, f32>) -> Result<Array2<f32>, ReduceError>,
{
    f
}

/// Variance below this share of the bucket's energy counts as exhausted.
const RELATIVE_CUTOFF: f32 = 1e-6;

/// Principal component projection by seeded power iteration.
///
/// Components are found one at a time on the mean-centred bucket, deflating
/// after each. The covariance matrix is never formed, so memory stays at
/// `O(n·D)`. The sign of each component is fixed so that its largest
/// coefficient is positive.
#[derive(Debug, Clone)]
pub struct PcaReducer {
    n_components: usize,
    seed: Seed,
    max_iterations: usize,
    tolerance: f32,
    max_elements: Option<usize>,
}

impl PcaReducer {
    /// Create a reducer projecting onto `n_components` directions.
    pub fn new(n_components: usize, seed: Seed) -> Self {
        Self {
            n_components,
            seed,
            max_iterations: 200,
            tolerance: 1e-6,
            max_elements: None,
        }
    }

    /// Refuse buckets with more than `max_elements` values.
    #[must_use]
    pub fn with_max_elements(mut self, max_elements: usize) -> Self {
        self.max_elements = Some(max_elements);
        self
    }

    /// Set the power iteration limit per component.
    #[must_use]
    pub fn with_max_iterations(mut self, max_iterations: usize) -> Self {
        self.max_iterations = max_iterations.max(1);
        self
    }

    /// Number of output columns.
    #[must_use]
    pub fn n_components(&self) -> usize {
        self.n_components
    }

    /// Dominant direction of `centred`, or `None` once its variance is
    /// negligible next to `energy`, the squared norm of the whole bucket.
    fn leading_direction(
        &self,
        centred: &Array2<f32>,
        energy: f32,
        rng: &mut impl Rng,
    ) -> Option<Array1<f32>> {
        let d = centred.ncols();
        let mut v = Array1::from_shape_fn(d, |_| rng.gen_range(-1.0_f32..1.0));
        let norm = v.dot(&v).sqrt();
        if norm == 0.0 {
            return None;
        }
        v /= norm;

        for _ in 0..self.max_iterations {
            // Xᵀ (X v) without forming the covariance matrix.
            let mut next = centred.t().dot(&centred.dot(&v));
            let norm = next.dot(&next).sqrt();
            if norm <= RELATIVE_CUTOFF * energy {
                return None;
            }
            next /= norm;
            let delta = (&next - &v).mapv(f32::abs).sum();
            v = next;
            if delta < self.tolerance {
                break;
            }
        }

        let pivot = v
            .iter()
            .copied()
            .fold(0.0_f32, |best, x| if x.abs() > best.abs() { x } else { best });
        if pivot < 0.0 {
            v.mapv_inplace(|x| -x);
        }
        Some(v)
    }
}

impl Reducer for PcaReducer {
    fn reduce(&mut self, bucket: ArrayView2<'_, f32>) -> Result<Array2<f32>, ReduceError> {
        let (n, d) = bucket.dim();
        if let Some(max) = self.max_elements {
            if n * d > max {
                return Err(ReduceError::ResourceExhausted(format!(
                    "bucket of {n}x{d} values exceeds the budget of {max}"
                )));
            }
        }
        if n == 0 {
            return Ok(Array2::zeros((0, self.n_components)));
        }

        let mean = bucket
            .mean_axis(Axis(0))
            .ok_or_else(|| ReduceError::Failed("empty bucket".to_string()))?;
        let centred = &bucket - &mean;
        let energy = centred.iter().map(|x| x * x).sum::<f32>();
        let mut residual = centred.clone();
        let mut rng = self.seed.to_rng();

        let mut output = Array2::<f32>::zeros((n, self.n_components));
        for k in 0..self.n_components.min(d) {
            let Some(direction) = self.leading_direction(&residual, energy, &mut rng) else {
                break;
            };
            let scores = centred.dot(&direction);
            output.column_mut(k).assign(&scores);

            // Deflate: X ← X − (X v) vᵀ
            let residual_scores = residual.dot(&direction);
            for (mut row, &s) in residual.axis_iter_mut(Axis(0)).zip(residual_scores.iter()) {
                row.scaled_add(-s, &direction);
            }
        }
        Ok(output)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ndarray::{array, Array2};

    fn line_data() -> Array2<f32> {
        // Points spread along (1, 1, 0) with a small offset along (0, 0, 1).
        Array2::from_shape_fn((10, 3), |(i, j)| match j {
            0 | 1 => i as f32,
            _ => if i % 2 == 0 { 0.1 } else { -0.1 },
        })
    }

    #[test]
    fn test_pca_output_shape() {
        let mut pca = PcaReducer::new(2, Seed::new(1));
        let out = pca.reduce(line_data().view()).unwrap();
        assert_eq!(out.dim(), (10, 2));
    }

    #[test]
    fn test_pca_first_component_follows_spread() {
        let mut pca = PcaReducer::new(1, Seed::new(7));
        let out = pca.reduce(line_data().view()).unwrap();
        let first = out.column(0);
        // Scores grow monotonically along the line, spaced by sqrt(2).
        for i in 1..10 {
            assert!((first[i] - first[i - 1] - 2.0_f32.sqrt()).abs() < 1e-2);
        }
    }

    #[test]
    fn test_pca_handles_small_scale_descriptors() {
        let data = line_data().mapv(|v| v * 1e-5);
        let out = PcaReducer::new(2, Seed::new(7)).reduce(data.view()).unwrap();
        let first = out.column(0);
        assert!(first.iter().any(|&v| v != 0.0));
        for i in 1..10 {
            assert!((first[i] - first[i - 1] - 2.0_f32.sqrt() * 1e-5).abs() < 1e-7);
        }
    }

    #[test]
    fn test_constant_bucket_projects_to_zero() {
        let data = Array2::from_elem((5, 3), 2.5_f32);
        let out = PcaReducer::new(2, Seed::new(0)).reduce(data.view()).unwrap();
        assert!(out.iter().all(|&v| v == 0.0));
    }

    #[test]
    fn test_pca_is_deterministic() {
        let data = line_data();
        let a = PcaReducer::new(2, Seed::new(3)).reduce(data.view()).unwrap();
        let b = PcaReducer::new(2, Seed::new(3)).reduce(data.view()).unwrap();
        assert_eq!(a, b);
    }

    #[test]
    fn test_pca_extra_components_are_zero() {
        let data = array![[1.0_f32, 2.0], [3.0, 4.0], [5.0, 7.0]];
        let out = PcaReducer::new(4, Seed::new(0)).reduce(data.view()).unwrap();
        assert_eq!(out.dim(), (3, 4));
        assert!(out.column(2).iter().all(|&v| v == 0.0));
        assert!(out.column(3).iter().all(|&v| v == 0.0));
    }

    #[test]
    fn test_single_row_bucket() {
        let data = array![[1.0_f32, 2.0, 3.0]];
        let out = PcaReducer::new(2, Seed::new(0)).reduce(data.view()).unwrap();
        assert_eq!(out, Array2::<f32>::zeros((1, 2)));
    }

    #[test]
    fn test_budget_signals_exhaustion() {
        let mut pca = PcaReducer::new(2, Seed::new(0)).with_max_elements(20);
        let err = pca.reduce(line_data().view()).unwrap_err();
        assert!(matches!(err, ReduceError::ResourceExhausted(_)));
    }

    #[test]
    fn test_closure_reducer() {
        let mut calls = 0;
        let mut reducer = reducer_fn(|bucket| {
            calls += 1;
            Ok(bucket.to_owned())
        });
        let data = array![[1.0_f32, 2.0]];
        assert_eq!(reducer.reduce(data.view()).unwrap(), data);
        drop(reducer);
        assert_eq!(calls, 1);
    }
}
