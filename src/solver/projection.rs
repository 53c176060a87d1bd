//! Gradient projection for small dense QPs
//!
//! Solves `min 0.5 x'Qx + b'x` subject to `y'x = r` and `0 <= x <= u`,
//! the subproblem of a chunked working set. Each iteration projects a
//! gradient step onto the feasible set and backtracks along the projection
//! arc until the objective decreases sufficiently, so every iterate is a
//! projected point and bound variables sit exactly on their bounds. Step
//! lengths come from the Barzilai-Borwein rule.

use crate::core::{Result, SVMError};

const MIN_STEP: f64 = 1e-10;
const MAX_STEP: f64 = 1e10;
const BISECTION_ROUNDS: usize = 128;
const MAX_BACKTRACKS: usize = 60;
/// Armijo constant of the arc search
const SUFFICIENT_DECREASE: f64 = 1e-4;

/// Euclidean projection of `z` onto `{x : y'x = rhs, 0 <= x <= upper}`
///
/// The projection is `clip(z + lambda y)` for the multiplier `lambda`
/// that satisfies the equality; `y'x` is nondecreasing in `lambda`, so it
/// is found by bisection. Returns `lambda`.
pub fn project(z: &[f64], signs: &[f64], upper: &[f64], rhs: f64, out: &mut [f64]) -> f64 {
    let place = |lambda: f64, out: &mut [f64]| -> f64 {
        let mut total = 0.0;
        for i in 0..z.len() {
            let x = (z[i] + lambda * signs[i]).clamp(0.0, upper[i]);
            out[i] = x;
            total += signs[i] * x;
        }
        total - rhs
    };

    let reach = z
        .iter()
        .zip(upper)
        .zip(signs)
        .map(|((z, u), y)| (z.abs() + u) / y.abs())
        .fold(0.0, f64::max)
        + 1.0;
    let (mut lo, mut hi) = (-reach, reach);
    for _ in 0..BISECTION_ROUNDS {
        let mid = 0.5 * (lo + hi);
        let residual = place(mid, out);
        if residual == 0.0 {
            return mid;
        }
        if residual < 0.0 {
            lo = mid;
        } else {
            hi = mid;
        }
        if hi - lo <= f64::EPSILON * reach {
            break;
        }
    }
    let lambda = 0.5 * (lo + hi);
    place(lambda, out);
    lambda
}

/// `max_{up} v - min_{low} v` with `v = -y g`
pub fn kkt_violation(signs: &[f64], upper: &[f64], x: &[f64], gradient: &[f64]) -> f64 {
    let mut max_up = f64::NEG_INFINITY;
    let mut min_low = f64::INFINITY;
    for i in 0..x.len() {
        let y = signs[i];
        let v = -y * gradient[i];
        let (below, above) = (x[i] < upper[i], x[i] > 0.0);
        if (y > 0.0 && below) || (y < 0.0 && above) {
            max_up = max_up.max(v);
        }
        if (y > 0.0 && above) || (y < 0.0 && below) {
            min_low = min_low.min(v);
        }
    }
    max_up - min_low
}

/// Projected gradient solver with an Armijo arc search
#[derive(Debug, Clone)]
pub struct GradientProjection {
    pub max_iterations: usize,
    /// Stop once the KKT violation drops to this value
    pub tolerance: f64,
}

impl GradientProjection {
    pub fn new(tolerance: f64) -> Self {
        Self {
            max_iterations: 500,
            tolerance,
        }
    }

    /// Improve the feasible point `x` in place and return the iterations used
    ///
    /// `quadratic` is the dense row-major `n x n` matrix `Q`.
    pub fn solve(
        &self,
        quadratic: &[f64],
        linear: &[f64],
        signs: &[f64],
        upper: &[f64],
        x: &mut [f64],
    ) -> Result<usize> {
        let n = x.len();
        for len in [linear.len(), signs.len(), upper.len()] {
            if len != n {
                return Err(SVMError::DimensionMismatch {
                    expected: n,
                    actual: len,
                });
            }
        }
        if quadratic.len() != n * n {
            return Err(SVMError::DimensionMismatch {
                expected: n * n,
                actual: quadratic.len(),
            });
        }

        let rhs: f64 = signs.iter().zip(x.iter()).map(|(y, a)| y * a).sum();
        let mut gradient = linear.to_vec();
        for (i, row) in quadratic.chunks(n).enumerate() {
            gradient[i] += row.iter().zip(x.iter()).map(|(q, a)| q * a).sum::<f64>();
        }

        let mut z: Vec<f64> = x.iter().zip(&gradient).map(|(a, g)| a - g).collect();
        let mut trial = vec![0.0; n];
        project(&z, signs, upper, rhs, &mut trial);
        let spread = trial
            .iter()
            .zip(x.iter())
            .map(|(t, a)| (t - a).abs())
            .fold(0.0, f64::max);
        if spread == 0.0 {
            return Ok(0);
        }
        let mut step = (1.0 / spread).clamp(MIN_STEP, MAX_STEP);

        let mut direction = vec![0.0; n];
        let mut curvature = vec![0.0; n];
        for iteration in 0..self.max_iterations {
            if kkt_violation(signs, upper, x, &gradient) <= self.tolerance {
                return Ok(iteration);
            }

            let mut accepted = false;
            for _ in 0..MAX_BACKTRACKS {
                for i in 0..n {
                    z[i] = x[i] - step * gradient[i];
                }
                project(&z, signs, upper, rhs, &mut trial);

                let mut slope = 0.0;
                for i in 0..n {
                    direction[i] = trial[i] - x[i];
                    slope += direction[i] * gradient[i];
                }
                if !(slope < 0.0) {
                    return Ok(iteration);
                }

                let mut dqd = 0.0;
                for (i, row) in quadratic.chunks(n).enumerate() {
                    curvature[i] = row.iter().zip(&direction).map(|(q, d)| q * d).sum();
                    dqd += direction[i] * curvature[i];
                }

                if slope + 0.5 * dqd <= SUFFICIENT_DECREASE * slope {
                    accepted = true;
                    step = if dqd > 0.0 {
                        let dd: f64 = direction.iter().map(|d| d * d).sum();
                        (dd / dqd).clamp(MIN_STEP, MAX_STEP)
                    } else {
                        MAX_STEP
                    };
                    break;
                }
                step = (0.5 * step).max(MIN_STEP);
            }
            if !accepted {
                return Ok(iteration);
            }

            x.copy_from_slice(&trial);
            for (g, c) in gradient.iter_mut().zip(&curvature) {
                *g += c;
            }
        }
        Ok(self.max_iterations)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_abs_diff_eq;

    #[test]
    fn test_projection_is_feasible() {
        let signs = [1.0, -1.0, 1.0, -1.0];
        let upper = [1.0, 1.0, 2.0, 2.0];
        let z = [3.0, -2.0, 0.5, 0.7];
        let mut x = [0.0; 4];

        project(&z, &signs, &upper, 0.5, &mut x);
        let residual: f64 = signs.iter().zip(&x).map(|(y, a)| y * a).sum::<f64>() - 0.5;
        assert_abs_diff_eq!(residual, 0.0, epsilon = 1e-12);
        for (a, u) in x.iter().zip(&upper) {
            assert!(*a >= 0.0 && *a <= *u);
        }
    }

    #[test]
    fn test_projection_keeps_feasible_points() {
        let signs = [1.0, 1.0, -1.0];
        let upper = [1.0, 1.0, 1.0];
        let z = [0.25, 0.5, 0.75];
        let mut x = [0.0; 3];

        project(&z, &signs, &upper, 0.0, &mut x);
        for (a, b) in x.iter().zip(&z) {
            assert_abs_diff_eq!(*a, *b, epsilon = 1e-12);
        }
    }

    #[test]
    fn test_projection_shifts_along_signs() {
        // Equal signs: the closest point moves both coordinates equally
        let mut x = [0.0; 2];
        project(&[0.2, 0.4], &[1.0, 1.0], &[1.0, 1.0], 1.0, &mut x);
        assert_abs_diff_eq!(x[0], 0.4, epsilon = 1e-12);
        assert_abs_diff_eq!(x[1], 0.6, epsilon = 1e-12);
    }

    #[test]
    fn test_solves_two_variable_svm() {
        // K = I, y = (1, -1), C = 1: optimum a = (1, 1)
        let quadratic = [1.0, 0.0, 0.0, 1.0];
        let mut x = [0.0, 0.0];
        let iterations = GradientProjection::new(1e-9)
            .solve(&quadratic, &[-1.0, -1.0], &[1.0, -1.0], &[1.0, 1.0], &mut x)
            .expect("solve");

        assert!(iterations > 0);
        assert_abs_diff_eq!(x[0], 1.0, epsilon = 1e-9);
        assert_abs_diff_eq!(x[1], 1.0, epsilon = 1e-9);
    }

    #[test]
    fn test_reaches_kkt_tolerance() {
        // Linear kernel on 1-D points -2, -1, 1, 2 with labels -1, -1, 1, 1
        let xs = [-2.0, -1.0, 1.0, 2.0];
        let ys = [-1.0, -1.0, 1.0, 1.0];
        let mut quadratic = [0.0; 16];
        for i in 0..4 {
            for j in 0..4 {
                quadratic[i * 4 + j] = ys[i] * ys[j] * xs[i] * xs[j];
            }
        }
        let upper = [10.0; 4];
        let mut x = [0.0; 4];

        GradientProjection::new(1e-8)
            .solve(&quadratic, &[-1.0; 4], &ys, &upper, &mut x)
            .expect("solve");

        let mut gradient = [-1.0; 4];
        for i in 0..4 {
            for j in 0..4 {
                gradient[i] += quadratic[i * 4 + j] * x[j];
            }
        }
        assert!(kkt_violation(&ys, &upper, &x, &gradient) <= 1e-8);
        // Margin is set by -1 and 1: w = 1
        let w: f64 = (0..4).map(|i| x[i] * ys[i] * xs[i]).sum();
        assert_abs_diff_eq!(w, 1.0, epsilon = 1e-6);
    }

    #[test]
    fn test_dimension_mismatch() {
        let mut x = [0.0, 0.0];
        let result = GradientProjection::new(1e-6).solve(
            &[1.0, 0.0, 0.0],
            &[0.0, 0.0],
            &[1.0, -1.0],
            &[1.0, 1.0],
            &mut x,
        );
        assert!(matches!(result, Err(SVMError::DimensionMismatch { .. })));
    }
}
