//! Dual lower bound for box and single-equality constrained QPs
//!
//! For convex `f` and a feasible `a`, `f(x) >= f(a) + g'(x - a)` for every
//! feasible `x`, so
//!
//! ```text
//! QD = QP - g'a + min { g'x : y'x = b, 0 <= x <= U }
//! ```
//!
//! is a lower bound on the optimum. The inner LP is solved through its
//! dual `max_r h(r)` with `h(r) = r b + sum_i U_i min(0, g_i - r y_i)`,
//! a concave piecewise linear function whose maximum lies on one of the
//! breakpoints `r = y_i g_i`.

use crate::solver::problem::QpProblem;
use std::cmp::Ordering;

/// Lower bound `QD` on the problem restricted to `indices`
///
/// Variables outside `indices` are held at their current values; the
/// equality right-hand side of the restricted problem is taken from the
/// current iterate. Pass every index to bound the full problem.
pub fn dual_bound(
    problem: &QpProblem,
    alpha: &[f64],
    gradient: &[f64],
    primal: f64,
    indices: &[usize],
) -> f64 {
    if indices.is_empty() {
        return primal;
    }

    let mut linear_part = 0.0;
    let mut rhs = 0.0;
    for &t in indices {
        linear_part += gradient[t] * alpha[t];
        rhs += problem.signs[t] * alpha[t];
    }

    primal - linear_part + max_lp_dual(problem, gradient, rhs, indices)
}

/// `max_r h(r)` by a sweep over the sorted breakpoints
fn max_lp_dual(problem: &QpProblem, gradient: &[f64], rhs: f64, indices: &[usize]) -> f64 {
    let mut breakpoints: Vec<(f64, usize)> = indices
        .iter()
        .map(|&t| (problem.signs[t] * gradient[t], t))
        .collect();
    breakpoints.sort_by(|a, b| a.0.partial_cmp(&b.0).unwrap_or(Ordering::Equal));

    // Terms with y = -1 are active below their breakpoint, terms with y = +1
    // above it. h(r) = r * rhs + sum_active U (g - r y).
    let mut offset = 0.0;
    let mut slope = 0.0;
    for &t in indices {
        if problem.signs[t] < 0.0 {
            offset += problem.upper[t] * gradient[t];
            slope += problem.upper[t] * problem.signs[t];
        }
    }

    let mut best = f64::NEG_INFINITY;
    for &(r, t) in &breakpoints {
        let u = problem.upper[t];
        let y = problem.signs[t];
        if y < 0.0 {
            offset -= u * gradient[t];
            slope -= u * y;
        }
        let h = r * rhs + offset - r * slope;
        if h > best {
            best = h;
        }
        if y > 0.0 {
            offset += u * gradient[t];
            slope += u * y;
        }
    }
    best
}

#[cfg(test)]
mod tests {
    use super::*;

    fn brute_force_lp_dual(problem: &QpProblem, gradient: &[f64], rhs: f64) -> f64 {
        (0..problem.len())
            .map(|k| {
                let r = problem.signs[k] * gradient[k];
                let sum: f64 = (0..problem.len())
                    .map(|i| problem.upper[i] * (gradient[i] - r * problem.signs[i]).min(0.0))
                    .sum();
                r * rhs + sum
            })
            .fold(f64::NEG_INFINITY, f64::max)
    }

    #[test]
    fn test_bound_at_zero() {
        // Q = I over two variables of opposite sign, optimum -1 at (1, 1)
        let problem = QpProblem::classification(&[1.0, -1.0][..], 1.0).expect("valid");
        let alpha = [0.0, 0.0];
        let gradient = [-1.0, -1.0];

        let qd = dual_bound(&problem, &alpha, &gradient, 0.0, &[0, 1]);
        assert!((qd - (-2.0)).abs() < 1e-12);
    }

    #[test]
    fn test_bound_is_tight_at_optimum() {
        let problem = QpProblem::classification(&[1.0, -1.0][..], 1.0).expect("valid");
        let alpha = [1.0, 1.0];
        let gradient = [0.0, 0.0];

        let qd = dual_bound(&problem, &alpha, &gradient, -1.0, &[0, 1]);
        assert!((qd - (-1.0)).abs() < 1e-12);
    }

    #[test]
    fn test_sweep_matches_brute_force() {
        let problem =
            QpProblem::classification(&[1.0, -1.0, 1.0, -1.0, 1.0, -1.0][..], 2.0).expect("valid");
        let gradient = [-0.3, 1.2, 0.7, -2.0, 0.0, 0.7];
        let alpha = [0.5, 0.0, 2.0, 1.5, 0.0, 1.0];

        let rhs = problem.signs.iter().zip(&alpha).map(|(y, a)| y * a).sum();
        let expected = brute_force_lp_dual(&problem, &gradient, rhs);
        let swept = max_lp_dual(&problem, &gradient, rhs, &[0, 1, 2, 3, 4, 5]);
        assert!((swept - expected).abs() < 1e-12);
    }

    #[test]
    fn test_restricted_bound() {
        let problem = QpProblem::classification(&[1.0, -1.0, 1.0][..], 1.0).expect("valid");
        let alpha = [0.5, 0.5, 0.0];
        let gradient = [0.0, 0.0, 1.0];

        let qd = dual_bound(&problem, &alpha, &gradient, -0.5, &[0, 1]);
        assert!((qd - (-0.5)).abs() < 1e-12);
        assert_eq!(dual_bound(&problem, &alpha, &gradient, -0.5, &[]), -0.5);
    }
}
