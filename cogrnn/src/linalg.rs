use nalgebra::DMatrix;
use ndarray::Array2;

use crate::error::{Result, TrainError};

/// All eigenvalues of a square matrix as (real, imaginary) pairs, unordered.
pub fn eigenvalues(a: &Array2<f64>) -> Result<Vec<(f64, f64)>> {
    let n = a.nrows();
    if n != a.ncols() {
        return Err(TrainError::shape("eigenvalue matrix", &[n, n], a.shape()));
    }

    if a.iter().any(|v| !v.is_finite()) {
        return Err(TrainError::InvalidParameter {
            name: "matrix",
            reason: "contains non-finite entries".into(),
        });
    }

    if n == 0 {
        return Ok(vec![]);
    }

    let entries = a.iter().copied().collect::<Vec<f64>>();
    let m = DMatrix::from_row_slice(n, n, &entries);

    Ok(m.complex_eigenvalues()
        .iter()
        .map(|ev| (ev.re, ev.im))
        .collect())
}

/// Magnitude of the largest eigenvalue.
pub fn spectral_radius(a: &Array2<f64>) -> Result<f64> {
    Ok(eigenvalues(a)?
        .into_iter()
        .map(|(re, im)| re.hypot(im))
        .fold(0., f64::max))
}

#[cfg(test)]
mod tests {
    use super::*;
    use ndarray::array;
    use ndarray_rand::{rand_distr::Normal, RandomExt};
    use rand::{rngs::StdRng, SeedableRng};

    fn sorted_real(mut ev: Vec<(f64, f64)>) -> Vec<f64> {
        ev.sort_by(|a, b| a.0.total_cmp(&b.0));
        ev.into_iter().map(|(re, _)| re).collect()
    }

    #[test]
    fn triangular_matrix_eigenvalues_are_the_diagonal() {
        let a = array![[3., 1., 4.], [0., -2., 7.], [0., 0., 0.5]];
        let ev = sorted_real(eigenvalues(&a).unwrap());

        for (got, want) in ev.iter().zip([-2., 0.5, 3.]) {
            assert!((got - want).abs() < 1e-10);
        }
    }

    #[test]
    fn rotation_has_complex_pair() {
        let a = array![[0., -2.], [2., 0.]];
        let ev = eigenvalues(&a).unwrap();

        for (re, im) in ev.iter() {
            assert!(re.abs() < 1e-10);
            assert!((im.abs() - 2.).abs() < 1e-10);
        }
        assert!((spectral_radius(&a).unwrap() - 2.).abs() < 1e-10);
    }

    #[test]
    fn trace_and_radius_scaling_hold_for_random_matrices() {
        let mut rng = StdRng::seed_from_u64(3);
        let normal = Normal::new(0., 1.).unwrap();

        for n in [1, 2, 5, 20, 60] {
            let a = Array2::random_using((n, n), normal, &mut rng);
            let ev = eigenvalues(&a).unwrap();

            assert_eq!(ev.len(), n);
            let trace: f64 = a.diag().sum();
            let ev_sum: f64 = ev.iter().map(|(re, _)| re).sum();
            let ev_imag: f64 = ev.iter().map(|(_, im)| im).sum();
            assert!((trace - ev_sum).abs() < 1e-8 * n as f64);
            assert!(ev_imag.abs() < 1e-8 * n as f64);

            let rho = spectral_radius(&a).unwrap();
            let scaled = spectral_radius(&(&a * (0.95 / rho))).unwrap();
            assert!((scaled - 0.95).abs() < 1e-8);
        }
    }

    #[test]
    fn empty_matrix_has_zero_radius() {
        assert_eq!(spectral_radius(&Array2::zeros((0, 0))).unwrap(), 0.);
    }

    #[test]
    fn rejects_non_finite_entries() {
        let a = array![[1., f64::NAN], [0., 1.]];
        assert!(matches!(eigenvalues(&a), Err(TrainError::InvalidParameter { .. })));
    }

    #[test]
    fn rejects_non_square() {
        assert!(eigenvalues(&Array2::zeros((2, 3))).is_err());
    }
}
