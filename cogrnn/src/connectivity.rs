//! Connectivity masks over a weight matrix.
//!
//! A mask splits the entries of a weight matrix into a plastic part, whose
//! values are trained and scaled by `mask_plastic`, and a fixed part, whose
//! values are frozen at `mask_fixed`. The effective weight is
//! `mask_plastic * W + mask_fixed`.

use ndarray::{Array1, Array2, Zip};
use rand::Rng;
use serde::{Deserialize, Serialize};

use crate::error::{Result, TrainError};

#[derive(Serialize, Deserialize)]
struct Masks {
    plastic: Array2<f64>,
    fixed: Option<Array2<f64>>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(try_from = "Masks", into = "Masks")]
pub struct Connectivity {
    pub mask_plastic: Array2<f64>,
    pub mask_fixed: Array2<f64>,

    /// Row-major flat indices of the trainable entries.
    pub idx_plastic: Vec<usize>,
    /// `mask_plastic` values at `idx_plastic`.
    pub plastic: Array1<f64>,
    pub nplastic: usize,

    pub p: f64,
    pub p_plastic: f64,
}

impl Connectivity {
    /// Builds a connectivity from a plastic mask and optional fixed weights.
    ///
    /// Entries of `plastic` must be non-negative; a zero entry is not trainable.
    pub fn new(plastic: Array2<f64>, fixed: Option<Array2<f64>>) -> Result<Connectivity> {
        let fixed = match fixed {
            Some(fixed) => {
                if fixed.dim() != plastic.dim() {
                    return Err(TrainError::shape(
                        "fixed connectivity",
                        plastic.shape(),
                        fixed.shape(),
                    ));
                }
                fixed
            }
            None => Array2::zeros(plastic.dim()),
        };

        if plastic.iter().any(|m| *m < 0. || !m.is_finite()) {
            return Err(TrainError::InvalidParameter {
                name: "connectivity",
                reason: "plastic mask entries must be finite and non-negative".into(),
            });
        }

        let idx_plastic = plastic
            .iter()
            .enumerate()
            .filter(|(_, m)| **m != 0.)
            .map(|(ix, _)| ix)
            .collect::<Vec<usize>>();

        let values = plastic.iter().copied().collect::<Vec<f64>>();
        let plastic_values = idx_plastic
            .iter()
            .map(|ix| values[*ix])
            .collect::<Array1<f64>>();

        let size = plastic.len().max(1) as f64;
        let connected = Zip::from(&plastic)
            .and(&fixed)
            .fold(0usize, |acc, m, f| acc + (*m != 0. || *f != 0.) as usize);

        let nplastic = idx_plastic.len();

        Ok(Connectivity {
            mask_plastic: plastic,
            mask_fixed: fixed,
            idx_plastic,
            plastic: plastic_values,
            nplastic,
            p: connected as f64 / size,
            p_plastic: nplastic as f64 / size,
        })
    }

    /// Random structural mask where each entry is trainable with probability `p`.
    pub fn random<R: Rng + ?Sized>(rows: usize, cols: usize, p: f64, rng: &mut R) -> Connectivity {
        let mask = Array2::from_shape_fn((rows, cols), |_| (rng.gen::<f64>() < p) as u8 as f64);

        Connectivity::new(mask, None).unwrap_or_else(|_| unreachable!("binary masks are valid"))
    }

    pub fn dim(&self) -> (usize, usize) {
        self.mask_plastic.dim()
    }

    pub fn is_plastic(&self) -> Array2<bool> {
        self.mask_plastic.mapv(|m| m != 0.)
    }

    pub fn is_fixed(&self) -> Array2<bool> {
        self.mask_fixed.mapv(|f| f != 0.)
    }

    /// Effective weights `mask_plastic * w + mask_fixed`.
    pub fn apply(&self, w: &Array2<f64>) -> Array2<f64> {
        &self.mask_plastic * w + &self.mask_fixed
    }

    /// Scales the frozen part of the matrix, used when renormalizing a
    /// recurrent matrix to a target spectral radius.
    pub fn scale_fixed(&mut self, factor: f64) {
        self.mask_fixed *= factor;
    }
}

impl TryFrom<Masks> for Connectivity {
    type Error = TrainError;

    fn try_from(masks: Masks) -> Result<Connectivity> {
        Connectivity::new(masks.plastic, masks.fixed)
    }
}

impl From<Connectivity> for Masks {
    fn from(c: Connectivity) -> Masks {
        let has_fixed = c.mask_fixed.iter().any(|f| *f != 0.);

        Masks {
            plastic: c.mask_plastic,
            fixed: has_fixed.then_some(c.mask_fixed),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ndarray::array;
    use rand::{rngs::StdRng, SeedableRng};

    #[test]
    fn densities_and_indices() {
        let plastic = array![[1., 0., 1.], [0., 0., 1.]];
        let fixed = array![[0., 0.5, 0.], [0., 0., 0.]];
        let c = Connectivity::new(plastic, Some(fixed)).unwrap();

        assert_eq!(c.idx_plastic, vec![0, 2, 5]);
        assert_eq!(c.nplastic, 3);
        assert!((c.p_plastic - 0.5).abs() < 1e-12);
        assert!((c.p - 4. / 6.).abs() < 1e-12);
        assert_eq!(c.is_fixed()[[0, 1]], true);
        assert_eq!(c.is_plastic()[[0, 1]], false);
    }

    #[test]
    fn p_plastic_matches_fraction_for_random_masks() {
        let mut rng = StdRng::seed_from_u64(7);

        for p in [0.0, 0.1, 0.5, 0.9, 1.0] {
            let c = Connectivity::random(13, 17, p, &mut rng);
            let ones = c.mask_plastic.iter().filter(|m| **m == 1.).count();

            assert_eq!(c.idx_plastic.len(), c.nplastic);
            assert_eq!(c.nplastic, ones);
            assert!((c.p_plastic - ones as f64 / (13. * 17.)).abs() < 1e-12);
        }
    }

    #[test]
    fn rejects_mismatched_fixed_mask() {
        let err = Connectivity::new(Array2::ones((2, 2)), Some(Array2::zeros((3, 2))));
        assert!(matches!(err, Err(TrainError::Shape { .. })));
    }

    #[test]
    fn apply_combines_plastic_and_fixed() {
        let c = Connectivity::new(array![[1., 0.], [2., 0.]], Some(array![[0., 3.], [0., 0.]]))
            .unwrap();
        let w = array![[0.5, 9.], [1., 9.]];

        assert_eq!(c.apply(&w), array![[0.5, 3.], [2., 0.]]);
    }

    #[test]
    fn serde_keeps_derived_fields_consistent() {
        let c = Connectivity::new(array![[1., 0.], [1., 1.]], None).unwrap();
        let json = serde_json::to_string(&c).unwrap();
        let back: Connectivity = serde_json::from_str(&json).unwrap();

        assert_eq!(back, c);
    }
}
