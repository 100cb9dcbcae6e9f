use ndarray::{Array1, Array2, Zip};

use crate::activation::EiPositive;
use crate::connectivity::Connectivity;
use crate::network::Weights;

/// Biological constraints between raw trainable weights and the weights the
/// network actually runs with.
///
/// Raw weights are masked by their connectivity. When `ei` is set, masked
/// weights are made non-negative and the columns of the recurrent and output
/// matrices take the sign of their presynaptic unit (Dale's Law). Inputs are
/// treated as excitatory.
#[derive(Debug, Clone, PartialEq)]
pub struct Constraints {
    pub c_in: Option<Connectivity>,
    pub c_rec: Option<Connectivity>,
    pub c_out: Option<Connectivity>,
    pub ei: Option<Array1<f64>>,
    pub positive: EiPositive,
}

fn masked(c: &Option<Connectivity>, w: &Array2<f64>) -> Array2<f64> {
    match c {
        Some(c) => c.apply(w),
        None => w.clone(),
    }
}

fn pull(
    c: &Option<Connectivity>,
    w: &Array2<f64>,
    d: &Array2<f64>,
    sign: Option<&Array1<f64>>,
    positive: Option<EiPositive>,
) -> Array2<f64> {
    let mut d = d.clone();

    if let Some(sign) = sign {
        d *= sign;
    }

    if let Some(positive) = positive {
        let pre = masked(c, w);
        Zip::from(&mut d)
            .and(&pre)
            .for_each(|d, p| *d *= positive.df(*p));
    }

    if let Some(c) = c {
        d *= &c.mask_plastic;
    }

    d
}

impl Constraints {
    pub fn none() -> Constraints {
        Constraints {
            c_in: None,
            c_rec: None,
            c_out: None,
            ei: None,
            positive: EiPositive::Rectify,
        }
    }

    pub fn effective(&self, w: &Weights) -> Weights {
        let mut win = masked(&self.c_in, &w.win);
        let mut wrec = masked(&self.c_rec, &w.wrec);
        let mut wout = masked(&self.c_out, &w.wout);

        if let Some(ei) = &self.ei {
            let positive = self.positive;
            win.mapv_inplace(|v| positive.f(v));
            wrec.mapv_inplace(|v| positive.f(v));
            wout.mapv_inplace(|v| positive.f(v));
            wrec *= ei;
            wout *= ei;
        }

        Weights {
            win,
            wrec,
            wout,
            brec: w.brec.clone(),
            bout: w.bout.clone(),
            x0: w.x0.clone(),
        }
    }

    /// Maps gradients with respect to effective weights back onto raw weights.
    pub fn pullback(&self, w: &Weights, d_eff: &Weights) -> Weights {
        let positive = self.ei.as_ref().map(|_| self.positive);
        let ei = self.ei.as_ref();

        Weights {
            win: pull(&self.c_in, &w.win, &d_eff.win, None, positive),
            wrec: pull(&self.c_rec, &w.wrec, &d_eff.wrec, ei, positive),
            wout: pull(&self.c_out, &w.wout, &d_eff.wout, ei, positive),
            brec: d_eff.brec.clone(),
            bout: d_eff.bout.clone(),
            x0: d_eff.x0.clone(),
        }
    }

    /// Full recurrent matrix used for spectral-radius normalization: masked
    /// plastic plus fixed weights with E/I signs, without positivity.
    pub fn full_recurrent(&self, wrec: &Array2<f64>) -> Array2<f64> {
        let mut full = masked(&self.c_rec, wrec);
        if let Some(ei) = &self.ei {
            full *= ei;
        }
        full
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ndarray::array;

    fn weights() -> Weights {
        Weights {
            win: array![[0.5], [-0.2]],
            wrec: array![[0.1, -0.3], [0.4, 0.2]],
            wout: array![[-0.7, 0.6]],
            brec: array![0., 0.],
            bout: array![0.],
            x0: array![0.1, 0.1],
        }
    }

    #[test]
    fn dale_signs_follow_presynaptic_unit() {
        let constraints = Constraints {
            ei: Some(array![1., -1.]),
            ..Constraints::none()
        };

        let eff = constraints.effective(&weights());
        assert_eq!(eff.wrec, array![[0.1, 0.], [0.4, -0.2]]);
        assert_eq!(eff.wout, array![[0., -0.6]]);
        assert_eq!(eff.win, array![[0.5], [0.]]);
    }

    #[test]
    fn pullback_matches_finite_differences() {
        let c_rec = Connectivity::new(array![[1., 2.], [0., 1.]], Some(array![[0., 0.], [0.3, 0.]]))
            .unwrap();
        let constraints = Constraints {
            c_rec: Some(c_rec),
            ei: Some(array![1., -1.]),
            positive: EiPositive::Abs,
            ..Constraints::none()
        };

        let coeff = array![[0.3, -1.1], [0.7, 2.0]];
        let objective = |w: &Weights| (&constraints.effective(w).wrec * &coeff).sum();

        let w = weights();
        let d_eff = Weights {
            wrec: coeff.clone(),
            ..Weights::zeros(1, 2, 1)
        };
        let grad = constraints.pullback(&w, &d_eff);

        let h = 1e-7;
        for i in 0..2 {
            for j in 0..2 {
                let mut plus = w.clone();
                plus.wrec[[i, j]] += h;
                let mut minus = w.clone();
                minus.wrec[[i, j]] -= h;
                let numeric = (objective(&plus) - objective(&minus)) / (2. * h);
                assert!((numeric - grad.wrec[[i, j]]).abs() < 1e-6);
            }
        }
    }

    #[test]
    fn full_recurrent_includes_fixed_weights() {
        let c_rec = Connectivity::new(array![[0., 1.], [1., 0.]], Some(array![[0.5, 0.], [0., 0.]]))
            .unwrap();
        let constraints = Constraints {
            c_rec: Some(c_rec),
            ..Constraints::none()
        };

        let full = constraints.full_recurrent(&array![[9., 2.], [3., 9.]]);
        assert_eq!(full, array![[0.5, 2.], [3., 0.]]);
    }
}
