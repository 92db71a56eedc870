use std::f64::consts::PI;

use crate::math::{lm_index, spherical_harmonics_count, triple_couplings, TripleCoupling};
use crate::math::{quadruple_couplings, QuadrupleCoupling, QuadrupleTerm};

/// Reduction of one set of spherical expansion coefficients `c[lm]` into
/// rotation-invariant features.
///
/// The features are the order-2 invariants (power spectrum)
/// `4π / (2l + 1) Σ_m c[l, m]^2` for every `l` (starting at 1 if `no_radial`
/// is set), followed by the order-3 invariants `Σ w3j c[l1] c[l2] c[l3]` for
/// all the triple couplings up to `max_triple`, and the order-4 invariants
/// `Σ w c[l1] c[l2] c[l3] c[l4]` for all the quadruple couplings up to
/// `max_quadruple`.
#[derive(Debug, Clone)]
pub struct Invariants {
    max_angular: usize,
    first_angular: usize,
    couplings: &'static [TripleCoupling],
    quadruples: &'static [QuadrupleCoupling],
}

/// Product of the coefficients in `term`, excluding the factor at `skip`
#[inline]
fn product_without(term: &QuadrupleTerm, c: &[f64], skip: usize) -> f64 {
    let mut product = 1.0;
    for (i, &lm) in term.lm.iter().enumerate() {
        if i != skip {
            product *= c[lm];
        }
    }
    return product;
}

impl Invariants {
    pub fn new(max_angular: usize, max_triple: usize, max_quadruple: usize, no_radial: bool) -> Invariants {
        assert!(max_triple <= max_angular, "max_triple must be smaller than max_angular");
        assert!(max_quadruple <= max_angular, "max_quadruple must be smaller than max_angular");
        Invariants {
            max_angular: max_angular,
            first_angular: usize::from(no_radial),
            couplings: triple_couplings(max_triple),
            quadruples: quadruple_couplings(max_quadruple),
        }
    }

    /// Number of coefficients taken as input
    pub fn input_size(&self) -> usize {
        spherical_harmonics_count(self.max_angular)
    }

    /// Number of order-2 invariants
    pub fn order_2_size(&self) -> usize {
        self.max_angular + 1 - self.first_angular
    }

    /// Number of order-2 and order-3 invariants
    fn order_3_end(&self) -> usize {
        self.order_2_size() + self.couplings.len()
    }

    /// Number of invariant features
    pub fn size(&self) -> usize {
        self.order_3_end() + self.quadruples.len()
    }

    #[inline]
    fn order_2_factor(l: usize) -> f64 {
        4.0 * PI / (2 * l + 1) as f64
    }

    /// Compute the invariants of `c`, and store them in `features`
    pub fn compute(&self, c: &[f64], features: &mut [f64]) {
        debug_assert_eq!(c.len(), self.input_size());
        debug_assert_eq!(features.len(), self.size());

        for l in self.first_angular..=self.max_angular {
            let range = lm_index(l, -(l as isize))..=lm_index(l, l as isize);
            let sum = c[range].iter().map(|v| v * v).sum::<f64>();
            features[l - self.first_angular] = Self::order_2_factor(l) * sum;
        }

        let offset = self.order_2_size();
        for (i, coupling) in self.couplings.iter().enumerate() {
            features[offset + i] = coupling.compute(c);
        }

        let offset = self.order_3_end();
        for (i, coupling) in self.quadruples.iter().enumerate() {
            features[offset + i] = coupling.compute(c);
        }
    }

    /// Compute the gradient of `Σ_k grad_features[k] * features[k]` with
    /// respect to `c`, and store it in `grad_c`
    pub fn gradient(&self, c: &[f64], grad_features: &[f64], grad_c: &mut [f64]) {
        debug_assert_eq!(grad_features.len(), self.size());

        grad_c.fill(0.0);
        for l in self.first_angular..=self.max_angular {
            let factor = 2.0 * Self::order_2_factor(l) * grad_features[l - self.first_angular];
            for m in -(l as isize)..=(l as isize) {
                let lm = lm_index(l, m);
                grad_c[lm] = factor * c[lm];
            }
        }

        let offset = self.order_2_size();
        for (coupling, &g) in self.couplings.iter().zip(&grad_features[offset..]) {
            for term in &coupling.terms {
                let factor = g * term.coefficient;
                grad_c[term.lm1] += factor * c[term.lm2] * c[term.lm3];
                grad_c[term.lm2] += factor * c[term.lm1] * c[term.lm3];
                grad_c[term.lm3] += factor * c[term.lm1] * c[term.lm2];
            }
        }

        let offset = self.order_3_end();
        for (coupling, &g) in self.quadruples.iter().zip(&grad_features[offset..]) {
            for term in &coupling.terms {
                let factor = g * term.coefficient;
                for (i, &lm) in term.lm.iter().enumerate() {
                    grad_c[lm] += factor * product_without(term, c, i);
                }
            }
        }
    }

    /// Compute the gradient of the single feature `feature` with respect to
    /// `c`, and store it in `grad_c`
    pub fn feature_gradient(&self, c: &[f64], feature: usize, grad_c: &mut [f64]) {
        grad_c.fill(0.0);
        let order_2 = self.order_2_size();
        if feature < order_2 {
            let l = feature + self.first_angular;
            let factor = 2.0 * Self::order_2_factor(l);
            for m in -(l as isize)..=(l as isize) {
                let lm = lm_index(l, m);
                grad_c[lm] = factor * c[lm];
            }
        } else if feature < self.order_3_end() {
            for term in &self.couplings[feature - order_2].terms {
                grad_c[term.lm1] += term.coefficient * c[term.lm2] * c[term.lm3];
                grad_c[term.lm2] += term.coefficient * c[term.lm1] * c[term.lm3];
                grad_c[term.lm3] += term.coefficient * c[term.lm1] * c[term.lm2];
            }
        } else {
            for term in &self.quadruples[feature - self.order_3_end()].terms {
                for (i, &lm) in term.lm.iter().enumerate() {
                    grad_c[lm] += term.coefficient * product_without(term, c, i);
                }
            }
        }
    }

    /// Accumulate in `features` the derivative of the invariants of `c`
    /// along the direction `dc`
    pub fn directional(&self, c: &[f64], dc: &[f64], features: &mut [f64]) {
        for l in self.first_angular..=self.max_angular {
            let mut sum = 0.0;
            for m in -(l as isize)..=(l as isize) {
                let lm = lm_index(l, m);
                sum += c[lm] * dc[lm];
            }
            features[l - self.first_angular] += 2.0 * Self::order_2_factor(l) * sum;
        }

        let offset = self.order_2_size();
        for (i, coupling) in self.couplings.iter().enumerate() {
            let mut sum = 0.0;
            for t in &coupling.terms {
                sum += t.coefficient * (
                    dc[t.lm1] * c[t.lm2] * c[t.lm3]
                    + c[t.lm1] * dc[t.lm2] * c[t.lm3]
                    + c[t.lm1] * c[t.lm2] * dc[t.lm3]
                );
            }
            features[offset + i] += sum;
        }

        let offset = self.order_3_end();
        for (i, coupling) in self.quadruples.iter().enumerate() {
            let mut sum = 0.0;
            for t in &coupling.terms {
                for (k, &lm) in t.lm.iter().enumerate() {
                    sum += t.coefficient * dc[lm] * product_without(t, c, k);
                }
            }
            features[offset + i] += sum;
        }
    }

    /// Accumulate in `output` the product of the Hessian of
    /// `Σ_k grad_features[k] * features[k]` (with respect to `c`) with `dc`
    pub fn hessian_product(&self, c: &[f64], grad_features: &[f64], dc: &[f64], output: &mut [f64]) {
        for l in self.first_angular..=self.max_angular {
            let factor = 2.0 * Self::order_2_factor(l) * grad_features[l - self.first_angular];
            for m in -(l as isize)..=(l as isize) {
                let lm = lm_index(l, m);
                output[lm] += factor * dc[lm];
            }
        }

        let offset = self.order_2_size();
        for (coupling, &g) in self.couplings.iter().zip(&grad_features[offset..]) {
            for t in &coupling.terms {
                let factor = g * t.coefficient;
                output[t.lm1] += factor * (dc[t.lm2] * c[t.lm3] + c[t.lm2] * dc[t.lm3]);
                output[t.lm2] += factor * (dc[t.lm1] * c[t.lm3] + c[t.lm1] * dc[t.lm3]);
                output[t.lm3] += factor * (dc[t.lm1] * c[t.lm2] + c[t.lm1] * dc[t.lm2]);
            }
        }

        let offset = self.order_3_end();
        for (coupling, &g) in self.quadruples.iter().zip(&grad_features[offset..]) {
            for t in &coupling.terms {
                let factor = g * t.coefficient;
                for (i, &lm_i) in t.lm.iter().enumerate() {
                    // second derivative with respect to the factors i and k
                    let mut value = 0.0;
                    for (k, &lm_k) in t.lm.iter().enumerate() {
                        if k == i {
                            continue;
                        }
                        let mut product = dc[lm_k];
                        for (p, &lm_p) in t.lm.iter().enumerate() {
                            if p != i && p != k {
                                product *= c[lm_p];
                            }
                        }
                        value += product;
                    }
                    output[lm_i] += factor * value;
                }
            }
        }
    }
}
