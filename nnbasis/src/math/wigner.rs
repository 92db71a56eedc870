use std::collections::BTreeMap;
use std::f64::consts::FRAC_1_SQRT_2;

use once_cell::sync::Lazy;

use super::lm_index;

/// Largest angular order supported for the triple couplings
pub const MAX_TRIPLE_ANGULAR: usize = 6;

/// Number of `(l1, l2, l3)` triple couplings for each maximal angular order
/// `0..=MAX_TRIPLE_ANGULAR`
pub const TRIPLE_COUPLING_COUNTS: [usize; MAX_TRIPLE_ANGULAR + 1] = [0, 0, 2, 4, 9, 14, 23];

/// Largest angular order supported for the quadruple couplings
pub const MAX_QUADRUPLE_ANGULAR: usize = 3;

/// Number of quadruple couplings for each maximal angular order
/// `0..=MAX_QUADRUPLE_ANGULAR`
pub const QUADRUPLE_COUPLING_COUNTS: [usize; MAX_QUADRUPLE_ANGULAR + 1] = [0, 1, 3, 9];

static FACTORIALS: Lazy<Vec<f64>> = Lazy::new(|| {
    let mut factorials = vec![1.0; 4 * MAX_TRIPLE_ANGULAR + 2];
    for n in 1..factorials.len() {
        factorials[n] = factorials[n - 1] * n as f64;
    }
    factorials
});

#[inline]
fn factorial(n: isize) -> f64 {
    debug_assert!(n >= 0);
    FACTORIALS[n as usize]
}

/// Compute the Wigner 3-j symbol `(l1 l2 l3; m1 m2 m3)` with the Racah
/// formula. Only valid for `l1 + l2 + l3 <= 4 * MAX_TRIPLE_ANGULAR`.
pub fn wigner_3j(l1: usize, l2: usize, l3: usize, m1: isize, m2: isize, m3: isize) -> f64 {
    assert!(
        l1 + l2 + l3 < FACTORIALS.len() - 1,
        "angular momenta are too large for the Wigner 3j table: ({}, {}, {})", l1, l2, l3
    );

    let (j1, j2, j3) = (l1 as isize, l2 as isize, l3 as isize);
    if m1 + m2 + m3 != 0 || m1.abs() > j1 || m2.abs() > j2 || m3.abs() > j3 {
        return 0.0;
    }
    if j3 < (j1 - j2).abs() || j3 > j1 + j2 {
        return 0.0;
    }

    let triangle = factorial(j1 + j2 - j3) * factorial(j1 - j2 + j3) * factorial(-j1 + j2 + j3)
        / factorial(j1 + j2 + j3 + 1);
    let prefactor = f64::sqrt(
        triangle
        * factorial(j1 + m1) * factorial(j1 - m1)
        * factorial(j2 + m2) * factorial(j2 - m2)
        * factorial(j3 + m3) * factorial(j3 - m3)
    );

    let k_min = 0.max(j2 - j3 - m1).max(j1 - j3 + m2);
    let k_max = (j1 + j2 - j3).min(j1 - m1).min(j2 + m2);

    let mut sum = 0.0;
    for k in k_min..=k_max {
        let denominator = factorial(k)
            * factorial(j3 - j2 + k + m1)
            * factorial(j3 - j1 + k - m2)
            * factorial(j1 + j2 - j3 - k)
            * factorial(j1 - k - m1)
            * factorial(j2 - k + m2);
        let sign = if k % 2 == 0 { 1.0 } else { -1.0 };
        sum += sign / denominator;
    }

    let sign = if (j1 - j2 - m3).rem_euclid(2) == 0 { 1.0 } else { -1.0 };
    return sign * prefactor * sum;
}

/// Coefficient of the real spherical harmonic `Y_l^m` in the complex
/// spherical harmonic `Y_l^μ`, as a `(real, imaginary)` pair
fn real_to_complex(mu: isize, m: isize) -> (f64, f64) {
    if mu == 0 {
        return if m == 0 { (1.0, 0.0) } else { (0.0, 0.0) };
    }
    if m.abs() != mu.abs() {
        return (0.0, 0.0);
    }

    let phase = if mu.abs() % 2 == 0 { 1.0 } else { -1.0 };
    match (mu > 0, m > 0) {
        (true, true) => (FRAC_1_SQRT_2, 0.0),
        (true, false) => (0.0, FRAC_1_SQRT_2),
        (false, true) => (phase * FRAC_1_SQRT_2, 0.0),
        (false, false) => (0.0, -phase * FRAC_1_SQRT_2),
    }
}

#[inline]
fn complex_mul(a: (f64, f64), b: (f64, f64)) -> (f64, f64) {
    (a.0 * b.0 - a.1 * b.1, a.0 * b.1 + a.1 * b.0)
}

/// One non-zero term in a triple coupling: `coefficient * c[lm1] * c[lm2] *
/// c[lm3]`, where the indexes follow the `l * l + l + m` order of the
/// spherical harmonics.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct CouplingTerm {
    pub lm1: usize,
    pub lm2: usize,
    pub lm3: usize,
    pub coefficient: f64,
}

/// Rotation-invariant coupling of three sets of real spherical harmonics
/// coefficients with angular orders `l1 <= l2 <= l3`
#[derive(Debug, Clone)]
pub struct TripleCoupling {
    pub l1: usize,
    pub l2: usize,
    pub l3: usize,
    pub terms: Vec<CouplingTerm>,
}

impl TripleCoupling {
    fn new(l1: usize, l2: usize, l3: usize) -> TripleCoupling {
        let mut terms = Vec::new();
        let (j1, j2, j3) = (l1 as isize, l2 as isize, l3 as isize);
        for m1 in -j1..=j1 {
            for m2 in -j2..=j2 {
                for m3 in -j3..=j3 {
                    let mut value = (0.0, 0.0);
                    for mu1 in signed_orders(m1) {
                        for mu2 in signed_orders(m2) {
                            let mu3 = -mu1 - mu2;
                            if mu3.abs() != m3.abs() {
                                continue;
                            }
                            let w3j = wigner_3j(l1, l2, l3, mu1, mu2, mu3);
                            if w3j == 0.0 {
                                continue;
                            }
                            let product = complex_mul(
                                complex_mul(real_to_complex(mu1, m1), real_to_complex(mu2, m2)),
                                real_to_complex(mu3, m3),
                            );
                            value.0 += w3j * product.0;
                            value.1 += w3j * product.1;
                        }
                    }

                    debug_assert!(value.1.abs() < 1e-12, "imaginary triple coupling");
                    if value.0.abs() > 1e-12 {
                        terms.push(CouplingTerm {
                            lm1: lm_index(l1, m1),
                            lm2: lm_index(l2, m2),
                            lm3: lm_index(l3, m3),
                            coefficient: value.0,
                        });
                    }
                }
            }
        }

        return TripleCoupling { l1, l2, l3, terms };
    }

    /// Evaluate this coupling for the coefficients `c`
    #[inline]
    pub fn compute(&self, c: &[f64]) -> f64 {
        self.terms.iter()
            .map(|t| t.coefficient * c[t.lm1] * c[t.lm2] * c[t.lm3])
            .sum()
    }
}

/// One non-zero term in a quadruple coupling: `coefficient * c[lm[0]] *
/// c[lm[1]] * c[lm[2]] * c[lm[3]]`
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct QuadrupleTerm {
    pub lm: [usize; 4],
    pub coefficient: f64,
}

/// Rotation-invariant coupling of four sets of real spherical harmonics
/// coefficients with angular orders `l[0] <= l[1] <= l[2] <= l[3]`.
///
/// The pairs `(l[0], l[1])` and `(l[2], l[3])` are first coupled to the
/// intermediate order `coupled`, and the two results are then contracted
/// together.
#[derive(Debug, Clone)]
pub struct QuadrupleCoupling {
    pub l: [usize; 4],
    pub coupled: usize,
    pub terms: Vec<QuadrupleTerm>,
}

impl QuadrupleCoupling {
    fn new(l: [usize; 4]) -> QuadrupleCoupling {
        // smallest non-zero intermediate order allowed by both pairs
        let parity = (l[0] + l[1]) % 2;
        let first = 1.max(l[1] - l[0]).max(l[3] - l[2]);
        let last = (l[0] + l[1]).min(l[2] + l[3]);
        let coupled = (first..=last)
            .find(|coupled| coupled % 2 == parity)
            .unwrap_or_else(|| panic!("no intermediate order to couple {:?}", l));

        let left = TripleCoupling::new(l[0], l[1], coupled);
        let right = TripleCoupling::new(l[2], l[3], coupled);

        let mut merged = BTreeMap::new();
        for a in &left.terms {
            for b in right.terms.iter().filter(|b| b.lm3 == a.lm3) {
                let mut lm = [a.lm1, a.lm2, b.lm1, b.lm2];
                lm.sort_unstable();
                *merged.entry(lm).or_insert(0.0) += a.coefficient * b.coefficient;
            }
        }

        let terms = merged.into_iter()
            .filter(|&(_, coefficient)| coefficient.abs() > 1e-12)
            .map(|(lm, coefficient)| QuadrupleTerm { lm, coefficient })
            .collect();

        return QuadrupleCoupling { l, coupled, terms };
    }

    /// Evaluate this coupling for the coefficients `c`
    #[inline]
    pub fn compute(&self, c: &[f64]) -> f64 {
        self.terms.iter()
            .map(|t| t.coefficient * c[t.lm[0]] * c[t.lm[1]] * c[t.lm[2]] * c[t.lm[3]])
            .sum()
    }
}

/// the complex orders `μ = ±|m|` contributing to the real order `m`
fn signed_orders(m: isize) -> impl Iterator<Item = isize> {
    let a = m.abs();
    let count = if a == 0 { 1 } else { 2 };
    [a, -a].into_iter().take(count)
}

static TRIPLE_COUPLINGS: Lazy<Vec<TripleCoupling>> = Lazy::new(|| {
    let mut couplings = Vec::new();
    for l3 in 1..=MAX_TRIPLE_ANGULAR {
        for l1 in 1..=l3 {
            for l2 in l1..=l3 {
                if (l1 + l2 + l3) % 2 == 0 && l3 <= l1 + l2 {
                    couplings.push(TripleCoupling::new(l1, l2, l3));
                }
            }
        }
    }
    couplings
});

/// Get all the triple couplings with `1 <= l1 <= l2 <= l3 <= max_angular`
/// and `l1 + l2 + l3` even, sorted by `l3` then `(l1, l2)`.
pub fn triple_couplings(max_angular: usize) -> &'static [TripleCoupling] {
    assert!(
        max_angular <= MAX_TRIPLE_ANGULAR,
        "triple couplings are only available up to l = {}, got {}",
        MAX_TRIPLE_ANGULAR, max_angular
    );
    &TRIPLE_COUPLINGS[..TRIPLE_COUPLING_COUNTS[max_angular]]
}

static QUADRUPLE_COUPLINGS: Lazy<Vec<QuadrupleCoupling>> = Lazy::new(|| {
    let mut couplings = Vec::new();
    for l4 in 1..=MAX_QUADRUPLE_ANGULAR {
        for l1 in 1..=l4 {
            for l2 in l1..=l4 {
                for l3 in l2..=l4 {
                    if (l1 + l2 + l3 + l4) % 2 == 0 {
                        couplings.push(QuadrupleCoupling::new([l1, l2, l3, l4]));
                    }
                }
            }
        }
    }
    couplings
});

/// Get all the quadruple couplings with `1 <= l1 <= l2 <= l3 <= l4 <=
/// max_angular` and an even sum of angular orders, sorted by `l4` then
/// `(l1, l2, l3)`.
pub fn quadruple_couplings(max_angular: usize) -> &'static [QuadrupleCoupling] {
    assert!(
        max_angular <= MAX_QUADRUPLE_ANGULAR,
        "quadruple couplings are only available up to l = {}, got {}",
        MAX_QUADRUPLE_ANGULAR, max_angular
    );
    &QUADRUPLE_COUPLINGS[..QUADRUPLE_COUPLING_COUNTS[max_angular]]
}
