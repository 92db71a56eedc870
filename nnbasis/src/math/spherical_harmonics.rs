use std::f64;
use std::f64::consts::SQRT_2;

use ndarray::ArrayView1;

/// `\sqrt{\frac{1}{2 \pi}}`
const SQRT_1_OVER_2PI: f64 = 0.3989422804014327;
/// `\sqrt{3}`
const SQRT_3: f64 = 1.7320508075688772;
/// `\sqrt{3 / 2}`
const SQRT_3_OVER_2: f64 = 1.224744871391589;

/// Number of spherical harmonics up to (and including) `max_angular`
#[inline]
pub fn spherical_harmonics_count(max_angular: usize) -> usize {
    (max_angular + 1) * (max_angular + 1)
}

/// Position of `Y_l^m` in a flat array of spherical harmonics
#[inline]
pub fn lm_index(l: usize, m: isize) -> usize {
    debug_assert!(m.unsigned_abs() <= l);
    ((l * l + l) as isize + m) as usize
}

/// Array storing data for `0 <= l <= l_max`, `0 <= m <= l`. This type
/// implements `Index<[usize; 2]>` and `IndexMut<[usize; 2]>`.
#[derive(Clone)]
struct LegendreArray {
    max_angular: usize,
    data: Vec<f64>,
}

impl LegendreArray {
    /// Create a new `LegendreArray` with the given maximal angular degree, and
    /// all elements set to zero.
    pub fn new(max_angular: usize) -> LegendreArray {
        let size = (max_angular + 1) * (max_angular + 2) / 2;
        LegendreArray {
            max_angular: max_angular,
            data: vec![0.0; size],
        }
    }

    #[inline]
    fn linear_index(&self, index: [usize; 2]) -> usize {
        let [l, m] = index;
        debug_assert!(l <= self.max_angular && m <= l);
        return m + l * (l + 1) / 2;
    }
}

impl std::ops::Index<[usize; 2]> for LegendreArray {
    type Output = f64;
    fn index(&self, index: [usize; 2]) -> &f64 {
        &self.data[self.linear_index(index)]
    }
}

impl std::ops::IndexMut<[usize; 2]> for LegendreArray {
    fn index_mut(&mut self, index: [usize; 2]) -> &mut f64 {
        let i = self.linear_index(index);
        &mut self.data[i]
    }
}

impl std::fmt::Debug for LegendreArray {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "LegendreArray[\n  l \\ m  ")?;
        for m in 0..(self.max_angular + 1) {
            write!(f, " {: ^12}", m)?;
        }
        writeln!(f)?;
        for l in 0..(self.max_angular + 1) {
            write!(f, "  {: <8}", l)?;
            for m in 0..=l {
                write!(f, " {:+.9}", self[[l, m]])?;
            }
            writeln!(f)?;
        }
        write!(f, "]")?;
        Ok(())
    }
}

/// Array storing data for `0 <= l <= l_max`, `-l <= m <= l`, in the same
/// order as the flat arrays used by the basis caches (`l * l + l + m`). This
/// type implements `Index<[isize; 2]>` and `IndexMut<[isize; 2]>` to allow
/// writing code like
///
/// ```
/// # use nnbasis::math::SphericalHarmonicsArray;
/// let mut array = SphericalHarmonicsArray::new(8);
/// array[[6, 3]] = 3.0;
/// array[[6, -3]] = -3.0;
///
/// // this is an error |m| > l
/// // array[[6, 7]] = 1.0;
///
/// // this is an error l > l_max
/// // array[[9, 7]] = 1.0;
/// ```
#[derive(Clone)]
pub struct SphericalHarmonicsArray {
    max_angular: isize,
    data: Vec<f64>,
}

impl SphericalHarmonicsArray {
    /// Create a new `SphericalHarmonicsArray` with the given maximal angular
    /// degree, and all elements set to zero.
    pub fn new(max_angular: usize) -> SphericalHarmonicsArray {
        SphericalHarmonicsArray {
            max_angular: max_angular as isize,
            data: vec![0.0; spherical_harmonics_count(max_angular)],
        }
    }

    #[inline]
    #[allow(clippy::suspicious_operation_groupings)]
    fn linear_index(&self, index: [isize; 2]) -> usize {
        let [l, m] = index;
        debug_assert!(l <= self.max_angular && -l <= m && m <= l);
        return (m + l + (l * l)) as usize;
    }

    /// Get the slice of the full array containing values for a given `l`. The
    /// size of the resulting view is `2 * l + 1`, and contains value for `m`
    /// from `-l` to `l` in order.
    #[inline]
    pub fn slice(&self, l: isize) -> ArrayView1<'_, f64> {
        let start = self.linear_index([l, -l]);
        let stop = self.linear_index([l, l]);
        return ArrayView1::from(&self.data[start..=stop]);
    }

    /// Get all the values in this array, in `l * l + l + m` order
    pub fn as_slice(&self) -> &[f64] {
        &self.data
    }

    /// Get all the values in this array as a mutable slice
    pub fn as_slice_mut(&mut self) -> &mut [f64] {
        &mut self.data
    }
}

impl std::ops::Index<[isize; 2]> for SphericalHarmonicsArray {
    type Output = f64;
    fn index(&self, index: [isize; 2]) -> &f64 {
        &self.data[self.linear_index(index)]
    }
}

impl std::ops::IndexMut<[isize; 2]> for SphericalHarmonicsArray {
    fn index_mut(&mut self, index: [isize; 2]) -> &mut f64 {
        let i = self.linear_index(index);
        &mut self.data[i]
    }
}

impl std::fmt::Debug for SphericalHarmonicsArray {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "SphericalHarmonicsArray[\n  l \\ m  ")?;
        for m in -self.max_angular..=self.max_angular {
            write!(f, " {: ^12}", m)?;
        }
        writeln!(f)?;
        for l in 0..(self.max_angular + 1) {
            write!(f, "  {: <8}", l)?;
            for _ in -self.max_angular..-l {
                write!(f, "             ")?;
            }

            for m in -l..=l {
                write!(f, " {:+.9}", self[[l, m]])?;
            }
            writeln!(f)?;
        }
        write!(f, "]")?;
        Ok(())
    }
}

/// Spherical coordinates of a vector, with the trigonometric functions
/// pre-computed
#[derive(Debug, Clone, Copy)]
struct Angles {
    r: f64,
    sqrt_xy: f64,
    cos_theta: f64,
    sin_theta: f64,
    cos_phi: f64,
    sin_phi: f64,
    /// the vector is on the z axis, and φ is undefined
    on_pole: bool,
}

impl Angles {
    fn new(vector: [f64; 3]) -> Angles {
        let [x, y, z] = vector;
        let sqrt_xy = f64::hypot(x, y);
        let r = f64::hypot(sqrt_xy, z);
        assert!(r > 0.0, "expected a non-zero vector in spherical harmonics");

        let on_pole = sqrt_xy <= f64::EPSILON * r;
        let (cos_phi, sin_phi) = if on_pole {
            (1.0, 0.0)
        } else {
            (x / sqrt_xy, y / sqrt_xy)
        };

        Angles {
            r: r,
            sqrt_xy: sqrt_xy,
            cos_theta: z / r,
            sin_theta: sqrt_xy / r,
            cos_phi: cos_phi,
            sin_phi: sin_phi,
            on_pole: on_pole,
        }
    }
}

/// Compute real spherical harmonics (with the Condon-Shortley phase) and
/// their Cartesian gradients.
///
/// The real harmonics are defined from the complex ones as `Y_l^0`,
/// `√2 cos(m φ) P_l^m` for `m > 0` and `√2 sin(|m| φ) P_l^|m|` for `m < 0`,
/// and are normalized such that `4π / (2l + 1) Σ_m (Y_l^m)^2 = 1`.
///
/// Gradients are computed with respect to the origin of the vector (i.e.
/// `∂Y / ∂(-r)`), which is the position of the central atom when the vector
/// goes from the central atom to one of its neighbors.
#[derive(Debug, Clone)]
pub struct SphericalHarmonics {
    max_angular: usize,
    /// array of associated Legendre polynomials, including a factor `√2`
    legendre_polynomials: LegendreArray,
    /// 'A' coefficient from <https://arxiv.org/abs/1410.1748> to compute
    /// Legendre polynomials
    coefficient_a: LegendreArray,
    /// 'B' coefficient from <https://arxiv.org/abs/1410.1748> to compute
    /// Legendre polynomials
    coefficient_b: LegendreArray,
    /// scratch space for `compute`, θ and φ derivatives
    angular_derivatives: [Vec<f64>; 2],
}

impl SphericalHarmonics {
    /// Build a new `SphericalHarmonics` calculator with the given `l_max`, and
    /// pre-compute all required quantities
    pub fn new(max_angular: usize) -> SphericalHarmonics {
        let mut coefficient_a = LegendreArray::new(max_angular);
        let mut coefficient_b = LegendreArray::new(max_angular);
        for l in 2..(max_angular + 1) {
            let ls = (l * l) as f64;
            let lm1s = ((l as isize - 1) * (l as isize - 1)) as f64;
            for m in 0..(l - 1) {
                let ms = (m * m) as f64;
                coefficient_a[[l, m]] = f64::sqrt((4.0 * ls - 1.0) / (ls - ms));
                coefficient_b[[l, m]] = -f64::sqrt((lm1s - ms) / (4.0 * lm1s - 1.0));
            }
        }

        let count = spherical_harmonics_count(max_angular);
        SphericalHarmonics {
            max_angular: max_angular,
            legendre_polynomials: LegendreArray::new(max_angular),
            coefficient_a: coefficient_a,
            coefficient_b: coefficient_b,
            angular_derivatives: [vec![0.0; count], vec![0.0; count]],
        }
    }

    /// Get the maximal angular degree of this calculator
    pub fn max_angular(&self) -> usize {
        self.max_angular
    }

    /// Number of spherical harmonics computed by this calculator
    pub fn count(&self) -> usize {
        spherical_harmonics_count(self.max_angular)
    }

    /// Evaluate the Legendre polynomials at `cos(θ)`, and fill
    /// `self.legendre_polynomials` with the resulting values
    fn compute_legendre_polynomials(&mut self, cos_theta: f64, sin_theta: f64) {
        let mut value = SQRT_1_OVER_2PI;
        self.legendre_polynomials[[0, 0]] = value;

        if self.max_angular > 0 {
            self.legendre_polynomials[[1, 0]] = cos_theta * SQRT_3 * value;
            value *= -SQRT_3_OVER_2 * sin_theta;
            self.legendre_polynomials[[1, 1]] = value;

            let a = &self.coefficient_a;
            let b = &self.coefficient_b;
            let p = &mut self.legendre_polynomials;

            for l in 2..(self.max_angular + 1) {
                for m in 0..(l - 1) {
                    p[[l, m]] = a[[l, m]] * (cos_theta * p[[l - 1, m]] + b[[l, m]] * p[[l - 2, m]]);
                }

                p[[l, l - 1]] = cos_theta * f64::sqrt(2.0 * l as f64 + 1.0) * value;
                value *= -f64::sqrt(1.0 + 0.5 / l as f64) * sin_theta;
                p[[l, l]] = value;
            }
        }
    }

    /// Evaluate all spherical harmonics for the given `vector` (which does not
    /// need to be normalized), and store the results in `values`, using the
    /// `l * l + l + m` order.
    pub fn compute_values(&mut self, vector: [f64; 3], values: &mut [f64]) {
        assert_eq!(
            values.len(), self.count(),
            "wrong size for the values array, expected {}, got {}",
            self.count(), values.len(),
        );

        let angles = Angles::new(vector);
        self.compute_legendre_polynomials(angles.cos_theta, angles.sin_theta);

        for l in 0..(self.max_angular + 1) {
            values[lm_index(l, 0)] = self.legendre_polynomials[[l, 0]] / SQRT_2;
        }

        // recurrence relation for cos(m φ) and sin(m φ)
        let mut cos_previous = 1.0;
        let mut sin_previous = 0.0;
        let mut cos_m_phi = angles.cos_phi;
        let mut sin_m_phi = angles.sin_phi;
        let two_cos = 2.0 * angles.cos_phi;
        for m in 1..(self.max_angular + 1) {
            for l in m..(self.max_angular + 1) {
                let p_lm = self.legendre_polynomials[[l, m]];
                values[lm_index(l, m as isize)] = p_lm * cos_m_phi;
                values[lm_index(l, -(m as isize))] = p_lm * sin_m_phi;
            }

            let cos_next = two_cos * cos_m_phi - cos_previous;
            let sin_next = two_cos * sin_m_phi - sin_previous;
            cos_previous = cos_m_phi;
            sin_previous = sin_m_phi;
            cos_m_phi = cos_next;
            sin_m_phi = sin_next;
        }
    }

    /// Compute the Cartesian gradients of the spherical harmonics in `values`
    /// (computed by `compute_values` for the same `vector`), and store them in
    /// `gradients`. `angular` is used as scratch space and contains the
    /// derivatives with respect to θ and φ on exit.
    ///
    /// When the vector is aligned with the z axis, φ is undefined: the φ
    /// derivatives are set to zero, and the gradients along x and y are
    /// obtained from the θ derivatives in the `φ = 0` and `φ = π/2` planes
    /// respectively, which gives the exact limit of the gradient.
    pub fn compute_gradients(
        &self,
        vector: [f64; 3],
        values: &[f64],
        angular: [&mut [f64]; 2],
        gradients: [&mut [f64]; 3],
    ) {
        let count = self.count();
        assert_eq!(
            values.len(), count,
            "wrong size for the values array, expected {}, got {}",
            count, values.len(),
        );
        let [d_theta, d_phi] = angular;
        assert!(
            d_theta.len() == count && d_phi.len() == count,
            "wrong size for one angular derivative array, expected {}", count
        );
        let [gradients_x, gradients_y, gradients_z] = gradients;
        assert!(
            gradients_x.len() == count && gradients_y.len() == count && gradients_z.len() == count,
            "wrong size for one gradient array, expected {}", count
        );

        let angles = Angles::new(vector);
        theta_derivatives(self.max_angular, values, angles.cos_phi, angles.sin_phi, d_theta);

        if angles.on_pole {
            let theta_x = -angles.cos_theta / angles.r;
            let theta_z = angles.sin_theta / angles.r;
            for i in 0..count {
                gradients_x[i] = d_theta[i] * theta_x;
                gradients_z[i] = d_theta[i] * theta_z;
            }

            // derivative along y, in the φ = π/2 plane
            theta_derivatives(self.max_angular, values, 0.0, 1.0, d_phi);
            for i in 0..count {
                gradients_y[i] = d_phi[i] * theta_x;
            }
            d_phi.fill(0.0);
            return;
        }

        for l in 0..(self.max_angular + 1) {
            for m in -(l as isize)..=(l as isize) {
                d_phi[lm_index(l, m)] = -(m as f64) * values[lm_index(l, -m)];
            }
        }

        let theta_x = -angles.cos_theta * angles.cos_phi / angles.r;
        let theta_y = -angles.cos_theta * angles.sin_phi / angles.r;
        let theta_z = angles.sin_theta / angles.r;
        let phi_x = angles.sin_phi / angles.sqrt_xy;
        let phi_y = -angles.cos_phi / angles.sqrt_xy;
        for i in 0..count {
            gradients_x[i] = d_theta[i] * theta_x + d_phi[i] * phi_x;
            gradients_y[i] = d_theta[i] * theta_y + d_phi[i] * phi_y;
            gradients_z[i] = d_theta[i] * theta_z;
        }
    }

    /// Evaluate all spherical harmonics for the given `vector`, and store the
    /// results in `values`. If `gradients` is `Some`, then this function also
    /// computes Cartesian gradients and store them in `gradients`.
    #[time_graph::instrument(name = "SphericalHarmonics::compute")]
    pub fn compute(
        &mut self,
        vector: [f64; 3],
        values: &mut SphericalHarmonicsArray,
        gradients: Option<&mut [SphericalHarmonicsArray; 3]>
    ) {
        assert_eq!(
            values.max_angular as usize, self.max_angular,
            "wrong size for the values array, expected max_angular to be {}, got {}",
            self.max_angular, values.max_angular,
        );
        if let Some(ref gradients) = gradients {
            for i in 0..3 {
                assert_eq!(
                    gradients[i].max_angular as usize, self.max_angular,
                    "wrong size for one gradient array, expected max_angular to be {}, got {}",
                    self.max_angular, gradients[i].max_angular,
                );
            }
        }

        self.compute_values(vector, &mut values.data);

        if let Some(gradients) = gradients {
            let mut angular = std::mem::take(&mut self.angular_derivatives);
            let [d_theta, d_phi] = &mut angular;
            let [gradients_x, gradients_y, gradients_z] = gradients;
            self.compute_gradients(
                vector,
                &values.data,
                [&mut d_theta[..], &mut d_phi[..]],
                [&mut gradients_x.data[..], &mut gradients_y.data[..], &mut gradients_z.data[..]],
            );
            self.angular_derivatives = angular;
        }
    }
}

/// Derivatives of the real spherical harmonics with respect to θ, using the
/// ladder relation between `Y_l^m` and `Y_l^{m ± 1}`:
/// `∂P_l^m/∂θ = 1/2 [√((l - m)(l + m + 1)) P_l^{m+1} - √((l + m)(l - m + 1)) P_l^{m-1}]`
fn theta_derivatives(max_angular: usize, values: &[f64], cos_phi: f64, sin_phi: f64, d_theta: &mut [f64]) {
    d_theta[0] = 0.0;
    for l in 1..(max_angular + 1) {
        let y = |m: isize| values[lm_index(l, m)];
        let lf = l as f64;

        let factor = f64::sqrt(0.5 * lf * (lf + 1.0));
        d_theta[lm_index(l, 0)] = factor * (cos_phi * y(1) + sin_phi * y(-1));
        d_theta[lm_index(l, 1)] = -factor * cos_phi * y(0);
        d_theta[lm_index(l, -1)] = -factor * sin_phi * y(0);

        for m in 2..=(l as isize) {
            let mf = m as f64;
            let factor = -0.5 * f64::sqrt((lf + mf) * (lf - mf + 1.0));
            d_theta[lm_index(l, m)] = factor * (cos_phi * y(m - 1) - sin_phi * y(-(m - 1)));
            d_theta[lm_index(l, -m)] = factor * (cos_phi * y(-(m - 1)) + sin_phi * y(m - 1));
        }

        for m in 1..(l as isize) {
            let mf = m as f64;
            let factor = 0.5 * f64::sqrt((lf + mf + 1.0) * (lf - mf));
            d_theta[lm_index(l, m)] += factor * (cos_phi * y(m + 1) + sin_phi * y(-(m + 1)));
            d_theta[lm_index(l, -m)] += factor * (cos_phi * y(-(m + 1)) - sin_phi * y(m + 1));
        }
    }
}
