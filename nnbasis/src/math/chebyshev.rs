/// Evaluate the Chebyshev polynomials of the first kind `T_0(x)` to
/// `T_{n-1}(x)` and store them in `values`, where `n = values.len()`.
#[inline]
pub fn chebyshev_first_kind(x: f64, values: &mut [f64]) {
    if values.is_empty() {
        return;
    }
    values[0] = 1.0;
    if values.len() > 1 {
        values[1] = x;
    }
    for n in 2..values.len() {
        values[n] = 2.0 * x * values[n - 1] - values[n - 2];
    }
}

/// Evaluate the Chebyshev polynomials of the second kind `U_0(x)` to
/// `U_{n-1}(x)` and store them in `values`, where `n = values.len()`.
#[inline]
pub fn chebyshev_second_kind(x: f64, values: &mut [f64]) {
    if values.is_empty() {
        return;
    }
    values[0] = 1.0;
    if values.len() > 1 {
        values[1] = 2.0 * x;
    }
    for n in 2..values.len() {
        values[n] = 2.0 * x * values[n - 1] - values[n - 2];
    }
}

/// Radial expansion on Chebyshev polynomials `T_n(1 - 2 r / rc)` for
/// `n = 0..=max_radial`.
#[derive(Debug, Clone, Copy)]
pub struct ChebyshevRadial {
    max_radial: usize,
    cutoff: f64,
}

impl ChebyshevRadial {
    pub fn new(max_radial: usize, cutoff: f64) -> ChebyshevRadial {
        ChebyshevRadial { max_radial, cutoff }
    }

    /// Number of radial functions, `max_radial + 1`
    pub fn size(&self) -> usize {
        self.max_radial + 1
    }

    /// Evaluate all radial functions at distance `r`
    #[inline]
    pub fn compute(&self, r: f64, values: &mut [f64]) {
        assert_eq!(
            values.len(), self.size(),
            "wrong size for the radial values, expected {}, got {}",
            self.size(), values.len()
        );
        chebyshev_first_kind(1.0 - 2.0 * r / self.cutoff, values);
    }

    /// Compute the Cartesian gradients of all radial functions for a neighbor
    /// at `vector` (of norm `r`), with respect to the position of the central
    /// atom. `second_kind` is used as scratch space and contains
    /// `U_n(1 - 2 r / rc)` on exit.
    #[inline]
    pub fn compute_gradients(&self, vector: [f64; 3], r: f64, second_kind: &mut [f64], gradients: [&mut [f64]; 3]) {
        let size = self.size();
        assert_eq!(
            second_kind.len(), size,
            "wrong size for the scratch array, expected {}, got {}",
            size, second_kind.len()
        );
        let [gradients_x, gradients_y, gradients_z] = gradients;
        assert!(
            gradients_x.len() == size && gradients_y.len() == size && gradients_z.len() == size,
            "wrong size for one radial gradient array, expected {}", size
        );

        chebyshev_second_kind(1.0 - 2.0 * r / self.cutoff, second_kind);

        gradients_x[0] = 0.0;
        gradients_y[0] = 0.0;
        gradients_z[0] = 0.0;
        let factor = 2.0 / (r * self.cutoff);
        for n in 1..size {
            let derivative = n as f64 * factor * second_kind[n - 1];
            gradients_x[n] = derivative * vector[0];
            gradients_y[n] = derivative * vector[1];
            gradients_z[n] = derivative * vector[2];
        }
    }
}
