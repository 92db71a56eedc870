use crate::Error;

/// Smooth cutoff function `fc(r) = (1 - (r / rc)^2)^4` for `r < rc`, and 0
/// after. The function and its first three derivatives vanish at `r = rc`.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct SmoothCutoff {
    cutoff: f64,
}

impl SmoothCutoff {
    /// Create a new cutoff function with the given cutoff radius
    pub fn new(cutoff: f64) -> Result<SmoothCutoff, Error> {
        if !(cutoff > 0.0 && cutoff.is_finite()) {
            return Err(Error::Configuration(format!(
                "expected a positive and finite cutoff radius, got {}", cutoff
            )));
        }
        return Ok(SmoothCutoff { cutoff });
    }

    /// Get the cutoff radius
    pub fn cutoff(&self) -> f64 {
        self.cutoff
    }

    /// Evaluate the cutoff function at the distance `r`
    #[inline]
    pub fn compute(&self, r: f64) -> f64 {
        if r >= self.cutoff {
            return 0.0;
        }
        let s = 1.0 - (r / self.cutoff) * (r / self.cutoff);
        let s2 = s * s;
        return s2 * s2;
    }

    /// Evaluate the derivative of the cutoff function with respect to `r`
    #[inline]
    pub fn derivative(&self, r: f64) -> f64 {
        if r >= self.cutoff {
            return 0.0;
        }
        let s = 1.0 - (r / self.cutoff) * (r / self.cutoff);
        return -8.0 * r * s * s * s / (self.cutoff * self.cutoff);
    }

    /// Cartesian gradient of the cutoff function for a neighbor at `vector`
    /// (of norm `r`) from the central atom, taken with respect to the
    /// position of the central atom.
    #[inline]
    pub fn gradient(&self, vector: [f64; 3], r: f64) -> [f64; 3] {
        if r >= self.cutoff {
            return [0.0; 3];
        }
        let s = 1.0 - (r / self.cutoff) * (r / self.cutoff);
        let factor = 8.0 * s * s * s / (self.cutoff * self.cutoff);
        return [factor * vector[0], factor * vector[1], factor * vector[2]];
    }
}
