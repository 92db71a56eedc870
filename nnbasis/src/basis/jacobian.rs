use ndarray::Array3;

use crate::Error;
use super::cache::check_capacity;

/// Sparse gradients of the features with respect to the neighbors positions.
///
/// Each entry contains the index of a feature, the index of a neighbor, and
/// the gradient of the feature with respect to the position of the central
/// atom, for the displacement of this neighbor only (i.e. `∂f / ∂(-d_j)`
/// where `d_j` is the vector from the central atom to the neighbor `j`).
/// Entries are stored by increasing feature index, and then by increasing
/// neighbor index. Pairs without entries have a zero gradient.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct SparseJacobian {
    feature_count: usize,
    neighbor_count: usize,
    features: Vec<usize>,
    neighbors: Vec<usize>,
    gradients: Vec<[f64; 3]>,
}

impl SparseJacobian {
    pub fn new() -> SparseJacobian {
        SparseJacobian::default()
    }

    /// Remove all entries, and set the shape of the jacobian
    pub fn reset(&mut self, feature_count: usize, neighbor_count: usize) {
        self.feature_count = feature_count;
        self.neighbor_count = neighbor_count;
        self.features.clear();
        self.neighbors.clear();
        self.gradients.clear();
    }

    /// Number of features
    pub fn feature_count(&self) -> usize {
        self.feature_count
    }

    /// Number of neighbors
    pub fn neighbor_count(&self) -> usize {
        self.neighbor_count
    }

    /// Number of stored entries
    pub fn len(&self) -> usize {
        self.features.len()
    }

    pub fn is_empty(&self) -> bool {
        self.features.is_empty()
    }

    #[inline]
    pub(crate) fn push(&mut self, feature: usize, neighbor: usize, gradient: [f64; 3]) {
        debug_assert!(feature < self.feature_count && neighbor < self.neighbor_count);
        self.features.push(feature);
        self.neighbors.push(neighbor);
        self.gradients.push(gradient);
    }

    /// Add all the entries of `other` after the ones in `self`, shifting
    /// their feature index by `feature_offset`
    pub(crate) fn extend_shifted(&mut self, other: &SparseJacobian, feature_offset: usize) {
        debug_assert!(feature_offset + other.feature_count <= self.feature_count);
        self.features.extend(other.features.iter().map(|&f| f + feature_offset));
        self.neighbors.extend_from_slice(&other.neighbors);
        self.gradients.extend_from_slice(&other.gradients);
    }

    /// Feature index of all entries
    pub fn feature_indices(&self) -> &[usize] {
        &self.features
    }

    /// Neighbor index of all entries
    pub fn neighbor_indices(&self) -> &[usize] {
        &self.neighbors
    }

    /// Gradients of all entries
    pub fn gradients(&self) -> &[[f64; 3]] {
        &self.gradients
    }

    /// Iterate over `(feature, neighbor, gradient)` for all entries
    pub fn iter(&self) -> impl Iterator<Item = (usize, usize, [f64; 3])> + '_ {
        self.features.iter().zip(&self.neighbors).zip(&self.gradients)
            .map(|((&feature, &neighbor), &gradient)| (feature, neighbor, gradient))
    }

    /// Contract this jacobian with the gradient `grad_features` of some
    /// quantity with respect to the features, accumulating the result for
    /// each neighbor in `forces`.
    pub fn contract(&self, grad_features: &[f64], forces: &mut [[f64; 3]]) -> Result<(), Error> {
        check_capacity("feature gradients", self.feature_count, grad_features.len())?;
        check_capacity("forces", self.neighbor_count, forces.len())?;

        for (feature, neighbor, gradient) in self.iter() {
            let g = grad_features[feature];
            let force = &mut forces[neighbor];
            force[0] += g * gradient[0];
            force[1] += g * gradient[1];
            force[2] += g * gradient[2];
        }
        return Ok(());
    }

    /// Get the dense version of this jacobian, with shape `(features,
    /// neighbors, 3)`
    pub fn to_dense(&self) -> Array3<f64> {
        let mut dense = Array3::zeros((self.feature_count, self.neighbor_count, 3));
        for (feature, neighbor, gradient) in self.iter() {
            for d in 0..3 {
                dense[[feature, neighbor, d]] += gradient[d];
            }
        }
        return dense;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn contraction() {
        let mut jacobian = SparseJacobian::new();
        jacobian.reset(3, 2);
        jacobian.push(0, 0, [1.0, 0.0, 0.0]);
        jacobian.push(0, 1, [0.0, 2.0, 0.0]);
        jacobian.push(2, 1, [0.0, 0.0, 3.0]);
        assert_eq!(jacobian.len(), 3);

        let mut forces = [[0.0; 3]; 2];
        jacobian.contract(&[2.0, 100.0, -1.0], &mut forces).unwrap();
        assert_eq!(forces, [[2.0, 0.0, 0.0], [0.0, 4.0, -3.0]]);

        let dense = jacobian.to_dense();
        assert_eq!(dense.shape(), [3, 2, 3]);
        assert_eq!(dense[[2, 1, 2]], 3.0);
        assert_eq!(dense[[1, 0, 0]], 0.0);

        assert!(jacobian.contract(&[1.0], &mut forces).is_err());
        assert!(jacobian.contract(&[1.0; 3], &mut forces[..1]).is_err());
    }

    #[test]
    fn shifted() {
        let mut first = SparseJacobian::new();
        first.reset(2, 1);
        first.push(1, 0, [1.0, 1.0, 1.0]);

        let mut merged = SparseJacobian::new();
        merged.reset(5, 1);
        merged.push(0, 0, [0.5, 0.5, 0.5]);
        merged.extend_shifted(&first, 3);

        assert_eq!(merged.feature_indices(), [0, 4]);
        assert_eq!(merged.neighbor_indices(), [0, 0]);
    }
}
