//! Parallel evaluation of a basis over many atomic environments.
//!
//! Each rayon worker thread gets its own instance of the basis, created with
//! `Basis::thread_safe_ref` on first use, so that the scratch memory is never
//! shared between threads. The per-thread buffers are reused from one
//! environment to the next.

use std::cell::RefCell;

use ndarray::{ArrayView1, ArrayView2, ArrayViewMut2, Axis};
use rayon::prelude::*;
use thread_local::ThreadLocal;

use crate::{Error, NeighborList};
use crate::basis::{Basis, SparseJacobian};

/// Basis instance and buffers owned by a single thread
struct ThreadState {
    basis: Box<dyn Basis>,
    features: Vec<f64>,
    grad: Vec<f64>,
}

/// Per-thread instances of a basis
struct ThreadBasis<'a> {
    basis: &'a dyn Basis,
    instances: ThreadLocal<RefCell<ThreadState>>,
}

impl<'a> ThreadBasis<'a> {
    fn new(basis: &'a dyn Basis) -> ThreadBasis<'a> {
        ThreadBasis {
            basis: basis,
            instances: ThreadLocal::new(),
        }
    }

    fn with<T>(&self, function: impl FnOnce(&mut dyn Basis) -> T) -> T {
        self.with_buffers(|basis, _, _| function(basis))
    }

    /// Call `function` with this thread's basis, features buffer (with
    /// `basis.size()` entries) and gradient buffer
    fn with_buffers<T>(&self, function: impl FnOnce(&mut dyn Basis, &mut [f64], &mut Vec<f64>) -> T) -> T {
        let mut state = self.instances.get_or(|| RefCell::new(ThreadState {
            basis: self.basis.thread_safe_ref(),
            features: vec![0.0; self.basis.size()],
            grad: Vec::new(),
        })).borrow_mut();

        let ThreadState { basis, features, grad } = &mut *state;
        function(&mut **basis, features, grad)
    }
}

/// Compute the descriptors of all the `environments` in parallel, storing
/// the one of environment `i` in the row `i` of `descriptors`.
#[time_graph::instrument(name = "batch::compute_descriptors")]
pub fn compute_descriptors(
    basis: &dyn Basis,
    environments: &[NeighborList],
    mut descriptors: ArrayViewMut2<'_, f64>,
) -> Result<(), Error> {
    let size = basis.size();
    if descriptors.shape() != [environments.len(), size] {
        return Err(Error::Configuration(format!(
            "expected descriptors array with shape [{}, {}], got {:?}",
            environments.len(), size, descriptors.shape()
        )));
    }

    let basis = ThreadBasis::new(basis);
    descriptors.axis_iter_mut(Axis(0))
        .into_par_iter()
        .zip(environments.par_iter())
        .try_for_each(|(mut row, neighbors)| basis.with_buffers(|basis, features, _| {
            if let Some(features) = row.as_slice_mut() {
                return basis.eval(neighbors, features);
            }

            basis.eval(neighbors, features)?;
            row.assign(&ArrayView1::from(&*features));
            Ok(())
        }))
}

/// Compute the descriptors and their gradients with respect to the neighbors
/// positions for all the `environments`, in parallel.
#[time_graph::instrument(name = "batch::compute_jacobians")]
pub fn compute_jacobians(
    basis: &dyn Basis,
    environments: &[NeighborList],
) -> Result<Vec<(Vec<f64>, SparseJacobian)>, Error> {
    let size = basis.size();
    let basis = ThreadBasis::new(basis);
    environments.par_iter()
        .map(|neighbors| basis.with(|basis| {
            let mut features = vec![0.0; size];
            let mut jacobian = SparseJacobian::new();
            basis.eval_grad(neighbors, &mut features, &mut jacobian)?;
            Ok((features, jacobian))
        }))
        .collect()
}

/// Compute the forces acting on the neighbors of all the `environments` in
/// parallel, given the gradients of the energy with respect to the
/// descriptors (one row per environment). The forces for environment `i`
/// are accumulated in `forces[i]`, which must contain one entry per
/// neighbor.
#[time_graph::instrument(name = "batch::compute_forces")]
pub fn compute_forces(
    basis: &dyn Basis,
    environments: &[NeighborList],
    grad_descriptors: ArrayView2<'_, f64>,
    forces: &mut [Vec<[f64; 3]>],
) -> Result<(), Error> {
    let size = basis.size();
    if grad_descriptors.shape() != [environments.len(), size] {
        return Err(Error::Configuration(format!(
            "expected descriptors gradient with shape [{}, {}], got {:?}",
            environments.len(), size, grad_descriptors.shape()
        )));
    }
    if forces.len() != environments.len() {
        return Err(Error::Configuration(format!(
            "expected forces for {} environments, got {}", environments.len(), forces.len()
        )));
    }

    let basis = ThreadBasis::new(basis);
    forces.par_iter_mut()
        .zip(environments.par_iter())
        .zip(grad_descriptors.axis_iter(Axis(0)).into_par_iter())
        .try_for_each(|((forces, neighbors), grad)| basis.with_buffers(|basis, features, buffer| {
            basis.eval_for_force(neighbors, features)?;
            if let Some(grad) = grad.as_slice() {
                return basis.force(neighbors, grad, forces);
            }

            buffer.clear();
            buffer.extend(grad.iter().copied());
            basis.force(neighbors, buffer, forces)
        }))
}

#[cfg(test)]
mod tests {
    use ndarray::Array2;
    use rand::{Rng, SeedableRng};

    use super::*;
    use crate::basis::{SphericalChebyshev, SphericalChebyshevParameters, WeightType};

    fn environments(count: usize) -> Vec<NeighborList> {
        let mut rng = rand::rngs::StdRng::seed_from_u64(1234);
        (0..count).map(|_| {
            let mut neighbors = NeighborList::new();
            for _ in 0..rng.gen_range(0..12) {
                let vector = [rng.gen_range(-2.0..2.0), rng.gen_range(-2.0..2.0), rng.gen_range(-2.0..2.0)];
                neighbors.push(vector, rng.gen_range(1..=2));
            }
            neighbors
        }).collect()
    }

    fn basis() -> SphericalChebyshev {
        SphericalChebyshev::new(2, &SphericalChebyshevParameters {
            nmax: 3, lmax: 3, l3max: 2, rcut: 3.0, wtype: WeightType::ExFull, ..Default::default()
        }).unwrap()
    }

    #[test]
    fn descriptors() {
        let environments = environments(20);
        let mut basis = basis();

        let mut descriptors = Array2::zeros((20, basis.size()));
        compute_descriptors(&basis, &environments, descriptors.view_mut()).unwrap();

        let mut expected = vec![0.0; basis.size()];
        for (neighbors, row) in environments.iter().zip(descriptors.rows()) {
            basis.eval(neighbors, &mut expected).unwrap();
            assert_eq!(row.to_vec(), expected);
        }

        // non-contiguous rows
        let mut transposed = Array2::zeros((basis.size(), 20));
        compute_descriptors(&basis, &environments, transposed.view_mut().reversed_axes()).unwrap();
        assert_eq!(transposed.t(), descriptors);

        let mut wrong = Array2::zeros((19, basis.size()));
        assert!(compute_descriptors(&basis, &environments, wrong.view_mut()).is_err());
    }

    #[test]
    fn jacobians_and_forces() {
        let environments = environments(8);
        let basis = basis();

        let jacobians = compute_jacobians(&basis, &environments).unwrap();
        assert_eq!(jacobians.len(), 8);

        let grad = Array2::from_shape_fn((8, basis.size()), |(i, j)| f64::cos((i + 3 * j) as f64));
        let mut forces = environments.iter().map(|n| vec![[0.0; 3]; n.len()]).collect::<Vec<_>>();
        compute_forces(&basis, &environments, grad.view(), &mut forces).unwrap();

        for (i, (_, jacobian)) in jacobians.iter().enumerate() {
            let mut expected = vec![[0.0; 3]; environments[i].len()];
            jacobian.contract(grad.row(i).as_slice().unwrap(), &mut expected).unwrap();
            for (a, b) in forces[i].iter().zip(&expected) {
                for d in 0..3 {
                    approx::assert_relative_eq!(a[d], b[d], epsilon=1e-10, max_relative=1e-8);
                }
            }
        }

        // non-contiguous gradient rows go through the per-thread buffer
        let transposed = grad.t().to_owned();
        let mut other = environments.iter().map(|n| vec![[0.0; 3]; n.len()]).collect::<Vec<_>>();
        compute_forces(&basis, &environments, transposed.t(), &mut other).unwrap();
        assert_eq!(other, forces);
    }
}
