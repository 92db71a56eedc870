use crate::{Error, NeighborList};

use super::{Basis, BasisKind, BasisDocument, SparseJacobian, Workspace};

/// Basis of one species sharing the hyper-parameters and the learnable
/// parameters of the basis of another species, without any change to the
/// neighbor species.
pub struct Shared {
    basis: Box<dyn Basis>,
    shared: usize,
}

impl std::fmt::Debug for Shared {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Shared")
            .field("basis", &self.basis.kind())
            .field("shared", &self.shared)
            .finish()
    }
}

impl Shared {
    /// Use `basis`, which belongs to the species `shared`
    pub fn new(basis: Box<dyn Basis>, shared: usize) -> Result<Shared, Error> {
        if basis.kind() == BasisKind::Shared {
            return Err(Error::Configuration("can not share a shared basis".into()));
        }
        if shared == 0 || shared > basis.species_count() {
            return Err(Error::Configuration(format!(
                "invalid species {} for shared basis, expected a value between 1 and {}",
                shared, basis.species_count()
            )));
        }
        return Ok(Shared { basis, shared });
    }

    /// Species owning the shared basis
    pub fn shared_species(&self) -> usize {
        self.shared
    }
}

impl Basis for Shared {
    fn kind(&self) -> BasisKind {
        BasisKind::Shared
    }

    fn rcut(&self) -> f64 {
        self.basis.rcut()
    }

    fn size(&self) -> usize {
        self.basis.size()
    }

    fn species_count(&self) -> usize {
        self.basis.species_count()
    }

    fn forward_cache_size(&self, neighbors: usize, full_cache: bool) -> usize {
        self.basis.forward_cache_size(neighbors, full_cache)
    }

    fn backward_cache_size(&self, neighbors: usize, full_cache: bool) -> usize {
        self.basis.backward_cache_size(neighbors, full_cache)
    }

    fn backward_force_cache_size(&self, neighbors: usize) -> usize {
        self.basis.backward_force_cache_size(neighbors)
    }

    fn forward(
        &mut self,
        neighbors: &NeighborList,
        features: &mut [f64],
        forward_cache: &mut [f64],
        full_cache: bool,
    ) -> Result<(), Error> {
        self.basis.forward(neighbors, features, forward_cache, full_cache)
    }

    fn backward(
        &mut self,
        neighbors: &NeighborList,
        grad_features: &[f64],
        grad_parameters: &mut [f64],
        forward_cache: &[f64],
        backward_cache: &mut [f64],
    ) -> Result<(), Error> {
        self.basis.backward(neighbors, grad_features, grad_parameters, forward_cache, backward_cache)
    }

    fn forward_force(
        &mut self,
        neighbors: &NeighborList,
        grad_features: &[f64],
        forces: &mut [[f64; 3]],
        forward_cache: &mut [f64],
        backward_cache: &mut [f64],
        full_cache: bool,
    ) -> Result<(), Error> {
        self.basis.forward_force(neighbors, grad_features, forces, forward_cache, backward_cache, full_cache)
    }

    fn backward_force(
        &mut self,
        neighbors: &NeighborList,
        grad_features: &[f64],
        grad_forces: &[[f64; 3]],
        grad_grad_features: &mut [f64],
        grad_parameters: Option<&mut [f64]>,
        forward_cache: &[f64],
        backward_cache: &[f64],
        backward_force_cache: &mut [f64],
    ) -> Result<(), Error> {
        self.basis.backward_force(
            neighbors,
            grad_features,
            grad_forces,
            grad_grad_features,
            grad_parameters,
            forward_cache,
            backward_cache,
            backward_force_cache,
        )
    }

    fn eval_grad(
        &mut self,
        neighbors: &NeighborList,
        features: &mut [f64],
        jacobian: &mut SparseJacobian,
    ) -> Result<(), Error> {
        self.basis.eval_grad(neighbors, features, jacobian)
    }

    fn parameter_count(&self) -> usize {
        self.basis.parameter_count()
    }

    fn parameters(&self) -> Result<Vec<f64>, Error> {
        self.basis.parameters()
    }

    fn set_parameters(&self, parameters: &[f64]) -> Result<(), Error> {
        self.basis.set_parameters(parameters)
    }

    fn init_parameters(&self, rng: &mut dyn rand::RngCore) -> Result<(), Error> {
        self.basis.init_parameters(rng)
    }

    fn thread_safe_ref(&self) -> Box<dyn Basis> {
        Box::new(Shared {
            basis: self.basis.thread_safe_ref(),
            shared: self.shared,
        })
    }

    fn shutdown(&mut self) {
        self.basis.shutdown();
    }

    fn is_shutdown(&self) -> bool {
        self.basis.is_shutdown()
    }

    fn save(&self) -> Result<BasisDocument, Error> {
        if self.basis.is_shutdown() {
            return Err(Error::State("can not call save on a basis after shutdown".into()));
        }
        Ok(BasisDocument::Share { share: self.shared })
    }

    fn workspace(&mut self) -> &mut Workspace {
        self.basis.workspace()
    }
}
