use crate::{Error, NeighborList};

use super::{Basis, BasisKind, BasisDocument, SparseJacobian, Workspace};

/// Basis of the species `this`, re-using the basis of the species `mirror`
/// with the two species exchanged in the neighbor lists.
///
/// The wrapped basis (and its parameters) are shared with the `mirror`
/// species.
pub struct Mirror {
    basis: Box<dyn Basis>,
    mirror: usize,
    this: usize,
    neighbors: NeighborList,
}

impl std::fmt::Debug for Mirror {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Mirror")
            .field("basis", &self.basis.kind())
            .field("mirror", &self.mirror)
            .field("this", &self.this)
            .finish_non_exhaustive()
    }
}

impl Mirror {
    /// Use `basis`, which belongs to the species `mirror`, for the species
    /// `this`
    pub fn new(basis: Box<dyn Basis>, mirror: usize, this: usize) -> Result<Mirror, Error> {
        if basis.kind() == BasisKind::Mirror {
            return Err(Error::Configuration("can not mirror a mirror basis".into()));
        }
        let species_count = basis.species_count();
        for species in [mirror, this] {
            if species == 0 || species > species_count {
                return Err(Error::Configuration(format!(
                    "invalid species {} for mirror basis, expected a value between 1 and {}",
                    species, species_count
                )));
            }
        }
        if mirror == this {
            return Err(Error::Configuration(format!("species {} can not mirror itself", this)));
        }

        return Ok(Mirror {
            basis: basis,
            mirror: mirror,
            this: this,
            neighbors: NeighborList::new(),
        });
    }

    /// Species whose basis is mirrored
    pub fn mirror_species(&self) -> usize {
        self.mirror
    }

    /// Species using this basis
    pub fn this_species(&self) -> usize {
        self.this
    }

    /// Copy `neighbors` in `self.neighbors`, exchanging the two species
    fn swap_species(&mut self, neighbors: &NeighborList) {
        let (mirror, this) = (self.mirror, self.this);
        self.neighbors.copy_with_species(neighbors, |species| {
            if species == this {
                mirror
            } else if species == mirror {
                this
            } else {
                species
            }
        });
    }
}

impl Basis for Mirror {
    fn kind(&self) -> BasisKind {
        BasisKind::Mirror
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
        self.swap_species(neighbors);
        self.basis.forward(&self.neighbors, features, forward_cache, full_cache)
    }

    fn backward(
        &mut self,
        neighbors: &NeighborList,
        grad_features: &[f64],
        grad_parameters: &mut [f64],
        forward_cache: &[f64],
        backward_cache: &mut [f64],
    ) -> Result<(), Error> {
        self.swap_species(neighbors);
        self.basis.backward(&self.neighbors, grad_features, grad_parameters, forward_cache, backward_cache)
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
        self.swap_species(neighbors);
        self.basis.forward_force(&self.neighbors, grad_features, forces, forward_cache, backward_cache, full_cache)
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
        self.swap_species(neighbors);
        self.basis.backward_force(
            &self.neighbors,
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
        self.swap_species(neighbors);
        self.basis.eval_grad(&self.neighbors, features, jacobian)
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
        Box::new(Mirror {
            basis: self.basis.thread_safe_ref(),
            mirror: self.mirror,
            this: self.this,
            neighbors: NeighborList::new(),
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
        Ok(BasisDocument::Mirror { mirror: self.mirror })
    }

    fn workspace(&mut self) -> &mut Workspace {
        self.basis.workspace()
    }
}
