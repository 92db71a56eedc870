use crate::{Error, NeighborList};

mod cache;
pub(crate) use self::cache::{check_capacity, take, take_mut, row, row_mut, dot, Lifecycle};
pub use self::cache::Workspace;

mod jacobian;
pub use self::jacobian::SparseJacobian;

mod weighting;
pub use self::weighting::{WeightType, WeightTypeSerde, FuseWeight, SpeciesWeighting, BlockWeights};
pub use self::weighting::{ChannelMixing, MixingMatrix};

mod invariants;
pub use self::invariants::Invariants;

mod parameters;
pub use self::parameters::{BasisDocument, SphericalChebyshevParameters, ChebyshevParameters};

mod spherical_chebyshev;
pub use self::spherical_chebyshev::SphericalChebyshev;

mod chebyshev;
pub use self::chebyshev::Chebyshev;

mod merge;
pub use self::merge::Merge;

mod mirror;
pub use self::mirror::Mirror;

mod shared;
pub use self::shared::Shared;

/// Create the basis described by `document`, for `species_count` species.
///
/// `mirror` and `share` documents reference the basis of another species,
/// and can only be loaded as part of a [`crate::BasisSet`].
pub fn build_basis(species_count: usize, document: &BasisDocument) -> Result<Box<dyn Basis>, Error> {
    match document {
        BasisDocument::SphericalChebyshev(parameters) => {
            Ok(Box::new(SphericalChebyshev::new(species_count, parameters)?))
        }
        BasisDocument::Chebyshev(parameters) => {
            Ok(Box::new(Chebyshev::new(species_count, parameters)?))
        }
        BasisDocument::Merge { basis } => {
            let basis = basis.iter()
                .map(|document| build_basis(species_count, document))
                .collect::<Result<Vec<_>, _>>()?;
            Ok(Box::new(Merge::new(basis)?))
        }
        BasisDocument::Mirror { .. } | BasisDocument::Share { .. } => Err(Error::Configuration(
            "mirror and share basis can only be created in a basis set".into()
        )),
    }
}

/// Distance to the neighbor at `vector`, or `None` if this neighbor does not
/// contribute: outside of the cutoff, or on top of the central atom.
#[inline]
pub(crate) fn neighbor_distance(vector: [f64; 3], cutoff: f64) -> Option<f64> {
    let r = norm(vector);
    if r >= cutoff || r < f64::MIN_POSITIVE {
        return None;
    }
    return Some(r);
}

#[inline]
pub(crate) fn norm(vector: [f64; 3]) -> f64 {
    f64::sqrt(vector[0] * vector[0] + vector[1] * vector[1] + vector[2] * vector[2])
}

/// The different kinds of basis implemented in this crate
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum BasisKind {
    SphericalChebyshev,
    Chebyshev,
    Merge,
    Mirror,
    Shared,
}

/// A `Basis` computes the descriptor (or features) of a single atom from the
/// list of its neighbors, as well as the derivatives of these features.
///
/// All derivatives are taken with respect to the position of the central
/// atom, separately for each neighbor: the gradient associated with the
/// neighbor `j` is `∂/∂(-d_j)`, where `d_j` is the vector from the central
/// atom to the neighbor. Contracting these gradients with `∂E/∂features`
/// gives the force acting on the neighbor `j`.
///
/// # Caches
///
/// The evaluation functions use caller-provided scratch buffers, whose size
/// is given by `forward_cache_size`, `backward_cache_size` and
/// `backward_force_cache_size`. The content of the forward cache written by
/// `forward` is used by all the other functions, which must be called with
/// the same neighbors (in the same order) and the same cache. Calling
/// `forward` for another atom invalidates all previous caches. Only the
/// number of neighbors and the cache mode are checked, the rest is a
/// precondition of these functions.
///
/// A basis is not meant to be used from multiple threads at the same time,
/// use `thread_safe_ref` to get one instance per thread.
pub trait Basis: Send + Sync {
    /// Get the kind of this basis
    fn kind(&self) -> BasisKind;

    /// Get the cutoff radius of this basis
    fn rcut(&self) -> f64;

    /// Get the number of features computed by this basis
    fn size(&self) -> usize;

    /// Get the number of species this basis can handle. Neighbor species are
    /// in `1..=species_count()`.
    fn species_count(&self) -> usize;

    /// Size of the forward cache for `neighbors` neighbors. With
    /// `full_cache`, the cache keeps the data of all neighbors around, which
    /// is required by `backward`, `backward_force` and `eval_grad`.
    fn forward_cache_size(&self, neighbors: usize, full_cache: bool) -> usize;

    /// Size of the backward cache used by `backward` and `forward_force`
    fn backward_cache_size(&self, neighbors: usize, full_cache: bool) -> usize;

    /// Size of the cache used by `backward_force`
    fn backward_force_cache_size(&self, neighbors: usize) -> usize;

    /// Compute the features for the given `neighbors`, and store them in
    /// `features`. The `forward_cache` must contain at least
    /// `forward_cache_size(neighbors.len(), full_cache)` elements.
    fn forward(
        &mut self,
        neighbors: &NeighborList,
        features: &mut [f64],
        forward_cache: &mut [f64],
        full_cache: bool,
    ) -> Result<(), Error>;

    /// Accumulate in `grad_parameters` the gradient of some quantity with
    /// respect to the parameters of this basis, given the gradient
    /// `grad_features` of the same quantity with respect to the features.
    ///
    /// This requires a previous call to `forward` with `full_cache`.
    fn backward(
        &mut self,
        neighbors: &NeighborList,
        grad_features: &[f64],
        grad_parameters: &mut [f64],
        forward_cache: &[f64],
        backward_cache: &mut [f64],
    ) -> Result<(), Error>;

    /// Accumulate in `forces` the force acting on each neighbor, given the
    /// gradient `grad_features` of the energy with respect to the features.
    ///
    /// `full_cache` must be the same as in the previous call to `forward`.
    fn forward_force(
        &mut self,
        neighbors: &NeighborList,
        grad_features: &[f64],
        forces: &mut [[f64; 3]],
        forward_cache: &mut [f64],
        backward_cache: &mut [f64],
        full_cache: bool,
    ) -> Result<(), Error>;

    /// Back-propagate the gradient `grad_forces` of some quantity with
    /// respect to the forces computed by `forward_force`. The gradient with
    /// respect to `grad_features` is accumulated in `grad_grad_features`,
    /// and the gradient with respect to the parameters in `grad_parameters`
    /// if it is given.
    ///
    /// This requires previous calls to `forward` and `forward_force` with
    /// `full_cache`, with the same `grad_features`.
    #[allow(clippy::too_many_arguments)]
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
    ) -> Result<(), Error>;

    /// Compute the features and their gradients with respect to all the
    /// neighbors, using the internal workspace of this basis.
    fn eval_grad(
        &mut self,
        neighbors: &NeighborList,
        features: &mut [f64],
        jacobian: &mut SparseJacobian,
    ) -> Result<(), Error>;

    /// Number of learnable parameters in this basis
    fn parameter_count(&self) -> usize;

    /// Does this basis have learnable parameters?
    fn has_parameters(&self) -> bool {
        self.parameter_count() > 0
    }

    /// Get a copy of the learnable parameters
    fn parameters(&self) -> Result<Vec<f64>, Error>;

    /// Set the learnable parameters. This is visible from all the instances
    /// sharing parameters with this one.
    fn set_parameters(&self, parameters: &[f64]) -> Result<(), Error>;

    /// Initialize the learnable parameters with random values
    fn init_parameters(&self, rng: &mut dyn rand::RngCore) -> Result<(), Error>;

    /// Get a new instance of this basis, sharing hyper-parameters and
    /// learnable parameters with this one, but with separate scratch memory.
    /// The new instance can be used concurrently with this one.
    fn thread_safe_ref(&self) -> Box<dyn Basis>;

    /// Release the resources of this basis. All operations on the basis
    /// will fail afterward.
    fn shutdown(&mut self);

    /// Was this basis shut down?
    fn is_shutdown(&self) -> bool;

    /// Get the document describing this basis and its parameters
    fn save(&self) -> Result<BasisDocument, Error>;

    #[doc(hidden)]
    fn workspace(&mut self) -> &mut Workspace;

    /// Compute the features for the given `neighbors`, using the internal
    /// workspace of this basis
    fn eval(&mut self, neighbors: &NeighborList, features: &mut [f64]) -> Result<(), Error> {
        let mut workspace = std::mem::take(self.workspace());
        let size = self.forward_cache_size(neighbors.len(), false);
        let (forward_cache, _) = workspace.prepare(size, 0);
        let result = self.forward(neighbors, features, forward_cache, false);
        *self.workspace() = workspace;
        return result;
    }

    /// Compute the features for the given `neighbors`, keeping the data
    /// needed by a subsequent call to `force` in the internal workspace
    fn eval_for_force(&mut self, neighbors: &NeighborList, features: &mut [f64]) -> Result<(), Error> {
        let mut workspace = std::mem::take(self.workspace());
        let size = self.forward_cache_size(neighbors.len(), true);
        let (forward_cache, _) = workspace.prepare(size, 0);
        let result = self.forward(neighbors, features, forward_cache, true);
        *self.workspace() = workspace;
        return result;
    }

    /// Accumulate in `forces` the force acting on each neighbor, after a
    /// call to `eval_for_force` with the same neighbors
    fn force(&mut self, neighbors: &NeighborList, grad_features: &[f64], forces: &mut [[f64; 3]]) -> Result<(), Error> {
        let mut workspace = std::mem::take(self.workspace());
        let forward_size = self.forward_cache_size(neighbors.len(), true);
        let backward_size = self.backward_cache_size(neighbors.len(), true);
        let (forward_cache, backward_cache) = workspace.prepare(forward_size, backward_size);
        let result = self.forward_force(neighbors, grad_features, forces, forward_cache, backward_cache, true);
        *self.workspace() = workspace;
        return result;
    }
}
