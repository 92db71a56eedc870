use log::debug;

use crate::{Error, NeighborList};

use super::{Basis, BasisKind, BasisDocument, SparseJacobian, Workspace};
use super::{check_capacity, take, take_mut};

/// Concatenation of the features of multiple basis, evaluated on the same
/// neighbors. The cutoff of the merged basis is the largest cutoff of its
/// components, and each component ignores the neighbors outside of its own
/// cutoff.
///
/// Only `SphericalChebyshev` and `Chebyshev` basis can be merged, and they
/// must all handle the same number of species.
pub struct Merge {
    basis: Vec<Box<dyn Basis>>,
    rcut: f64,
    size: usize,
    workspace: Workspace,
    jacobian: SparseJacobian,
}

impl std::fmt::Debug for Merge {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Merge")
            .field("basis", &self.basis.iter().map(|b| b.kind()).collect::<Vec<_>>())
            .field("rcut", &self.rcut)
            .field("size", &self.size)
            .finish_non_exhaustive()
    }
}

impl Merge {
    /// Merge the given `basis`, in order
    pub fn new(basis: Vec<Box<dyn Basis>>) -> Result<Merge, Error> {
        let Some(first) = basis.first() else {
            return Err(Error::Configuration("can not merge an empty list of basis".into()));
        };

        let species_count = first.species_count();
        let mut rcut = f64::NEG_INFINITY;
        let mut size = 0;
        for b in &basis {
            if !matches!(b.kind(), BasisKind::SphericalChebyshev | BasisKind::Chebyshev) {
                return Err(Error::Configuration(format!(
                    "only spherical_chebyshev and chebyshev basis can be merged, got {:?}", b.kind()
                )));
            }
            if b.species_count() != species_count {
                return Err(Error::Configuration(format!(
                    "all merged basis must use the same number of species, got {} and {}",
                    species_count, b.species_count()
                )));
            }
            rcut = f64::max(rcut, b.rcut());
            size += b.size();
        }

        debug!("merged {} basis with {} features in total", basis.len(), size);

        return Ok(Merge {
            basis: basis,
            rcut: rcut,
            size: size,
            workspace: Workspace::default(),
            jacobian: SparseJacobian::new(),
        });
    }

    /// Get the merged basis
    pub fn basis(&self) -> &[Box<dyn Basis>] {
        &self.basis
    }
}

impl Basis for Merge {
    fn kind(&self) -> BasisKind {
        BasisKind::Merge
    }

    fn rcut(&self) -> f64 {
        self.rcut
    }

    fn size(&self) -> usize {
        self.size
    }

    fn species_count(&self) -> usize {
        self.basis[0].species_count()
    }

    fn forward_cache_size(&self, neighbors: usize, full_cache: bool) -> usize {
        self.basis.iter().map(|b| b.forward_cache_size(neighbors, full_cache)).sum()
    }

    fn backward_cache_size(&self, neighbors: usize, full_cache: bool) -> usize {
        self.basis.iter().map(|b| b.backward_cache_size(neighbors, full_cache)).sum()
    }

    fn backward_force_cache_size(&self, neighbors: usize) -> usize {
        self.basis.iter().map(|b| b.backward_force_cache_size(neighbors)).sum()
    }

    fn forward(
        &mut self,
        neighbors: &NeighborList,
        features: &mut [f64],
        forward_cache: &mut [f64],
        full_cache: bool,
    ) -> Result<(), Error> {
        let nn = neighbors.len();
        check_capacity("features", self.size, features.len())?;
        check_capacity("forward cache", self.forward_cache_size(nn, full_cache), forward_cache.len())?;

        let mut features = features;
        let mut forward_cache = forward_cache;
        for basis in &mut self.basis {
            let size = basis.size();
            let forward_size = basis.forward_cache_size(nn, full_cache);
            basis.forward(
                neighbors,
                take_mut(&mut features, size),
                take_mut(&mut forward_cache, forward_size),
                full_cache,
            )?;
        }
        return Ok(());
    }

    fn backward(
        &mut self,
        neighbors: &NeighborList,
        grad_features: &[f64],
        grad_parameters: &mut [f64],
        forward_cache: &[f64],
        backward_cache: &mut [f64],
    ) -> Result<(), Error> {
        let nn = neighbors.len();
        check_capacity("features gradient", self.size, grad_features.len())?;
        check_capacity("parameters gradient", self.parameter_count(), grad_parameters.len())?;
        check_capacity("forward cache", self.forward_cache_size(nn, true), forward_cache.len())?;
        check_capacity("backward cache", self.backward_cache_size(nn, true), backward_cache.len())?;

        let mut grad_features = grad_features;
        let mut grad_parameters = grad_parameters;
        let mut forward_cache = forward_cache;
        let mut backward_cache = backward_cache;
        for basis in &mut self.basis {
            let size = basis.size();
            let parameter_count = basis.parameter_count();
            let forward_size = basis.forward_cache_size(nn, true);
            let backward_size = basis.backward_cache_size(nn, true);
            basis.backward(
                neighbors,
                take(&mut grad_features, size),
                take_mut(&mut grad_parameters, parameter_count),
                take(&mut forward_cache, forward_size),
                take_mut(&mut backward_cache, backward_size),
            )?;
        }
        return Ok(());
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
        let nn = neighbors.len();
        check_capacity("features gradient", self.size, grad_features.len())?;
        check_capacity("forces", nn, forces.len())?;
        check_capacity("forward cache", self.forward_cache_size(nn, full_cache), forward_cache.len())?;
        check_capacity("backward cache", self.backward_cache_size(nn, full_cache), backward_cache.len())?;

        let mut grad_features = grad_features;
        let mut forward_cache = forward_cache;
        let mut backward_cache = backward_cache;
        for basis in &mut self.basis {
            let size = basis.size();
            let forward_size = basis.forward_cache_size(nn, full_cache);
            let backward_size = basis.backward_cache_size(nn, full_cache);
            basis.forward_force(
                neighbors,
                take(&mut grad_features, size),
                forces,
                take_mut(&mut forward_cache, forward_size),
                take_mut(&mut backward_cache, backward_size),
                full_cache,
            )?;
        }
        return Ok(());
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
        let nn = neighbors.len();
        check_capacity("features gradient", self.size, grad_features.len())?;
        check_capacity("forces gradient", nn, grad_forces.len())?;
        check_capacity("features gradient output", self.size, grad_grad_features.len())?;
        if let Some(ref grad_parameters) = grad_parameters {
            check_capacity("parameters gradient", self.parameter_count(), grad_parameters.len())?;
        }
        check_capacity("forward cache", self.forward_cache_size(nn, true), forward_cache.len())?;
        check_capacity("backward cache", self.backward_cache_size(nn, true), backward_cache.len())?;
        check_capacity("backward force cache", self.backward_force_cache_size(nn), backward_force_cache.len())?;

        let mut grad_features = grad_features;
        let mut grad_grad_features = grad_grad_features;
        let mut grad_parameters = grad_parameters;
        let mut forward_cache = forward_cache;
        let mut backward_cache = backward_cache;
        let mut backward_force_cache = backward_force_cache;
        for basis in &mut self.basis {
            let size = basis.size();
            let forward_size = basis.forward_cache_size(nn, true);
            let backward_size = basis.backward_cache_size(nn, true);
            let backward_force_size = basis.backward_force_cache_size(nn);
            let parameter_count = basis.parameter_count();
            basis.backward_force(
                neighbors,
                take(&mut grad_features, size),
                grad_forces,
                take_mut(&mut grad_grad_features, size),
                grad_parameters.as_mut().map(|g| take_mut(g, parameter_count)),
                take(&mut forward_cache, forward_size),
                take(&mut backward_cache, backward_size),
                take_mut(&mut backward_force_cache, backward_force_size),
            )?;
        }
        return Ok(());
    }

    #[time_graph::instrument(name = "Merge::eval_grad")]
    fn eval_grad(
        &mut self,
        neighbors: &NeighborList,
        features: &mut [f64],
        jacobian: &mut SparseJacobian,
    ) -> Result<(), Error> {
        check_capacity("features", self.size, features.len())?;

        jacobian.reset(self.size, neighbors.len());
        let mut offset = 0;
        for basis in &mut self.basis {
            let size = basis.size();
            basis.eval_grad(neighbors, &mut features[offset..offset + size], &mut self.jacobian)?;
            jacobian.extend_shifted(&self.jacobian, offset);
            offset += size;
        }
        return Ok(());
    }

    fn parameter_count(&self) -> usize {
        self.basis.iter().map(|b| b.parameter_count()).sum()
    }

    fn parameters(&self) -> Result<Vec<f64>, Error> {
        let mut parameters = Vec::with_capacity(self.parameter_count());
        for basis in &self.basis {
            parameters.extend(basis.parameters()?);
        }
        return Ok(parameters);
    }

    fn set_parameters(&self, parameters: &[f64]) -> Result<(), Error> {
        if parameters.len() != self.parameter_count() {
            return Err(Error::Configuration(format!(
                "expected {} parameters, got {}", self.parameter_count(), parameters.len()
            )));
        }

        let mut parameters = parameters;
        for basis in &self.basis {
            basis.set_parameters(take(&mut parameters, basis.parameter_count()))?;
        }
        return Ok(());
    }

    fn init_parameters(&self, rng: &mut dyn rand::RngCore) -> Result<(), Error> {
        for basis in &self.basis {
            basis.init_parameters(rng)?;
        }
        return Ok(());
    }

    fn thread_safe_ref(&self) -> Box<dyn Basis> {
        Box::new(Merge {
            basis: self.basis.iter().map(|b| b.thread_safe_ref()).collect(),
            rcut: self.rcut,
            size: self.size,
            workspace: Workspace::default(),
            jacobian: SparseJacobian::new(),
        })
    }

    fn shutdown(&mut self) {
        for basis in &mut self.basis {
            basis.shutdown();
        }
        self.workspace = Workspace::default();
    }

    fn is_shutdown(&self) -> bool {
        self.basis.iter().all(|b| b.is_shutdown())
    }

    fn save(&self) -> Result<BasisDocument, Error> {
        let basis = self.basis.iter().map(|b| b.save()).collect::<Result<Vec<_>, _>>()?;
        return Ok(BasisDocument::Merge { basis });
    }

    fn workspace(&mut self) -> &mut Workspace {
        &mut self.workspace
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::basis::{Chebyshev, ChebyshevParameters, SphericalChebyshev, SphericalChebyshevParameters};

    fn components() -> Vec<Box<dyn Basis>> {
        vec![
            Box::new(SphericalChebyshev::new(2, &SphericalChebyshevParameters {
                nmax: 2, lmax: 3, rcut: 3.0, ..Default::default()
            }).unwrap()),
            Box::new(Chebyshev::new(2, &ChebyshevParameters {
                nmax: 4, rcut: 5.0, ..Default::default()
            }).unwrap()),
        ]
    }

    #[test]
    fn sizes() {
        let merge = Merge::new(components()).unwrap();
        let parts = components();
        let (a, b) = (&parts[0], &parts[1]);
        assert_eq!(merge.rcut(), 5.0);
        assert_eq!(merge.size(), a.size() + b.size());
        assert_eq!(merge.forward_cache_size(8, true), a.forward_cache_size(8, true) + b.forward_cache_size(8, true));
        assert_eq!(merge.backward_cache_size(8, false), a.backward_cache_size(8, false) + b.backward_cache_size(8, false));
        assert_eq!(merge.species_count(), 2);
    }

    #[test]
    fn invalid() {
        assert!(Merge::new(Vec::new()).is_err());

        let inner = Merge::new(components()).unwrap();
        assert!(Merge::new(vec![Box::new(inner)]).is_err());

        let mismatch: Vec<Box<dyn Basis>> = vec![
            Box::new(Chebyshev::new(1, &ChebyshevParameters::default()).unwrap()),
            Box::new(Chebyshev::new(2, &ChebyshevParameters::default()).unwrap()),
        ];
        assert!(Merge::new(mismatch).is_err());
    }

    #[test]
    fn save() {
        let merge = Merge::new(components()).unwrap();
        let BasisDocument::Merge { basis } = merge.save().unwrap() else {
            panic!("expected a merge document");
        };
        assert_eq!(basis.len(), 2);
        assert!(matches!(basis[0], BasisDocument::SphericalChebyshev(_)));
        assert!(matches!(basis[1], BasisDocument::Chebyshev(_)));
    }
}
