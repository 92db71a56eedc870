use log::{debug, warn};

use crate::{Error, NeighborList};
use crate::math::{SmoothCutoff, ChebyshevRadial};

use super::{Basis, BasisKind, BasisDocument, SparseJacobian, Workspace};
use super::{SpeciesWeighting, ChebyshevParameters};
use super::{check_capacity, take, take_mut, row, row_mut, Lifecycle};
use super::{neighbor_distance, norm};
use super::parameters::{load_fuse_matrix, save_fuse_matrix};
use super::spherical_chebyshev::check_radial_parameters;

/// Radial-only basis: the features are the sums over neighbors of the
/// Chebyshev radial functions `fc(r) T_n(r)`, one set per block of the
/// species weighting.
#[derive(Debug)]
pub struct Chebyshev {
    max_radial: usize,
    cutoff: SmoothCutoff,
    radial: ChebyshevRadial,
    weighting: SpeciesWeighting,
    lifecycle: Lifecycle,
    workspace: Workspace,
    neighbor_weights: Vec<Option<f64>>,
}

impl Chebyshev {
    /// Create a new radial basis for `species_count` species
    pub fn new(species_count: usize, parameters: &ChebyshevParameters) -> Result<Chebyshev, Error> {
        let cutoff = check_radial_parameters(parameters.nmax, parameters.rcut)?;
        let fuse = load_fuse_matrix(
            parameters.wtype,
            species_count,
            parameters.fuse_size,
            parameters.fuse_weight.as_ref(),
        )?;

        let basis = Chebyshev {
            max_radial: parameters.nmax,
            cutoff: cutoff,
            radial: ChebyshevRadial::new(parameters.nmax, parameters.rcut),
            weighting: SpeciesWeighting::new(parameters.wtype, species_count, fuse)?,
            lifecycle: Lifecycle::new(),
            workspace: Workspace::default(),
            neighbor_weights: Vec::new(),
        };
        debug!("created Chebyshev basis with {} features", basis.size());

        return Ok(basis);
    }

    /// Get the species weighting used by this basis
    pub fn weighting(&self) -> &SpeciesWeighting {
        &self.weighting
    }

    fn radial_size(&self) -> usize {
        self.max_radial + 1
    }
}

impl Basis for Chebyshev {
    fn kind(&self) -> BasisKind {
        BasisKind::Chebyshev
    }

    fn rcut(&self) -> f64 {
        self.cutoff.cutoff()
    }

    fn size(&self) -> usize {
        self.weighting.block_count() * self.radial_size()
    }

    fn species_count(&self) -> usize {
        self.weighting.species_count()
    }

    fn forward_cache_size(&self, neighbors: usize, full_cache: bool) -> usize {
        if full_cache {
            neighbors * (self.radial_size() + 1)
        } else {
            self.radial_size()
        }
    }

    fn backward_cache_size(&self, neighbors: usize, full_cache: bool) -> usize {
        let nr = self.radial_size();
        if full_cache {
            3 * neighbors * nr + 3 * neighbors + nr
        } else {
            4 * nr
        }
    }

    fn backward_force_cache_size(&self, _: usize) -> usize {
        self.radial_size()
    }

    #[time_graph::instrument(name = "Chebyshev::forward")]
    fn forward(
        &mut self,
        neighbors: &NeighborList,
        features: &mut [f64],
        forward_cache: &mut [f64],
        full_cache: bool,
    ) -> Result<(), Error> {
        self.lifecycle.start_forward()?;

        let nn = neighbors.len();
        let size = self.size();
        check_capacity("features", size, features.len())?;
        check_capacity("forward cache", self.forward_cache_size(nn, full_cache), forward_cache.len())?;

        let nr = self.radial_size();
        let rcut = self.rcut();

        let mut buffer = forward_cache;
        let all_radial = take_mut(&mut buffer, if full_cache { nn * nr } else { nr });
        let all_cutoff = take_mut(&mut buffer, if full_cache { nn } else { 0 });

        let features = &mut features[..size];
        features.fill(0.0);

        let weights = self.weighting.blocks()?;
        for j in 0..nn {
            let vector = neighbors.vector(j);
            let species = neighbors.species(j);
            self.weighting.check_species(species)?;

            let radial = row_mut(all_radial, if full_cache { j } else { 0 }, nr);
            let Some(r) = neighbor_distance(vector, rcut) else {
                if norm(vector) < rcut {
                    warn!("neighbor {} is on top of the central atom, ignoring it", j);
                }
                if full_cache {
                    radial.fill(0.0);
                    all_cutoff[j] = 0.0;
                }
                continue;
            };

            self.radial.compute(r, radial);
            let fc = self.cutoff.compute(r);
            if full_cache {
                all_cutoff[j] = fc;
            }

            weights.for_each(species, |block, weight| {
                let factor = weight * fc;
                for (f, t) in row_mut(features, block, nr).iter_mut().zip(&*radial) {
                    *f += factor * t;
                }
            });
        }
        drop(weights);

        self.lifecycle.forward_done(nn, full_cache);
        return Ok(());
    }

    #[time_graph::instrument(name = "Chebyshev::backward")]
    fn backward(
        &mut self,
        neighbors: &NeighborList,
        grad_features: &[f64],
        grad_parameters: &mut [f64],
        forward_cache: &[f64],
        backward_cache: &mut [f64],
    ) -> Result<(), Error> {
        let nn = neighbors.len();
        self.lifecycle.check_forward("backward", nn, Some(true))?;
        check_capacity("features gradient", self.size(), grad_features.len())?;
        check_capacity("parameters gradient", self.parameter_count(), grad_parameters.len())?;
        check_capacity("forward cache", self.forward_cache_size(nn, true), forward_cache.len())?;
        check_capacity("backward cache", self.backward_cache_size(nn, true), backward_cache.len())?;

        if !self.weighting.is_fused() {
            return Ok(());
        }

        let nr = self.radial_size();
        let mut forward = forward_cache;
        let all_radial = take(&mut forward, nn * nr);
        let all_cutoff = take(&mut forward, nn);

        let fuse_size = self.weighting.fuse_size();
        let first = self.weighting.first_fused_block();
        for j in 0..nn {
            let species = neighbors.species(j);
            self.weighting.check_species(species)?;

            let fc = all_cutoff[j];
            let radial = row(all_radial, j, nr);
            for k in 0..fuse_size {
                let grad = row(grad_features, first + k, nr);
                let value = grad.iter().zip(radial).map(|(g, t)| g * t).sum::<f64>();
                grad_parameters[(species - 1) * fuse_size + k] += fc * value;
            }
        }

        return Ok(());
    }

    #[time_graph::instrument(name = "Chebyshev::forward_force")]
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
        self.lifecycle.check_forward("forward_force", nn, Some(full_cache))?;
        check_capacity("features gradient", self.size(), grad_features.len())?;
        check_capacity("forces", nn, forces.len())?;
        check_capacity("forward cache", self.forward_cache_size(nn, full_cache), forward_cache.len())?;
        check_capacity("backward cache", self.backward_cache_size(nn, full_cache), backward_cache.len())?;

        let nr = self.radial_size();
        let rcut = self.rcut();
        let slots = if full_cache { nn } else { 1 };

        let mut forward = forward_cache;
        let all_radial = take_mut(&mut forward, slots * nr);
        let all_cutoff = take_mut(&mut forward, if full_cache { nn } else { 0 });

        let mut backward = backward_cache;
        let [rx, ry, rz] = [(); 3].map(|()| take_mut(&mut backward, slots * nr));
        let [cx, cy, cz] = [(); 3].map(|()| take_mut(&mut backward, if full_cache { nn } else { 0 }));
        let second_kind = take_mut(&mut backward, nr);

        let weights = self.weighting.blocks()?;
        for j in 0..nn {
            let vector = neighbors.vector(j);
            let species = neighbors.species(j);
            self.weighting.check_species(species)?;

            let slot = if full_cache { j } else { 0 };
            let Some(r) = neighbor_distance(vector, rcut) else {
                if full_cache {
                    for gradient in [&mut *rx, &mut *ry, &mut *rz] {
                        row_mut(gradient, j, nr).fill(0.0);
                    }
                    cx[j] = 0.0;
                    cy[j] = 0.0;
                    cz[j] = 0.0;
                }
                continue;
            };

            let radial = row_mut(all_radial, slot, nr);
            let fc = if full_cache {
                all_cutoff[j]
            } else {
                self.radial.compute(r, radial);
                self.cutoff.compute(r)
            };

            self.radial.compute_gradients(
                vector, r, second_kind,
                [row_mut(rx, slot, nr), row_mut(ry, slot, nr), row_mut(rz, slot, nr)],
            );
            let fc_gradient = self.cutoff.gradient(vector, r);
            if full_cache {
                cx[j] = fc_gradient[0];
                cy[j] = fc_gradient[1];
                cz[j] = fc_gradient[2];
            }

            let radial_gradients = [row(rx, slot, nr), row(ry, slot, nr), row(rz, slot, nr)];
            let force = &mut forces[j];
            for n in 0..nr {
                let mut grad = 0.0;
                weights.for_each(species, |block, weight| grad += weight * grad_features[block * nr + n]);
                for d in 0..3 {
                    force[d] += grad * (fc * radial_gradients[d][n] + fc_gradient[d] * radial[n]);
                }
            }
        }
        drop(weights);

        self.lifecycle.force_done(full_cache);
        return Ok(());
    }

    #[time_graph::instrument(name = "Chebyshev::backward_force")]
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
        self.lifecycle.check_force("backward_force", nn)?;
        let size = self.size();
        check_capacity("features gradient", size, grad_features.len())?;
        check_capacity("forces gradient", nn, grad_forces.len())?;
        check_capacity("features gradient output", size, grad_grad_features.len())?;
        if let Some(ref grad_parameters) = grad_parameters {
            check_capacity("parameters gradient", self.parameter_count(), grad_parameters.len())?;
        }
        check_capacity("forward cache", self.forward_cache_size(nn, true), forward_cache.len())?;
        check_capacity("backward cache", self.backward_cache_size(nn, true), backward_cache.len())?;
        check_capacity("backward force cache", self.backward_force_cache_size(nn), backward_force_cache.len())?;

        let nr = self.radial_size();
        let mut forward = forward_cache;
        let all_radial = take(&mut forward, nn * nr);
        let all_cutoff = take(&mut forward, nn);

        let mut backward = backward_cache;
        let radial_gradients = [(); 3].map(|()| take(&mut backward, nn * nr));
        let cutoff_gradients = [(); 3].map(|()| take(&mut backward, nn));

        let delta = &mut backward_force_cache[..nr];

        let fuse_size = self.weighting.fuse_size();
        let first = self.weighting.first_fused_block();
        let mut grad_parameters = grad_parameters.filter(|_| self.weighting.is_fused());

        let weights = self.weighting.blocks()?;
        for j in 0..nn {
            let species = neighbors.species(j);
            self.weighting.check_species(species)?;

            let direction = grad_forces[j];
            let fc = all_cutoff[j];
            let radial = row(all_radial, j, nr);
            let mut cutoff = 0.0;
            for d in 0..3 {
                cutoff += direction[d] * cutoff_gradients[d][j];
            }
            for n in 0..nr {
                let mut value = cutoff * radial[n];
                for d in 0..3 {
                    value += fc * direction[d] * radial_gradients[d][j * nr + n];
                }
                delta[n] = value;
            }

            weights.for_each(species, |block, weight| {
                for (g, d) in row_mut(grad_grad_features, block, nr).iter_mut().zip(&*delta) {
                    *g += weight * d;
                }
            });

            if let Some(ref mut grad_parameters) = grad_parameters {
                for k in 0..fuse_size {
                    let grad = row(grad_features, first + k, nr);
                    let value = grad.iter().zip(&*delta).map(|(g, d)| g * d).sum::<f64>();
                    grad_parameters[(species - 1) * fuse_size + k] += value;
                }
            }
        }

        return Ok(());
    }

    #[time_graph::instrument(name = "Chebyshev::eval_grad")]
    fn eval_grad(
        &mut self,
        neighbors: &NeighborList,
        features: &mut [f64],
        jacobian: &mut SparseJacobian,
    ) -> Result<(), Error> {
        let nn = neighbors.len();
        let nr = self.radial_size();
        let rcut = self.rcut();
        let blocks = self.weighting.block_count();

        let mut workspace = std::mem::take(&mut self.workspace);
        let (forward_cache, backward_cache) = workspace.prepare(
            self.forward_cache_size(nn, true),
            3 * nr + nr,
        );

        let result = self.forward(neighbors, features, forward_cache, true);
        if let Err(error) = result {
            self.workspace = workspace;
            return Err(error);
        }

        let all_radial = &forward_cache[..nn * nr];
        let all_cutoff = &forward_cache[nn * nr..nn * (nr + 1)];
        let mut backward = &mut *backward_cache;
        let [rx, ry, rz] = [(); 3].map(|()| take_mut(&mut backward, nr));
        let second_kind = take_mut(&mut backward, nr);

        jacobian.reset(self.size(), nn);
        self.neighbor_weights.clear();
        self.neighbor_weights.resize(nn * blocks, None);
        let mut gradients = vec![[0.0; 3]; nn * nr];

        let result = self.weighting.blocks().map(|weights| {
            for j in 0..nn {
                let vector = neighbors.vector(j);
                let Some(r) = neighbor_distance(vector, rcut) else {
                    continue;
                };

                self.radial.compute_gradients(vector, r, second_kind, [&mut *rx, &mut *ry, &mut *rz]);
                let fc_gradient = self.cutoff.gradient(vector, r);
                let fc = all_cutoff[j];
                let radial = row(all_radial, j, nr);
                for n in 0..nr {
                    let gradient = &mut gradients[j * nr + n];
                    gradient[0] = fc * rx[n] + fc_gradient[0] * radial[n];
                    gradient[1] = fc * ry[n] + fc_gradient[1] * radial[n];
                    gradient[2] = fc * rz[n] + fc_gradient[2] * radial[n];
                }

                let neighbor_weights = &mut self.neighbor_weights[j * blocks..(j + 1) * blocks];
                weights.for_each(neighbors.species(j), |block, weight| neighbor_weights[block] = Some(weight));
            }
        });

        if result.is_ok() {
            for feature in 0..self.size() {
                let block = feature / nr;
                let n = feature % nr;
                for j in 0..nn {
                    if let Some(weight) = self.neighbor_weights[j * blocks + block] {
                        let gradient = gradients[j * nr + n];
                        jacobian.push(feature, j, [weight * gradient[0], weight * gradient[1], weight * gradient[2]]);
                    }
                }
            }
        }

        self.workspace = workspace;
        return result;
    }

    fn parameter_count(&self) -> usize {
        self.weighting.species_count() * self.weighting.fuse_size()
    }

    fn parameters(&self) -> Result<Vec<f64>, Error> {
        self.lifecycle.check_alive("parameters")?;
        self.weighting.parameters()
    }

    fn set_parameters(&self, parameters: &[f64]) -> Result<(), Error> {
        self.lifecycle.check_alive("set_parameters")?;
        self.weighting.set_parameters(parameters)
    }

    fn init_parameters(&self, rng: &mut dyn rand::RngCore) -> Result<(), Error> {
        self.lifecycle.check_alive("init_parameters")?;
        self.weighting.init_parameters(rng)
    }

    fn thread_safe_ref(&self) -> Box<dyn Basis> {
        Box::new(Chebyshev {
            max_radial: self.max_radial,
            cutoff: self.cutoff,
            radial: self.radial,
            weighting: self.weighting.clone(),
            lifecycle: self.lifecycle.for_reference(),
            workspace: Workspace::default(),
            neighbor_weights: Vec::new(),
        })
    }

    fn shutdown(&mut self) {
        self.lifecycle.shutdown();
        self.workspace = Workspace::default();
    }

    fn is_shutdown(&self) -> bool {
        self.lifecycle.is_shutdown()
    }

    fn save(&self) -> Result<BasisDocument, Error> {
        self.lifecycle.check_alive("save")?;
        let matrix = match self.weighting.fuse_weight() {
            Some(fuse) => Some(fuse.read()?.clone()),
            None => None,
        };
        let (fuse_size, fuse_weight) = save_fuse_matrix(matrix.as_ref());

        return Ok(BasisDocument::Chebyshev(ChebyshevParameters {
            nmax: self.max_radial,
            rcut: self.rcut(),
            wtype: self.weighting.weight_type(),
            fuse_size: fuse_size,
            fuse_weight: fuse_weight,
        }));
    }

    fn workspace(&mut self) -> &mut Workspace {
        &mut self.workspace
    }
}

#[cfg(test)]
mod tests {
    use approx::assert_relative_eq;

    use crate::basis::WeightType;
    use super::*;

    #[test]
    fn features() {
        let mut basis = Chebyshev::new(2, &ChebyshevParameters {
            nmax: 3, rcut: 4.0, wtype: WeightType::Full, ..Default::default()
        }).unwrap();
        assert_eq!(basis.size(), 8);

        let neighbors = NeighborList::from_pairs(&[
            ([1.0, 0.0, 0.0], 1),
            ([0.0, 2.0, 0.0], 2),
            ([0.0, 0.0, 5.0], 2),
        ]);
        let mut features = vec![0.0; 8];
        basis.eval(&neighbors, &mut features).unwrap();

        let cutoff = SmoothCutoff::new(4.0).unwrap();
        let radial = ChebyshevRadial::new(3, 4.0);
        let mut expected = [0.0; 4];
        radial.compute(1.0, &mut expected);
        for n in 0..4 {
            assert_relative_eq!(features[n], cutoff.compute(1.0) * expected[n], max_relative=1e-12);
        }
        radial.compute(2.0, &mut expected);
        for n in 0..4 {
            assert_relative_eq!(features[4 + n], cutoff.compute(2.0) * expected[n], max_relative=1e-12);
        }
    }

    #[test]
    fn cache_sizes() {
        let basis = Chebyshev::new(1, &ChebyshevParameters { nmax: 4, ..Default::default() }).unwrap();
        assert_eq!(basis.forward_cache_size(7, true), 7 * 6);
        assert_eq!(basis.forward_cache_size(7, false), 5);
        assert_eq!(basis.backward_cache_size(7, true), 3 * 7 * 5 + 3 * 7 + 5);
        assert_eq!(basis.backward_cache_size(7, false), 20);
    }

    #[test]
    fn jacobian_matches_forces() {
        let mut basis = Chebyshev::new(3, &ChebyshevParameters {
            nmax: 4, rcut: 3.5, wtype: WeightType::Default, ..Default::default()
        }).unwrap();
        let neighbors = NeighborList::from_pairs(&[
            ([1.0, 0.2, 0.0], 1),
            ([-0.5, 1.3, 0.4], 2),
            ([0.3, -0.2, -2.0], 3),
        ]);

        let mut features = vec![0.0; basis.size()];
        let mut jacobian = SparseJacobian::new();
        basis.eval_grad(&neighbors, &mut features, &mut jacobian).unwrap();

        let grad = (0..basis.size()).map(|i| 0.5 - 0.1 * i as f64).collect::<Vec<_>>();
        let mut expected = vec![[0.0; 3]; 3];
        jacobian.contract(&grad, &mut expected).unwrap();

        let mut forces = vec![[0.0; 3]; 3];
        basis.eval_for_force(&neighbors, &mut features).unwrap();
        basis.force(&neighbors, &grad, &mut forces).unwrap();
        for (a, b) in forces.iter().zip(&expected) {
            for d in 0..3 {
                assert_relative_eq!(a[d], b[d], epsilon=1e-12, max_relative=1e-10);
            }
        }
    }

    #[test]
    fn save() {
        let basis = Chebyshev::new(2, &ChebyshevParameters {
            nmax: 2, rcut: 5.0, wtype: WeightType::Fuse, fuse_size: Some(3), ..Default::default()
        }).unwrap();
        assert_eq!(basis.parameter_count(), 6);

        let BasisDocument::Chebyshev(parameters) = basis.save().unwrap() else {
            panic!("expected a Chebyshev document");
        };
        assert_eq!(parameters.fuse_size, Some(3));
        assert_eq!(parameters.fuse_weight, Some(vec![vec![0.0; 3]; 2]));
    }
}
