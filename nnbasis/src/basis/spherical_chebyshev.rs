use log::{debug, warn};

use crate::{Error, NeighborList};
use crate::math::{SmoothCutoff, ChebyshevRadial, SphericalHarmonics, spherical_harmonics_count};
use crate::math::{MAX_TRIPLE_ANGULAR, MAX_QUADRUPLE_ANGULAR};

use super::{Basis, BasisKind, BasisDocument, SparseJacobian, Workspace};
use super::{SpeciesWeighting, ChannelMixing, Invariants, SphericalChebyshevParameters};
use super::{check_capacity, take, take_mut, row, row_mut, dot, Lifecycle};
use super::{neighbor_distance, norm};
use super::parameters::{load_fuse_matrix, save_fuse_matrix, load_post_fuse};

/// Largest supported order for the Chebyshev polynomials
pub(crate) const MAX_RADIAL: usize = 20;
/// Largest supported order for the spherical harmonics
pub(crate) const MAX_ANGULAR: usize = 12;

/// Check the radial hyper-parameters shared by all Chebyshev-based basis
pub(crate) fn check_radial_parameters(max_radial: usize, cutoff: f64) -> Result<SmoothCutoff, Error> {
    if max_radial > MAX_RADIAL {
        return Err(Error::Configuration(format!(
            "nmax must be at most {}, got {}", MAX_RADIAL, max_radial
        )));
    }
    return SmoothCutoff::new(cutoff);
}

/// Numerical kernels used to expand the density of one neighbor
#[derive(Debug, Clone)]
struct Kernels {
    cutoff: SmoothCutoff,
    radial: ChebyshevRadial,
    spherical_harmonics: SphericalHarmonics,
}

/// Scratch memory used when computing the gradients for a single neighbor
struct Scratch<'a> {
    second_kind: &'a mut [f64],
    d_theta: &'a mut [f64],
    d_phi: &'a mut [f64],
}

impl Kernels {
    /// Compute the radial functions and spherical harmonics for the
    /// neighbor at `vector`, returning the value of the cutoff function
    #[inline]
    fn values(&mut self, vector: [f64; 3], r: f64, radial: &mut [f64], harmonics: &mut [f64]) -> f64 {
        self.radial.compute(r, radial);
        self.spherical_harmonics.compute_values(vector, harmonics);
        return self.cutoff.compute(r);
    }

    /// Compute the gradients of the radial functions and spherical harmonics
    /// for the neighbor at `vector`, returning the gradient of the cutoff
    /// function
    #[inline]
    fn gradients(
        &self,
        vector: [f64; 3],
        r: f64,
        harmonics: &[f64],
        scratch: Scratch<'_>,
        radial_gradients: [&mut [f64]; 3],
        harmonics_gradients: [&mut [f64]; 3],
    ) -> [f64; 3] {
        self.radial.compute_gradients(vector, r, scratch.second_kind, radial_gradients);
        self.spherical_harmonics.compute_gradients(
            vector, harmonics, [scratch.d_theta, scratch.d_phi], harmonics_gradients
        );
        return self.cutoff.gradient(vector, r);
    }
}

/// Per-atom descriptor built from the expansion of the neighbor density on
/// Chebyshev polynomials (radial part) and real spherical harmonics (angular
/// part), reduced to rotation-invariant features.
///
/// For each radial channel (one per block of the species weighting and per
/// radial order `n`), the features contain the order-2 invariants for
/// `l = 0..=lmax`, followed by the order-3 invariants up to `l3max` and the
/// order-4 invariants up to `l4max`.
///
/// With `post_fuse`, the coefficients of all the radial channels are first
/// mixed into `post_fuse_size` channels by a learnable matrix, and the
/// invariants are computed for each mixed channel instead.
#[derive(Debug)]
pub struct SphericalChebyshev {
    max_radial: usize,
    max_angular: usize,
    max_triple: usize,
    max_quadruple: usize,
    no_radial: bool,
    kernels: Kernels,
    invariants: Invariants,
    weighting: SpeciesWeighting,
    mixing: Option<ChannelMixing>,
    lifecycle: Lifecycle,
    workspace: Workspace,
    /// gradients of the invariants, used by `eval_grad`
    feature_gradient: Vec<f64>,
    /// weight of each neighbor in each block, used by `eval_grad`
    neighbor_weights: Vec<Option<f64>>,
}

impl SphericalChebyshev {
    /// Create a new basis for `species_count` species with the given
    /// hyper-parameters
    pub fn new(species_count: usize, parameters: &SphericalChebyshevParameters) -> Result<SphericalChebyshev, Error> {
        let cutoff = check_radial_parameters(parameters.nmax, parameters.rcut)?;
        if parameters.lmax > MAX_ANGULAR {
            return Err(Error::Configuration(format!(
                "lmax must be at most {}, got {}", MAX_ANGULAR, parameters.lmax
            )));
        }
        if parameters.l3max > MAX_TRIPLE_ANGULAR {
            return Err(Error::Configuration(format!(
                "l3max must be at most {}, got {}", MAX_TRIPLE_ANGULAR, parameters.l3max
            )));
        }
        if parameters.l3max > parameters.lmax {
            return Err(Error::Configuration(format!(
                "l3max ({}) can not be larger than lmax ({})", parameters.l3max, parameters.lmax
            )));
        }
        if parameters.l4max > MAX_QUADRUPLE_ANGULAR {
            return Err(Error::Configuration(format!(
                "l4max must be at most {}, got {}", MAX_QUADRUPLE_ANGULAR, parameters.l4max
            )));
        }
        if parameters.l4max > parameters.lmax {
            return Err(Error::Configuration(format!(
                "l4max ({}) can not be larger than lmax ({})", parameters.l4max, parameters.lmax
            )));
        }

        let fuse = load_fuse_matrix(
            parameters.wtype,
            species_count,
            parameters.fuse_size,
            parameters.fuse_weight.as_ref(),
        )?;
        let weighting = SpeciesWeighting::new(parameters.wtype, species_count, fuse)?;

        let channels = weighting.block_count() * (parameters.nmax + 1);
        let mixing = match load_post_fuse(parameters, channels)? {
            Some((weights, scale)) => Some(ChannelMixing::new(weights, scale)?),
            None => None,
        };

        let basis = SphericalChebyshev {
            max_radial: parameters.nmax,
            max_angular: parameters.lmax,
            max_triple: parameters.l3max,
            max_quadruple: parameters.l4max,
            no_radial: parameters.noradial,
            kernels: Kernels {
                cutoff: cutoff,
                radial: ChebyshevRadial::new(parameters.nmax, parameters.rcut),
                spherical_harmonics: SphericalHarmonics::new(parameters.lmax),
            },
            invariants: Invariants::new(parameters.lmax, parameters.l3max, parameters.l4max, parameters.noradial),
            weighting: weighting,
            mixing: mixing,
            lifecycle: Lifecycle::new(),
            workspace: Workspace::default(),
            feature_gradient: Vec::new(),
            neighbor_weights: Vec::new(),
        };

        debug!(
            "created spherical Chebyshev basis with {} features ({} radial channels, {} mixed channels, {} invariants per channel)",
            basis.size(), basis.channels(), basis.mixed_channels(), basis.invariants.size(),
        );

        return Ok(basis);
    }

    /// Get the species weighting used by this basis
    pub fn weighting(&self) -> &SpeciesWeighting {
        &self.weighting
    }

    /// Number of radial functions
    fn radial_size(&self) -> usize {
        self.max_radial + 1
    }

    /// Number of spherical harmonics
    fn angular_size(&self) -> usize {
        spherical_harmonics_count(self.max_angular)
    }

    /// Number of radial channels, accounting for the species weighting
    pub fn channels(&self) -> usize {
        self.weighting.block_count() * self.radial_size()
    }

    /// Number of sets of coefficients reduced to invariants: one per mixed
    /// channel with `post_fuse`, one per radial channel otherwise
    pub fn mixed_channels(&self) -> usize {
        self.mixing.as_ref().map_or_else(|| self.channels(), ChannelMixing::size)
    }

    fn fused_size(&self) -> usize {
        if self.weighting.is_fused() {
            self.radial_size() * self.angular_size()
        } else {
            0
        }
    }

    /// Size of the mixed coefficients, 0 without `post_fuse`
    fn mixed_size(&self) -> usize {
        self.mixing.as_ref().map_or(0, |mixing| mixing.size() * self.angular_size())
    }

    fn fuse_parameter_count(&self) -> usize {
        self.weighting.species_count() * self.weighting.fuse_size()
    }

    /// Compute the gradient of `Σ grad_features · features` with respect to
    /// the expansion coefficients, going through the channel mixing if any.
    /// The gradient with respect to the mixed coefficients is stored in
    /// `grad_mixed`.
    fn coefficients_gradient(
        &self,
        coefficients: &[f64],
        mixed: &[f64],
        grad_features: &[f64],
        grad_coefficients: &mut [f64],
        grad_mixed: &mut [f64],
    ) -> Result<(), Error> {
        let lm = self.angular_size();
        let size_l = self.invariants.size();
        match self.mixing {
            Some(ref mixing) => {
                for channel in 0..mixing.size() {
                    self.invariants.gradient(
                        row(mixed, channel, lm),
                        row(grad_features, channel, size_l),
                        row_mut(grad_mixed, channel, lm),
                    );
                }
                mixing.read()?.mix_transpose(grad_mixed, grad_coefficients, lm);
            }
            None => {
                for channel in 0..self.channels() {
                    self.invariants.gradient(
                        row(coefficients, channel, lm),
                        row(grad_features, channel, size_l),
                        row_mut(grad_coefficients, channel, lm),
                    );
                }
            }
        }
        return Ok(());
    }

    /// Compute the per-neighbor gradients for the full backward cache, and
    /// the sparse jacobian from them
    fn jacobian(
        &mut self,
        neighbors: &NeighborList,
        forward_cache: &[f64],
        backward_cache: &mut [f64],
        jacobian: &mut SparseJacobian,
    ) -> Result<(), Error> {
        let nn = neighbors.len();
        let nr = self.radial_size();
        let lm = self.angular_size();
        let blocks = self.weighting.block_count();
        let size_l = self.invariants.size();
        let channels = self.channels();
        let rcut = self.kernels.cutoff.cutoff();

        let mut forward = forward_cache;
        let coefficients = take(&mut forward, channels * lm);
        let mixed = take(&mut forward, self.mixed_size());
        let all_radial = take(&mut forward, nn * nr);
        let all_cutoff = take(&mut forward, nn);
        let all_harmonics = take(&mut forward, nn * lm);

        let mut backward = backward_cache;
        take_mut(&mut backward, channels * lm + self.mixed_size());
        let [rx, ry, rz] = [(); 3].map(|()| take_mut(&mut backward, nn * nr));
        let [cx, cy, cz] = [(); 3].map(|()| take_mut(&mut backward, nn));
        let [hx, hy, hz] = [(); 3].map(|()| take_mut(&mut backward, nn * lm));
        let d_theta = take_mut(&mut backward, lm);
        let d_phi = take_mut(&mut backward, lm);
        let second_kind = take_mut(&mut backward, nr);

        self.neighbor_weights.clear();
        self.neighbor_weights.resize(nn * blocks, None);

        let weights = self.weighting.blocks()?;
        for j in 0..nn {
            let vector = neighbors.vector(j);
            let species = neighbors.species(j);
            self.weighting.check_species(species)?;

            let Some(r) = neighbor_distance(vector, rcut) else {
                continue;
            };

            let fc_gradient = self.kernels.gradients(
                vector,
                r,
                row(all_harmonics, j, lm),
                Scratch { second_kind: &mut *second_kind, d_theta: &mut *d_theta, d_phi: &mut *d_phi },
                [row_mut(rx, j, nr), row_mut(ry, j, nr), row_mut(rz, j, nr)],
                [row_mut(hx, j, lm), row_mut(hy, j, lm), row_mut(hz, j, lm)],
            );
            cx[j] = fc_gradient[0];
            cy[j] = fc_gradient[1];
            cz[j] = fc_gradient[2];

            let neighbor_weights = &mut self.neighbor_weights[j * blocks..(j + 1) * blocks];
            weights.for_each(species, |block, weight| neighbor_weights[block] = Some(weight));
        }
        drop(weights);

        let neighbor_weights = &self.neighbor_weights;
        let radial_gradients = [&*rx, &*ry, &*rz];
        let cutoff_gradients = [&*cx, &*cy, &*cz];
        let harmonics_gradients = [&*hx, &*hy, &*hz];
        // gradient of `Σ_k gradient[k] c[channel, k]` with respect to the
        // position of neighbor j, or None if j does not contribute to this
        // channel
        let channel_gradient = |channel: usize, j: usize, gradient: &[f64]| -> Option<[f64; 3]> {
            let block = channel / nr;
            let n = channel % nr;
            let weight = neighbor_weights[j * blocks + block]?;

            let t_n = all_radial[j * nr + n];
            let fc = all_cutoff[j];
            let harmonics = dot(gradient, row(all_harmonics, j, lm));
            let ft = weight * fc * t_n;

            let mut value = [0.0; 3];
            for d in 0..3 {
                let radial = cutoff_gradients[d][j] * t_n + fc * radial_gradients[d][j * nr + n];
                value[d] = weight * radial * harmonics + ft * dot(gradient, row(harmonics_gradients[d], j, lm));
            }
            Some(value)
        };

        let mixing = match self.mixing {
            Some(ref mixing) => Some(mixing.read()?),
            None => None,
        };
        let input = if mixing.is_some() { mixed } else { coefficients };

        jacobian.reset(self.mixed_channels() * size_l, nn);
        let mut gradient = std::mem::take(&mut self.feature_gradient);
        gradient.resize(lm, 0.0);
        for mixed_channel in 0..self.mixed_channels() {
            let c = row(input, mixed_channel, lm);
            for feature in 0..size_l {
                self.invariants.feature_gradient(c, feature, &mut gradient);

                for j in 0..nn {
                    let value = match mixing {
                        None => channel_gradient(mixed_channel, j, &gradient),
                        Some(ref mixing) => {
                            let mut total = None;
                            for channel in 0..channels {
                                if let Some(value) = channel_gradient(channel, j, &gradient) {
                                    let weight = mixing.weight(mixed_channel, channel);
                                    let total = total.get_or_insert([0.0; 3]);
                                    for d in 0..3 {
                                        total[d] += weight * value[d];
                                    }
                                }
                            }
                            total
                        }
                    };

                    if let Some(value) = value {
                        jacobian.push(mixed_channel * size_l + feature, j, value);
                    }
                }
            }
        }
        drop(mixing);
        self.feature_gradient = gradient;

        return Ok(());
    }
}

impl Basis for SphericalChebyshev {
    fn kind(&self) -> BasisKind {
        BasisKind::SphericalChebyshev
    }

    fn rcut(&self) -> f64 {
        self.kernels.cutoff.cutoff()
    }

    fn size(&self) -> usize {
        self.mixed_channels() * self.invariants.size()
    }

    fn species_count(&self) -> usize {
        self.weighting.species_count()
    }

    fn forward_cache_size(&self, neighbors: usize, full_cache: bool) -> usize {
        let nr = self.radial_size();
        let lm = self.angular_size();
        let coefficients = self.channels() * lm + self.mixed_size();
        if full_cache {
            coefficients + neighbors * (nr + 1 + lm + self.fused_size())
        } else {
            coefficients + nr + lm + self.fused_size()
        }
    }

    fn backward_cache_size(&self, neighbors: usize, full_cache: bool) -> usize {
        let nr = self.radial_size();
        let lm = self.angular_size();
        let coefficients = self.channels() * lm + self.mixed_size();
        if full_cache {
            coefficients + 3 * neighbors * (nr + 1 + lm) + 2 * lm + nr
        } else {
            coefficients + 4 * nr + 5 * lm
        }
    }

    fn backward_force_cache_size(&self, _: usize) -> usize {
        let nr = self.radial_size();
        let lm = self.angular_size();
        let coefficients = self.channels() * lm;
        let hessian = if self.weighting.is_fused() { coefficients } else { 0 };
        coefficients + nr + lm + hessian + 2 * self.mixed_size()
    }

    #[time_graph::instrument(name = "SphericalChebyshev::forward")]
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
        let lm = self.angular_size();
        let fused = self.fused_size();
        let rcut = self.rcut();
        let slots = if full_cache { nn } else { 1 };

        let mut buffer = forward_cache;
        let coefficients = take_mut(&mut buffer, self.channels() * lm);
        let mixed = take_mut(&mut buffer, self.mixed_size());
        let all_radial = take_mut(&mut buffer, slots * nr);
        let all_cutoff = take_mut(&mut buffer, if full_cache { nn } else { 0 });
        let all_harmonics = take_mut(&mut buffer, slots * lm);
        let all_fused = take_mut(&mut buffer, slots * fused);

        coefficients.fill(0.0);
        let weights = self.weighting.blocks()?;
        for j in 0..nn {
            let vector = neighbors.vector(j);
            let species = neighbors.species(j);
            self.weighting.check_species(species)?;

            let slot = if full_cache { j } else { 0 };
            let radial = row_mut(all_radial, slot, nr);
            let harmonics = row_mut(all_harmonics, slot, lm);
            let products = row_mut(all_fused, slot, fused);

            let Some(r) = neighbor_distance(vector, rcut) else {
                if norm(vector) < rcut {
                    warn!("neighbor {} is on top of the central atom, ignoring it", j);
                }
                if full_cache {
                    radial.fill(0.0);
                    harmonics.fill(0.0);
                    products.fill(0.0);
                    all_cutoff[j] = 0.0;
                }
                continue;
            };

            let fc = self.kernels.values(vector, r, radial, harmonics);
            if full_cache {
                all_cutoff[j] = fc;
            }

            if fused == 0 {
                weights.for_each(species, |block, weight| {
                    for n in 0..nr {
                        let factor = weight * fc * radial[n];
                        let c = row_mut(coefficients, block * nr + n, lm);
                        for (c, y) in c.iter_mut().zip(&*harmonics) {
                            *c += factor * y;
                        }
                    }
                });
            } else {
                for n in 0..nr {
                    let factor = fc * radial[n];
                    for (b, y) in row_mut(products, n, lm).iter_mut().zip(&*harmonics) {
                        *b = factor * y;
                    }
                }
                weights.for_each(species, |block, weight| {
                    let c = row_mut(coefficients, block, nr * lm);
                    for (c, b) in c.iter_mut().zip(&*products) {
                        *c += weight * b;
                    }
                });
            }
        }
        drop(weights);

        let input: &[f64] = match self.mixing {
            Some(ref mixing) => {
                mixing.read()?.mix(coefficients, mixed, lm);
                mixed
            }
            None => coefficients,
        };

        let size_l = self.invariants.size();
        for channel in 0..self.mixed_channels() {
            self.invariants.compute(row(input, channel, lm), row_mut(features, channel, size_l));
        }

        self.lifecycle.forward_done(nn, full_cache);
        return Ok(());
    }

    #[time_graph::instrument(name = "SphericalChebyshev::backward")]
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

        if !self.weighting.is_fused() && self.mixing.is_none() {
            return Ok(());
        }

        let nr = self.radial_size();
        let lm = self.angular_size();
        let block_size = nr * lm;

        let mut forward = forward_cache;
        let coefficients = take(&mut forward, self.channels() * lm);
        let mixed = take(&mut forward, self.mixed_size());
        take(&mut forward, nn * (nr + 1 + lm));
        let all_fused = take(&mut forward, nn * self.fused_size());

        let mut backward = backward_cache;
        let grad_coefficients = take_mut(&mut backward, self.channels() * lm);
        let grad_mixed = take_mut(&mut backward, self.mixed_size());
        self.coefficients_gradient(coefficients, mixed, grad_features, grad_coefficients, grad_mixed)?;

        // the post fuse parameters come after the fuse parameters
        let (grad_fuse, grad_mixing) = grad_parameters.split_at_mut(self.fuse_parameter_count());
        if let Some(ref mixing) = self.mixing {
            mixing.read()?.weights_gradient(grad_mixed, coefficients, lm, grad_mixing);
        }

        if self.weighting.is_fused() {
            let fuse_size = self.weighting.fuse_size();
            let first = self.weighting.first_fused_block();
            for j in 0..nn {
                let species = neighbors.species(j);
                self.weighting.check_species(species)?;

                let products = row(all_fused, j, block_size);
                for k in 0..fuse_size {
                    let grad_c = row(grad_coefficients, first + k, block_size);
                    grad_fuse[(species - 1) * fuse_size + k] += dot(grad_c, products);
                }
            }
        }

        return Ok(());
    }

    #[time_graph::instrument(name = "SphericalChebyshev::forward_force")]
    #[allow(clippy::too_many_lines)]
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
        let lm = self.angular_size();
        let rcut = self.rcut();
        let slots = if full_cache { nn } else { 1 };

        let mut forward = forward_cache;
        let coefficients = take_mut(&mut forward, self.channels() * lm);
        let mixed = take_mut(&mut forward, self.mixed_size());
        let all_radial = take_mut(&mut forward, slots * nr);
        let all_cutoff = take_mut(&mut forward, if full_cache { nn } else { 0 });
        let all_harmonics = take_mut(&mut forward, slots * lm);

        let mut backward = backward_cache;
        let grad_coefficients = take_mut(&mut backward, self.channels() * lm);
        let grad_mixed = take_mut(&mut backward, self.mixed_size());
        let [rx, ry, rz] = [(); 3].map(|()| take_mut(&mut backward, slots * nr));
        let [cx, cy, cz] = [(); 3].map(|()| take_mut(&mut backward, if full_cache { nn } else { 0 }));
        let [hx, hy, hz] = [(); 3].map(|()| take_mut(&mut backward, slots * lm));
        let d_theta = take_mut(&mut backward, lm);
        let d_phi = take_mut(&mut backward, lm);
        let second_kind = take_mut(&mut backward, nr);

        self.coefficients_gradient(coefficients, mixed, grad_features, grad_coefficients, grad_mixed)?;

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
                    for gradient in [&mut *hx, &mut *hy, &mut *hz] {
                        row_mut(gradient, j, lm).fill(0.0);
                    }
                    cx[j] = 0.0;
                    cy[j] = 0.0;
                    cz[j] = 0.0;
                }
                continue;
            };

            let radial = row_mut(all_radial, slot, nr);
            let harmonics = row_mut(all_harmonics, slot, lm);
            let fc = if full_cache {
                all_cutoff[j]
            } else {
                self.kernels.values(vector, r, radial, harmonics)
            };

            let radial_gradients = [row_mut(rx, slot, nr), row_mut(ry, slot, nr), row_mut(rz, slot, nr)];
            let harmonics_gradients = [row_mut(hx, slot, lm), row_mut(hy, slot, lm), row_mut(hz, slot, lm)];
            let fc_gradient = self.kernels.gradients(
                vector,
                r,
                harmonics,
                Scratch { second_kind: &mut *second_kind, d_theta: &mut *d_theta, d_phi: &mut *d_phi },
                radial_gradients,
                harmonics_gradients,
            );
            if full_cache {
                cx[j] = fc_gradient[0];
                cy[j] = fc_gradient[1];
                cz[j] = fc_gradient[2];
            }

            // d_phi accumulates the gradient with respect to the spherical
            // harmonics, and second_kind the one with respect to the radial
            // functions. d_theta contains the weighted gradient of the
            // coefficients of a single radial order.
            d_phi.fill(0.0);
            for n in 0..nr {
                d_theta.fill(0.0);
                weights.for_each(species, |block, weight| {
                    let grad_c = row(grad_coefficients, block * nr + n, lm);
                    for (g, gc) in d_theta.iter_mut().zip(grad_c) {
                        *g += weight * gc;
                    }
                });

                let factor = fc * radial[n];
                for (gy, g) in d_phi.iter_mut().zip(&*d_theta) {
                    *gy += factor * g;
                }
                second_kind[n] = dot(harmonics, d_theta);
            }

            let force = &mut forces[j];
            let radial_gradients = [row(rx, slot, nr), row(ry, slot, nr), row(rz, slot, nr)];
            let harmonics_gradients = [row(hx, slot, lm), row(hy, slot, lm), row(hz, slot, lm)];
            for d in 0..3 {
                let mut value = dot(d_phi, harmonics_gradients[d]);
                for n in 0..nr {
                    value += (fc * radial_gradients[d][n] + fc_gradient[d] * radial[n]) * second_kind[n];
                }
                force[d] += value;
            }
        }
        drop(weights);

        self.lifecycle.force_done(full_cache);
        return Ok(());
    }

    #[time_graph::instrument(name = "SphericalChebyshev::backward_force")]
    #[allow(clippy::too_many_lines)]
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
        let lm = self.angular_size();
        let size_l = self.invariants.size();
        let channels = self.channels();
        let fused = self.weighting.is_fused();

        let mixed_size = self.mixed_size();

        let mut forward = forward_cache;
        let coefficients = take(&mut forward, channels * lm);
        let mixed = take(&mut forward, mixed_size);
        let all_radial = take(&mut forward, nn * nr);
        let all_cutoff = take(&mut forward, nn);
        let all_harmonics = take(&mut forward, nn * lm);
        let all_fused = take(&mut forward, nn * self.fused_size());

        let mut backward = backward_cache;
        let grad_coefficients = take(&mut backward, channels * lm);
        let grad_mixed = take(&mut backward, mixed_size);
        let radial_gradients = [(); 3].map(|()| take(&mut backward, nn * nr));
        let cutoff_gradients = [(); 3].map(|()| take(&mut backward, nn));
        let harmonics_gradients = [(); 3].map(|()| take(&mut backward, nn * lm));

        let mut cache = backward_force_cache;
        let delta_coefficients = take_mut(&mut cache, channels * lm);
        let delta_radial = take_mut(&mut cache, nr);
        let delta_harmonics = take_mut(&mut cache, lm);
        let hessian_delta = take_mut(&mut cache, if fused { channels * lm } else { 0 });
        let delta_mixed = take_mut(&mut cache, mixed_size);
        let hessian_mixed = take_mut(&mut cache, mixed_size);

        // Variation of the coefficient for neighbor j along grad_forces[j]:
        // delta_radial[n] * Y[k] + fc * T[n] * delta_harmonics[k]
        let directional = |j: usize, delta_radial: &mut [f64], delta_harmonics: &mut [f64]| {
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
                delta_radial[n] = value;
            }
            for k in 0..lm {
                let mut value = 0.0;
                for d in 0..3 {
                    value += direction[d] * harmonics_gradients[d][j * lm + k];
                }
                delta_harmonics[k] = value;
            }
        };

        delta_coefficients.fill(0.0);
        let weights = self.weighting.blocks()?;
        for j in 0..nn {
            let species = neighbors.species(j);
            self.weighting.check_species(species)?;

            directional(j, &mut *delta_radial, &mut *delta_harmonics);
            let fc = all_cutoff[j];
            let radial = row(all_radial, j, nr);
            let harmonics = row(all_harmonics, j, lm);
            weights.for_each(species, |block, weight| {
                for n in 0..nr {
                    let a = weight * delta_radial[n];
                    let b = weight * fc * radial[n];
                    let delta_c = row_mut(delta_coefficients, block * nr + n, lm);
                    for k in 0..lm {
                        delta_c[k] += a * harmonics[k] + b * delta_harmonics[k];
                    }
                }
            });
        }
        drop(weights);

        let mixing = match self.mixing {
            Some(ref mixing) => Some(mixing.read()?),
            None => None,
        };
        let (input, delta_input): (&[f64], &[f64]) = match mixing {
            Some(ref mixing) => {
                mixing.mix(delta_coefficients, delta_mixed, lm);
                (mixed, &*delta_mixed)
            }
            None => (coefficients, &*delta_coefficients),
        };

        for channel in 0..self.mixed_channels() {
            self.invariants.directional(
                row(input, channel, lm),
                row(delta_input, channel, lm),
                row_mut(grad_grad_features, channel, size_l),
            );
        }

        let Some(grad_parameters) = grad_parameters else {
            return Ok(());
        };
        if !fused && mixing.is_none() {
            return Ok(());
        }

        // product of the Hessian with respect to the inputs of the invariants
        // with their variation, mapped back to the radial channels if needed
        let (grad_fuse, grad_mixing) = grad_parameters.split_at_mut(self.fuse_parameter_count());
        if let Some(ref mixing) = mixing {
            hessian_mixed.fill(0.0);
            for channel in 0..mixing.weights.nrows() {
                self.invariants.hessian_product(
                    row(mixed, channel, lm),
                    row(grad_features, channel, size_l),
                    row(delta_input, channel, lm),
                    row_mut(hessian_mixed, channel, lm),
                );
            }

            mixing.weights_gradient(grad_mixed, delta_coefficients, lm, grad_mixing);
            mixing.weights_gradient(hessian_mixed, coefficients, lm, grad_mixing);
            if fused {
                mixing.mix_transpose(hessian_mixed, hessian_delta, lm);
            }
        } else {
            hessian_delta.fill(0.0);
            for channel in 0..channels {
                self.invariants.hessian_product(
                    row(coefficients, channel, lm),
                    row(grad_features, channel, size_l),
                    row(delta_coefficients, channel, lm),
                    row_mut(hessian_delta, channel, lm),
                );
            }
        }
        drop(mixing);

        if !fused {
            return Ok(());
        }

        let block_size = nr * lm;
        let fuse_size = self.weighting.fuse_size();
        let first = self.weighting.first_fused_block();
        for j in 0..nn {
            let species = neighbors.species(j);
            directional(j, &mut *delta_radial, &mut *delta_harmonics);
            let fc = all_cutoff[j];
            let radial = row(all_radial, j, nr);
            let harmonics = row(all_harmonics, j, lm);
            let products = row(all_fused, j, block_size);

            for k in 0..fuse_size {
                let block = first + k;
                let mut value = dot(row(hessian_delta, block, block_size), products);
                let grad_c = row(grad_coefficients, block, block_size);
                for n in 0..nr {
                    let grad_c = row(grad_c, n, lm);
                    value += delta_radial[n] * dot(grad_c, harmonics);
                    value += fc * radial[n] * dot(grad_c, delta_harmonics);
                }
                grad_fuse[(species - 1) * fuse_size + k] += value;
            }
        }

        return Ok(());
    }

    #[time_graph::instrument(name = "SphericalChebyshev::eval_grad")]
    fn eval_grad(
        &mut self,
        neighbors: &NeighborList,
        features: &mut [f64],
        jacobian: &mut SparseJacobian,
    ) -> Result<(), Error> {
        let nn = neighbors.len();
        let mut workspace = std::mem::take(&mut self.workspace);
        let (forward_cache, backward_cache) = workspace.prepare(
            self.forward_cache_size(nn, true),
            self.backward_cache_size(nn, true),
        );

        let result = self.forward(neighbors, features, forward_cache, true)
            .and_then(|()| self.jacobian(neighbors, forward_cache, backward_cache, jacobian));

        self.workspace = workspace;
        return result;
    }

    fn parameter_count(&self) -> usize {
        self.fuse_parameter_count() + self.mixing.as_ref().map_or(0, ChannelMixing::parameter_count)
    }

    fn parameters(&self) -> Result<Vec<f64>, Error> {
        self.lifecycle.check_alive("parameters")?;
        let mut parameters = self.weighting.parameters()?;
        if let Some(ref mixing) = self.mixing {
            parameters.extend(mixing.parameters()?);
        }
        return Ok(parameters);
    }

    fn set_parameters(&self, parameters: &[f64]) -> Result<(), Error> {
        self.lifecycle.check_alive("set_parameters")?;
        if parameters.len() != self.parameter_count() {
            return Err(Error::Configuration(format!(
                "expected {} parameters, got {}", self.parameter_count(), parameters.len()
            )));
        }

        let (fuse, post_fuse) = parameters.split_at(self.fuse_parameter_count());
        self.weighting.set_parameters(fuse)?;
        if let Some(ref mixing) = self.mixing {
            mixing.set_parameters(post_fuse)?;
        }
        return Ok(());
    }

    fn init_parameters(&self, rng: &mut dyn rand::RngCore) -> Result<(), Error> {
        self.lifecycle.check_alive("init_parameters")?;
        self.weighting.init_parameters(rng)?;
        if let Some(ref mixing) = self.mixing {
            mixing.init_parameters(rng)?;
        }
        return Ok(());
    }

    fn thread_safe_ref(&self) -> Box<dyn Basis> {
        Box::new(SphericalChebyshev {
            max_radial: self.max_radial,
            max_angular: self.max_angular,
            max_triple: self.max_triple,
            max_quadruple: self.max_quadruple,
            no_radial: self.no_radial,
            kernels: self.kernels.clone(),
            invariants: self.invariants.clone(),
            weighting: self.weighting.clone(),
            mixing: self.mixing.clone(),
            lifecycle: self.lifecycle.for_reference(),
            workspace: Workspace::default(),
            feature_gradient: Vec::new(),
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

        let (post_fuse_size, post_fuse_weight, post_fuse_scale) = match self.mixing {
            Some(ref mixing) => {
                let matrix = mixing.read()?;
                (Some(mixing.size()), Some(matrix.weights.iter().copied().collect()), Some(matrix.scale))
            }
            None => (None, None, None),
        };

        return Ok(BasisDocument::SphericalChebyshev(SphericalChebyshevParameters {
            nmax: self.max_radial,
            lmax: self.max_angular,
            noradial: self.no_radial,
            l3max: self.max_triple,
            l4max: self.max_quadruple,
            rcut: self.rcut(),
            wtype: self.weighting.weight_type(),
            fuse_size: fuse_size,
            fuse_weight: fuse_weight,
            post_fuse: self.mixing.is_some(),
            post_fuse_size: post_fuse_size,
            post_fuse_weight: post_fuse_weight,
            post_fuse_scale: post_fuse_scale,
        }));
    }

    fn workspace(&mut self) -> &mut Workspace {
        &mut self.workspace
    }
}
