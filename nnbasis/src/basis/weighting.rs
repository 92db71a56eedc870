use std::sync::{Arc, RwLock, RwLockReadGuard, RwLockWriteGuard};

use log::warn;
use ndarray::Array2;
use rand::Rng;

use crate::Error;

/// Strategy used to map the species of the neighbors to radial channels
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
#[derive(serde::Serialize, serde::Deserialize)]
#[serde(try_from = "WeightTypeSerde", into = "WeightTypeSerde")]
pub enum WeightType {
    /// all species share a single set of radial channels
    None,
    /// a single set of radial channels for all species, plus one where each
    /// species is weighted by `+species` (odd species) or `-species` (even
    /// species)
    #[default]
    Default,
    /// one set of radial channels per species
    Full,
    /// one set of radial channels per species, plus one shared by all
    /// species
    ExFull,
    /// species are mixed into a given number of channel sets by a learnable
    /// weight matrix
    Fuse,
    /// like `Fuse`, plus one set of radial channels shared by all species
    ExFuse,
}

/// Serde representation of `WeightType`, accepting both the name and the
/// legacy integer code when reading
#[derive(Debug, Clone)]
#[derive(serde::Serialize, serde::Deserialize, schemars::JsonSchema)]
#[serde(untagged)]
pub enum WeightTypeSerde {
    /// one of "none", "default", "full", "exfull", "fuse" or "exfuse"
    Name(String),
    /// legacy integer code: -1, 0, 2, 3, 4 or 6
    Code(i64),
}

impl WeightType {
    /// Get the name of this weight type, as used in documents
    pub fn name(self) -> &'static str {
        match self {
            WeightType::None => "none",
            WeightType::Default => "default",
            WeightType::Full => "full",
            WeightType::ExFull => "exfull",
            WeightType::Fuse => "fuse",
            WeightType::ExFuse => "exfuse",
        }
    }

    /// Get the legacy integer code of this weight type
    pub fn code(self) -> i64 {
        match self {
            WeightType::None => -1,
            WeightType::Default => 0,
            WeightType::Full => 2,
            WeightType::ExFull => 3,
            WeightType::Fuse => 4,
            WeightType::ExFuse => 6,
        }
    }

    /// Parse a weight type from its name
    pub fn from_name(name: &str) -> Result<WeightType, Error> {
        let weight_type = match name {
            "none" => WeightType::None,
            "default" => WeightType::Default,
            "full" => WeightType::Full,
            "exfull" => WeightType::ExFull,
            "fuse" => WeightType::Fuse,
            "exfuse" => WeightType::ExFuse,
            _ => return Err(Error::Configuration(format!("unknown weight type '{}'", name))),
        };
        return Ok(weight_type);
    }

    /// Get a weight type from its legacy integer code
    pub fn from_code(code: i64) -> Result<WeightType, Error> {
        let weight_type = match code {
            -1 => WeightType::None,
            0 => WeightType::Default,
            2 => WeightType::Full,
            3 => WeightType::ExFull,
            4 => WeightType::Fuse,
            6 => WeightType::ExFuse,
            _ => return Err(Error::Configuration(format!("unknown weight type code {}", code))),
        };
        return Ok(weight_type);
    }

    /// Does this weight type use a fuse weight matrix?
    pub fn is_fused(self) -> bool {
        matches!(self, WeightType::Fuse | WeightType::ExFuse)
    }

    /// Weight type effectively used for `species_count` species. With a
    /// single species, all the non-fused types reduce to `None`.
    pub fn effective(self, species_count: usize) -> WeightType {
        if species_count == 1 && matches!(self, WeightType::Default | WeightType::Full | WeightType::ExFull) {
            return WeightType::None;
        }
        return self;
    }

    /// Number of radial channel blocks used by this weight type
    pub fn block_count(self, species_count: usize, fuse_size: usize) -> usize {
        match self.effective(species_count) {
            WeightType::None => 1,
            WeightType::Default => 2,
            WeightType::Full => species_count,
            WeightType::ExFull => species_count + 1,
            WeightType::Fuse => fuse_size,
            WeightType::ExFuse => fuse_size + 1,
        }
    }
}

impl std::fmt::Display for WeightType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.name())
    }
}

impl TryFrom<WeightTypeSerde> for WeightType {
    type Error = Error;

    fn try_from(value: WeightTypeSerde) -> Result<WeightType, Error> {
        match value {
            WeightTypeSerde::Name(name) => WeightType::from_name(&name),
            WeightTypeSerde::Code(code) => WeightType::from_code(code),
        }
    }
}

impl From<WeightType> for WeightTypeSerde {
    fn from(value: WeightType) -> WeightTypeSerde {
        WeightTypeSerde::Name(value.name().into())
    }
}

/// Learnable matrix mixing species into fused channels, with one row per
/// species and one column per fused channel.
///
/// The matrix is shared between all the instances created with
/// `Basis::thread_safe_ref`: updates made through one of them are visible to
/// all the others. Updates must not happen while another instance is
/// evaluating.
#[derive(Debug, Clone)]
pub struct FuseWeight(Arc<RwLock<Array2<f64>>>);

impl FuseWeight {
    pub fn new(matrix: Array2<f64>) -> FuseWeight {
        FuseWeight(Arc::new(RwLock::new(matrix)))
    }

    pub fn read(&self) -> Result<RwLockReadGuard<'_, Array2<f64>>, Error> {
        self.0.read().map_err(|_| Error::State("the fuse weight lock is poisoned".into()))
    }

    pub fn write(&self) -> Result<RwLockWriteGuard<'_, Array2<f64>>, Error> {
        self.0.write().map_err(|_| Error::State("the fuse weight lock is poisoned".into()))
    }

    /// Is `other` referencing the same matrix as `self`?
    pub fn shares_with(&self, other: &FuseWeight) -> bool {
        Arc::ptr_eq(&self.0, &other.0)
    }
}

/// Mapping from neighbor species to radial channel blocks
#[derive(Debug, Clone)]
pub struct SpeciesWeighting {
    weight_type: WeightType,
    effective: WeightType,
    species_count: usize,
    fuse_size: usize,
    block_count: usize,
    fuse: Option<FuseWeight>,
}

impl SpeciesWeighting {
    /// Create a new species weighting. `fuse` must be given (with one row per
    /// species and at least one column) if and only if the weight type is
    /// `Fuse` or `ExFuse`.
    pub fn new(weight_type: WeightType, species_count: usize, fuse: Option<Array2<f64>>) -> Result<SpeciesWeighting, Error> {
        if species_count == 0 {
            return Err(Error::Configuration("the number of species must be positive".into()));
        }

        let fuse_size = if weight_type.is_fused() {
            let matrix = fuse.as_ref().ok_or_else(|| Error::Configuration(format!(
                "a fuse weight matrix is required for '{}' weight type", weight_type
            )))?;
            if matrix.nrows() != species_count {
                return Err(Error::Configuration(format!(
                    "the fuse weight matrix must have one row per species: expected {} rows, got {}",
                    species_count, matrix.nrows()
                )));
            }
            if matrix.ncols() == 0 {
                return Err(Error::Configuration("the fuse weight matrix must have at least one column".into()));
            }
            matrix.ncols()
        } else {
            if fuse.is_some() {
                return Err(Error::Configuration(format!(
                    "a fuse weight matrix can only be used with 'fuse' or 'exfuse' weight types, got '{}'", weight_type
                )));
            }
            0
        };

        return Ok(SpeciesWeighting {
            weight_type: weight_type,
            effective: weight_type.effective(species_count),
            species_count: species_count,
            fuse_size: fuse_size,
            block_count: weight_type.block_count(species_count, fuse_size),
            fuse: fuse.map(FuseWeight::new),
        });
    }

    /// Weight type requested by the user
    pub fn weight_type(&self) -> WeightType {
        self.weight_type
    }

    pub fn species_count(&self) -> usize {
        self.species_count
    }

    /// Number of radial channel blocks
    pub fn block_count(&self) -> usize {
        self.block_count
    }

    /// Number of fused channels (0 if this weighting is not fused)
    pub fn fuse_size(&self) -> usize {
        self.fuse_size
    }

    pub fn fuse_weight(&self) -> Option<&FuseWeight> {
        self.fuse.as_ref()
    }

    /// Does this weighting use a fuse weight matrix?
    pub fn is_fused(&self) -> bool {
        self.fuse.is_some()
    }

    /// Index of the block associated with the first fused channel
    pub fn first_fused_block(&self) -> usize {
        if self.effective == WeightType::ExFuse { 1 } else { 0 }
    }

    /// Check that `species` is a valid (1-based) species index
    #[inline]
    pub fn check_species(&self, species: usize) -> Result<(), Error> {
        if species == 0 || species > self.species_count {
            return Err(Error::Configuration(format!(
                "invalid neighbor species {}, expected a value between 1 and {}",
                species, self.species_count
            )));
        }
        return Ok(());
    }

    /// Acquire the block weights for an evaluation
    pub fn blocks(&self) -> Result<BlockWeights<'_>, Error> {
        let fuse = match self.fuse {
            Some(ref fuse) => Some(fuse.read()?),
            None => None,
        };
        return Ok(BlockWeights {
            weight_type: self.effective,
            first_fused: self.first_fused_block(),
            fuse: fuse,
        });
    }

    /// Get the fuse weights as a flat row-major vector
    pub fn parameters(&self) -> Result<Vec<f64>, Error> {
        match self.fuse {
            Some(ref fuse) => Ok(fuse.read()?.iter().copied().collect()),
            None => Ok(Vec::new()),
        }
    }

    /// Set the fuse weights from a flat row-major slice
    pub fn set_parameters(&self, parameters: &[f64]) -> Result<(), Error> {
        let count = self.species_count * self.fuse_size;
        if parameters.len() != count {
            return Err(Error::Configuration(format!(
                "expected {} parameters, got {}", count, parameters.len()
            )));
        }
        if let Some(ref fuse) = self.fuse {
            let mut matrix = fuse.write()?;
            for (value, &new) in matrix.iter_mut().zip(parameters) {
                *value = new;
            }
        }
        return Ok(());
    }

    /// Initialize the fuse weights with random values in `[-1, 1]`. With
    /// more than one species, each column is then scaled to have a mean
    /// absolute value of 1.
    pub fn init_parameters(&self, rng: &mut dyn rand::RngCore) -> Result<(), Error> {
        let Some(ref fuse) = self.fuse else {
            return Ok(());
        };

        let mut matrix = fuse.write()?;
        matrix.mapv_inplace(|_| rng.gen_range(-1.0..=1.0));
        if self.species_count > 1 {
            for mut column in matrix.columns_mut() {
                let norm = column.iter().map(|v| v.abs()).sum::<f64>() / self.species_count as f64;
                if norm > 0.0 {
                    column /= norm;
                } else {
                    warn!("all fuse weights in a column are zero, skipping normalization");
                }
            }
        }
        return Ok(());
    }
}

/// Learnable mixing weights and scale of the channel mixing
#[derive(Debug, Clone, PartialEq)]
pub struct MixingMatrix {
    /// one row per mixed channel, one column per radial channel
    pub weights: Array2<f64>,
    /// global factor applied to all the mixed channels
    pub scale: f64,
}

impl MixingMatrix {
    /// Weight of `channel` in the `mixed` channel, including the scale
    #[inline]
    pub fn weight(&self, mixed: usize, channel: usize) -> f64 {
        self.scale * self.weights[[mixed, channel]]
    }

    /// Mix the rows of `input` (one per radial channel, each with `width`
    /// values) into the rows of `output` (one per mixed channel)
    pub fn mix(&self, input: &[f64], output: &mut [f64], width: usize) {
        output.fill(0.0);
        for (mixed, weights) in self.weights.rows().into_iter().enumerate() {
            let output = &mut output[mixed * width..(mixed + 1) * width];
            for (channel, &weight) in weights.iter().enumerate() {
                let factor = self.scale * weight;
                let input = &input[channel * width..(channel + 1) * width];
                for (o, i) in output.iter_mut().zip(input) {
                    *o += factor * i;
                }
            }
        }
    }

    /// Transposed operation of `mix`: map the rows of `input` (one per mixed
    /// channel) back to the rows of `output` (one per radial channel)
    pub fn mix_transpose(&self, input: &[f64], output: &mut [f64], width: usize) {
        output.fill(0.0);
        for (mixed, weights) in self.weights.rows().into_iter().enumerate() {
            let input = &input[mixed * width..(mixed + 1) * width];
            for (channel, &weight) in weights.iter().enumerate() {
                let factor = self.scale * weight;
                let output = &mut output[channel * width..(channel + 1) * width];
                for (o, i) in output.iter_mut().zip(input) {
                    *o += factor * i;
                }
            }
        }
    }

    /// Accumulate in `grad_weights` (flat, row-major) the gradient with
    /// respect to the weights of `Σ grad_output · mix(input)`
    pub fn weights_gradient(&self, grad_output: &[f64], input: &[f64], width: usize, grad_weights: &mut [f64]) {
        let channels = self.weights.ncols();
        for mixed in 0..self.weights.nrows() {
            let grad_output = &grad_output[mixed * width..(mixed + 1) * width];
            for channel in 0..channels {
                let input = &input[channel * width..(channel + 1) * width];
                let value = grad_output.iter().zip(input).map(|(g, i)| g * i).sum::<f64>();
                grad_weights[mixed * channels + channel] += self.scale * value;
            }
        }
    }
}

/// Linear mixing of all the radial channels into a smaller set of channels,
/// applied to the expansion coefficients before computing the invariants.
///
/// Like `FuseWeight`, the weights are shared between all the instances
/// created with `Basis::thread_safe_ref`.
#[derive(Debug, Clone)]
pub struct ChannelMixing {
    size: usize,
    channels: usize,
    matrix: Arc<RwLock<MixingMatrix>>,
}

impl ChannelMixing {
    /// Create a new mixing from the `weights` (one row per mixed channel, one
    /// column per radial channel) and `scale`
    pub fn new(weights: Array2<f64>, scale: f64) -> Result<ChannelMixing, Error> {
        if weights.nrows() == 0 || weights.ncols() == 0 {
            return Err(Error::Configuration("the post fuse weights can not be empty".into()));
        }
        if !scale.is_finite() {
            return Err(Error::Configuration(format!("invalid post fuse scale {}", scale)));
        }

        return Ok(ChannelMixing {
            size: weights.nrows(),
            channels: weights.ncols(),
            matrix: Arc::new(RwLock::new(MixingMatrix { weights, scale })),
        });
    }

    /// Number of mixed channels
    pub fn size(&self) -> usize {
        self.size
    }

    /// Number of radial channels taken as input
    pub fn channels(&self) -> usize {
        self.channels
    }

    pub fn parameter_count(&self) -> usize {
        self.size * self.channels
    }

    pub fn read(&self) -> Result<RwLockReadGuard<'_, MixingMatrix>, Error> {
        self.matrix.read().map_err(|_| Error::State("the post fuse weight lock is poisoned".into()))
    }

    fn write(&self) -> Result<RwLockWriteGuard<'_, MixingMatrix>, Error> {
        self.matrix.write().map_err(|_| Error::State("the post fuse weight lock is poisoned".into()))
    }

    /// Get the mixing weights as a flat row-major vector
    pub fn parameters(&self) -> Result<Vec<f64>, Error> {
        Ok(self.read()?.weights.iter().copied().collect())
    }

    /// Set the mixing weights from a flat row-major slice
    pub fn set_parameters(&self, parameters: &[f64]) -> Result<(), Error> {
        if parameters.len() != self.parameter_count() {
            return Err(Error::Configuration(format!(
                "expected {} post fuse parameters, got {}", self.parameter_count(), parameters.len()
            )));
        }
        let mut matrix = self.write()?;
        for (value, &new) in matrix.weights.iter_mut().zip(parameters) {
            *value = new;
        }
        return Ok(());
    }

    /// Initialize the weights with random values in `[-1, 1]`, scaling each
    /// row to a mean absolute value of 1. The scale is reset to
    /// `sqrt(1 / channels)`.
    pub fn init_parameters(&self, rng: &mut dyn rand::RngCore) -> Result<(), Error> {
        let channels = self.channels as f64;
        let mut matrix = self.write()?;
        matrix.weights.mapv_inplace(|_| rng.gen_range(-1.0..=1.0));
        for mut row in matrix.weights.rows_mut() {
            let norm = row.iter().map(|v| v.abs()).sum::<f64>() / channels;
            if norm > 0.0 {
                row /= norm;
            } else {
                warn!("all post fuse weights in a row are zero, skipping normalization");
            }
        }
        matrix.scale = f64::sqrt(1.0 / channels);
        return Ok(());
    }

    /// Is `other` referencing the same weights as `self`?
    pub fn shares_with(&self, other: &ChannelMixing) -> bool {
        Arc::ptr_eq(&self.matrix, &other.matrix)
    }
}

/// Weights of all radial channel blocks for the neighbors, valid during an
/// evaluation
pub struct BlockWeights<'a> {
    weight_type: WeightType,
    first_fused: usize,
    fuse: Option<RwLockReadGuard<'a, Array2<f64>>>,
}

impl BlockWeights<'_> {
    /// Call `callback(block, weight)` for every radial channel block the
    /// neighbors with the given (1-based) species contribute to.
    #[inline]
    pub fn for_each(&self, species: usize, mut callback: impl FnMut(usize, f64)) {
        match self.weight_type {
            WeightType::None => callback(0, 1.0),
            WeightType::Default => {
                callback(0, 1.0);
                let weight = if species % 2 == 1 { species as f64 } else { -(species as f64) };
                callback(1, weight);
            }
            WeightType::Full => callback(species - 1, 1.0),
            WeightType::ExFull => {
                callback(0, 1.0);
                callback(species, 1.0);
            }
            WeightType::Fuse | WeightType::ExFuse => {
                if self.first_fused == 1 {
                    callback(0, 1.0);
                }
                if let Some(ref fuse) = self.fuse {
                    for (k, &weight) in fuse.row(species - 1).iter().enumerate() {
                        callback(self.first_fused + k, weight);
                    }
                }
            }
        }
    }

    /// Weight of the fused channel `k` for the given (1-based) species
    #[inline]
    pub fn fused(&self, species: usize, k: usize) -> f64 {
        match self.fuse {
            Some(ref fuse) => fuse[[species - 1, k]],
            None => 0.0,
        }
    }
}

#[cfg(test)]
mod tests {
    use approx::assert_relative_eq;
    use ndarray::array;
    use rand::SeedableRng;

    use super::*;

    fn collect(weighting: &SpeciesWeighting, species: usize) -> Vec<(usize, f64)> {
        let mut result = Vec::new();
        weighting.blocks().unwrap().for_each(species, |block, weight| result.push((block, weight)));
        return result;
    }

    #[test]
    fn block_counts() {
        assert_eq!(WeightType::None.block_count(3, 0), 1);
        assert_eq!(WeightType::Default.block_count(3, 0), 2);
        assert_eq!(WeightType::Default.block_count(1, 0), 1);
        assert_eq!(WeightType::Full.block_count(3, 0), 3);
        assert_eq!(WeightType::Full.block_count(1, 0), 1);
        assert_eq!(WeightType::ExFull.block_count(3, 0), 4);
        assert_eq!(WeightType::ExFull.block_count(1, 0), 1);
        assert_eq!(WeightType::Fuse.block_count(3, 5), 5);
        assert_eq!(WeightType::ExFuse.block_count(3, 5), 6);
        assert_eq!(WeightType::ExFuse.block_count(1, 2), 3);
    }

    #[test]
    fn contributions() {
        let weighting = SpeciesWeighting::new(WeightType::Default, 3, None).unwrap();
        assert_eq!(collect(&weighting, 1), [(0, 1.0), (1, 1.0)]);
        assert_eq!(collect(&weighting, 2), [(0, 1.0), (1, -2.0)]);
        assert_eq!(collect(&weighting, 3), [(0, 1.0), (1, 3.0)]);

        let weighting = SpeciesWeighting::new(WeightType::Full, 3, None).unwrap();
        assert_eq!(collect(&weighting, 2), [(1, 1.0)]);

        let weighting = SpeciesWeighting::new(WeightType::ExFull, 3, None).unwrap();
        assert_eq!(collect(&weighting, 2), [(0, 1.0), (2, 1.0)]);

        let weighting = SpeciesWeighting::new(WeightType::ExFull, 1, None).unwrap();
        assert_eq!(collect(&weighting, 1), [(0, 1.0)]);

        let matrix = array![[0.5, -1.0], [2.0, 0.25]];
        let weighting = SpeciesWeighting::new(WeightType::Fuse, 2, Some(matrix.clone())).unwrap();
        assert_eq!(collect(&weighting, 2), [(0, 2.0), (1, 0.25)]);

        let weighting = SpeciesWeighting::new(WeightType::ExFuse, 2, Some(matrix)).unwrap();
        assert_eq!(collect(&weighting, 1), [(0, 1.0), (1, 0.5), (2, -1.0)]);
    }

    #[test]
    fn invalid_fuse_weights() {
        assert!(SpeciesWeighting::new(WeightType::Fuse, 2, None).is_err());
        assert!(SpeciesWeighting::new(WeightType::Fuse, 2, Some(Array2::zeros((3, 2)))).is_err());
        assert!(SpeciesWeighting::new(WeightType::ExFuse, 2, Some(Array2::zeros((2, 0)))).is_err());
        assert!(SpeciesWeighting::new(WeightType::Full, 2, Some(Array2::zeros((2, 2)))).is_err());
        assert!(SpeciesWeighting::new(WeightType::None, 0, None).is_err());
    }

    #[test]
    fn species_range() {
        let weighting = SpeciesWeighting::new(WeightType::Full, 2, None).unwrap();
        assert!(weighting.check_species(1).is_ok());
        assert!(weighting.check_species(2).is_ok());
        assert!(weighting.check_species(0).is_err());
        assert!(weighting.check_species(3).is_err());
    }

    #[test]
    fn parameters() {
        let weighting = SpeciesWeighting::new(WeightType::Fuse, 3, Some(Array2::zeros((3, 2)))).unwrap();
        weighting.set_parameters(&[1.0, 2.0, 3.0, 4.0, 5.0, 6.0]).unwrap();
        assert_eq!(weighting.parameters().unwrap(), [1.0, 2.0, 3.0, 4.0, 5.0, 6.0]);
        assert_eq!(weighting.blocks().unwrap().fused(2, 1), 4.0);
        assert!(weighting.set_parameters(&[1.0]).is_err());

        let mut rng = rand::rngs::StdRng::seed_from_u64(42);
        weighting.init_parameters(&mut rng).unwrap();
        let matrix = weighting.fuse_weight().unwrap().read().unwrap().clone();
        for column in matrix.columns() {
            let mean = column.iter().map(|v| v.abs()).sum::<f64>() / 3.0;
            assert_relative_eq!(mean, 1.0, max_relative=1e-12);
        }

        let shared = weighting.clone();
        shared.set_parameters(&[0.0; 6]).unwrap();
        assert_eq!(weighting.parameters().unwrap(), [0.0; 6]);
    }

    #[test]
    fn channel_mixing() {
        let mixing = ChannelMixing::new(array![[1.0, 0.0, 2.0], [0.5, -1.0, 0.0]], 2.0).unwrap();
        assert_eq!(mixing.size(), 2);
        assert_eq!(mixing.channels(), 3);
        assert_eq!(mixing.parameter_count(), 6);

        // three channels with two values each
        let input = [1.0, 2.0, 3.0, 4.0, 5.0, 6.0];
        let mut output = [0.0; 4];
        mixing.read().unwrap().mix(&input, &mut output, 2);
        assert_eq!(output, [22.0, 28.0, -5.0, -6.0]);

        // Σ g · mix(x) == Σ mix_transpose(g) · x
        let grad = [0.5, -1.0, 2.0, 0.25];
        let mut transposed = [0.0; 6];
        mixing.read().unwrap().mix_transpose(&grad, &mut transposed, 2);
        let lhs = grad.iter().zip(&output).map(|(a, b)| a * b).sum::<f64>();
        let rhs = transposed.iter().zip(&input).map(|(a, b)| a * b).sum::<f64>();
        assert_relative_eq!(lhs, rhs, max_relative=1e-14);

        // the output is linear in the weights
        let mut grad_weights = [0.0; 6];
        mixing.read().unwrap().weights_gradient(&grad, &input, 2, &mut grad_weights);
        let along = grad_weights.iter().zip(mixing.parameters().unwrap()).map(|(a, b)| a * b).sum::<f64>();
        assert_relative_eq!(along, lhs, max_relative=1e-14);

        assert!(mixing.set_parameters(&[1.0; 5]).is_err());
        let shared = mixing.clone();
        shared.set_parameters(&[0.0, 1.0, 2.0, 3.0, 4.0, 5.0]).unwrap();
        assert!(shared.shares_with(&mixing));
        assert_eq!(mixing.parameters().unwrap(), [0.0, 1.0, 2.0, 3.0, 4.0, 5.0]);

        let mut rng = rand::rngs::StdRng::seed_from_u64(12);
        mixing.init_parameters(&mut rng).unwrap();
        let matrix = mixing.read().unwrap().clone();
        assert_relative_eq!(matrix.scale, f64::sqrt(1.0 / 3.0), max_relative=1e-14);
        for row in matrix.weights.rows() {
            let mean = row.iter().map(|v| v.abs()).sum::<f64>() / 3.0;
            assert_relative_eq!(mean, 1.0, max_relative=1e-12);
        }

        assert!(ChannelMixing::new(Array2::zeros((0, 3)), 1.0).is_err());
        assert!(ChannelMixing::new(Array2::zeros((2, 3)), f64::NAN).is_err());
    }

    #[test]
    fn serialization() {
        let weight_type: WeightType = serde_json::from_str("\"exfuse\"").unwrap();
        assert_eq!(weight_type, WeightType::ExFuse);
        let weight_type: WeightType = serde_json::from_str("3").unwrap();
        assert_eq!(weight_type, WeightType::ExFull);
        let weight_type: WeightType = serde_json::from_str("-1").unwrap();
        assert_eq!(weight_type, WeightType::None);
        assert_eq!(serde_json::to_string(&WeightType::Full).unwrap(), "\"full\"");

        assert!(serde_json::from_str::<WeightType>("\"bad\"").is_err());
        assert!(serde_json::from_str::<WeightType>("1").is_err());
    }
}
