use log::warn;
use ndarray::Array2;
use serde::{Deserialize, Serialize};

use crate::Error;
use super::{WeightType, WeightTypeSerde};

fn default_max_radial() -> usize { 5 }
fn default_max_angular() -> usize { 6 }
fn default_cutoff() -> f64 { 6.0 }

#[allow(clippy::trivially_copy_pass_by_ref)]
fn is_false(value: &bool) -> bool { !value }

/// Hyper-parameters of the `SphericalChebyshev` basis
#[derive(Debug, Clone, PartialEq)]
#[derive(Serialize, Deserialize, schemars::JsonSchema)]
pub struct SphericalChebyshevParameters {
    /// maximal order of the Chebyshev polynomials
    #[serde(default = "default_max_radial")]
    pub nmax: usize,
    /// maximal order of the spherical harmonics
    #[serde(default = "default_max_angular")]
    pub lmax: usize,
    /// do not include the `l = 0` order-2 invariants
    #[serde(default, skip_serializing_if = "is_false")]
    pub noradial: bool,
    /// maximal angular order used by the order-3 invariants, 0 to disable
    /// them
    #[serde(default)]
    pub l3max: usize,
    /// maximal angular order used by the order-4 invariants, 0 to disable
    /// them
    #[serde(default)]
    pub l4max: usize,
    /// cutoff radius
    #[serde(default = "default_cutoff")]
    pub rcut: f64,
    /// how to map neighbor species to radial channels
    #[serde(default)]
    #[schemars(with = "WeightTypeSerde")]
    pub wtype: WeightType,
    /// number of fused channels, for the `fuse` and `exfuse` weight types
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub fuse_size: Option<usize>,
    /// fuse weight matrix, for the `fuse` and `exfuse` weight types. This
    /// contains one array per species if `fuse_size` is given, and one array
    /// per fused channel otherwise.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub fuse_weight: Option<Vec<Vec<f64>>>,
    /// mix all the radial channels into `post_fuse_size` channels before
    /// computing the invariants
    #[serde(default)]
    pub post_fuse: bool,
    /// number of mixed channels, for `post_fuse`
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub post_fuse_size: Option<usize>,
    /// flat row-major mixing weights, with one row per mixed channel
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub post_fuse_weight: Option<Vec<f64>>,
    /// global factor applied to the mixed channels, 1 by default
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub post_fuse_scale: Option<f64>,
}

impl Default for SphericalChebyshevParameters {
    fn default() -> Self {
        SphericalChebyshevParameters {
            nmax: default_max_radial(),
            lmax: default_max_angular(),
            noradial: false,
            l3max: 0,
            l4max: 0,
            rcut: default_cutoff(),
            wtype: WeightType::Default,
            fuse_size: None,
            fuse_weight: None,
            post_fuse: false,
            post_fuse_size: None,
            post_fuse_weight: None,
            post_fuse_scale: None,
        }
    }
}

/// Hyper-parameters of the `Chebyshev` basis
#[derive(Debug, Clone, PartialEq)]
#[derive(Serialize, Deserialize, schemars::JsonSchema)]
pub struct ChebyshevParameters {
    /// maximal order of the Chebyshev polynomials
    #[serde(default = "default_max_radial")]
    pub nmax: usize,
    /// cutoff radius
    #[serde(default = "default_cutoff")]
    pub rcut: f64,
    /// how to map neighbor species to radial channels
    #[serde(default)]
    #[schemars(with = "WeightTypeSerde")]
    pub wtype: WeightType,
    /// number of fused channels, for the `fuse` and `exfuse` weight types
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub fuse_size: Option<usize>,
    /// fuse weight matrix, see `SphericalChebyshevParameters::fuse_weight`
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub fuse_weight: Option<Vec<Vec<f64>>>,
}

impl Default for ChebyshevParameters {
    fn default() -> Self {
        ChebyshevParameters {
            nmax: default_max_radial(),
            rcut: default_cutoff(),
            wtype: WeightType::Default,
            fuse_size: None,
            fuse_weight: None,
        }
    }
}

/// Persisted description of a basis, tagged by its `"type"`
#[derive(Debug, Clone, PartialEq)]
#[derive(Serialize, Deserialize, schemars::JsonSchema)]
#[serde(tag = "type")]
pub enum BasisDocument {
    #[serde(rename = "spherical_chebyshev")]
    SphericalChebyshev(SphericalChebyshevParameters),
    #[serde(rename = "chebyshev")]
    Chebyshev(ChebyshevParameters),
    /// concatenation of the features of multiple basis
    #[serde(rename = "merge")]
    Merge {
        basis: Vec<BasisDocument>,
    },
    /// use the basis of another species, exchanging the two species
    #[serde(rename = "mirror")]
    Mirror {
        mirror: usize,
    },
    /// use the same basis as another species
    #[serde(rename = "share")]
    Share {
        share: usize,
    },
}

const DEFAULT_TYPE: &str = "spherical_chebyshev";

const SPHERICAL_CHEBYSHEV_KEYS: &[&str] = &[
    "type", "nmax", "lmax", "noradial", "l3max", "l4max", "rcut", "wtype", "fuse_size", "fuse_weight",
    "post_fuse", "post_fuse_size", "post_fuse_weight", "post_fuse_scale",
];
const CHEBYSHEV_KEYS: &[&str] = &["type", "nmax", "rcut", "wtype", "fuse_size", "fuse_weight"];
const MERGE_KEYS: &[&str] = &["type", "basis"];
const MIRROR_KEYS: &[&str] = &["type", "mirror"];
const SHARE_KEYS: &[&str] = &["type", "share"];

/// Keys of older documents which are only accepted with a single value,
/// given as JSON text
const SPHERICAL_CHEBYSHEV_FIXED: &[(&str, &str)] = &[
    ("l3cross", "true"),
    ("l4cross", "true"),
    ("fuse_style", "\"limited\""),
];
const CHEBYSHEV_FIXED: &[(&str, &str)] = &[("fuse_style", "\"limited\"")];
const NO_FIXED: &[(&str, &str)] = &[];

/// Keys of older documents for features which are no longer supported
const REMOVED_KEYS: &[&str] = &["rfunc_scales", "system_scales"];

/// Add the default `"type"` to documents without one, including inside
/// merged basis
fn normalize(value: &mut serde_json::Value) {
    if let serde_json::Value::Object(map) = value {
        map.entry("type").or_insert_with(|| DEFAULT_TYPE.into());
        if map.get("type").and_then(serde_json::Value::as_str) == Some("merge") {
            if let Some(serde_json::Value::Array(basis)) = map.get_mut("basis") {
                for value in basis {
                    normalize(value);
                }
            }
        }
    }
}

/// Check that all the keys in `value` are known, removing the keys of older
/// documents which are only accepted with their default value
fn check_keys(value: &mut serde_json::Value) -> Result<(), Error> {
    let serde_json::Value::Object(map) = value else {
        return Ok(());
    };

    let kind = map.get("type").and_then(serde_json::Value::as_str).map(str::to_owned);
    let (known, fixed) = match kind.as_deref() {
        Some("spherical_chebyshev") => (SPHERICAL_CHEBYSHEV_KEYS, SPHERICAL_CHEBYSHEV_FIXED),
        Some("chebyshev") => (CHEBYSHEV_KEYS, CHEBYSHEV_FIXED),
        Some("merge") => {
            if let Some(serde_json::Value::Array(basis)) = map.get_mut("basis") {
                for value in basis {
                    check_keys(value)?;
                }
            }
            (MERGE_KEYS, NO_FIXED)
        }
        Some("mirror") => (MIRROR_KEYS, NO_FIXED),
        Some("share") => (SHARE_KEYS, NO_FIXED),
        // unknown types are reported when deserializing
        _ => return Ok(()),
    };

    for &(key, expected) in fixed {
        if let Some(actual) = map.remove(key) {
            if actual.to_string() != expected {
                return Err(Error::Configuration(format!(
                    "'{}' must be {} if present, got {}", key, expected, actual
                )));
            }
        }
    }

    for key in map.keys() {
        if REMOVED_KEYS.contains(&key.as_str()) {
            return Err(Error::Configuration(format!("'{}' is no longer supported", key)));
        }
        if !known.contains(&key.as_str()) {
            return Err(Error::Configuration(format!("unknown key '{}' in basis document", key)));
        }
    }

    return Ok(());
}

impl BasisDocument {
    /// Load a document from a JSON value. Documents without `"type"` are
    /// `spherical_chebyshev` basis.
    ///
    /// Unknown keys are rejected. The `l3cross`, `l4cross` and `fuse_style`
    /// keys of older documents are accepted with their only supported value
    /// (respectively `true`, `true` and `"limited"`).
    pub fn from_json(mut value: serde_json::Value) -> Result<BasisDocument, Error> {
        normalize(&mut value);
        check_keys(&mut value)?;
        return Ok(serde_json::from_value(value)?);
    }

    /// Load a document from a JSON string
    pub fn from_json_str(json: &str) -> Result<BasisDocument, Error> {
        let value = serde_json::from_str(json)?;
        return BasisDocument::from_json(value);
    }

    /// Convert this document to a JSON value
    pub fn to_json(&self) -> Result<serde_json::Value, Error> {
        return Ok(serde_json::to_value(self)?);
    }
}

/// Get the fuse weight matrix (with one row per species) from the values in
/// a document.
pub(crate) fn load_fuse_matrix(
    weight_type: WeightType,
    species_count: usize,
    fuse_size: Option<usize>,
    fuse_weight: Option<&Vec<Vec<f64>>>,
) -> Result<Option<Array2<f64>>, Error> {
    if !weight_type.is_fused() {
        if fuse_size.is_some() || fuse_weight.is_some() {
            warn!("ignoring fuse weights for '{}' weight type", weight_type);
        }
        return Ok(None);
    }

    match (fuse_size, fuse_weight) {
        (None, None) => Err(Error::Configuration(format!(
            "one of 'fuse_weight' or 'fuse_size' is required for '{}' weight type", weight_type
        ))),
        (Some(fuse_size), None) => Ok(Some(Array2::zeros((species_count, fuse_size)))),
        (Some(fuse_size), Some(rows)) => {
            let matrix = matrix_from_rows(rows)?;
            if matrix.ncols() != fuse_size {
                return Err(Error::Configuration(format!(
                    "'fuse_weight' has {} columns, but 'fuse_size' is {}", matrix.ncols(), fuse_size
                )));
            }
            Ok(Some(matrix))
        }
        // legacy documents store the matrix by columns
        (None, Some(columns)) => Ok(Some(matrix_from_rows(columns)?.reversed_axes())),
    }
}

fn matrix_from_rows(rows: &[Vec<f64>]) -> Result<Array2<f64>, Error> {
    let ncols = rows.first().map_or(0, Vec::len);
    if rows.iter().any(|row| row.len() != ncols) {
        return Err(Error::Configuration("all the rows of 'fuse_weight' must have the same size".into()));
    }

    let data = rows.iter().flatten().copied().collect::<Vec<_>>();
    return Array2::from_shape_vec((rows.len(), ncols), data).map_err(|e| Error::Configuration(format!(
        "invalid 'fuse_weight': {}", e
    )));
}

/// Get the `fuse_size` and `fuse_weight` entries of a document
pub(crate) fn save_fuse_matrix(matrix: Option<&Array2<f64>>) -> (Option<usize>, Option<Vec<Vec<f64>>>) {
    match matrix {
        Some(matrix) => (
            Some(matrix.ncols()),
            Some(matrix.rows().into_iter().map(|row| row.to_vec()).collect()),
        ),
        None => (None, None),
    }
}

/// Get the post fuse weights (with one row per mixed channel and one column
/// per radial channel) and scale from the values in a document
pub(crate) fn load_post_fuse(
    parameters: &SphericalChebyshevParameters,
    channels: usize,
) -> Result<Option<(Array2<f64>, f64)>, Error> {
    if !parameters.post_fuse {
        if parameters.post_fuse_size.is_some() || parameters.post_fuse_weight.is_some() {
            warn!("ignoring post fuse weights since 'post_fuse' is false");
        }
        return Ok(None);
    }

    let scale = parameters.post_fuse_scale.unwrap_or(1.0);
    let weights = match (parameters.post_fuse_size, &parameters.post_fuse_weight) {
        (None, None) => return Err(Error::Configuration(
            "one of 'post_fuse_weight' or 'post_fuse_size' is required for 'post_fuse'".into()
        )),
        (Some(size), None) => Array2::zeros((size, channels)),
        (size, Some(weights)) => {
            let expected = size.unwrap_or(weights.len() / channels) * channels;
            if weights.len() != expected || weights.is_empty() {
                return Err(Error::Configuration(format!(
                    "'post_fuse_weight' must contain {} values per mixed channel{}, got {} values",
                    channels,
                    size.map(|size| format!(" for {} mixed channels", size)).unwrap_or_default(),
                    weights.len(),
                )));
            }
            Array2::from_shape_vec((weights.len() / channels, channels), weights.clone())
                .map_err(|e| Error::Configuration(format!("invalid 'post_fuse_weight': {}", e)))?
        }
    };

    return Ok(Some((weights, scale)));
}
