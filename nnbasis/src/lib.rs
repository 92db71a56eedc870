#![warn(clippy::all, clippy::pedantic)]

// disable some style lints
#![allow(clippy::needless_return, clippy::must_use_candidate, clippy::comparison_chain)]
#![allow(clippy::redundant_field_names, clippy::redundant_closure_for_method_calls)]
#![allow(clippy::unreadable_literal, clippy::option_if_let_else, clippy::range_plus_one)]
#![allow(clippy::missing_errors_doc, clippy::missing_panics_doc, clippy::module_name_repetitions)]
#![allow(clippy::too_many_arguments, clippy::similar_names, clippy::many_single_char_names)]

#![allow(clippy::cast_possible_truncation, clippy::cast_precision_loss)]
#![allow(clippy::cast_possible_wrap, clippy::cast_lossless, clippy::cast_sign_loss)]
#![allow(clippy::default_trait_access)]

// Tests lints
#![cfg_attr(test, allow(clippy::float_cmp))]

//! Per-atom descriptors for machine-learned interatomic potentials.
//!
//! The descriptors are built from the expansion of the density of neighbors
//! around a central atom on Chebyshev polynomials and real spherical
//! harmonics, reduced to rotation-invariant features. All the basis
//! implement the [`Basis`] trait, which provides the features and their
//! derivatives (with respect to the neighbors positions and to the learnable
//! parameters) using caller-provided scratch memory.

mod errors;
pub use self::errors::Error;

pub mod math;

mod neighbors;
pub use self::neighbors::{NeighborList, NeighborSource};

pub mod basis;
pub use self::basis::{Basis, BasisKind, BasisDocument, SparseJacobian};
pub use self::basis::{SphericalChebyshev, Chebyshev, Merge, Mirror, Shared};
pub use self::basis::{SphericalChebyshevParameters, ChebyshevParameters, WeightType};

mod basis_set;
pub use self::basis_set::BasisSet;

pub mod batch;
