mod cutoff;
pub use self::cutoff::SmoothCutoff;

mod chebyshev;
pub use self::chebyshev::{ChebyshevRadial, chebyshev_first_kind, chebyshev_second_kind};

mod spherical_harmonics;
pub use self::spherical_harmonics::{SphericalHarmonics, SphericalHarmonicsArray};
pub use self::spherical_harmonics::{lm_index, spherical_harmonics_count};

mod wigner;
pub use self::wigner::{wigner_3j, triple_couplings, TripleCoupling, CouplingTerm};
pub use self::wigner::{quadruple_couplings, QuadrupleCoupling, QuadrupleTerm};
pub use self::wigner::{MAX_TRIPLE_ANGULAR, TRIPLE_COUPLING_COUNTS, MAX_QUADRUPLE_ANGULAR, QUADRUPLE_COUPLING_COUNTS};
