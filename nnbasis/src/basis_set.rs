use indexmap::IndexSet;
use log::debug;

use crate::Error;
use crate::basis::{Basis, BasisKind, BasisDocument, Mirror, Shared, build_basis};

/// The basis used for the atoms of every species of a model, indexed by the
/// (1-based) species of the central atom.
///
/// Species can optionally be named with chemical symbols. `mirror` and
/// `share` documents are resolved against the basis of the other species,
/// sharing their parameters.
pub struct BasisSet {
    symbols: IndexSet<String>,
    basis: Vec<Box<dyn Basis>>,
}

impl std::fmt::Debug for BasisSet {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BasisSet")
            .field("symbols", &self.symbols)
            .field("basis", &self.basis.iter().map(|b| b.kind()).collect::<Vec<_>>())
            .finish()
    }
}

/// Get the basis referenced by a mirror or share document
fn referenced<'a>(
    basis: &'a [Option<Box<dyn Basis>>],
    documents: &[BasisDocument],
    species: usize,
    reference: usize,
) -> Result<&'a dyn Basis, Error> {
    if reference == 0 || reference > documents.len() {
        return Err(Error::Configuration(format!(
            "species {} references the basis of species {}, which does not exist", species, reference
        )));
    }
    if reference == species {
        return Err(Error::Configuration(format!(
            "the basis of species {} can not reference itself", species
        )));
    }
    return basis[reference - 1].as_deref().ok_or_else(|| Error::Configuration(format!(
        "species {} references the basis of species {}, which is not a concrete basis",
        species, reference
    )));
}

impl BasisSet {
    /// Create the basis for all species, the document at index `i` giving
    /// the basis of species `i + 1`
    pub fn new(documents: &[BasisDocument]) -> Result<BasisSet, Error> {
        let species_count = documents.len();
        if species_count == 0 {
            return Err(Error::Configuration("a basis set needs at least one species".into()));
        }

        let mut basis = Vec::with_capacity(species_count);
        for document in documents {
            match document {
                BasisDocument::Mirror { .. } | BasisDocument::Share { .. } => basis.push(None),
                document => basis.push(Some(build_basis(species_count, document)?)),
            }
        }

        // mirrors first, since a shared basis can reference a mirror
        for (i, document) in documents.iter().enumerate() {
            if let &BasisDocument::Mirror { mirror } = document {
                let species = i + 1;
                let reference = referenced(&basis, documents, species, mirror)?;
                let mirrored = Mirror::new(reference.thread_safe_ref(), mirror, species)?;
                basis[i] = Some(Box::new(mirrored));
            }
        }

        for (i, document) in documents.iter().enumerate() {
            if let &BasisDocument::Share { share } = document {
                let species = i + 1;
                let reference = referenced(&basis, documents, species, share)?;
                let shared = Shared::new(reference.thread_safe_ref(), share)?;
                basis[i] = Some(Box::new(shared));
            }
        }

        let basis = basis.into_iter().flatten().collect::<Vec<_>>();
        debug_assert_eq!(basis.len(), species_count);
        debug!("created basis set for {} species", species_count);

        return Ok(BasisSet {
            symbols: IndexSet::new(),
            basis: basis,
        });
    }

    /// Create the basis for all species, naming the species with the given
    /// `symbols`
    pub fn with_symbols(symbols: &[&str], documents: &[BasisDocument]) -> Result<BasisSet, Error> {
        if symbols.len() != documents.len() {
            return Err(Error::Configuration(format!(
                "got {} symbols for {} basis", symbols.len(), documents.len()
            )));
        }

        let mut set = BasisSet::new(documents)?;
        for &symbol in symbols {
            if !set.symbols.insert(symbol.to_owned()) {
                return Err(Error::Configuration(format!("duplicated species symbol '{}'", symbol)));
            }
        }
        return Ok(set);
    }

    /// Load a basis set from a JSON array of documents
    pub fn from_json(value: serde_json::Value) -> Result<BasisSet, Error> {
        let serde_json::Value::Array(values) = value else {
            return Err(Error::Configuration("a basis set must be stored as a JSON array".into()));
        };
        let documents = values.into_iter()
            .map(BasisDocument::from_json)
            .collect::<Result<Vec<_>, _>>()?;
        return BasisSet::new(&documents);
    }

    /// Number of species
    pub fn species_count(&self) -> usize {
        self.basis.len()
    }

    /// Symbols of the species, empty if the species are not named
    pub fn symbols(&self) -> &IndexSet<String> {
        &self.symbols
    }

    /// Get the (1-based) species associated with `symbol`
    pub fn species(&self, symbol: &str) -> Option<usize> {
        self.symbols.get_index_of(symbol).map(|index| index + 1)
    }

    /// Get the basis of the given (1-based) species
    pub fn get(&self, species: usize) -> Option<&dyn Basis> {
        let index = species.checked_sub(1)?;
        self.basis.get(index).map(|basis| &**basis)
    }

    /// Get the basis of the given (1-based) species
    pub fn get_mut(&mut self, species: usize) -> Option<&mut Box<dyn Basis>> {
        let index = species.checked_sub(1)?;
        self.basis.get_mut(index)
    }

    /// Iterate over the basis of all species
    pub fn iter(&self) -> impl Iterator<Item = &dyn Basis> + '_ {
        self.basis.iter().map(|basis| &**basis)
    }

    /// Is the basis of the given species the owner of its parameters?
    fn owns_parameters(basis: &dyn Basis) -> bool {
        !matches!(basis.kind(), BasisKind::Mirror | BasisKind::Shared)
    }

    /// Number of learnable parameters, counting parameters shared between
    /// species only once
    pub fn parameter_count(&self) -> usize {
        self.iter()
            .filter(|basis| BasisSet::owns_parameters(*basis))
            .map(|basis| basis.parameter_count())
            .sum()
    }

    /// Get all learnable parameters, by species
    pub fn parameters(&self) -> Result<Vec<f64>, Error> {
        let mut parameters = Vec::with_capacity(self.parameter_count());
        for basis in self.iter().filter(|basis| BasisSet::owns_parameters(*basis)) {
            parameters.extend(basis.parameters()?);
        }
        return Ok(parameters);
    }

    /// Set all learnable parameters, in the same order as `parameters`
    pub fn set_parameters(&self, parameters: &[f64]) -> Result<(), Error> {
        if parameters.len() != self.parameter_count() {
            return Err(Error::Configuration(format!(
                "expected {} parameters, got {}", self.parameter_count(), parameters.len()
            )));
        }

        let mut start = 0;
        for basis in self.iter().filter(|basis| BasisSet::owns_parameters(*basis)) {
            let count = basis.parameter_count();
            basis.set_parameters(&parameters[start..start + count])?;
            start += count;
        }
        return Ok(());
    }

    /// Initialize all learnable parameters with random values
    pub fn init_parameters(&self, rng: &mut dyn rand::RngCore) -> Result<(), Error> {
        for basis in self.iter().filter(|basis| BasisSet::owns_parameters(*basis)) {
            basis.init_parameters(rng)?;
        }
        return Ok(());
    }

    /// Get a new set sharing parameters with this one, which can be used
    /// concurrently with it
    pub fn thread_safe_ref(&self) -> BasisSet {
        BasisSet {
            symbols: self.symbols.clone(),
            basis: self.basis.iter().map(|basis| basis.thread_safe_ref()).collect(),
        }
    }

    /// Shut down all the basis in this set
    pub fn shutdown(&mut self) {
        for basis in &mut self.basis {
            basis.shutdown();
        }
    }

    /// Get the documents describing all the basis in this set
    pub fn save(&self) -> Result<Vec<BasisDocument>, Error> {
        self.iter().map(|basis| basis.save()).collect()
    }

    /// Get the JSON array describing all the basis in this set
    pub fn to_json(&self) -> Result<serde_json::Value, Error> {
        return Ok(serde_json::to_value(self.save()?)?);
    }
}
