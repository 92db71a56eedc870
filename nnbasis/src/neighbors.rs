/// Provider of the neighbors of one central atom. Implementations call
/// `callback(dx, dy, dz, species)` for every neighbor closer than `cutoff`,
/// where `(dx, dy, dz)` is the vector from the central atom to the neighbor
/// and `species` is the 1-based species index of the neighbor.
///
/// The order of the neighbors is free, but must be the same each time the
/// function is called for the same atom.
pub trait NeighborSource {
    fn for_each_neighbor(&self, cutoff: f64, callback: &mut dyn FnMut(f64, f64, f64, usize));
}

/// Neighbors of a single central atom, stored as separate arrays of
/// displacement components and species.
///
/// The list is meant to be re-used for different atoms: `clear` and `build`
/// keep the allocated memory around.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct NeighborList {
    dx: Vec<f64>,
    dy: Vec<f64>,
    dz: Vec<f64>,
    species: Vec<usize>,
}

impl NeighborList {
    /// Create a new empty neighbor list
    pub fn new() -> NeighborList {
        NeighborList::default()
    }

    /// Create a neighbor list from `(vector, species)` pairs
    pub fn from_pairs(pairs: &[([f64; 3], usize)]) -> NeighborList {
        let mut list = NeighborList::new();
        for &(vector, species) in pairs {
            list.push(vector, species);
        }
        return list;
    }

    /// Remove all neighbors from this list
    pub fn clear(&mut self) {
        self.dx.clear();
        self.dy.clear();
        self.dz.clear();
        self.species.clear();
    }

    /// Add a neighbor at `vector` from the central atom, with the given species
    pub fn push(&mut self, vector: [f64; 3], species: usize) {
        self.dx.push(vector[0]);
        self.dy.push(vector[1]);
        self.dz.push(vector[2]);
        self.species.push(species);
    }

    /// Replace the content of this list with the neighbors from `source`
    /// within `cutoff`
    pub fn build(&mut self, source: &dyn NeighborSource, cutoff: f64) {
        self.clear();
        source.for_each_neighbor(cutoff, &mut |dx, dy, dz, species| {
            self.push([dx, dy, dz], species);
        });
    }

    /// Number of neighbors in this list
    pub fn len(&self) -> usize {
        self.species.len()
    }

    /// Is this list empty?
    pub fn is_empty(&self) -> bool {
        self.species.is_empty()
    }

    /// Vector from the central atom to the neighbor `index`
    #[inline]
    pub fn vector(&self, index: usize) -> [f64; 3] {
        [self.dx[index], self.dy[index], self.dz[index]]
    }

    /// Species of the neighbor `index`
    #[inline]
    pub fn species(&self, index: usize) -> usize {
        self.species[index]
    }

    /// Species of all neighbors
    pub fn all_species(&self) -> &[usize] {
        &self.species
    }

    /// Iterate over `(vector, species)` for all neighbors
    pub fn iter(&self) -> impl Iterator<Item = ([f64; 3], usize)> + '_ {
        (0..self.len()).map(|i| (self.vector(i), self.species(i)))
    }

    /// Copy `other` into this list, replacing the species with
    /// `map_species(species)`
    pub fn copy_with_species(&mut self, other: &NeighborList, map_species: impl Fn(usize) -> usize) {
        self.dx.clone_from(&other.dx);
        self.dy.clone_from(&other.dy);
        self.dz.clone_from(&other.dz);
        self.species.clear();
        self.species.extend(other.species.iter().map(|&s| map_species(s)));
    }
}

impl NeighborSource for NeighborList {
    fn for_each_neighbor(&self, cutoff: f64, callback: &mut dyn FnMut(f64, f64, f64, usize)) {
        for i in 0..self.len() {
            let [dx, dy, dz] = self.vector(i);
            if dx * dx + dy * dy + dz * dz < cutoff * cutoff {
                callback(dx, dy, dz, self.species[i]);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn build_from_source() {
        let all = NeighborList::from_pairs(&[
            ([1.0, 0.0, 0.0], 1),
            ([0.0, 5.0, 0.0], 2),
            ([0.0, 0.5, -0.5], 2),
        ]);

        let mut list = NeighborList::new();
        list.build(&all, 3.0);
        assert_eq!(list.len(), 2);
        assert_eq!(list.vector(1), [0.0, 0.5, -0.5]);
        assert_eq!(list.all_species(), [1, 2]);

        list.build(&all, 0.5);
        assert!(list.is_empty());
    }

    #[test]
    fn swap_species() {
        let list = NeighborList::from_pairs(&[([1.0, 0.0, 0.0], 1), ([0.0, 1.0, 0.0], 3)]);
        let mut swapped = NeighborList::new();
        swapped.copy_with_species(&list, |s| if s == 1 { 3 } else if s == 3 { 1 } else { s });

        assert_eq!(swapped.all_species(), [3, 1]);
        assert_eq!(swapped.vector(0), list.vector(0));
    }
}
