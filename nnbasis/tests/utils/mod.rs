#![allow(dead_code)]

use rand::{Rng, SeedableRng};
use rand::rngs::StdRng;

use nnbasis::{Basis, NeighborList};

pub fn rng(seed: u64) -> StdRng {
    StdRng::seed_from_u64(seed)
}

/// Random neighbors inside a sphere of radius `radius`, at least 0.5 away
/// from the central atom
pub fn random_neighbors(rng: &mut StdRng, count: usize, radius: f64, species_count: usize) -> NeighborList {
    let mut neighbors = NeighborList::new();
    while neighbors.len() < count {
        let vector = [
            rng.gen_range(-radius..radius),
            rng.gen_range(-radius..radius),
            rng.gen_range(-radius..radius),
        ];
        let r2 = vector[0] * vector[0] + vector[1] * vector[1] + vector[2] * vector[2];
        if r2 < 0.25 || r2 >= radius * radius {
            continue;
        }
        neighbors.push(vector, rng.gen_range(1..=species_count));
    }
    return neighbors;
}

pub fn random_vector(rng: &mut StdRng, size: usize) -> Vec<f64> {
    (0..size).map(|_| rng.gen_range(-1.0..1.0)).collect()
}

/// Random rotation matrix, built from a random unit quaternion
pub fn random_rotation(rng: &mut StdRng) -> [[f64; 3]; 3] {
    let mut q = [0.0f64; 4];
    loop {
        for x in &mut q {
            *x = rng.gen_range(-1.0..1.0);
        }
        let norm = q.iter().map(|x| x * x).sum::<f64>().sqrt();
        if norm > 0.1 && norm < 1.0 {
            for x in &mut q {
                *x /= norm;
            }
            break;
        }
    }

    let [w, x, y, z] = q;
    return [
        [1.0 - 2.0 * (y * y + z * z), 2.0 * (x * y - z * w), 2.0 * (x * z + y * w)],
        [2.0 * (x * y + z * w), 1.0 - 2.0 * (x * x + z * z), 2.0 * (y * z - x * w)],
        [2.0 * (x * z - y * w), 2.0 * (y * z + x * w), 1.0 - 2.0 * (x * x + y * y)],
    ];
}

pub fn rotate(neighbors: &NeighborList, rotation: &[[f64; 3]; 3]) -> NeighborList {
    let mut rotated = NeighborList::new();
    for (v, species) in neighbors.iter() {
        let vector = [
            rotation[0][0] * v[0] + rotation[0][1] * v[1] + rotation[0][2] * v[2],
            rotation[1][0] * v[0] + rotation[1][1] * v[1] + rotation[1][2] * v[2],
            rotation[2][0] * v[0] + rotation[2][1] * v[1] + rotation[2][2] * v[2],
        ];
        rotated.push(vector, species);
    }
    return rotated;
}

/// Copy of `neighbors` where the neighbor `index` is displaced by `delta`
/// along the axis `axis`
pub fn displaced(neighbors: &NeighborList, index: usize, axis: usize, delta: f64) -> NeighborList {
    let mut result = NeighborList::new();
    for (i, (mut vector, species)) in neighbors.iter().enumerate() {
        if i == index {
            vector[axis] += delta;
        }
        result.push(vector, species);
    }
    return result;
}

pub fn features(basis: &mut dyn Basis, neighbors: &NeighborList) -> Vec<f64> {
    let mut features = vec![0.0; basis.size()];
    basis.eval(neighbors, &mut features).expect("failed to compute features");
    return features;
}

/// `sum(grad * features)` for the given neighbors
pub fn energy(basis: &mut dyn Basis, neighbors: &NeighborList, grad: &[f64]) -> f64 {
    features(basis, neighbors).iter().zip(grad).map(|(f, g)| f * g).sum()
}

pub fn forces(basis: &mut dyn Basis, neighbors: &NeighborList, grad: &[f64]) -> Vec<[f64; 3]> {
    let mut features = vec![0.0; basis.size()];
    basis.eval_for_force(neighbors, &mut features).expect("failed to compute features");
    let mut forces = vec![[0.0; 3]; neighbors.len()];
    basis.force(neighbors, grad, &mut forces).expect("failed to compute forces");
    return forces;
}

/// Check the forces computed by `basis` against finite differences of
/// `sum(grad * features)`. The force on a neighbor is minus the derivative
/// of the energy with respect to the neighbor displacement.
pub fn check_forces_finite_differences(basis: &mut dyn Basis, neighbors: &NeighborList, grad: &[f64]) {
    const DELTA: f64 = 1e-6;

    let forces = forces(basis, neighbors, grad);
    for index in 0..neighbors.len() {
        for axis in 0..3 {
            let plus = energy(basis, &displaced(neighbors, index, axis, DELTA), grad);
            let minus = energy(basis, &displaced(neighbors, index, axis, -DELTA), grad);
            let finite_difference = (minus - plus) / (2.0 * DELTA);

            approx::assert_relative_eq!(
                forces[index][axis], finite_difference, epsilon=1e-6, max_relative=1e-5
            );
        }
    }
}
