use nnbasis::{Basis, BasisDocument, Error, NeighborList};
use nnbasis::basis::build_basis;

mod utils;

fn all_basis() -> Vec<Box<dyn Basis>> {
    let documents = serde_json::json!([
        {"nmax": 3, "lmax": 4, "l3max": 2, "rcut": 5.0, "wtype": "exfuse", "fuse_size": 2},
        {"nmax": 2, "lmax": 2, "rcut": 5.0, "wtype": "full"},
        {"nmax": 2, "lmax": 3, "l3max": 2, "l4max": 3, "rcut": 5.0, "wtype": "exfuse", "fuse_size": 2,
         "post_fuse": true, "post_fuse_size": 3},
        {"type": "chebyshev", "nmax": 6, "rcut": 5.0, "wtype": "fuse", "fuse_size": 3},
        {"type": "chebyshev", "nmax": 3, "rcut": 5.0, "wtype": "default"},
        {"type": "merge", "basis": [
            {"nmax": 2, "lmax": 3, "rcut": 4.0, "wtype": "fuse", "fuse_size": 1},
            {"type": "chebyshev", "nmax": 4, "rcut": 5.0},
        ]},
    ]);

    let mut rng = utils::rng(3);
    let mut all = Vec::new();
    for value in documents.as_array().unwrap() {
        let document = BasisDocument::from_json(value.clone()).unwrap();
        let basis = build_basis(3, &document).unwrap();
        basis.init_parameters(&mut rng).unwrap();
        all.push(basis);
    }
    return all;
}

/// Run all operations with buffers of exactly the advertised size
fn run_exact(basis: &mut dyn Basis, neighbors: &NeighborList) -> Result<(), Error> {
    let nn = neighbors.len();
    let size = basis.size();
    let grad = vec![0.5; size];

    let mut features = vec![0.0; size];
    let mut forward = vec![0.0; basis.forward_cache_size(nn, false)];
    let mut backward = vec![0.0; basis.backward_cache_size(nn, false)];
    let mut forces = vec![[0.0; 3]; nn];
    basis.forward(neighbors, &mut features, &mut forward, false)?;
    basis.forward_force(neighbors, &grad, &mut forces, &mut forward, &mut backward, false)?;

    let mut forward = vec![0.0; basis.forward_cache_size(nn, true)];
    let mut backward = vec![0.0; basis.backward_cache_size(nn, true)];
    let mut backward_force = vec![0.0; basis.backward_force_cache_size(nn)];
    let mut grad_parameters = vec![0.0; basis.parameter_count()];
    basis.forward(neighbors, &mut features, &mut forward, true)?;
    basis.backward(neighbors, &grad, &mut grad_parameters, &forward, &mut backward)?;

    let mut full_forces = vec![[0.0; 3]; nn];
    basis.forward_force(neighbors, &grad, &mut full_forces, &mut forward, &mut backward, true)?;

    let grad_forces = vec![[0.1, -0.2, 0.3]; nn];
    let mut grad_grad = vec![0.0; size];
    basis.backward_force(
        neighbors,
        &grad,
        &grad_forces,
        &mut grad_grad,
        Some(&mut grad_parameters),
        &forward,
        &backward,
        &mut backward_force,
    )?;

    for (a, b) in forces.iter().zip(&full_forces) {
        for d in 0..3 {
            approx::assert_relative_eq!(a[d], b[d], epsilon=1e-10, max_relative=1e-8);
        }
    }
    assert!(features.iter().all(|f| f.is_finite()));
    return Ok(());
}

#[test]
fn exact_sizes() {
    let mut rng = utils::rng(11);
    let counts = [0, 1, 2, 3, 7, 16, 33, 100, 250, 999, 2000];
    for mut basis in all_basis() {
        for &count in &counts {
            let neighbors = utils::random_neighbors(&mut rng, count, 5.5, 3);
            run_exact(&mut *basis, &neighbors).unwrap();
        }
    }
}

#[test]
fn linear_sizes() {
    for basis in all_basis() {
        for full in [false, true] {
            let base = basis.forward_cache_size(0, full);
            let step = basis.forward_cache_size(1, full) - base;
            assert_eq!(basis.forward_cache_size(2000, full), base + 2000 * step);
            if !full {
                assert_eq!(step, 0);
            }

            let base = basis.backward_cache_size(0, full);
            let step = basis.backward_cache_size(1, full) - base;
            assert_eq!(basis.backward_cache_size(1234, full), base + 1234 * step);
        }
        assert_eq!(basis.backward_force_cache_size(0), basis.backward_force_cache_size(500));
    }
}

#[test]
fn too_small_buffers() {
    let mut rng = utils::rng(19);
    let neighbors = utils::random_neighbors(&mut rng, 5, 4.0, 3);
    let nn = neighbors.len();

    for mut basis in all_basis() {
        let size = basis.size();

        let mut features = vec![0.0; size - 1];
        let mut forward = vec![0.0; basis.forward_cache_size(nn, true)];
        let result = basis.forward(&neighbors, &mut features, &mut forward, true);
        assert!(matches!(result, Err(Error::Capacity { .. })));

        let mut features = vec![0.0; size];
        let mut small = vec![0.0; basis.forward_cache_size(nn, true) - 1];
        let result = basis.forward(&neighbors, &mut features, &mut small, true);
        assert!(matches!(result, Err(Error::Capacity { .. })));

        basis.forward(&neighbors, &mut features, &mut forward, true).unwrap();

        let grad = vec![1.0; size];
        let mut backward = vec![0.0; basis.backward_cache_size(nn, true) - 1];
        let mut forces = vec![[0.0; 3]; nn];
        let result = basis.forward_force(&neighbors, &grad, &mut forces, &mut forward, &mut backward, true);
        assert!(matches!(result, Err(Error::Capacity { .. })));

        let mut backward = vec![0.0; basis.backward_cache_size(nn, true)];
        let mut forces = vec![[0.0; 3]; nn - 1];
        let result = basis.forward_force(&neighbors, &grad, &mut forces, &mut forward, &mut backward, true);
        assert!(matches!(result, Err(Error::Capacity { .. })));

        if basis.has_parameters() {
            let mut grad_parameters = vec![0.0; basis.parameter_count() - 1];
            let result = basis.backward(&neighbors, &grad, &mut grad_parameters, &forward, &mut backward);
            assert!(matches!(result, Err(Error::Capacity { .. })));
        }
    }
}
