use approx::assert_relative_eq;

use nnbasis::{Basis, BasisKind, BasisSet, Merge, NeighborList, SparseJacobian};
use nnbasis::{SphericalChebyshev, SphericalChebyshevParameters, Chebyshev, ChebyshevParameters, WeightType};

mod utils;

fn components() -> (SphericalChebyshev, Chebyshev) {
    let spherical = SphericalChebyshev::new(2, &SphericalChebyshevParameters {
        nmax: 3, lmax: 4, l3max: 2, rcut: 3.0, wtype: WeightType::ExFull, ..Default::default()
    }).unwrap();
    let radial = Chebyshev::new(2, &ChebyshevParameters {
        nmax: 8, rcut: 5.0, wtype: WeightType::Fuse, fuse_size: Some(2), ..Default::default()
    }).unwrap();
    return (spherical, radial);
}

#[test]
fn merge_concatenates() {
    let mut rng = utils::rng(8);
    let (mut spherical, mut radial) = components();
    radial.init_parameters(&mut rng).unwrap();

    let mut merged = Merge::new(vec![spherical.thread_safe_ref(), radial.thread_safe_ref()]).unwrap();
    assert_eq!(merged.size(), spherical.size() + radial.size());
    assert_eq!(merged.rcut(), 5.0);
    assert_eq!(merged.parameter_count(), radial.parameter_count());

    for _ in 0..4 {
        let neighbors = utils::random_neighbors(&mut rng, 20, 5.0, 2);

        let mut expected = utils::features(&mut spherical, &neighbors);
        expected.extend(utils::features(&mut radial, &neighbors));
        assert_eq!(utils::features(&mut merged, &neighbors), expected);

        let grad = utils::random_vector(&mut rng, merged.size());
        let (first, second) = grad.split_at(spherical.size());
        let mut expected = utils::forces(&mut spherical, &neighbors, first);
        let other = utils::forces(&mut radial, &neighbors, second);
        for (force, other) in expected.iter_mut().zip(&other) {
            for d in 0..3 {
                force[d] += other[d];
            }
        }

        let forces = utils::forces(&mut merged, &neighbors, &grad);
        for (a, b) in forces.iter().zip(&expected) {
            for d in 0..3 {
                assert_relative_eq!(a[d], b[d], epsilon=1e-12, max_relative=1e-12);
            }
        }
    }
}

#[test]
fn merge_jacobian() {
    let mut rng = utils::rng(80);
    let (mut spherical, mut radial) = components();
    radial.init_parameters(&mut rng).unwrap();
    let mut merged = Merge::new(vec![spherical.thread_safe_ref(), radial.thread_safe_ref()]).unwrap();

    let neighbors = utils::random_neighbors(&mut rng, 10, 5.0, 2);
    let mut features = vec![0.0; merged.size()];
    let mut jacobian = SparseJacobian::new();
    merged.eval_grad(&neighbors, &mut features, &mut jacobian).unwrap();
    let dense = jacobian.to_dense();

    let mut offset = 0;
    let parts: [&mut dyn Basis; 2] = [&mut spherical, &mut radial];
    for basis in parts {
        let mut sub_features = vec![0.0; basis.size()];
        let mut sub_jacobian = SparseJacobian::new();
        basis.eval_grad(&neighbors, &mut sub_features, &mut sub_jacobian).unwrap();
        assert_eq!(features[offset..offset + basis.size()], sub_features);

        let sub_dense = sub_jacobian.to_dense();
        for ((f, j, d), value) in sub_dense.indexed_iter() {
            assert_eq!(dense[[offset + f, j, d]], *value);
        }
        offset += basis.size();
    }
}

#[test]
fn merge_parameters_gradient() {
    let mut rng = utils::rng(81);
    let (spherical, mut radial) = components();
    radial.init_parameters(&mut rng).unwrap();
    let mut merged = Merge::new(vec![spherical.thread_safe_ref(), radial.thread_safe_ref()]).unwrap();

    let neighbors = utils::random_neighbors(&mut rng, 10, 5.0, 2);
    let nn = neighbors.len();
    let grad = utils::random_vector(&mut rng, merged.size());

    let mut features = vec![0.0; merged.size()];
    let mut forward = vec![0.0; merged.forward_cache_size(nn, true)];
    let mut backward = vec![0.0; merged.backward_cache_size(nn, true)];
    let mut grad_parameters = vec![0.0; merged.parameter_count()];
    merged.forward(&neighbors, &mut features, &mut forward, true).unwrap();
    merged.backward(&neighbors, &grad, &mut grad_parameters, &forward, &mut backward).unwrap();

    let mut features = vec![0.0; radial.size()];
    let mut forward = vec![0.0; radial.forward_cache_size(nn, true)];
    let mut backward = vec![0.0; radial.backward_cache_size(nn, true)];
    let mut expected = vec![0.0; radial.parameter_count()];
    radial.forward(&neighbors, &mut features, &mut forward, true).unwrap();
    radial.backward(&neighbors, &grad[spherical.size()..], &mut expected, &forward, &mut backward).unwrap();

    assert_eq!(grad_parameters, expected);
}

fn swap(neighbors: &NeighborList, a: usize, b: usize) -> NeighborList {
    let mut swapped = NeighborList::new();
    swapped.copy_with_species(neighbors, |s| if s == a { b } else if s == b { a } else { s });
    return swapped;
}

#[test]
fn basis_set_references() {
    let mut rng = utils::rng(321);
    let set = BasisSet::from_json(serde_json::json!([
        {"nmax": 3, "lmax": 3, "rcut": 4.0, "wtype": "exfuse", "fuse_size": 2},
        {"type": "mirror", "mirror": 1},
        {"type": "share", "share": 1},
    ])).unwrap();
    set.init_parameters(&mut rng).unwrap();

    assert_eq!(set.get(2).unwrap().kind(), BasisKind::Mirror);
    assert_eq!(set.get(3).unwrap().kind(), BasisKind::Shared);
    assert_eq!(set.parameter_count(), 3 * 2);

    let mut set = set.thread_safe_ref();
    let neighbors = utils::random_neighbors(&mut rng, 15, 4.0, 3);

    let original = utils::features(&mut **set.get_mut(1).unwrap(), &swap(&neighbors, 1, 2));
    let mirrored = utils::features(&mut **set.get_mut(2).unwrap(), &neighbors);
    assert_eq!(original, mirrored);

    let original = utils::features(&mut **set.get_mut(1).unwrap(), &neighbors);
    let shared = utils::features(&mut **set.get_mut(3).unwrap(), &neighbors);
    assert_eq!(original, shared);

    // parameters are shared between the three species
    let parameters = vec![0.5; set.parameter_count()];
    set.set_parameters(&parameters).unwrap();
    for basis in set.iter() {
        assert_eq!(basis.parameters().unwrap(), parameters);
    }

    let grad = utils::random_vector(&mut rng, set.get(2).unwrap().size());
    let expected = utils::forces(&mut **set.get_mut(1).unwrap(), &swap(&neighbors, 1, 2), &grad);
    let forces = utils::forces(&mut **set.get_mut(2).unwrap(), &neighbors, &grad);
    assert_eq!(forces, expected);

    set.shutdown();
    assert!(set.iter().all(|basis| basis.is_shutdown()));
}

#[test]
fn batch_evaluation() {
    let mut rng = utils::rng(4);
    let (mut spherical, _) = components();
    let environments = (0..32)
        .map(|_| utils::random_neighbors(&mut rng, 10, 3.0, 2))
        .collect::<Vec<_>>();

    let mut descriptors = ndarray::Array2::zeros((environments.len(), spherical.size()));
    nnbasis::batch::compute_descriptors(&spherical, &environments, descriptors.view_mut()).unwrap();

    for (neighbors, row) in environments.iter().zip(descriptors.rows()) {
        assert_eq!(row.to_vec(), utils::features(&mut spherical, neighbors));
    }
}
