use approx::assert_relative_eq;

use nnbasis::{Basis, NeighborList, SparseJacobian};
use nnbasis::{SphericalChebyshev, SphericalChebyshevParameters, Chebyshev, ChebyshevParameters, WeightType};

mod utils;

fn spherical(nmax: usize, lmax: usize, l3max: usize, wtype: WeightType) -> SphericalChebyshev {
    SphericalChebyshev::new(2, &SphericalChebyshevParameters {
        nmax: nmax,
        lmax: lmax,
        l3max: l3max,
        rcut: 4.0,
        wtype: wtype,
        fuse_size: if wtype.is_fused() { Some(3) } else { None },
        ..Default::default()
    }).unwrap()
}

/// Spherical basis with order-4 invariants, and optionally channel mixing
/// after the species fuse
fn quadruple(wtype: WeightType, post_fuse_size: Option<usize>) -> SphericalChebyshev {
    SphericalChebyshev::new(2, &SphericalChebyshevParameters {
        nmax: 2,
        lmax: 3,
        l3max: 2,
        l4max: 3,
        rcut: 4.0,
        wtype: wtype,
        fuse_size: if wtype.is_fused() { Some(2) } else { None },
        post_fuse: post_fuse_size.is_some(),
        post_fuse_size: post_fuse_size,
        ..Default::default()
    }).unwrap()
}

fn chebyshev(nmax: usize, wtype: WeightType) -> Chebyshev {
    Chebyshev::new(2, &ChebyshevParameters {
        nmax: nmax,
        rcut: 3.5,
        wtype: wtype,
        fuse_size: if wtype.is_fused() { Some(2) } else { None },
        ..Default::default()
    }).unwrap()
}

#[test]
fn spherical_finite_differences() {
    let mut rng = utils::rng(0xf0f0);
    for nmax in [0, 3, 5] {
        for lmax in [0, 2, 6] {
            let mut basis = spherical(nmax, lmax, 0, WeightType::Default);
            let neighbors = utils::random_neighbors(&mut rng, 6, 4.0, 2);
            let grad = utils::random_vector(&mut rng, basis.size());
            utils::check_forces_finite_differences(&mut basis, &neighbors, &grad);
        }
    }
}

#[test]
fn spherical_weighting_finite_differences() {
    let mut rng = utils::rng(12);
    for wtype in [WeightType::None, WeightType::Full, WeightType::ExFull, WeightType::Fuse, WeightType::ExFuse] {
        let mut basis = spherical(3, 3, 3, wtype);
        basis.init_parameters(&mut rng).unwrap();

        let neighbors = utils::random_neighbors(&mut rng, 7, 4.0, 2);
        let grad = utils::random_vector(&mut rng, basis.size());
        utils::check_forces_finite_differences(&mut basis, &neighbors, &grad);
    }
}

#[test]
fn radial_finite_differences() {
    let mut rng = utils::rng(77);
    for wtype in [WeightType::None, WeightType::Default, WeightType::ExFull, WeightType::ExFuse] {
        let mut basis = chebyshev(5, wtype);
        basis.init_parameters(&mut rng).unwrap();

        let neighbors = utils::random_neighbors(&mut rng, 9, 3.5, 2);
        let grad = utils::random_vector(&mut rng, basis.size());
        utils::check_forces_finite_differences(&mut basis, &neighbors, &grad);
    }
}

fn check_jacobian(basis: &mut dyn Basis, neighbors: &NeighborList, grad: &[f64]) {
    let mut features = vec![0.0; basis.size()];
    let mut jacobian = SparseJacobian::new();
    basis.eval_grad(neighbors, &mut features, &mut jacobian).unwrap();
    assert_eq!(features, utils::features(basis, neighbors));

    let mut expected = vec![[0.0; 3]; neighbors.len()];
    jacobian.contract(grad, &mut expected).unwrap();

    let forces = utils::forces(basis, neighbors, grad);
    for (a, b) in forces.iter().zip(&expected) {
        for d in 0..3 {
            assert_relative_eq!(a[d], b[d], epsilon=1e-10, max_relative=1e-8);
        }
    }
}

#[test]
fn jacobians() {
    let mut rng = utils::rng(5);
    let neighbors = utils::random_neighbors(&mut rng, 10, 3.5, 2);

    let mut basis = spherical(4, 4, 2, WeightType::ExFuse);
    basis.init_parameters(&mut rng).unwrap();
    let grad = utils::random_vector(&mut rng, basis.size());
    check_jacobian(&mut basis, &neighbors, &grad);

    let mut basis = chebyshev(4, WeightType::Fuse);
    basis.init_parameters(&mut rng).unwrap();
    let grad = utils::random_vector(&mut rng, basis.size());
    check_jacobian(&mut basis, &neighbors, &grad);
}

/// Check the gradient with respect to the parameters computed by `backward`
/// against finite differences of `sum(grad * features)`
fn check_parameters_gradient(basis: &mut dyn Basis, neighbors: &NeighborList, grad: &[f64]) {
    const DELTA: f64 = 1e-6;
    let nn = neighbors.len();

    let mut features = vec![0.0; basis.size()];
    let mut forward = vec![0.0; basis.forward_cache_size(nn, true)];
    let mut backward = vec![0.0; basis.backward_cache_size(nn, true)];
    basis.forward(neighbors, &mut features, &mut forward, true).unwrap();

    let mut grad_parameters = vec![0.0; basis.parameter_count()];
    basis.backward(neighbors, grad, &mut grad_parameters, &forward, &mut backward).unwrap();

    let parameters = basis.parameters().unwrap();
    for i in 0..parameters.len() {
        let mut displaced = parameters.clone();
        displaced[i] = parameters[i] + DELTA;
        basis.set_parameters(&displaced).unwrap();
        let plus = utils::energy(basis, neighbors, grad);

        displaced[i] = parameters[i] - DELTA;
        basis.set_parameters(&displaced).unwrap();
        let minus = utils::energy(basis, neighbors, grad);

        let finite_difference = (plus - minus) / (2.0 * DELTA);
        assert_relative_eq!(grad_parameters[i], finite_difference, epsilon=1e-6, max_relative=1e-5);
    }
    basis.set_parameters(&parameters).unwrap();
}

#[test]
fn parameters_gradient() {
    let mut rng = utils::rng(99);
    for wtype in [WeightType::Fuse, WeightType::ExFuse] {
        let neighbors = utils::random_neighbors(&mut rng, 8, 3.5, 2);

        let mut basis = spherical(3, 3, 2, wtype);
        basis.init_parameters(&mut rng).unwrap();
        let grad = utils::random_vector(&mut rng, basis.size());
        check_parameters_gradient(&mut basis, &neighbors, &grad);

        let mut basis = chebyshev(4, wtype);
        basis.init_parameters(&mut rng).unwrap();
        let grad = utils::random_vector(&mut rng, basis.size());
        check_parameters_gradient(&mut basis, &neighbors, &grad);
    }

    // without learnable parameters, backward only checks its inputs
    let mut basis = spherical(2, 2, 0, WeightType::Full);
    let neighbors = utils::random_neighbors(&mut rng, 3, 3.5, 2);
    let nn = neighbors.len();
    let mut features = vec![0.0; basis.size()];
    let mut forward = vec![0.0; basis.forward_cache_size(nn, true)];
    let mut backward = vec![0.0; basis.backward_cache_size(nn, true)];
    basis.forward(&neighbors, &mut features, &mut forward, true).unwrap();
    let grad = vec![1.0; basis.size()];
    basis.backward(&neighbors, &grad, &mut [], &forward, &mut backward).unwrap();
}

/// Check `backward_force` against the jacobian (for the gradient with
/// respect to `grad`) and against finite differences (for the gradient with
/// respect to the parameters) of `sum(grad_forces * forces)`
fn check_backward_force(basis: &mut dyn Basis, neighbors: &NeighborList, grad: &[f64], grad_forces: &[[f64; 3]]) {
    const DELTA: f64 = 1e-6;
    let nn = neighbors.len();

    let mut features = vec![0.0; basis.size()];
    let mut forward = vec![0.0; basis.forward_cache_size(nn, true)];
    let mut backward = vec![0.0; basis.backward_cache_size(nn, true)];
    let mut backward_force = vec![0.0; basis.backward_force_cache_size(nn)];
    let mut forces = vec![[0.0; 3]; nn];
    basis.forward(neighbors, &mut features, &mut forward, true).unwrap();
    basis.forward_force(neighbors, grad, &mut forces, &mut forward, &mut backward, true).unwrap();

    let mut grad_grad = vec![0.0; basis.size()];
    let mut grad_parameters = vec![0.0; basis.parameter_count()];
    basis.backward_force(
        neighbors,
        grad,
        grad_forces,
        &mut grad_grad,
        Some(&mut grad_parameters),
        &forward,
        &backward,
        &mut backward_force,
    ).unwrap();

    // forces are linear in `grad`, the gradient is the jacobian
    let mut jacobian = SparseJacobian::new();
    basis.eval_grad(neighbors, &mut features, &mut jacobian).unwrap();
    let mut expected = vec![0.0; basis.size()];
    for (feature, neighbor, gradient) in jacobian.iter() {
        for d in 0..3 {
            expected[feature] += grad_forces[neighbor][d] * gradient[d];
        }
    }
    for (a, b) in grad_grad.iter().zip(&expected) {
        assert_relative_eq!(a, b, epsilon=1e-10, max_relative=1e-8);
    }

    let loss = |basis: &mut dyn Basis| -> f64 {
        let forces = utils::forces(basis, neighbors, grad);
        forces.iter().zip(grad_forces)
            .map(|(f, g)| f[0] * g[0] + f[1] * g[1] + f[2] * g[2])
            .sum()
    };

    let parameters = basis.parameters().unwrap();
    for i in 0..parameters.len() {
        let mut displaced = parameters.clone();
        displaced[i] = parameters[i] + DELTA;
        basis.set_parameters(&displaced).unwrap();
        let plus = loss(basis);

        displaced[i] = parameters[i] - DELTA;
        basis.set_parameters(&displaced).unwrap();
        let minus = loss(basis);

        let finite_difference = (plus - minus) / (2.0 * DELTA);
        assert_relative_eq!(grad_parameters[i], finite_difference, epsilon=1e-6, max_relative=1e-5);
    }
    basis.set_parameters(&parameters).unwrap();
}

#[test]
fn backward_force() {
    let mut rng = utils::rng(2024);
    for wtype in [WeightType::Default, WeightType::ExFull, WeightType::Fuse, WeightType::ExFuse] {
        let neighbors = utils::random_neighbors(&mut rng, 6, 3.5, 2);
        let grad_forces = (0..neighbors.len())
            .map(|_| {
                let v = utils::random_vector(&mut rng, 3);
                [v[0], v[1], v[2]]
            })
            .collect::<Vec<_>>();

        let mut basis = spherical(3, 3, 3, wtype);
        basis.init_parameters(&mut rng).unwrap();
        let grad = utils::random_vector(&mut rng, basis.size());
        check_backward_force(&mut basis, &neighbors, &grad, &grad_forces);

        let mut basis = chebyshev(4, wtype);
        basis.init_parameters(&mut rng).unwrap();
        let grad = utils::random_vector(&mut rng, basis.size());
        check_backward_force(&mut basis, &neighbors, &grad, &grad_forces);
    }
}

#[test]
fn quadruple_and_mixing_finite_differences() {
    let mut rng = utils::rng(4444);
    let configurations = [
        (WeightType::Default, None),
        (WeightType::ExFull, Some(3)),
        (WeightType::Fuse, Some(2)),
        (WeightType::ExFuse, Some(4)),
    ];
    for (wtype, post_fuse_size) in configurations {
        let mut basis = quadruple(wtype, post_fuse_size);
        basis.init_parameters(&mut rng).unwrap();

        let neighbors = utils::random_neighbors(&mut rng, 7, 4.0, 2);
        let grad = utils::random_vector(&mut rng, basis.size());
        utils::check_forces_finite_differences(&mut basis, &neighbors, &grad);
        check_jacobian(&mut basis, &neighbors, &grad);
    }
}

#[test]
fn mixing_parameters_gradient() {
    let mut rng = utils::rng(4545);
    for (wtype, post_fuse_size) in [(WeightType::Full, Some(2)), (WeightType::ExFuse, Some(3))] {
        let neighbors = utils::random_neighbors(&mut rng, 6, 3.5, 2);
        let grad_forces = (0..neighbors.len())
            .map(|_| {
                let v = utils::random_vector(&mut rng, 3);
                [v[0], v[1], v[2]]
            })
            .collect::<Vec<_>>();

        let mut basis = quadruple(wtype, post_fuse_size);
        basis.init_parameters(&mut rng).unwrap();
        let grad = utils::random_vector(&mut rng, basis.size());
        check_parameters_gradient(&mut basis, &neighbors, &grad);
        check_backward_force(&mut basis, &neighbors, &grad, &grad_forces);
    }
}
