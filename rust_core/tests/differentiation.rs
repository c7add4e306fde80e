use mhgraph_core::autodiff::{finite_difference, forward_mode, log_prob_gradient, reverse_mode};
use mhgraph_core::distributions::Distribution;
use mhgraph_core::ops::Op;
use mhgraph_core::tensor::{self, from_vec, scalar, Tensor};
use mhgraph_core::{Graph, GraphBuilder, VertexId};
use rand::SeedableRng;
use rand_chacha::ChaCha8Rng;

fn values(t: &Tensor) -> Vec<f64> {
    t.iter().copied().collect()
}

fn assert_close(a: f64, b: f64) {
    let scale = a.abs().max(b.abs()).max(1e-3);
    assert!((a - b).abs() <= 1e-6 * scale, "{} vs {}", a, b);
}

/// out = sum(sigmoid(sin(x * w) + exp(x) / w)^2)
fn operator_chain() -> (Graph, VertexId, VertexId, VertexId) {
    let mut b = GraphBuilder::new();
    let x = b.constant(from_vec(&[3], vec![0.3, -0.8, 1.1]).unwrap());
    let w = b.scalar_constant(1.7);
    let xw = b.mul(x, w).unwrap();
    let wave = b.deterministic(Op::Sin, &[xw]).unwrap();
    let growth = b.exp(x).unwrap();
    let scaled = b.div(growth, w).unwrap();
    let inner = b.add(wave, scaled).unwrap();
    let squashed = b.deterministic(Op::Sigmoid, &[inner]).unwrap();
    let squared = b.deterministic(Op::Square, &[squashed]).unwrap();
    let out = b.sum(squared).unwrap();
    let g = b.build(&mut ChaCha8Rng::seed_from_u64(0)).unwrap();
    (g, x, w, out)
}

#[test]
fn forward_reverse_and_finite_differences_agree() {
    let (mut g, x, w, out) = operator_chain();

    let reverse = reverse_mode(&mut g, out).unwrap();
    let numeric_x = finite_difference(&mut g, x, out, 1e-6).unwrap();
    let numeric_w = finite_difference(&mut g, w, out, 1e-6).unwrap();

    let reverse_x = values(reverse.wrt(x).unwrap());
    for (i, expected) in values(&numeric_x).into_iter().enumerate() {
        let mut direction = vec![0.0; 3];
        direction[i] = 1.0;
        let seed = from_vec(&[3], direction).unwrap();
        let forward = forward_mode(&mut g, &[(x, seed)], out).unwrap();

        assert_close(forward.tangent.sum(), expected);
        assert_close(reverse_x[i], expected);
    }

    let forward_w = forward_mode(&mut g, &[(w, scalar(1.0))], out).unwrap();
    assert_close(forward_w.tangent.sum(), numeric_w.sum());
    assert_close(reverse.wrt(w).unwrap().sum(), numeric_w.sum());
}

#[test]
fn scalar_broadcast_adjoint_sums_per_element_adjoints() {
    let mut b = GraphBuilder::new();
    let s = b.scalar_constant(0.5);
    let m = b.constant(from_vec(&[2, 2], vec![1.0, -2.0, 3.0, 0.5]).unwrap());
    let child = b.mul(s, m).unwrap();
    let squared = b.deterministic(Op::Square, &[child]).unwrap();
    let out = b.sum(squared).unwrap();
    let mut g = b.build(&mut ChaCha8Rng::seed_from_u64(0)).unwrap();

    let adjoints = reverse_mode(&mut g, out).unwrap();
    let child_adjoint = adjoints.wrt(child).unwrap();
    assert_eq!(child_adjoint.shape(), &[2, 2]);

    // d child_ij / d s = m_ij, so the scalar's adjoint is the sum of the four contributions.
    let m_value = g.value(m).unwrap().clone();
    let per_element = child_adjoint * &m_value;
    let s_adjoint = adjoints.wrt(s).unwrap();
    assert_eq!(s_adjoint.ndim(), 0);
    assert_close(s_adjoint.sum(), per_element.sum());
    assert_close(s_adjoint.sum(), 2.0 * 0.5 * (1.0 + 4.0 + 9.0 + 0.25));
}

#[test]
fn log_prob_gradient_matches_finite_differences() {
    // mu ~ N(0, 1); scale ~ Exponential(1); obs ~ N(2 * mu, scale), shape [4].
    let mut b = GraphBuilder::new();
    let zero = b.scalar_constant(0.0);
    let one = b.scalar_constant(1.0);
    let two = b.scalar_constant(2.0);
    let mu = b.probabilistic(Distribution::Gaussian, &[zero, one], &[]).unwrap();
    let scale = b.probabilistic(Distribution::Exponential, &[one], &[]).unwrap();
    let mean = b.mul(two, mu).unwrap();
    let obs = b.probabilistic(Distribution::Gaussian, &[mean, scale], &[4]).unwrap();
    b.set_initial_value(mu, scalar(0.4)).unwrap();
    b.set_initial_value(scale, scalar(1.3)).unwrap();
    b.observe(obs, from_vec(&[4], vec![0.2, 1.5, 0.9, -0.3]).unwrap()).unwrap();
    let mut g = b.build(&mut ChaCha8Rng::seed_from_u64(0)).unwrap();

    let gradient = log_prob_gradient(&mut g, &[mu, scale]).unwrap();

    let eps = 1e-6;
    for id in [mu, scale] {
        let original = g.value(id).unwrap().clone();
        g.set_value(id, original.mapv(|v| v + eps)).unwrap();
        let plus = g.log_prob().unwrap();
        g.set_value(id, original.mapv(|v| v - eps)).unwrap();
        let minus = g.log_prob().unwrap();
        g.set_value(id, original).unwrap();

        let numeric = (plus - minus) / (2.0 * eps);
        assert_close(gradient.wrt(id).unwrap().sum(), numeric);
    }
    assert_eq!(tensor::element_count(g.vertex(obs).unwrap().shape()), 4);
}
