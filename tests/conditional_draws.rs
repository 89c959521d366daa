use ndarray::array;
use psr_gibbs::rho::{draw_rho_analytic, grid_log_density, gumbel_argmax, log_uniform_grid};
use psr_gibbs::{BoundedPrior, ConditionalRhoSampler, PriorBounds, RhoSampling};
use rand::{RngExt, SeedableRng, rngs::StdRng};
use rand_distr::Gumbel;

const RHO_MIN: f64 = 1e-20;
const RHO_MAX: f64 = 1e-10;
const TAU: f64 = 1e-15;

fn analytic_cdf(rho: f64) -> f64 {
    let lo = (-TAU / RHO_MIN).exp();
    let hi = (-TAU / RHO_MAX).exp();
    ((-TAU / rho).exp() - lo) / (hi - lo)
}

#[test]
fn single_frequency_without_red_noise_matches_closed_form() {
    // log10 amplitude prior [-10, -5] gives variance bounds [1e-20, 1e-10].
    let priors = [BoundedPrior::Uniform { min: -10.0, max: -5.0 }];
    let sampler =
        ConditionalRhoSampler::new(RhoSampling::Conditional, &priors, 1000).expect("sampler");
    let tau = array![TAU];
    let mut rng = StdRng::seed_from_u64(20_200);
    let n = 10_000;
    let mut draws: Vec<f64> = (0..n).map(|_| sampler.draw(&tau, None, &mut rng)[0]).collect();

    let bounds = PriorBounds::from_log10_amplitude(&priors[0]);
    assert!(draws.iter().all(|r| (bounds.min..=bounds.max).contains(r)));

    draws.sort_by(f64::total_cmp);
    let ks = draws
        .iter()
        .enumerate()
        .map(|(i, r)| {
            let f = analytic_cdf(*r);
            let above = (i + 1) as f64 / n as f64 - f;
            let below = f - i as f64 / n as f64;
            above.max(below)
        })
        .fold(0.0, f64::max);
    assert!(ks < 0.02, "KS distance {ks}");

    // 1/ρ is exponential with rate τ shifted to start at 1/ρmax.
    let inverse_mean = draws.iter().map(|r| 1.0 / r).sum::<f64>() / n as f64;
    let expected = 1.0 / RHO_MAX + 1.0 / TAU;
    assert!(
        (inverse_mean / expected - 1.0).abs() < 0.05,
        "mean of 1/rho {inverse_mean:e}, expected {expected:e}"
    );
}

#[test]
fn analytic_draws_never_leave_bounds_for_extreme_statistics() {
    let bounds = PriorBounds { min: RHO_MIN, max: RHO_MAX };
    let mut rng = StdRng::seed_from_u64(3);
    for tau in [0.0, 1e-300, 1e-25, 1e-5, 1e5, f64::MIN_POSITIVE] {
        for _ in 0..1000 {
            let rho = draw_rho_analytic(tau, bounds, &mut rng);
            assert!((RHO_MIN..=RHO_MAX).contains(&rho), "tau={tau} rho={rho}");
        }
    }
}

#[test]
fn gumbel_max_matches_normalized_grid_sampling() {
    let bounds = PriorBounds { min: RHO_MIN, max: RHO_MAX };
    let grid = log_uniform_grid(bounds, 200);
    let log_density = grid_log_density(TAU, 3e-15, grid.view());

    let max = log_density.fold(f64::NEG_INFINITY, |a, b| a.max(*b));
    let weights = log_density.mapv(|v| (v - max).exp());
    let total = weights.sum();
    let cdf: Vec<f64> = weights
        .iter()
        .scan(0.0, |acc, w| {
            *acc += w / total;
            Some(*acc)
        })
        .collect();

    let gumbel = Gumbel::new(0.0, 1.0).expect("gumbel");
    let mut rng = StdRng::seed_from_u64(77);
    let reps = 20_000;
    let mut gumbel_counts = vec![0usize; grid.len()];
    let mut direct_counts = vec![0usize; grid.len()];
    for _ in 0..reps {
        gumbel_counts[gumbel_argmax(log_density.view(), &gumbel, &mut rng)] += 1;
        let u = rng.random::<f64>();
        let idx = cdf.partition_point(|c| *c < u).min(grid.len() - 1);
        direct_counts[idx] += 1;
    }

    let mut a = 0.0;
    let mut b = 0.0;
    let mut distance: f64 = 0.0;
    for k in 0..grid.len() {
        a += gumbel_counts[k] as f64 / reps as f64;
        b += direct_counts[k] as f64 / reps as f64;
        distance = distance.max((a - b).abs());
        assert!((a - cdf[k]).abs() < 0.02);
    }
    assert!(distance < 0.025, "two-sample distance {distance}");
}
