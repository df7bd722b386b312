mod common;

use abc_smc_rs::{AbcSettings, ExecutionMode, Sampler, StopReason, ToleranceKind};
use anyhow::Result;
use approx::assert_abs_diff_eq;

use common::{mean_distance, priors, GaussianMeans, TRUE_MEANS};

#[test]
fn recovers_gaussian_means() -> Result<()> {
    let model = GaussianMeans {
        num_points: 500,
        sigma: 0.05,
    };
    let observed = model.observed(0)?;

    let dir = tempfile::tempdir()?;
    let outfile = dir.path().join("abc_out.txt");

    let mut settings = AbcSettings {
        num_particles: 100,
        num_iterations: 20,
        num_params: Some(2),
        execution: ExecutionMode::Pool { num_workers: 4 },
        outfile: Some(outfile.clone()),
        seed: 42,
        ..Default::default()
    };
    settings.tolerance.start = 0.5;
    settings.tolerance.min = 0.002;
    settings.tolerance.kind = ToleranceKind::Exp;

    let mut sampler = Sampler::new(priors()?, observed, mean_distance, settings)?;
    let output = sampler.sample(&model)?;

    let population = &output.population;
    assert_eq!(output.stop_reason, StopReason::Completed);
    assert_eq!(population.len(), 100);
    assert_eq!(population.iteration(), 19);
    assert_abs_diff_eq!(population.weights().iter().sum::<f64>(), 1., epsilon = 1e-10);
    assert!(population.weights().iter().all(|&w| w >= 0.));

    let mean = population.mean();
    for (estimate, truth) in mean.iter().zip(TRUE_MEANS) {
        assert_abs_diff_eq!(*estimate, truth, epsilon = 0.01);
    }

    let tolerances: Vec<f64> = output.history.iter().map(|s| s.tolerance).collect();
    assert_eq!(tolerances.len(), 20);
    assert!(tolerances.windows(2).all(|pair| pair[1] <= pair[0]));
    assert!(tolerances[19] < tolerances[0]);
    assert_eq!(tolerances[19], 0.002);
    assert!(population.distances().iter().all(|&d| d <= 0.002));

    let lines = std::fs::read_to_string(&outfile)?;
    assert_eq!(lines.lines().count(), 20);
    Ok(())
}
