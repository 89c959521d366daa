use clap::{Args, Parser, Subcommand};
use ndarray::Array1;
use psr_gibbs::chain::{create_output_dir, read_json, write_json};
use psr_gibbs::{
    ModelSpec, NoiseModel, ParameterIndex, PulsarBlockGibbs, PulsarData, PulsarNoiseModel,
    SamplerConfig, simulate_residuals,
};
use rand::{SeedableRng, rngs::StdRng};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::PathBuf;

const SAMPLER_CONFIG_FILE: &str = "sampler_config.json";
const VERSION: &str = concat!(
    env!("CARGO_PKG_VERSION"),
    " (build ",
    env!("PSR_GIBBS_BUILD_TIMESTAMP"),
    ")"
);

#[derive(Parser, Debug)]
#[command(name = "psr-gibbs")]
#[command(version = VERSION)]
#[command(about = "Block Gibbs sampling of single-pulsar noise and GW free spectra", long_about = None)]
#[command(arg_required_else_help = true)]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    Sample(SampleArgs),
    Simulate(SimulateArgs),
}

#[derive(Args, Debug)]
struct SampleArgs {
    run: PathBuf,
    #[arg(long = "out")]
    out: PathBuf,
    #[arg(long = "niter", default_value_t = 10_000)]
    niter: usize,
    /// Continue from the chains already in the output directory.
    #[arg(long = "resume")]
    resume: bool,
    #[arg(long = "seed")]
    seed: Option<u64>,
}

#[derive(Args, Debug)]
struct SimulateArgs {
    run: PathBuf,
    #[arg(long = "out")]
    out: PathBuf,
    #[arg(long = "seed")]
    seed: Option<u64>,
    /// Fix a parameter for the simulation, as `name=value`.
    #[arg(long = "inject")]
    inject: Vec<String>,
}

/// Everything one run needs: data, model components, sampler settings and
/// optional starting values keyed by flat parameter name.
#[derive(Debug, Clone, Serialize, Deserialize)]
struct RunSpec {
    pulsar: PulsarData,
    model: ModelSpec,
    #[serde(default)]
    sampler: SamplerConfig,
    #[serde(default)]
    initial: Option<BTreeMap<String, f64>>,
}

fn main() {
    if let Err(e) = run() {
        eprintln!("error: {e}");
        std::process::exit(1);
    }
}

fn run() -> Result<(), String> {
    let cli = Cli::parse();
    match cli.command {
        Command::Sample(args) => run_sample(args),
        Command::Simulate(args) => run_simulate(args),
    }
}

fn run_sample(args: SampleArgs) -> Result<(), String> {
    let mut spec: RunSpec = read_json(&args.run).map_err(|e| e.to_string())?;
    if let Some(seed) = args.seed {
        spec.sampler.seed = seed;
    }
    let model = PulsarNoiseModel::new(spec.pulsar, &spec.model).map_err(|e| e.to_string())?;
    let mut sampler =
        PulsarBlockGibbs::new(model, spec.sampler.clone()).map_err(|e| e.to_string())?;
    for warning in sampler.report().warnings() {
        eprintln!("warning: {warning}");
    }

    let mut rng = StdRng::seed_from_u64(spec.sampler.seed);
    let x0 = initial_vector(sampler.index(), spec.initial.as_ref(), &mut rng)?;

    create_output_dir(&args.out).map_err(|e| e.to_string())?;
    write_json(&args.out.join(SAMPLER_CONFIG_FILE), sampler.config()).map_err(|e| e.to_string())?;
    sampler
        .sample(x0.view(), &args.out, args.niter, args.resume)
        .map_err(|e| e.to_string())?;

    if let Some(tuning) = sampler.white_tuning() {
        println!(
            "white-noise block: thinning {}, tuning acceptance {:.3}",
            tuning.thinning, tuning.acceptance_rate
        );
    }
    println!(
        "{}: {} iterations of {} parameters and {} coefficients in {}",
        sampler.model().pulsar_name(),
        args.niter,
        sampler.index().len(),
        sampler.layout().width,
        args.out.display()
    );
    Ok(())
}

fn run_simulate(args: SimulateArgs) -> Result<(), String> {
    let spec: RunSpec = read_json(&args.run).map_err(|e| e.to_string())?;
    let seed = args.seed.unwrap_or(spec.sampler.seed);
    let model =
        PulsarNoiseModel::new(spec.pulsar.clone(), &spec.model).map_err(|e| e.to_string())?;
    let index = ParameterIndex::new(model.parameters()).map_err(|e| e.to_string())?;

    let mut values = spec.initial.clone().unwrap_or_default();
    for item in &args.inject {
        let (name, value) = parse_injection(item)?;
        values.insert(name, value);
    }
    let mut rng = StdRng::seed_from_u64(seed);
    let x = initial_vector(&index, Some(&values), &mut rng)?;
    let simulation = simulate_residuals(&model, x.view(), &mut rng).map_err(|e| e.to_string())?;

    let mut out = spec;
    out.pulsar.residuals = simulation.residuals.to_vec();
    out.initial = Some(
        index
            .param_names()
            .iter()
            .cloned()
            .zip(x.iter().copied())
            .collect(),
    );
    write_json(&args.out, &out).map_err(|e| e.to_string())?;
    println!(
        "simulated {} residuals for {} into {}",
        out.pulsar.residuals.len(),
        out.pulsar.name,
        args.out.display()
    );
    Ok(())
}

/// Prior draw, overridden by any named starting values.
fn initial_vector(
    index: &ParameterIndex,
    values: Option<&BTreeMap<String, f64>>,
    rng: &mut StdRng,
) -> Result<Array1<f64>, String> {
    let mut x = index.sample_initial(rng);
    for (name, value) in values.into_iter().flatten() {
        let pos = index
            .position(name)
            .ok_or_else(|| format!("unknown parameter '{name}'"))?;
        x[pos] = *value;
    }
    Ok(x)
}

fn parse_injection(item: &str) -> Result<(String, f64), String> {
    let (name, value) = item
        .split_once('=')
        .ok_or_else(|| format!("expected name=value, got '{item}'"))?;
    let value = value
        .trim()
        .parse::<f64>()
        .map_err(|e| format!("invalid value for '{name}': {e}"))?;
    Ok((name.trim().to_string(), value))
}
