// Copyright (c) 2026, Chad Hogan
// All rights reserved.
//
// This source code is licensed under the BSD-3-Clause license found in the
// LICENSE file in the root directory of this source tree.

use std::path::{Path, PathBuf};

use anyhow::{bail, Context, Result};
use clap::{Args, Parser, Subcommand};
use log::info;
use ndarray::Array2;

use traveltime_inversion::core::{GridDims, Simbox};
use traveltime_inversion::field::{lateral_correlation, Field3D};
use traveltime_inversion::inversion::{
    Horizon, HorizonData, InversionConfig, InversionState, ProgressInfo, PushDownHorizon,
    RmsSurvey, SurveyData, TravelTimeInversion,
};
use traveltime_inversion::io;
use traveltime_inversion::joint::{JointModel, SingleFieldModel};
use traveltime_inversion::prior::{circulant_correlation, ExponentialVariogram, IntervalPrior};

#[derive(Parser)]
#[command(
    name = "traveltime-inversion",
    about = "Bayesian inversion of push-down horizons and RMS velocities"
)]
struct Cli {
    #[command(flatten)]
    model: ModelArgs,

    /// Number of Rayon worker threads
    #[arg(long, global = true)]
    threads: Option<usize>,

    /// Print trace-loop progress to stderr
    #[arg(long, global = true)]
    progress: bool,

    /// Log debug messages
    #[arg(short = 'v', long, global = true)]
    verbose: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Args)]
struct ModelArgs {
    /// Grid size, comma-separated (nx,ny,nz)
    #[arg(short = 's', long)]
    size: String,

    /// Lateral spacing, comma-separated (dx,dy)
    #[arg(long, default_value = "25.0,25.0")]
    spacing: String,

    /// Top surface in ms: "uniform:<t>" or "file:<path>"
    #[arg(long)]
    top: String,

    /// Base surface in ms: "uniform:<t>" or "file:<path>"
    #[arg(long)]
    base: String,

    /// Vp: "uniform:<v>" or "file:<path>"
    #[arg(long)]
    vp: String,

    /// Vs: "uniform:<v>" or "file:<path>"
    #[arg(long)]
    vs: String,

    /// Density: "uniform:<v>" or "file:<path>"
    #[arg(long)]
    rho: String,

    /// Standard deviations of log Vp, log Vs and log density, comma-separated
    #[arg(long, default_value = "0.1,0.1,0.05")]
    log_std: String,

    /// Correlations Vp-Vs, Vp-density and Vs-density, comma-separated
    #[arg(long, default_value = "0.7,0.4,0.5")]
    log_corr: String,

    /// Vertical correlation range of the prior (ms)
    #[arg(long, default_value = "40.0")]
    vertical_range: f64,

    /// Lateral correlation range of the prior
    #[arg(long, default_value = "1000.0")]
    lateral_range: f64,

    /// Lateral range of the kriging variogram
    #[arg(long, default_value = "2000.0")]
    kriging_range: f64,

    /// Lateral correlation range of the stationary observation error
    #[arg(long)]
    error_range: Option<f64>,

    /// Smallest accepted thinnest/thickest layer ratio after regridding
    #[arg(long, default_value = "0.41")]
    lz_limit: f64,

    /// Do not resample covariance kernels when regridding
    #[arg(long)]
    keep_covariances: bool,

    /// Output directory
    #[arg(short = 'o', long, default_value = ".")]
    output: PathBuf,
}

#[derive(Subcommand)]
enum Command {
    /// Invert push-down horizons of a monitor survey
    Horizon {
        /// Horizon as "<name>:<initial.npy>:<push_down.npy>:<std_ms>" (repeatable)
        #[arg(long = "horizon", num_args = 1, required = true)]
        horizons: Vec<String>,

        /// Standard deviation of the log velocity change
        #[arg(long, default_value = "0.05")]
        change_std: f64,

        /// Regrid using the inverted velocity change
        #[arg(long)]
        regrid: bool,
    },
    /// Invert RMS velocities
    Rms {
        /// Sample times of the RMS cube (.npy vector, ms)
        #[arg(long)]
        times: PathBuf,

        /// RMS velocity cube (.npy, nx × ny × n_samples)
        #[arg(long)]
        velocities: PathBuf,

        /// Standard deviation of the RMS velocities
        #[arg(long)]
        std_dev: f64,

        /// Time-lapse number; monitors (> 0) shift the axis before updating
        #[arg(long, default_value = "0")]
        time_lapse: usize,

        /// Layers above the model
        #[arg(long, default_value = "50")]
        above_layers: usize,

        /// Velocity standard deviation above the model
        #[arg(long, default_value = "100.0")]
        above_std: f64,

        /// Vertical correlation range above the model (ms)
        #[arg(long, default_value = "100.0")]
        above_range: f64,

        /// Layers below the model
        #[arg(long, default_value = "50")]
        below_layers: usize,

        /// Thickness of the interval below the model (ms)
        #[arg(long, default_value = "500.0")]
        below_thickness: f64,

        /// Velocity standard deviation below the model
        #[arg(long, default_value = "100.0")]
        below_std: f64,

        /// Vertical correlation range below the model (ms)
        #[arg(long, default_value = "100.0")]
        below_range: f64,

        /// Velocity at the datum
        #[arg(long)]
        velocity_top: f64,

        /// Velocity at the base of the interval below the model
        #[arg(long)]
        velocity_base: f64,
    },
}

fn parse_list<T: std::str::FromStr>(s: &str, n: usize, what: &str) -> Result<Vec<T>>
where
    T::Err: std::error::Error + Send + Sync + 'static,
{
    let parts: Vec<T> = s
        .split(',')
        .map(|p| p.trim().parse::<T>())
        .collect::<std::result::Result<Vec<_>, _>>()
        .with_context(|| format!("invalid --{}: expected {} comma-separated values", what, n))?;
    if parts.len() != n {
        bail!("--{} has {} components, expected {}", what, parts.len(), n);
    }
    Ok(parts)
}

fn build_surface(arg: &str, shape: [usize; 2]) -> Result<Array2<f64>> {
    if let Some(val_str) = arg.strip_prefix("uniform:") {
        let val: f64 = val_str.parse().context("invalid uniform surface value")?;
        if !val.is_finite() {
            bail!("uniform surface value must be finite, got {}", val);
        }
        return Ok(Array2::from_elem((shape[0], shape[1]), val));
    }
    if let Some(path_str) = arg.strip_prefix("file:") {
        return io::load_surface(Path::new(path_str), shape)
            .with_context(|| format!("loading surface {}", path_str));
    }
    bail!(
        "unknown surface '{}'. Expected 'uniform:<t>' or 'file:<path>'",
        arg
    );
}

fn build_log_field(arg: &str, dims: GridDims) -> Result<Field3D> {
    if let Some(val_str) = arg.strip_prefix("uniform:") {
        let val: f64 = val_str.parse().context("invalid uniform value")?;
        if !val.is_finite() || val <= 0.0 {
            bail!("uniform value must be positive and finite, got {}", val);
        }
        return Ok(Field3D::constant(dims, val.ln()));
    }
    if let Some(path_str) = arg.strip_prefix("file:") {
        return io::load_log_velocity(Path::new(path_str), dims)
            .with_context(|| format!("loading {}", path_str));
    }
    bail!(
        "unknown field '{}'. Expected 'uniform:<v>' or 'file:<path>'",
        arg
    );
}

/// Covariance kernels sharing one vertical and one lateral correlation.
struct KernelFactory {
    dims: GridDims,
    vertical: Vec<f64>,
    lateral: Array2<f64>,
}

impl KernelFactory {
    fn new(args: &ModelArgs, dims: GridDims, simbox: &Simbox) -> Self {
        let dz = 0.5 * (simbox.min_dz() + simbox.max_dz());
        let vertical = circulant_correlation(
            dims.nzp,
            dz,
            &ExponentialVariogram::exponential(args.vertical_range),
        );
        let lateral = lateral_correlation(
            dims.nxp,
            dims.nyp,
            (simbox.dx(), simbox.dy()),
            &ExponentialVariogram::exponential(args.lateral_range),
        );
        KernelFactory {
            dims,
            vertical,
            lateral,
        }
    }

    fn kernel(&self, covariance: f64) -> Result<Field3D> {
        let profile: Vec<f64> = self.vertical.iter().map(|c| c * covariance).collect();
        Ok(Field3D::stationary_covariance(
            self.dims,
            &self.lateral,
            &profile,
        )?)
    }
}

fn build_state(args: &ModelArgs) -> Result<(InversionState, KernelFactory)> {
    let size: Vec<usize> = parse_list(&args.size, 3, "size")?;
    let spacing: Vec<f64> = parse_list(&args.spacing, 2, "spacing")?;
    let lateral = [size[0], size[1]];
    let top = build_surface(&args.top, lateral)?;
    let base = build_surface(&args.base, lateral)?;
    let simbox = Simbox::new((0.0, 0.0), (spacing[0], spacing[1]), top, base, size[2])
        .context("invalid simbox")?;

    let extra = [
        (args.lateral_range / simbox.dx()).ceil() as usize,
        (args.lateral_range / simbox.dy()).ceil() as usize,
        (args.vertical_range / simbox.min_dz()).ceil() as usize,
    ];
    let dims = GridDims::padded([size[0], size[1], size[2]], extra)?;
    info!(
        "grid {}x{}x{} padded to {}x{}x{}",
        dims.nx, dims.ny, dims.nz, dims.nxp, dims.nyp, dims.nzp
    );

    let std: Vec<f64> = parse_list(&args.log_std, 3, "log-std")?;
    let corr: Vec<f64> = parse_list(&args.log_corr, 3, "log-corr")?;
    let kernels = KernelFactory::new(args, dims, &simbox);
    let joint = JointModel::new(
        [
            build_log_field(&args.vp, dims)?,
            build_log_field(&args.vs, dims)?,
            build_log_field(&args.rho, dims)?,
        ],
        [
            kernels.kernel(std[0] * std[0])?,
            kernels.kernel(std[1] * std[1])?,
            kernels.kernel(std[2] * std[2])?,
        ],
        [
            kernels.kernel(corr[0] * std[0] * std[1])?,
            kernels.kernel(corr[1] * std[0] * std[2])?,
            kernels.kernel(corr[2] * std[1] * std[2])?,
        ],
    )?;
    Ok((InversionState::new(simbox, joint)?, kernels))
}

fn build_config(cli: &Cli) -> Result<InversionConfig> {
    let args = &cli.model;
    let mut config = InversionConfig::new()
        .with_kriging_range(args.kriging_range)?
        .with_lz_limit(args.lz_limit)?
        .with_resample_covariances(!args.keep_covariances);
    if let Some(range) = args.error_range {
        config = config.with_error_correlation_range(range)?;
    }
    if let Some(threads) = cli.threads {
        config = config.with_threads(threads);
    }
    Ok(config)
}

fn parse_horizon(arg: &str, shape: [usize; 2]) -> Result<(Horizon, PushDownHorizon)> {
    let parts: Vec<&str> = arg.split(':').collect();
    if parts.len() != 4 {
        bail!(
            "--horizon expects '<name>:<initial.npy>:<push_down.npy>:<std_ms>', got '{}'",
            arg
        );
    }
    let std_dev: f64 = parts[3].parse().context("invalid horizon standard deviation")?;
    let name = parts[0].to_string();
    let times = io::load_surface(Path::new(parts[1]), shape)
        .with_context(|| format!("loading initial horizon {}", parts[1]))?;
    let push_down = io::load_surface(Path::new(parts[2]), shape)
        .with_context(|| format!("loading push-down {}", parts[2]))?;
    Ok((
        Horizon {
            name: name.clone(),
            times,
        },
        PushDownHorizon {
            name,
            push_down,
            std_dev,
        },
    ))
}

fn write_outputs(state: &mut InversionState, dir: &Path) -> Result<()> {
    std::fs::create_dir_all(dir).with_context(|| format!("creating {}", dir.display()))?;
    state.joint.to_space()?;
    for (field, name) in state
        .joint
        .means
        .iter()
        .zip(["log_vp", "log_vs", "log_rho"])
    {
        io::save_field(field, &dir.join(format!("{}.npy", name)))?;
    }
    if let Some(dynamic) = state.dynamic.as_mut() {
        dynamic.to_space()?;
        io::save_field(&dynamic.mean, &dir.join("log_vp_change.npy"))?;
    }
    io::save_surface(state.simbox.top_surface(), &dir.join("top.npy"))?;
    io::save_surface(state.simbox.base_surface(), &dir.join("base.npy"))?;
    if let Some(mapping) = &state.depth_mapping {
        io::save_surface(&mapping.top_depth(), &dir.join("top_depth.npy"))?;
        io::save_array3(mapping.depths(), &dir.join("depth.npy"))?;
    }
    info!("results written to {}", dir.display());
    Ok(())
}

fn main() -> Result<()> {
    let cli = Cli::parse();
    let level = if cli.verbose { "debug" } else { "info" };
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or(level)).init();

    let config = build_config(&cli)?;
    let (mut state, kernels) = build_state(&cli.model)?;
    let shape = [state.simbox.nx(), state.simbox.ny()];

    let mut driver = TravelTimeInversion::new(config);
    if cli.progress {
        driver = driver.with_progress(Box::new(|info: ProgressInfo| {
            eprintln!(
                "[{:.1}s] traces {}/{}",
                info.elapsed.as_secs_f64(),
                info.traces_processed,
                info.total_traces,
            );
        }));
    }

    match &cli.command {
        Command::Horizon {
            horizons,
            change_std,
            regrid,
        } => {
            let mut data = HorizonData::default();
            for arg in horizons {
                let (initial, push_down) = parse_horizon(arg, shape)?;
                data.initial.push(initial);
                data.push_down.push(push_down);
            }
            let change = SingleFieldModel::new(
                Field3D::zeros(kernels.dims),
                kernels.kernel(change_std * change_std)?,
            )?;
            state = state.with_dynamic(change)?;
            let summary = driver.horizon_pass(&mut state, &data, *regrid)?;
            info!("{:?}", summary);
        }
        Command::Rms {
            times,
            velocities,
            std_dev,
            time_lapse,
            above_layers,
            above_std,
            above_range,
            below_layers,
            below_thickness,
            below_std,
            below_range,
            velocity_top,
            velocity_base,
        } => {
            let times = io::load_vector_any(times)
                .with_context(|| format!("loading {}", times.display()))?
                .to_vec();
            let cube = io::load_array3(velocities, [shape[0], shape[1], times.len()])
                .with_context(|| format!("loading {}", velocities.display()))?;
            let traces = io::rms_traces_from_cube(&times, &cube)?;
            if traces.is_empty() {
                bail!("the RMS cube holds no valid trace");
            }
            let survey = SurveyData {
                time_lapse: *time_lapse,
                horizons: None,
                rms: Some(RmsSurvey {
                    traces,
                    std_dev: *std_dev,
                    above: IntervalPrior::new(*above_layers, above_std * above_std, *above_range)?,
                    below: IntervalPrior::new(*below_layers, below_std * below_std, *below_range)?,
                    below_thickness: *below_thickness,
                    velocity_top: *velocity_top,
                    velocity_base: *velocity_base,
                }),
            };
            for summary in driver.run(&mut state, &survey)? {
                info!("{:?}", summary);
            }
        }
    }

    write_outputs(&mut state, &cli.model.output)
}
