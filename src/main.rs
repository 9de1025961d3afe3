use std::path::PathBuf;

use anyhow::Context;
use clap::{Parser, ValueEnum};
use log::info;

use ecm_fibertrack_lib::{run, Analysis, Config};

/// Command-line arguments
#[derive(Parser, Debug)]
#[clap(author, version, about = "ECM FiberTrack - fiber architecture and cell-track alignment")]
struct Args {
    /// Path to configuration file
    #[clap(short, long, default_value = "config.toml")]
    config: String,

    /// Path to input image or directory (overwrites config)
    #[clap(short, long)]
    input: Option<String>,

    /// Spot table exported from the tracker (overwrites config)
    #[clap(short, long)]
    tracks: Option<String>,

    /// Path to output directory (overwrites config)
    #[clap(short, long)]
    output: Option<String>,

    /// Analysis to run
    #[clap(short, long, value_enum, default_value = "all")]
    analysis: AnalysisArg,

    /// Save intermediate images and log at debug level
    #[clap(short, long)]
    debug: bool,
}

#[derive(Debug, Clone, Copy, ValueEnum)]
enum AnalysisArg {
    Alignment,
    Order,
    Segmentation,
    Tracks,
    All,
}

impl From<AnalysisArg> for Analysis {
    fn from(arg: AnalysisArg) -> Self {
        match arg {
            AnalysisArg::Alignment => Analysis::Alignment,
            AnalysisArg::Order => Analysis::Order,
            AnalysisArg::Segmentation => Analysis::Segmentation,
            AnalysisArg::Tracks => Analysis::Tracks,
            AnalysisArg::All => Analysis::All,
        }
    }
}

fn main() -> anyhow::Result<()> {
    let args = Args::parse();

    let default_level = if args.debug { "debug" } else { "info" };
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or(default_level)).init();

    // Missing config file falls back to defaults so CLI flags alone can drive a run
    let mut config = if PathBuf::from(&args.config).is_file() {
        Config::from_file(&args.config)
            .with_context(|| format!("loading configuration from {}", args.config))?
    } else {
        info!("No configuration at {}, using defaults", args.config);
        Config::default()
    };

    if let Some(input) = args.input {
        config.input_path = input;
    }
    if let Some(tracks) = args.tracks {
        config.tracks_path = Some(tracks);
    }
    if let Some(output) = args.output {
        config.output_base_dir = output;
    }

    let analysis = Analysis::from(args.analysis);
    config.validate(analysis.needs_images()).context("invalid configuration")?;

    let summary = run(&config, analysis, args.debug).context("analysis failed")?;
    for path in &summary.outputs {
        info!("Wrote {}", path.display());
    }

    if summary.images_failed > 0 {
        anyhow::bail!("{} image(s) failed to process", summary.images_failed);
    }

    Ok(())
}
