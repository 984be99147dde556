mod config;
mod stages;

use std::path::PathBuf;

use burn::backend::Autodiff;
use burn_ndarray::NdArray;
use burn_wgpu::{Wgpu, WgpuDevice};
use clap::Parser;

use crate::config::{AppConfig, BackendKind};
use crate::stages::{Runner, StageSelection};

/// MirrorFusion - dual-mirror data generation and depth-conditioned inpainting
#[derive(Parser, Debug)]
#[command(name = "mf-app")]
#[command(author, version, about, long_about = None)]
struct Args {
    /// JSON run configuration
    config: PathBuf,

    /// Stage to run
    #[arg(value_enum, default_value_t = StageSelection::All)]
    stage: StageSelection,
}

fn main() -> anyhow::Result<()> {
    env_logger::init();

    let args = Args::parse();
    let stages = args.stage.stages();

    let config = AppConfig::load(&args.config)?;
    log::info!(
        "MirrorFusion: workspace {}, backend {:?}, stages {:?}",
        config.workspace.display(),
        config.backend,
        stages
    );

    match config.backend {
        BackendKind::Cpu => Runner::<Autodiff<NdArray>>::new(config, Default::default())?.run(&stages),
        BackendKind::Wgpu => Runner::<Autodiff<Wgpu>>::new(config, WgpuDevice::default())?.run(&stages),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::stages::Stage;

    #[test]
    fn test_stage_defaults_to_all() {
        let args = Args::try_parse_from(["mf-app", "run.json"]).unwrap();
        assert_eq!(args.config, PathBuf::from("run.json"));
        assert_eq!(args.stage.stages(), vec![Stage::Generate, Stage::Train, Stage::Sample]);
    }

    #[test]
    fn test_stage_argument() {
        let args = Args::try_parse_from(["mf-app", "run.json", "evaluate"]).unwrap();
        assert_eq!(args.stage, StageSelection::Sample);

        assert!(Args::try_parse_from(["mf-app", "run.json", "render"]).is_err());
        assert!(Args::try_parse_from(["mf-app"]).is_err());
    }
}
