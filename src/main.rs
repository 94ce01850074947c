//! Scene viewer binary

use clap::Parser;
use scene_viewer::asset::gltf::load_gltf;
use scene_viewer::engine::run_headless;
use scene_viewer::{window, ViewerArgs, ViewerError};

fn run(args: &ViewerArgs) -> Result<(), ViewerError> {
    let config = args.config();
    let asset = load_gltf(args.asset_path()?)?;

    if args.headless {
        let stats = run_headless(&config, &asset, args.headless_frames())?;
        let drawn: u32 = stats.iter().map(|s| s.base.drawn).sum();
        log::info!("Rendered {} headless frames, {} draws", stats.len(), drawn);
        Ok(())
    } else {
        window::run_viewer(config, &asset)
    }
}

fn main() {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    let args = ViewerArgs::parse();
    if let Err(err) = run(&args) {
        log::error!("{}", err);
        std::process::exit(1);
    }
}
