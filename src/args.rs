//! Command line arguments
//!
//! Malformed or zero window dimensions fall back to the defaults with a
//! warning; a missing asset path is an error.

use crate::asset::AssetError;
use crate::ViewerConfig;
use clap::Parser;
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Scene viewer arguments.
#[derive(Parser, Debug, Clone)]
#[command(
    name = "scene-viewer",
    about = "Render a glTF scene with a depth pre-pass and a frustum-culled forward pass",
    long_about = "Loads a .gltf or .glb file and renders it every frame.\n\n\
        CONTROLS:\n\
          WASD / QE   move, Shift to sprint\n\
          Right mouse look around\n\
          Wheel       change move speed\n\
          Escape      quit\n\
        \n\
        EXAMPLES:\n\
          # Open a model in a 1280x720 window\n\
          scene-viewer model.glb -W 1280 -H 720\n\
        \n\
          # Render three frames without a GPU and exit\n\
          scene-viewer model.glb --headless --frames 3",
    version
)]
pub struct ViewerArgs {
    /// glTF or GLB file to load.
    pub asset: Option<PathBuf>,

    /// Window width in pixels.
    #[arg(short = 'W', long)]
    pub width: Option<String>,

    /// Window height in pixels.
    #[arg(short = 'H', long)]
    pub height: Option<String>,

    /// Wait for vertical sync when presenting.
    #[arg(long)]
    pub vsync: bool,

    /// Exit after rendering N frames.
    #[arg(long)]
    pub frames: Option<u64>,

    /// Render with the CPU backend instead of opening a window.
    #[arg(long)]
    pub headless: bool,

    /// Give up on a fence wait after this many milliseconds (default: wait forever).
    #[arg(long)]
    pub fence_timeout_ms: Option<u64>,
}

/// Frames rendered by `--headless` when `--frames` is absent
pub const DEFAULT_HEADLESS_FRAMES: u64 = 3;

fn parse_dimension(value: Option<&str>, name: &str, default: u32) -> u32 {
    let Some(value) = value else {
        return default;
    };
    match value.trim().parse::<u32>() {
        Ok(parsed) if parsed > 0 => parsed,
        _ => {
            log::warn!("Invalid {} '{}', using {}", name, value, default);
            default
        }
    }
}

impl ViewerArgs {
    pub fn config(&self) -> ViewerConfig {
        let defaults = ViewerConfig::default();
        ViewerConfig {
            width: parse_dimension(self.width.as_deref(), "width", defaults.width),
            height: parse_dimension(self.height.as_deref(), "height", defaults.height),
            vsync: self.vsync,
            frame_limit: self.frames,
            fence_timeout: self.fence_timeout_ms.map(Duration::from_millis),
            ..defaults
        }
    }

    pub fn asset_path(&self) -> Result<&Path, AssetError> {
        self.asset.as_deref().ok_or(AssetError::Missing)
    }

    pub fn headless_frames(&self) -> u64 {
        self.frames.unwrap_or(DEFAULT_HEADLESS_FRAMES)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;

    fn parse(args: &[&str]) -> ViewerArgs {
        ViewerArgs::try_parse_from(std::iter::once("scene-viewer").chain(args.iter().copied()))
            .unwrap()
    }

    #[rstest]
    #[case(&["model.glb"], 800, 600)]
    #[case(&["model.glb", "-W", "1024", "-H", "768"], 1024, 768)]
    #[case(&["model.glb", "--width", "wide"], 800, 600)]
    #[case(&["model.glb", "--width", "0", "--height", "tall"], 800, 600)]
    #[case(&["model.glb", "--height", "480"], 800, 480)]
    fn dimensions_fall_back(#[case] args: &[&str], #[case] width: u32, #[case] height: u32) {
        let config = parse(args).config();
        assert_eq!((config.width, config.height), (width, height));
    }

    #[test]
    fn missing_asset_is_an_error() {
        let args = parse(&["--headless"]);
        assert!(matches!(args.asset_path(), Err(AssetError::Missing)));
        assert_eq!(args.headless_frames(), DEFAULT_HEADLESS_FRAMES);
    }

    #[test]
    fn flags_reach_config() {
        let args = parse(&["scene.gltf", "--vsync", "--frames", "10", "--fence-timeout-ms", "250"]);
        let config = args.config();
        assert!(config.vsync);
        assert_eq!(config.frame_limit, Some(10));
        assert_eq!(config.fence_timeout, Some(Duration::from_millis(250)));
        assert_eq!(args.asset_path().unwrap(), Path::new("scene.gltf"));
    }
}
