//! Renders one slice through a synthetic phantom and writes it as PNG.

use std::path::PathBuf;
use std::process::ExitCode;

use clap::{Parser, ValueEnum};
use glam::{DMat3, DVec3};
use ndarray::Array3;
use tracing::{debug, error, info};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use volume_reslice::{
    BlendMode, Config, ImageData, Orientation, Resolution, ResliceError, Scene, SliceCompositor, Volume,
    VolumeKind,
};

#[derive(Debug, Clone, Copy, ValueEnum)]
enum Plane {
    Axial,
    Coronal,
    Sagittal,
}

impl From<Plane> for Orientation {
    fn from(plane: Plane) -> Self {
        match plane {
            Plane::Axial => Orientation::Axial,
            Plane::Coronal => Orientation::Coronal,
            Plane::Sagittal => Orientation::Sagittal,
        }
    }
}

#[derive(Debug, Clone, Copy, ValueEnum)]
enum Blend {
    Alpha,
    ReverseAlpha,
    Add,
    Subtract,
}

impl From<Blend> for BlendMode {
    fn from(blend: Blend) -> Self {
        match blend {
            Blend::Alpha => BlendMode::Alpha,
            Blend::ReverseAlpha => BlendMode::ReverseAlpha,
            Blend::Add => BlendMode::Add,
            Blend::Subtract => BlendMode::Subtract,
        }
    }
}

#[derive(Parser, Debug)]
#[command(name = "volume-reslice")]
#[command(author, version, about, long_about = None)]
struct Cli {
    /// Slice orientation
    #[arg(long, value_enum, default_value_t = Plane::Axial)]
    orientation: Plane,

    /// Output width and height in pixels
    #[arg(long, default_value_t = 512)]
    size: u32,

    /// Offset of the slice along its normal, in millimetres
    #[arg(long, default_value_t = 0.0, allow_hyphen_values = true)]
    offset: f64,

    #[arg(long, value_enum, default_value_t = Blend::Alpha)]
    blend: Blend,

    #[arg(long, default_value_t = 0.5)]
    foreground_opacity: f64,

    /// Draw the segmentation as outlines
    #[arg(long, default_value_t = false)]
    outline: bool,

    /// JSON file overriding pipeline tunables
    #[arg(long)]
    config: Option<PathBuf>,

    #[arg(short, long, default_value = "slice.png")]
    output: PathBuf,

    #[arg(short, long, default_value_t = false)]
    verbose: bool,
}

fn main() -> ExitCode {
    let cli = Cli::parse();
    init_logging(cli.verbose);

    let config = match load_config(cli.config.as_ref()) {
        Ok(config) => config,
        Err(e) => {
            error!("Configuration error: {}", e);
            return ExitCode::FAILURE;
        }
    };

    match render(&cli, config) {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            error!("Rendering failed: {}", e);
            ExitCode::FAILURE
        }
    }
}

fn init_logging(verbose: bool) {
    let env_filter = if verbose { "volume_reslice=debug" } else { "volume_reslice=info" };

    tracing_subscriber::registry()
        .with(tracing_subscriber::EnvFilter::try_from_default_env().unwrap_or_else(|_| env_filter.into()))
        .with(tracing_subscriber::fmt::layer())
        .init();
}

fn load_config(path: Option<&PathBuf>) -> Result<Config, ResliceError> {
    let Some(path) = path else {
        return Ok(Config::default());
    };
    let json = std::fs::read_to_string(path)?;
    Config::from_json(&json)
}

/// A 1 mm ellipsoid phantom with a shifted copy and a two-label segmentation.
fn phantom(scene: &Scene) -> Result<(), ResliceError> {
    let (depth, height, width) = (96, 128, 128);
    let center = DVec3::new(width as f64, height as f64, depth as f64) / 2.0;
    let radii = DVec3::new(50.0, 40.0, 35.0);
    let inside = |i: usize, j: usize, k: usize, shift: f64| {
        let p = (DVec3::new(i as f64 + shift, j as f64, k as f64) - center) / radii;
        p.length_squared()
    };

    let ct = Array3::from_shape_fn((depth, height, width), |(k, j, i)| {
        let r = inside(i, j, k, 0.0);
        if r < 1.0 { (1000.0 * (1.0 - r)) as i16 } else { -1000 }
    });
    let mr = Array3::from_shape_fn((depth, height, width), |(k, j, i)| {
        let r = inside(i, j, k, 15.0);
        if r < 1.0 { (255.0 * (1.0 - r)) as u8 } else { 0 }
    });
    let labels = Array3::from_shape_fn((depth, height, width), |(k, j, i)| match inside(i, j, k, 0.0) {
        r if r < 0.2 => 2u8,
        r if r < 0.5 => 1,
        _ => 0,
    });

    let origin = -center;
    for (id, kind, image) in [
        ("ct", VolumeKind::Scalar, ImageData::new(ct)?),
        ("mr", VolumeKind::Scalar, ImageData::new(mr)?),
        ("seg", VolumeKind::Label, ImageData::new(labels)?),
    ] {
        scene.add_volume(
            Volume::new(id, kind)
                .with_image(image)
                .with_geometry(origin, DVec3::ONE, DMat3::IDENTITY),
        );
    }
    Ok(())
}

fn render(cli: &Cli, config: Config) -> Result<(), ResliceError> {
    let scene = Scene::new(config);
    phantom(&scene)?;
    info!("Loaded volumes: {}", scene.volume_ids().join(", "));
    for id in scene.volume_ids() {
        if let Some(node) = scene.volume(&id) {
            let volume = node.borrow();
            debug!(volume = %id, kind = ?volume.kind(), spacing = ?volume.spacing(), "volume ready");
        }
    }

    let compositor = SliceCompositor::new(&scene, "Red");
    compositor.composite_node().modify(|c| {
        c.background_volume_id = Some("ct".into());
        c.foreground_volume_id = Some("mr".into());
        c.label_volume_id = Some("seg".into());
        c.foreground_opacity = cli.foreground_opacity;
        c.compositing = cli.blend.into();
    });
    compositor.slice_node().modify(|s| {
        s.set_orientation(cli.orientation.into());
        s.use_label_outline = cli.outline;
    });
    compositor.fit_slice_to_all(cli.size, cli.size);
    compositor.set_slice_offset(cli.offset);

    let effective = compositor.effective_blend_mode();
    info!(
        "Slice: {} at offset {:.1} mm, blending {:?}",
        compositor.slice_node().state().orientation().as_str(),
        compositor.slice_offset(),
        effective
    );

    let Some(image) = compositor.composited_image(Resolution::Xy) else {
        error!("No layer produced an image");
        return Ok(());
    };
    image.save(&cli.output)?;
    info!("Wrote {}", cli.output.display());
    Ok(())
}
