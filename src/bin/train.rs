//! compact-train: train a masked splat model from a scene manifest
//!
//! Usage:
//!   compact-train --scene path/to/scene.json [--out-dir DIR] [overrides...]

use compact_splat::io::checkpoint::Checkpoint;
use compact_splat::io::scene::load_scene;
use compact_splat::optim::Trainer;
use compact_splat::render::CpuRasterizer;
use compact_splat::viewer::ViewerBridge;
use compact_splat::TrainerConfig;
use nalgebra::Vector3;
use std::path::PathBuf;

/// Create timestamped run directory under runs/.
fn create_run_directory() -> std::io::Result<PathBuf> {
    use time::OffsetDateTime;

    let now = OffsetDateTime::now_utc();
    let dir_name = format!(
        "runs/{:04}{:02}{:02}_{:02}{:02}",
        now.year(),
        now.month() as u8,
        now.day(),
        now.hour(),
        now.minute()
    );

    let mut path = PathBuf::from(&dir_name);
    let mut counter = 1;
    while path.exists() {
        path = PathBuf::from(format!("{}.{}", dir_name, counter));
        counter += 1;
    }
    std::fs::create_dir_all(&path)?;
    Ok(path)
}

fn save_final_preview(
    trainer: &Trainer<CpuRasterizer>,
    camera: &compact_splat::Camera,
    path: &std::path::Path,
) -> anyhow::Result<()> {
    let frame = trainer.render_preview(camera, 1.0, trainer.sh_degree(), false);
    let mut img = image::RgbImage::new(frame.width, frame.height);
    for (i, p) in frame.pixels.iter().enumerate() {
        let x = (i as u32) % frame.width;
        let y = (i as u32) / frame.width;
        let to_srgb = |c: f32| (c.clamp(0.0, 1.0).powf(1.0 / 2.2) * 255.0) as u8;
        img.put_pixel(x, y, image::Rgb([to_srgb(p.x), to_srgb(p.y), to_srgb(p.z)]));
    }
    img.save(path)?;
    Ok(())
}

fn run() -> anyhow::Result<()> {
    eprintln!("compact-train v{}", compact_splat::VERSION);

    let raw_args: Vec<String> = std::env::args().skip(1).collect();
    let mut scene_path: Option<PathBuf> = None;
    let mut out_dir: Option<PathBuf> = None;
    let mut resume_path: Option<PathBuf> = None;
    let mut viewer_addr: Option<String> = None;

    // A --config file establishes the baseline; the remaining flags
    // override individual fields regardless of their position.
    let mut config = TrainerConfig::default();
    if let Some(pos) = raw_args.iter().position(|a| a == "--config") {
        let path = raw_args
            .get(pos + 1)
            .ok_or_else(|| anyhow::anyhow!("--config needs a value"))?;
        let text = std::fs::read_to_string(path)?;
        config = serde_json::from_str(&text)?;
    }

    let mut args = raw_args.into_iter();

    fn parse_next<T: std::str::FromStr>(
        args: &mut impl Iterator<Item = String>,
        flag: &str,
    ) -> anyhow::Result<T>
    where
        T::Err: std::fmt::Display,
    {
        let value = args
            .next()
            .ok_or_else(|| anyhow::anyhow!("{flag} needs a value"))?;
        value
            .parse()
            .map_err(|e| anyhow::anyhow!("bad value for {flag}: {e}"))
    }

    while let Some(a) = args.next() {
        match a.as_str() {
            "--scene" => scene_path = args.next().map(PathBuf::from),
            "--out-dir" => out_dir = args.next().map(PathBuf::from),
            "--resume" => resume_path = args.next().map(PathBuf::from),
            "--config" => {
                args.next(); // already applied above
            }
            "--viewer" => viewer_addr = args.next(),
            "--iters" => config.iterations = parse_next(&mut args, "--iters")?,
            "--seed" => config.seed = parse_next(&mut args, "--seed")?,
            "--lambda-dssim" => config.lambda_dssim = parse_next(&mut args, "--lambda-dssim")?,
            "--densify-grad-threshold" => {
                config.densify_grad_threshold =
                    parse_next(&mut args, "--densify-grad-threshold")?;
            }
            "--densify-until" => {
                config.densify_until_iter = parse_next(&mut args, "--densify-until")?;
            }
            "--prune-iteration" => {
                config.prune_iterations = vec![parse_next(&mut args, "--prune-iteration")?];
            }
            "--gate-switch" => {
                config.gate_switch_iteration = Some(parse_next(&mut args, "--gate-switch")?);
            }
            "--gate-temperature" => {
                config.gate_temperature = parse_next(&mut args, "--gate-temperature")?;
            }
            "--white-bg" => config.white_background = true,
            "--log-interval" => config.log_interval = parse_next(&mut args, "--log-interval")?,
            "--checkpoint-interval" => {
                config.checkpoint_interval = parse_next(&mut args, "--checkpoint-interval")?;
            }
            "--help" | "-h" => {
                eprintln!("Usage:");
                eprintln!("  compact-train --scene <scene.json> [--out-dir DIR] [--resume checkpoint.csp]");
                eprintln!("      [--config config.json] [--viewer ADDR:PORT] [--iters N] [--seed U64]");
                eprintln!("      [--lambda-dssim F] [--densify-grad-threshold F] [--densify-until N]");
                eprintln!("      [--prune-iteration N] [--gate-switch N] [--gate-temperature F]");
                eprintln!("      [--white-bg] [--log-interval N] [--checkpoint-interval N]");
                eprintln!();
                eprintln!("  --config loads a full TrainerConfig as JSON; other flags override it.");
                return Ok(());
            }
            other => anyhow::bail!("unknown arg: {other} (see --help)"),
        }
    }

    let scene_path = scene_path.ok_or_else(|| anyhow::anyhow!("missing --scene <scene.json>"))?;
    let scene = load_scene(&scene_path)?;
    eprintln!(
        "loaded scene `{}`: {} views, {} seed points, extent {:.3}",
        scene_path.display(),
        scene.views.len(),
        scene.cloud.len(),
        scene.extent
    );

    let out_dir = match out_dir {
        Some(dir) => {
            std::fs::create_dir_all(&dir)?;
            dir
        }
        None => create_run_directory()?,
    };

    let background = if config.white_background {
        Vector3::new(1.0, 1.0, 1.0)
    } else {
        Vector3::zeros()
    };
    let rasterizer = CpuRasterizer::new(background);

    let mut trainer = match resume_path {
        Some(path) => {
            let checkpoint = Checkpoint::load(&path)?;
            eprintln!(
                "resuming from `{}` at iteration {}",
                path.display(),
                checkpoint.iteration
            );
            Trainer::resume(config, scene.views, rasterizer, checkpoint)?
        }
        None => Trainer::new(config, scene.cloud, scene.views, scene.extent, rasterizer)?,
    };

    // Record the resolved configuration next to the checkpoints.
    let config_json = serde_json::to_string_pretty(trainer.config())?;
    std::fs::write(out_dir.join("config.json"), config_json)?;

    let mut viewer = match viewer_addr {
        Some(addr) => {
            let bridge =
                ViewerBridge::bind(&addr, scene_path.to_string_lossy().into_owned())?;
            eprintln!("viewer listening on {}", bridge.local_addr()?);
            Some(bridge)
        }
        None => None,
    };

    trainer.run(viewer.as_mut(), Some(&out_dir))?;

    eprintln!(
        "done: {} points after {} iterations (ema loss {:.6})",
        trainer.cloud().len(),
        trainer.iteration(),
        trainer.ema_loss()
    );

    // Render the first training view as a quick visual sanity check.
    if let Some(camera) = trainer.first_view_camera() {
        let preview_path = out_dir.join("final_preview.png");
        save_final_preview(&trainer, &camera, &preview_path)?;
        eprintln!("saved `{}`", preview_path.display());
    }

    Ok(())
}

fn main() {
    if let Err(e) = run() {
        eprintln!("error: {e:#}");
        std::process::exit(1);
    }
}
