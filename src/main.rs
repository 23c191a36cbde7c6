use anyhow::{Context, Result};
use std::path::PathBuf;
use std::sync::{Arc, Mutex};

use focusstack::image_io::write_image;
use focusstack::logger::DualLogger;
use focusstack::pipeline::{preprocess_stack, run_pipeline_with, stack_name, ProgressCallback};
use focusstack::settings::{load_settings, settings_path};
use focusstack::{DebugSink, DirectorySink, DiskCache, StackCache};

fn usage() -> ! {
    eprintln!("usage: focusstack <input_dir> [output_dir]");
    std::process::exit(2);
}

pub fn main() -> Result<()> {
    let mut args = std::env::args_os().skip(1);
    let input_dir = PathBuf::from(args.next().unwrap_or_else(|| usage()));
    let output_override = args.next().map(PathBuf::from);
    if args.next().is_some() {
        usage();
    }

    DualLogger::init()?;
    log::info!("Settings: {}", settings_path().display());
    let mut settings = load_settings();
    if let Some(output_dir) = output_override {
        settings.output_dir = output_dir;
    }
    DualLogger::set_log_file(&settings.output_dir.join("focusstack.log"))?;

    if !input_dir.is_dir() {
        anyhow::bail!("input directory {} does not exist", input_dir.display());
    }
    let name = stack_name(&input_dir);

    let progress: ProgressCallback = Arc::new(Mutex::new(|msg: String, pct: f32| {
        log::info!("[{:5.1}%] {}", pct, msg);
    }));

    let cache = settings
        .use_cache
        .then(|| DiskCache::new(settings.cache_dir()));
    let stack = preprocess_stack(
        &input_dir,
        &settings,
        cache.as_ref().map(|c| c as &dyn StackCache),
        Some(progress.clone()),
    )
    .with_context(|| format!("preparing stack from {}", input_dir.display()))?;

    let sink = settings
        .debug_output
        .then(|| DirectorySink::new(settings.output_dir.join("debug").join(&name)));
    if let Some(ref sink) = sink {
        log::info!("Writing debug artifacts to {}", sink.root().display());
    }

    let fused = run_pipeline_with(
        &stack,
        &settings.fusion,
        sink.as_ref().map(|s| s as &dyn DebugSink),
        Some(progress),
    )
    .context("fusing stack")?;

    let output_path = settings
        .output_dir
        .join("fused_images")
        .join(format!("{}_fused.png", name));
    write_image(&output_path, &fused)
        .with_context(|| format!("writing {}", output_path.display()))?;
    log::info!("Fused image written to {}", output_path.display());
    Ok(())
}
