use std::error::Error;
use std::sync::Arc;

use spim_render::{
    ComputeBackend, CpuBackend, DemoLoader, Processor, RenderConfig, RenderEngine, SortBy,
    VolumeCache, VolumeLoader, WgpuBackend, open_path, transform,
};

/// Usage: `spim-render [config.json] [source folder]`
///
/// Renders the first time point of the source (the synthetic demo when no
/// folder is given) to `result.png`.
#[tokio::main(flavor = "current_thread")]
async fn main() {
    env_logger::init();
    if let Err(err) = run().await {
        log::error!("{}", err);
        std::process::exit(1);
    }
}

async fn run() -> Result<(), Box<dyn Error>> {
    let mut args = std::env::args().skip(1);
    let config = match args.next() {
        Some(path) => RenderConfig::from_json_file(path)?,
        None => RenderConfig::default(),
    };
    let loader = open_source(args.next().as_deref())?;
    log::info!("{} time points from {}", loader.frame_count(), loader.name());

    let cache = VolumeCache::with_loader(loader, config.prefetch_depth);

    if config.processor == Processor::GPU {
        match WgpuBackend::new(config.device_index).await {
            Ok(backend) => return render(backend, &cache, &config),
            Err(err) => log::warn!("{}, falling back to the CPU", err),
        }
    }
    render(CpuBackend::new(), &cache, &config)
}

fn open_source(source: Option<&str>) -> Result<Arc<dyn VolumeLoader>, Box<dyn Error>> {
    match source {
        Some(path) => Ok(open_path(path, SortBy::default())?),
        None => Ok(Arc::new(DemoLoader::default())),
    }
}

fn render<B: ComputeBackend>(
    backend: B,
    cache: &VolumeCache,
    config: &RenderConfig,
) -> Result<(), Box<dyn Error>> {
    let mut engine = RenderEngine::new(backend, config.width, config.height)?;
    log::info!("rendering {:?} on {}", config.mode, engine.backend().name());

    engine.set_compositing_params(config.compositing);
    engine.set_transform(transform::rotate_y(config.rotation_y), None);
    engine.show_frame(cache, 0)?;

    engine.render(config.mode);
    if let Some(err) = engine.last_error() {
        log::warn!("frame rendered with error: {}", err);
    }
    engine.raster().save_png("result.png")?;
    log::info!("saved result.png");
    Ok(())
}
