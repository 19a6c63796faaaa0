//! Headless host for the demos: picks a backend, builds one renderer and
//! drives it for a fixed number of frames.

#![deny(clippy::all, clippy::pedantic)]
#![allow(clippy::missing_errors_doc)]

use std::path::PathBuf;

use anyhow::{Context, Result};
use clap::{Parser, ValueEnum};
use ssbo_compute::{AssetSource, BufferStore, ComputeBackend, CpuBackend, DirAssets};
use ssbo_render::{ConvRenderer, DemoConfig, InvocationProbe, PointCircleRenderer, Renderer};

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum Demo {
    Circle,
    Conv,
    Probe,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum Backend {
    Cpu,
    Gpu,
}

/// Run one storage-buffer demo headless.
#[derive(Debug, Parser)]
#[command(name = "ssbo-runtime", version)]
pub struct Args {
    #[arg(long, value_enum, default_value_t = Demo::Circle)]
    pub demo: Demo,

    /// Directory holding shaders, weights and the input image.
    #[arg(long, default_value = "assets")]
    pub assets: PathBuf,

    #[arg(long, default_value_t = 1)]
    pub frames: u32,

    /// JSON demo configuration; stock settings when omitted.
    #[arg(long)]
    pub config: Option<PathBuf>,

    #[arg(long, value_enum, default_value_t = Backend::Cpu)]
    pub backend: Backend,
}

/// How a run went.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RunSummary {
    pub frames: u32,
    pub skipped: u32,
}

fn build<B, S>(
    backend: B,
    demo: Demo,
    store: &BufferStore<S>,
    config: &DemoConfig,
) -> Result<Box<dyn Renderer>>
where
    B: ComputeBackend + 'static,
    S: AssetSource,
{
    let renderer: Box<dyn Renderer> = match demo {
        Demo::Circle => Box::new(PointCircleRenderer::init(backend, store, config)?),
        Demo::Conv => Box::new(ConvRenderer::init(backend, store, config)?),
        Demo::Probe => Box::new(InvocationProbe::init(backend, store, config)?),
    };
    Ok(renderer)
}

/// Builds the renderer `args` asks for.
pub fn renderer(args: &Args) -> Result<Box<dyn Renderer>> {
    let config = match &args.config {
        Some(path) => DemoConfig::from_json_file(path)?,
        None => DemoConfig::default(),
    };
    let store = BufferStore::new(DirAssets::new(args.assets.clone()));

    let renderer = match args.backend {
        Backend::Cpu => build(CpuBackend::new(), args.demo, &store, &config),
        #[cfg(feature = "gpu")]
        Backend::Gpu => {
            let gpu = ssbo_compute::WgpuBackend::try_new().context("creating the wgpu device")?;
            build(gpu, args.demo, &store, &config)
        }
        #[cfg(not(feature = "gpu"))]
        Backend::Gpu => anyhow::bail!("this build has no gpu backend; rebuild with --features gpu"),
    };
    renderer.with_context(|| format!("initialising the {:?} demo", args.demo))
}

/// Runs `args.frames` frames. Failed frames are counted, not fatal.
pub fn run(args: &Args) -> Result<RunSummary> {
    let mut renderer = renderer(args)?;
    tracing::info!(
        "running {} for {} frames on the {:?} backend",
        renderer.name(),
        args.frames,
        args.backend
    );

    let mut summary = RunSummary {
        frames: args.frames,
        skipped: 0,
    };
    for frame in 0..args.frames {
        if !renderer.render().is_completed() {
            summary.skipped += 1;
            tracing::debug!("frame {frame} skipped");
        }
    }
    if summary.skipped > 0 {
        tracing::warn!("{} of {} frames skipped", summary.skipped, summary.frames);
    }
    Ok(summary)
}
