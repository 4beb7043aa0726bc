use anyhow::{Context, Result, anyhow};
use clap::{Arg, ArgMatches, value_parser};
use std::fs::File;
use std::io::BufWriter;
use std::path::{Path, PathBuf};
use tracing_chrome::ChromeLayerBuilder;
use tracing_flame::FlameLayer;
use tracing_perfetto::PerfettoLayer;
use tracing_subscriber::{EnvFilter, filter::LevelFilter, fmt, prelude::*};

const DEFAULT_DIRECTIVES: &str = "testbench=info,tokio_zookeeper=off";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TraceFormat {
    Chrome,
    Flame,
    Perfetto,
}

impl TraceFormat {
    fn parse(s: &str) -> Result<Self> {
        match s {
            "chrome" => Ok(TraceFormat::Chrome),
            "flame" => Ok(TraceFormat::Flame),
            "perfetto" => Ok(TraceFormat::Perfetto),
            other => Err(anyhow!("unknown trace format {:?}", other)),
        }
    }

    fn default_file(&self) -> &'static str {
        match self {
            TraceFormat::Chrome => "./trace.json",
            TraceFormat::Flame => "./tracing.folded",
            TraceFormat::Perfetto => "./trace.pftrace",
        }
    }
}

/// Keeps trace files open; flushes them when dropped.
pub struct TelemetryGuard {
    _chrome: Option<tracing_chrome::FlushGuard>,
    _flame: Option<tracing_flame::FlushGuard<BufWriter<File>>>,
}

pub fn args() -> Vec<Arg> {
    vec![
        Arg::new("trace-format")
            .long("trace-format")
            .value_parser(["chrome", "flame", "perfetto"])
            .help("Also export spans in this format"),
        Arg::new("trace-file")
            .long("trace-file")
            .value_parser(value_parser!(PathBuf))
            .requires("trace-format")
            .help("Where to write the exported trace"),
    ]
}

pub fn init_from_matches(matches: &ArgMatches) -> Result<TelemetryGuard> {
    let format = matches
        .get_one::<String>("trace-format")
        .map(|s| TraceFormat::parse(s))
        .transpose()?;
    init(format, matches.get_one::<PathBuf>("trace-file").map(|p| p.as_path()))
}

fn env_filter() -> Result<EnvFilter> {
    let builder = EnvFilter::builder().with_default_directive(LevelFilter::INFO.into());
    if std::env::var_os(EnvFilter::DEFAULT_ENV).is_some() {
        Ok(builder.from_env_lossy())
    } else {
        builder
            .parse(DEFAULT_DIRECTIVES)
            .context("parsing default log directives")
    }
}

/// Installs the global subscriber: env filter, fmt output and optionally
/// one trace export layer.
pub fn init(format: Option<TraceFormat>, file: Option<&Path>) -> Result<TelemetryGuard> {
    let path = format.map(|f| {
        file.map(Path::to_path_buf)
            .unwrap_or_else(|| f.default_file().into())
    });

    let mut guard = TelemetryGuard {
        _chrome: None,
        _flame: None,
    };
    let mut chrome_layer = None;
    let mut flame_layer = None;
    let mut perfetto_layer = None;
    match (format, &path) {
        (Some(TraceFormat::Chrome), Some(path)) => {
            let (layer, flush) = ChromeLayerBuilder::new().file(path).build();
            chrome_layer = Some(layer);
            guard._chrome = Some(flush);
        }
        (Some(TraceFormat::Flame), Some(path)) => {
            let (layer, flush) = FlameLayer::with_file(path)
                .map_err(|e| anyhow!("creating {}: {}", path.display(), e))?;
            flame_layer = Some(layer);
            guard._flame = Some(flush);
        }
        (Some(TraceFormat::Perfetto), Some(path)) => {
            let file = File::create(path)
                .with_context(|| format!("creating {}", path.display()))?;
            perfetto_layer = Some(PerfettoLayer::new(std::sync::Mutex::new(file)));
        }
        _ => {}
    }

    tracing_subscriber::registry()
        .with(env_filter()?)
        .with(fmt::layer())
        .with(chrome_layer)
        .with(flame_layer)
        .with(perfetto_layer)
        .try_init()
        .context("installing tracing subscriber")?;
    Ok(guard)
}
