//! Logging bootstrap for the controller services
//!
//! Console output plus an optional per-day log file, both behind one
//! reloadable `EnvFilter` so the level can be changed while running.

use std::fs::{self, File, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::{Mutex, OnceLock};

use tracing::Level;
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::{
    fmt::{self, format::Writer, FmtContext, FormatEvent, FormatFields},
    layer::SubscriberExt,
    registry::LookupSpan,
    reload,
    util::SubscriberInitExt,
    EnvFilter, Layer, Registry,
};

/// Subscriber below the output layers: the registry behind the reloadable filter
type Filtered = tracing_subscriber::layer::Layered<reload::Layer<EnvFilter, Registry>, Registry>;
type OutputLayer = Box<dyn Layer<Filtered> + Send + Sync>;

/// Environment variable overriding the log root directory
pub const LOG_DIR_ENV: &str = "AQUA_LOG_DIR";
const DEFAULT_LOG_ROOT: &str = "logs";

/// Bracketed tag and console color per level
const LEVEL_TAGS: [(Level, &str, &str); 5] = [
    (Level::TRACE, "[TRACE]", "\x1b[35m"),
    (Level::DEBUG, "[DEBUG]", "\x1b[34m"),
    (Level::INFO, "[INFO]", "\x1b[32m"),
    (Level::WARN, "[WARN]", "\x1b[33m"),
    (Level::ERROR, "[ERROR]", "\x1b[31m"),
];

fn level_tag(level: Level) -> (&'static str, &'static str) {
    LEVEL_TAGS
        .iter()
        .find(|(l, _, _)| *l == level)
        .map_or(("[?]", ""), |(_, tag, color)| (*tag, *color))
}

/// `2026-03-02T00:50:44.809000Z [INFO] Valve cold: OPEN`
struct TaggedFormat;

impl<S, N> FormatEvent<S, N> for TaggedFormat
where
    S: tracing::Subscriber + for<'a> LookupSpan<'a>,
    N: for<'a> FormatFields<'a> + 'static,
{
    fn format_event(
        &self,
        ctx: &FmtContext<'_, S, N>,
        mut writer: Writer<'_>,
        event: &tracing::Event<'_>,
    ) -> std::fmt::Result {
        let (tag, color) = level_tag(*event.metadata().level());
        let stamp = chrono::Utc::now().format("%Y-%m-%dT%H:%M:%S%.6fZ");
        if writer.has_ansi_escapes() {
            write!(writer, "{} {}{}\x1b[0m ", stamp, color, tag)?;
        } else {
            write!(writer, "{} {} ", stamp, tag)?;
        }
        ctx.field_format().format_fields(writer.by_ref(), event)?;
        writeln!(writer)
    }
}

static LOG_ROOT: OnceLock<PathBuf> = OnceLock::new();

fn env_log_root() -> Option<PathBuf> {
    std::env::var_os(LOG_DIR_ENV).map(PathBuf::from)
}

/// Fix the log root once: `AQUA_LOG_DIR` env > `config_dir` > "logs"
pub fn init_log_root(config_dir: Option<&str>) {
    LOG_ROOT.get_or_init(|| {
        env_log_root()
            .or_else(|| config_dir.map(PathBuf::from))
            .unwrap_or_else(|| PathBuf::from(DEFAULT_LOG_ROOT))
    });
}

pub fn get_log_root() -> PathBuf {
    LOG_ROOT
        .get()
        .cloned()
        .or_else(env_log_root)
        .unwrap_or_else(|| PathBuf::from(DEFAULT_LOG_ROOT))
}

/// Log file switching to `{YYYYMMDD}_{service}.log` when the local date changes
struct DatedFile {
    service_name: String,
    dir: PathBuf,
    state: Mutex<(String, File)>,
}

fn today() -> String {
    chrono::Local::now().format("%Y%m%d").to_string()
}

impl DatedFile {
    fn open(service_name: &str, dir: &Path) -> std::io::Result<Self> {
        let date = today();
        let file = Self::open_for(dir, &date, service_name)?;
        Ok(Self {
            service_name: service_name.to_string(),
            dir: dir.to_path_buf(),
            state: Mutex::new((date, file)),
        })
    }

    fn open_for(dir: &Path, date: &str, service_name: &str) -> std::io::Result<File> {
        fs::create_dir_all(dir)?;
        OpenOptions::new()
            .create(true)
            .append(true)
            .open(dir.join(format!("{}_{}.log", date, service_name)))
    }

    fn with_file<T>(&self, f: impl FnOnce(&mut File) -> std::io::Result<T>) -> std::io::Result<T> {
        let mut state = self
            .state
            .lock()
            .map_err(|e| std::io::Error::other(format!("log file lock poisoned: {}", e)))?;
        let date = today();
        if state.0 != date {
            let file = Self::open_for(&self.dir, &date, &self.service_name)?;
            *state = (date, file);
        }
        f(&mut state.1)
    }
}

impl Write for DatedFile {
    fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
        self.with_file(|file| file.write(buf))
    }

    fn flush(&mut self) -> std::io::Result<()> {
        self.with_file(|file| file.flush())
    }
}

/// Reload handle of the installed filter and the spec it was last set to
struct FilterState {
    handle: reload::Handle<EnvFilter, Registry>,
    spec: Mutex<String>,
}

static FILTER: OnceLock<FilterState> = OnceLock::new();
// Non-blocking file writers flush on drop
static GUARDS: Mutex<Vec<WorkerGuard>> = Mutex::new(Vec::new());

/// Logger configuration
#[derive(Debug, Clone)]
pub struct LogConfig {
    /// Service name (e.g., "aquasrv")
    pub service_name: String,
    pub log_dir: PathBuf,
    /// Default level when `RUST_LOG` is not set
    pub level: Level,
    /// Write a daily log file next to the console output
    pub enable_file: bool,
    /// JSON lines in the log file
    pub enable_json: bool,
    /// Colored console output
    pub ansi: bool,
}

impl Default for LogConfig {
    fn default() -> Self {
        Self {
            service_name: "unknown".to_string(),
            log_dir: get_log_root(),
            level: Level::INFO,
            enable_file: true,
            enable_json: false,
            ansi: true,
        }
    }
}

fn filter_spec(config: &LogConfig) -> String {
    std::env::var("RUST_LOG")
        .ok()
        .filter(|spec| !spec.is_empty())
        .unwrap_or_else(|| {
            format!(
                "{},{}=debug",
                config.level.as_str().to_lowercase(),
                config.service_name
            )
        })
}

fn file_layer(config: &LogConfig) -> Result<OutputLayer, Box<dyn std::error::Error>> {
    let (writer, guard) =
        tracing_appender::non_blocking(DatedFile::open(&config.service_name, &config.log_dir)?);
    match GUARDS.lock() {
        Ok(mut guards) => guards.push(guard),
        Err(poisoned) => poisoned.into_inner().push(guard),
    }
    let layer = fmt::layer().with_writer(writer);
    Ok(if config.enable_json {
        layer.json().with_target(true).boxed()
    } else {
        layer.with_ansi(false).event_format(TaggedFormat).boxed()
    })
}

/// Install the global subscriber
pub fn init_with_config(config: LogConfig) -> Result<(), Box<dyn std::error::Error>> {
    let spec = filter_spec(&config);
    let (filter, handle) = reload::Layer::new(EnvFilter::try_new(&spec)?);

    let mut layers: Vec<OutputLayer> = vec![fmt::layer()
        .with_ansi(config.ansi)
        .event_format(TaggedFormat)
        .boxed()];
    if config.enable_file {
        layers.push(file_layer(&config)?);
    }

    tracing_subscriber::registry()
        .with(filter)
        .with(layers)
        .try_init()?;
    let _ = FILTER.set(FilterState {
        handle,
        spec: Mutex::new(spec),
    });

    tracing::info!(
        "Logging {} to console{}",
        config.service_name,
        if config.enable_file {
            format!(" and {}", config.log_dir.display())
        } else {
            String::new()
        }
    );
    Ok(())
}

/// Replace the filter at run time with a level ("debug") or a full spec ("info,aquasrv=trace")
pub fn set_log_level(spec: &str) -> Result<(), String> {
    let state = FILTER.get().ok_or("logging not initialized")?;
    let filter = EnvFilter::try_new(spec).map_err(|e| format!("Invalid log level '{}': {}", spec, e))?;
    state
        .handle
        .reload(filter)
        .map_err(|e| format!("Failed to reload log filter: {}", e))?;
    if let Ok(mut current) = state.spec.lock() {
        *current = spec.to_string();
    }
    tracing::info!("Log level changed to: {}", spec);
    Ok(())
}

/// Filter spec in force, `unknown` before initialization
pub fn get_log_level() -> String {
    FILTER
        .get()
        .and_then(|state| state.spec.lock().ok().map(|spec| spec.clone()))
        .unwrap_or_else(|| "unknown".to_string())
}
