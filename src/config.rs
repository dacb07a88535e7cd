//! Configuration for the cache server.
//!
//! Supports memcached-compatible command-line flags and an optional TOML
//! configuration file. CLI arguments take precedence over config file values.

use clap::Parser;
use serde::Deserialize;
use std::net::IpAddr;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

/// Highest verbosity level the `verbosity` command will accept.
pub const MAX_VERBOSITY_LEVEL: usize = 2;

/// Command-line arguments for the cache server
#[derive(Parser, Debug)]
#[command(name = "scattercache")]
#[command(version)]
#[command(about = "A memcached-compatible cache server", long_about = None)]
pub struct CliArgs {
    /// Path to TOML configuration file
    #[arg(long)]
    pub config: Option<PathBuf>,

    /// TCP port number to listen on (0 = off)
    #[arg(short = 'p', long = "port")]
    pub port: Option<u16>,

    /// UDP port number to listen on (0 = off)
    #[arg(short = 'U', long = "udp-port")]
    pub udpport: Option<u16>,

    /// TCP port number for binary protocol connections (not built; rejected)
    #[arg(short = 'n', long = "binary-port")]
    pub binary_port: Option<u16>,

    /// UDP port number for binary protocol connections (not built; rejected)
    #[arg(short = 'N', long = "binary-udp-port")]
    pub binary_udpport: Option<u16>,

    /// Unix socket path to listen on (disables network support)
    #[arg(short = 's', long = "socket")]
    pub socketpath: Option<PathBuf>,

    /// Interface to listen on (default: all addresses)
    #[arg(short = 'l', long = "listen")]
    pub interface: Option<IpAddr>,

    /// Run as a daemon
    #[arg(short = 'd', long)]
    pub daemonize: bool,

    /// Maximize core file limit
    #[arg(short = 'r', long = "max-core")]
    pub maxcore: bool,

    /// Assume the identity of this user (only when run as root)
    #[arg(short = 'u', long = "user")]
    pub username: Option<String>,

    /// Max memory to use for items, in megabytes
    #[arg(short = 'm', long = "memory-limit")]
    pub maxbytes_mb: Option<usize>,

    /// Return an error on memory exhaustion instead of evicting items
    #[arg(short = 'M', long = "disable-eviction")]
    pub no_evict: bool,

    /// Max simultaneous connections
    #[arg(short = 'c', long = "conn-limit")]
    pub maxconns: Option<usize>,

    /// Lock down all paged memory
    #[arg(short = 'k', long = "lock-memory")]
    pub lock_memory: bool,

    /// Verbose (repeat for more detail)
    #[arg(short = 'v', action = clap::ArgAction::Count)]
    pub verbose: u8,

    /// Run a managed instance (mnemonic: buckets)
    #[arg(short = 'b', long = "managed")]
    pub managed: bool,

    /// Save PID in this file, only used with -d
    #[arg(short = 'P', long = "pidfile")]
    pub pidfile: Option<PathBuf>,

    /// Chunk size growth factor
    #[arg(short = 'f', long = "growth-factor")]
    pub factor: Option<f64>,

    /// Number of worker threads (defaults to the number of CPU cores)
    #[arg(short = 't', long = "threads")]
    pub threads: Option<usize>,

    /// Enable per-prefix stats, keyed up to this delimiter character
    #[arg(short = 'D', long = "prefix-delimiter")]
    pub prefix_delimiter: Option<char>,

    /// Maximum number of requests per event, to prevent starvation
    #[arg(short = 'R', long = "reqs-per-event")]
    pub reqs_per_event: Option<usize>,

    /// Maximum bytes used for connection buffers
    #[arg(short = 'C', long = "conn-buffer-bytes")]
    pub conn_buffer_bytes: Option<usize>,

    /// Print the license and exit
    #[arg(short = 'i', long = "license")]
    pub license: bool,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long, default_value = "info")]
    pub log_level: String,
}

/// TOML configuration file structure
#[derive(Debug, Deserialize, Default)]
pub struct TomlConfig {
    #[serde(default)]
    pub server: ServerConfig,
    #[serde(default)]
    pub cache: CacheConfig,
    #[serde(default)]
    pub logging: LoggingConfig,
}

/// Server-related configuration
#[derive(Debug, Deserialize, Default)]
pub struct ServerConfig {
    /// TCP port (0 = off)
    pub port: Option<u16>,
    /// UDP port (0 = off)
    pub udp_port: Option<u16>,
    /// Interface to bind
    pub interface: Option<IpAddr>,
    /// Number of worker threads
    pub threads: Option<usize>,
    /// Max simultaneous connections
    pub conn_limit: Option<usize>,
    /// Requests handled per reactor wake-up
    pub reqs_per_event: Option<usize>,
    /// Total connection-buffer bytes
    pub conn_buffer_bytes: Option<usize>,
}

/// Cache-related configuration
#[derive(Debug, Deserialize, Default)]
pub struct CacheConfig {
    /// Max item memory in megabytes
    pub memory_limit_mb: Option<usize>,
    /// Disable LRU eviction
    pub disable_eviction: Option<bool>,
    /// Growth factor
    pub growth_factor: Option<f64>,
}

/// Logging configuration
#[derive(Debug, Deserialize, Default)]
pub struct LoggingConfig {
    /// Log level
    pub level: Option<String>,
}

/// Final resolved configuration, shared across threads.
///
/// Most knobs are fixed at startup; the few the text protocol can change at
/// runtime (`verbosity`, `stats detail on|off`) are atomics.
#[derive(Debug)]
pub struct Settings {
    pub port: u16,
    pub udpport: u16,
    pub socketpath: Option<PathBuf>,
    pub interface: IpAddr,
    pub maxbytes: usize,
    pub maxconns: usize,
    pub evict_to_free: bool,
    pub managed: bool,
    pub factor: f64,
    pub prefix_delimiter: u8,
    pub detail_enabled: AtomicBool,
    pub verbose: AtomicUsize,
    /// Worker thread count, not counting the dispatcher.
    pub num_workers: usize,
    pub reqs_per_event: usize,
    pub max_conn_buffer_bytes: usize,
    pub log_level: String,
}

impl Default for Settings {
    fn default() -> Self {
        Settings {
            port: 0,
            udpport: 0,
            socketpath: None,
            interface: IpAddr::from([0, 0, 0, 0]),
            maxbytes: 64 * 1024 * 1024,
            maxconns: 1024,
            evict_to_free: true,
            managed: false,
            factor: 1.25,
            prefix_delimiter: b':',
            detail_enabled: AtomicBool::new(false),
            verbose: AtomicUsize::new(0),
            num_workers: num_cpus(),
            reqs_per_event: 1,
            max_conn_buffer_bytes: 16 * 1024 * 1024,
            log_level: "info".to_string(),
        }
    }
}

impl Settings {
    pub fn verbosity(&self) -> usize {
        self.verbose.load(Ordering::Relaxed)
    }

    pub fn set_verbosity(&self, level: usize) {
        self.verbose
            .store(level.min(MAX_VERBOSITY_LEVEL), Ordering::Relaxed);
    }

    pub fn detail_enabled(&self) -> bool {
        self.detail_enabled.load(Ordering::Relaxed)
    }

    pub fn set_detail_enabled(&self, on: bool) {
        self.detail_enabled.store(on, Ordering::Relaxed);
    }
}

/// Startup options that matter to `main` but not to the running server.
#[derive(Debug, Default)]
pub struct StartupOptions {
    pub daemonize: bool,
    pub maxcore: bool,
    pub lock_memory: bool,
    pub username: Option<String>,
    pub pidfile: Option<PathBuf>,
    pub license: bool,
}

/// Load configuration from CLI args and optional TOML file.
/// CLI arguments take precedence over TOML file values.
pub fn load() -> Result<(Settings, StartupOptions), ConfigError> {
    use clap::error::ErrorKind;

    let cli = match CliArgs::try_parse() {
        Ok(cli) => cli,
        Err(e) if matches!(e.kind(), ErrorKind::DisplayHelp | ErrorKind::DisplayVersion) => {
            let _ = e.print();
            std::process::exit(0);
        }
        Err(e) => return Err(ConfigError::Usage(Box::new(e))),
    };
    resolve(cli)
}

fn resolve(cli: CliArgs) -> Result<(Settings, StartupOptions), ConfigError> {
    let file = if let Some(ref path) = cli.config {
        let contents = std::fs::read_to_string(path)
            .map_err(|e| ConfigError::FileRead(path.clone(), e))?;
        toml::from_str(&contents).map_err(|e| ConfigError::TomlParse(path.clone(), e))?
    } else {
        TomlConfig::default()
    };

    let defaults = Settings::default();

    let port = cli.port.or(file.server.port).unwrap_or(0);
    let udpport = cli.udpport.or(file.server.udp_port).unwrap_or(0);

    if cli.binary_port.unwrap_or(0) != 0 || cli.binary_udpport.unwrap_or(0) != 0 {
        return Err(ConfigError::BinaryProtocolUnsupported);
    }

    if cli.socketpath.is_none() && port == 0 && udpport == 0 && !cli.license {
        return Err(ConfigError::NoListeners);
    }

    let factor = cli
        .factor
        .or(file.cache.growth_factor)
        .unwrap_or(defaults.factor);
    if factor <= 1.0 {
        return Err(ConfigError::BadFactor(factor));
    }

    let reqs_per_event = cli
        .reqs_per_event
        .or(file.server.reqs_per_event)
        .unwrap_or(defaults.reqs_per_event);
    if reqs_per_event == 0 {
        return Err(ConfigError::BadReqsPerEvent);
    }

    let num_workers = cli.threads.or(file.server.threads).unwrap_or(0);
    let num_workers = if num_workers == 0 { num_cpus() } else { num_workers };

    let settings = Settings {
        port,
        udpport,
        socketpath: cli.socketpath,
        interface: cli
            .interface
            .or(file.server.interface)
            .unwrap_or(defaults.interface),
        maxbytes: cli
            .maxbytes_mb
            .map(|mb| mb * 1024 * 1024)
            .or(file.cache.memory_limit_mb.map(|mb| mb * 1024 * 1024))
            .unwrap_or(defaults.maxbytes),
        maxconns: cli
            .maxconns
            .or(file.server.conn_limit)
            .unwrap_or(defaults.maxconns),
        evict_to_free: !(cli.no_evict || file.cache.disable_eviction.unwrap_or(false)),
        managed: cli.managed,
        factor,
        prefix_delimiter: cli
            .prefix_delimiter
            .map(|c| c as u8)
            .unwrap_or(defaults.prefix_delimiter),
        detail_enabled: AtomicBool::new(cli.prefix_delimiter.is_some()),
        verbose: AtomicUsize::new(cli.verbose as usize),
        num_workers,
        reqs_per_event,
        max_conn_buffer_bytes: cli
            .conn_buffer_bytes
            .or(file.server.conn_buffer_bytes)
            .unwrap_or(defaults.max_conn_buffer_bytes),
        log_level: if cli.log_level != "info" {
            cli.log_level
        } else {
            file.logging.level.unwrap_or(defaults.log_level)
        },
    };

    let startup = StartupOptions {
        daemonize: cli.daemonize,
        maxcore: cli.maxcore,
        lock_memory: cli.lock_memory,
        username: cli.username,
        pidfile: cli.pidfile,
        license: cli.license,
    };

    Ok((settings, startup))
}

fn num_cpus() -> usize {
    std::thread::available_parallelism()
        .map(|n| n.get())
        .unwrap_or(1)
}

/// Configuration loading errors
#[derive(Debug)]
pub enum ConfigError {
    Usage(Box<clap::Error>),
    FileRead(PathBuf, std::io::Error),
    TomlParse(PathBuf, toml::de::Error),
    NoListeners,
    BinaryProtocolUnsupported,
    BadFactor(f64),
    BadReqsPerEvent,
}

impl std::fmt::Display for ConfigError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ConfigError::Usage(e) => write!(f, "{e}"),
            ConfigError::FileRead(path, e) => {
                write!(f, "Failed to read config file '{}': {}", path.display(), e)
            }
            ConfigError::TomlParse(path, e) => {
                write!(f, "Failed to parse config file '{}': {}", path.display(), e)
            }
            ConfigError::NoListeners => {
                write!(f, "Either -p, -U or -s must be specified")
            }
            ConfigError::BinaryProtocolUnsupported => {
                write!(f, "Binary protocol support is not built into this server")
            }
            ConfigError::BadFactor(factor) => {
                write!(f, "Factor must be greater than 1 (got {factor})")
            }
            ConfigError::BadReqsPerEvent => {
                write!(f, "Number of requests per event must be greater than 0")
            }
        }
    }
}

impl std::error::Error for ConfigError {}

#[cfg(test)]
mod tests {
    use super::*;

    fn args(argv: &[&str]) -> CliArgs {
        CliArgs::parse_from(std::iter::once("scattercache").chain(argv.iter().copied()))
    }

    #[test]
    fn requires_a_listener() {
        let err = resolve(args(&[])).unwrap_err();
        assert!(matches!(err, ConfigError::NoListeners));
    }

    #[test]
    fn tcp_port_is_enough() {
        let (settings, _) = resolve(args(&["-p", "11211"])).unwrap();
        assert_eq!(settings.port, 11211);
        assert_eq!(settings.udpport, 0);
        assert!(settings.evict_to_free);
    }

    #[test]
    fn binary_ports_are_rejected() {
        let err = resolve(args(&["-p", "11211", "-n", "11212"])).unwrap_err();
        assert!(matches!(err, ConfigError::BinaryProtocolUnsupported));
    }

    #[test]
    fn verbosity_stacks() {
        let (settings, _) = resolve(args(&["-p", "11211", "-v", "-v"])).unwrap();
        assert_eq!(settings.verbosity(), 2);
    }

    #[test]
    fn factor_must_exceed_one() {
        let err = resolve(args(&["-p", "11211", "-f", "0.9"])).unwrap_err();
        assert!(matches!(err, ConfigError::BadFactor(_)));
    }

    #[test]
    fn prefix_delimiter_enables_detail_stats() {
        let (settings, _) = resolve(args(&["-p", "11211", "-D", ":"])).unwrap();
        assert!(settings.detail_enabled());
        assert_eq!(settings.prefix_delimiter, b':');
    }

    #[test]
    fn memory_limit_is_in_megabytes() {
        let (settings, _) = resolve(args(&["-p", "11211", "-m", "128"])).unwrap();
        assert_eq!(settings.maxbytes, 128 * 1024 * 1024);
    }

    #[test]
    fn toml_file_fills_unset_flags() {
        let toml_str = r#"
            [server]
            port = 11311
            threads = 3

            [cache]
            memory_limit_mb = 32

            [logging]
            level = "debug"
        "#;
        let file: TomlConfig = toml::from_str(toml_str).unwrap();
        assert_eq!(file.server.port, Some(11311));
        assert_eq!(file.server.threads, Some(3));
        assert_eq!(file.cache.memory_limit_mb, Some(32));
        assert_eq!(file.logging.level.as_deref(), Some("debug"));
    }
}
