//! CLI surface for the `ember` server binary: flags, env fallbacks and an
//! optional JSON config file all fold into one [`Runtime`].

use std::{path::PathBuf, time::Duration};

use clap::Parser;
use ember::{
    Handler, HttpLimits, ListenError, ListenerSettings, ListenerUrl, Runtime, ServerError,
    StaticSettings,
};
use serde::Deserialize;

// `-V` is the verbose switch, so the clap-generated version flag (which
// would claim `-V`) is disabled.
#[derive(Parser, Debug, Default)]
#[command(
    name = "ember",
    about = "HTTP/1.1 + WebSocket + SSE server with clustered pub/sub",
    version,
    disable_version_flag = true
)]
pub struct Cli {
    /// Bind address in URL form (scheme://host:port?opt=val). Also read
    /// from the ADDRESS environment variable.
    #[arg(short = 'b', long = "bind")]
    pub bind: Option<String>,

    /// Bind port; supersedes the port in --bind. Also read from PORT.
    #[arg(short = 'p', long = "port")]
    pub port: Option<u16>,

    /// Async callback threads per worker (negative: cpu count + n).
    /// Also read from THREADS.
    #[arg(short = 't', long = "threads")]
    pub threads: Option<i32>,

    /// Worker processes (negative: cpu count + n; 0: single process).
    /// Also read from WORKERS.
    #[arg(short = 'w', long = "workers")]
    pub workers: Option<i32>,

    /// Public folder for static file service.
    #[arg(long = "www", visible_alias = "public")]
    pub www: Option<PathBuf>,

    /// Per-line header limit, bytes.
    #[arg(long = "max-line", visible_alias = "maxln")]
    pub max_line: Option<usize>,

    /// Total header limit per request, bytes.
    #[arg(long = "max-header", visible_alias = "maxhd")]
    pub max_header: Option<usize>,

    /// Body payload limit per request, bytes.
    #[arg(long = "max-body", visible_alias = "maxbd")]
    pub max_body: Option<usize>,

    /// Incoming WebSocket message limit, bytes.
    #[arg(long = "max-message", visible_alias = "maxms")]
    pub max_message: Option<usize>,

    /// HTTP keep-alive timeout, seconds.
    #[arg(short = 'k', long = "keep-alive")]
    pub keep_alive: Option<u64>,

    /// WebSocket / SSE ping interval, seconds.
    #[arg(long = "ping")]
    pub ping: Option<u64>,

    /// Max-Age header for static files, seconds.
    #[arg(long = "max-age", visible_alias = "maxage")]
    pub max_age: Option<u32>,

    /// Log requests.
    #[arg(short = 'v', long = "log")]
    pub log: bool,

    /// Use a self-signed TLS certificate (requires a TLS adapter build).
    #[arg(long = "tls")]
    pub tls_self_signed: bool,

    /// TLS certificate .pem file.
    #[arg(long = "cert")]
    pub cert: Option<PathBuf>,

    /// TLS private key .pem file.
    #[arg(long = "key")]
    pub key: Option<PathBuf>,

    /// Host name for the TLS certificate.
    #[arg(long = "name")]
    pub name: Option<String>,

    /// TLS private-key password.
    #[arg(long = "tls-pass")]
    pub tls_pass: Option<String>,

    /// Cluster broadcast port for cross-host pub/sub.
    #[arg(long = "broadcast", visible_alias = "bp")]
    pub broadcast_port: Option<u16>,

    /// Cluster secret. Also read from SECRET / SECRET_LENGTH.
    #[arg(long = "secret", visible_alias = "scrt")]
    pub secret: Option<String>,

    /// Print debug-level messages.
    #[arg(short = 'V', long = "verbose")]
    pub verbose: bool,

    /// JSON configuration file; CLI flags win over its values.
    #[arg(short = 'C', long = "config")]
    pub config: Option<PathBuf>,

    /// Pidfile path.
    #[arg(long = "pid", visible_alias = "pidfile")]
    pub pidfile: Option<PathBuf>,

    /// Warm up before forking workers.
    #[arg(long = "preload", visible_alias = "warmup")]
    pub preload: bool,
}

/// JSON config file schema; every field optional, CLI flags win.
#[derive(Deserialize, Debug, Default)]
#[serde(deny_unknown_fields)]
pub struct ConfigFile {
    pub bind: Option<String>,
    pub port: Option<u16>,
    pub threads: Option<i32>,
    pub workers: Option<i32>,
    pub www: Option<PathBuf>,
    pub max_line: Option<usize>,
    pub max_header: Option<usize>,
    pub max_body: Option<usize>,
    pub max_message: Option<usize>,
    pub keep_alive: Option<u64>,
    pub ping: Option<u64>,
    pub max_age: Option<u32>,
    pub log: Option<bool>,
    pub broadcast_port: Option<u16>,
    pub secret: Option<String>,
    pub pidfile: Option<PathBuf>,
}

fn env_parse<T: std::str::FromStr>(name: &str) -> Option<T> {
    std::env::var(name).ok().and_then(|v| v.parse().ok())
}

/// Resolves CLI > config file > environment > defaults into a [`Runtime`]
/// with the given root handler.
pub fn build_runtime(
    mut cli: Cli,
    handler: std::sync::Arc<dyn Handler>,
) -> Result<Runtime, ServerError> {
    let file = match &cli.config {
        Some(path) => {
            let text = std::fs::read_to_string(path)
                .map_err(|e| ServerError::Config(format!("config file {}: {e}", path.display())))?;
            serde_json::from_str::<ConfigFile>(&text)
                .map_err(|e| ServerError::Config(format!("config file {}: {e}", path.display())))?
        }
        None => ConfigFile::default(),
    };

    // Layer the sources: file fills CLI gaps, env fills the rest.
    cli.bind = cli.bind.or(file.bind).or_else(|| std::env::var("ADDRESS").ok());
    cli.port = cli.port.or(file.port).or_else(|| env_parse("PORT"));
    cli.threads = cli.threads.or(file.threads).or_else(|| env_parse("THREADS"));
    cli.workers = cli.workers.or(file.workers).or_else(|| env_parse("WORKERS"));
    cli.www = cli.www.or(file.www);
    cli.max_line = cli.max_line.or(file.max_line);
    cli.max_header = cli.max_header.or(file.max_header);
    cli.max_body = cli.max_body.or(file.max_body);
    cli.max_message = cli.max_message.or(file.max_message);
    cli.keep_alive = cli.keep_alive.or(file.keep_alive);
    cli.ping = cli.ping.or(file.ping);
    cli.max_age = cli.max_age.or(file.max_age);
    cli.log = cli.log || file.log.unwrap_or(false);
    cli.broadcast_port = cli.broadcast_port.or(file.broadcast_port);
    cli.secret = cli.secret.or(file.secret);
    cli.pidfile = cli.pidfile.or(file.pidfile);

    let mut url = resolve_bind_url(&cli)?;
    if cli.tls_self_signed {
        url.tls.self_signed = true;
    }
    if let Some(cert) = &cli.cert {
        url.tls.cert = Some(cert.clone());
    }
    if let Some(key) = &cli.key {
        url.tls.key = Some(key.clone());
    }
    if let Some(pass) = &cli.tls_pass {
        url.tls.password = Some(pass.clone());
    }
    if let Some(name) = &cli.name {
        url.tls.server_name = Some(name.clone());
    }

    let defaults = ListenerSettings::default();
    let mut limits = HttpLimits::default();
    if let Some(n) = cli.max_line {
        limits.max_line_len = n;
    }
    if let Some(n) = cli.max_header {
        limits.max_header_size = n;
    }
    if let Some(n) = cli.max_body {
        limits.max_body_size = n;
    }

    let settings = ListenerSettings {
        limits,
        keep_alive: cli.keep_alive.map_or(defaults.keep_alive, Duration::from_secs),
        ping_interval: cli.ping.map_or(defaults.ping_interval, Duration::from_secs),
        ws_max_message: cli.max_message.unwrap_or(defaults.ws_max_message),
        public_folder: cli.www.as_ref().map(|root| StaticSettings {
            root: root.clone(),
            max_age: cli.max_age.unwrap_or(3600),
        }),
        log_requests: cli.log,
        ..defaults
    };

    let mut runtime = Runtime::new();
    runtime.defaults = settings;
    if let Some(threads) = cli.threads {
        runtime.threads = threads;
    }
    if let Some(workers) = cli.workers {
        runtime.workers = workers;
    }
    runtime.secret = cli.secret.clone();
    runtime.broadcast_port = cli.broadcast_port;
    runtime.pidfile = cli.pidfile.clone();
    runtime.listen(url, handler);
    Ok(runtime)
}

fn resolve_bind_url(cli: &Cli) -> Result<ListenerUrl, ServerError> {
    let mut url = match &cli.bind {
        Some(bind) if bind.contains("://") => ListenerUrl::parse(bind),
        Some(bind) => ListenerUrl::parse(&format!("http://{bind}")),
        None => ListenerUrl::parse("http://0.0.0.0:3000"),
    }
    .map_err(|err: ListenError| ServerError::Config(err.to_string()))?;
    if let Some(port) = cli.port {
        url.port = port;
    }
    Ok(url)
}

/// Initialises structured logging; `-V` lowers the floor to debug.
pub fn init_tracing(verbose: bool) {
    use tracing_subscriber::EnvFilter;
    let default = if verbose { "debug" } else { "info" };
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(default));
    tracing_subscriber::fmt().with_env_filter(filter).init();
}
