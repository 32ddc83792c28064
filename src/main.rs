use clap::Parser;
use log::info;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tokio::signal;
use url_proxy::config::{Config, parse_listen_addr, resolve_path};
use url_proxy::forward::ForwardRules;
use url_proxy::handler::{HandlerOptions, ProxyHandler};
use url_proxy::logging::{CustomLogger, init_fallback, parse_log_format, parse_log_level};
use url_proxy::{CacheStore, ProxyServer};

#[derive(Parser)]
#[clap(
    version,
    about = "Caching HTTP(S)/FTP proxy: GET /<remote-url> fetches, streams and caches the remote file"
)]
struct Args {
    #[clap(long, value_name = "ADDR", help = "HTTP server address (e.g. :8888 or 127.0.0.1:8888)")]
    addr: Option<String>,

    #[clap(long, value_name = "DIR", help = "Cache directory (defaults to the system temp directory)")]
    cache: Option<PathBuf>,

    #[clap(long, value_name = "FILE", help = "Forward rule file with '<host> <forward-host>' lines")]
    forward: Option<PathBuf>,

    #[clap(short, long, value_name = "FILE", help = "JSON configuration file")]
    config: Option<String>,

    #[clap(long, value_name = "FILE", help = "Write a sample configuration file and exit")]
    generate_config: Option<String>,

    #[clap(long, value_name = "SECONDS", help = "Origin connect timeout in seconds (default: none)")]
    connect_timeout: Option<u64>,

    #[clap(long, value_name = "NUM", help = "Maximum idle origin connections kept per host")]
    pool_max_idle: Option<usize>,

    #[clap(long, value_name = "LEVEL", help = "Log level: trace, debug, info, warn, error")]
    log_level: Option<String>,

    #[clap(long, value_name = "FORMAT", help = "Log format: text or json")]
    log_format: Option<String>,
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let args = Args::parse();

    if let Some(config_file) = &args.generate_config {
        Config::default().to_file(config_file)?;
        println!("Sample configuration file generated: {}", config_file);
        return Ok(());
    }

    let config = load_config(&args)?;
    init_logging(&args, &config)?;

    config.validate()?;
    let cache_root = resolve_path(&config.cache_root());
    info!("cache dir: {}", cache_root.display());

    let forwards = match &config.forward_file {
        Some(path) => {
            info!("forward config file: {}", path.display());
            ForwardRules::from_file(path)?
        }
        None => ForwardRules::default(),
    };

    let options = HandlerOptions {
        connect_timeout: config.connect_timeout_secs.map(Duration::from_secs),
        pool_max_idle_per_host: config.pool_max_idle_per_host,
    };
    let handler = ProxyHandler::with_options(CacheStore::new(cache_root), Arc::new(forwards), options);
    let server = ProxyServer::new(handler, config.listen_addr);

    tokio::select! {
        result = server.run() => {
            result?;
        }
        _ = signal::ctrl_c() => {
            info!("Received Ctrl+C, shutting down");
        }
    }

    Ok(())
}

fn load_config(args: &Args) -> Result<Config, Box<dyn std::error::Error>> {
    let mut config = match &args.config {
        Some(config_file) => {
            if !Path::new(config_file).exists() {
                return Err(format!("Configuration file not found: {}", config_file).into());
            }
            Config::from_file(config_file)?
        }
        None => Config::default(),
    };

    if let Some(addr) = &args.addr {
        config.listen_addr = parse_listen_addr(addr)?;
    }
    if let Some(cache) = &args.cache {
        config.cache_dir = Some(cache.clone());
    }
    if let Some(forward) = &args.forward {
        config.forward_file = Some(forward.clone());
    }
    if args.connect_timeout.is_some() {
        config.connect_timeout_secs = args.connect_timeout;
    }
    if let Some(pool_max_idle) = args.pool_max_idle {
        config.pool_max_idle_per_host = pool_max_idle;
    }

    Ok(config)
}

fn init_logging(args: &Args, config: &Config) -> Result<(), Box<dyn std::error::Error>> {
    match &config.logging {
        Some(logging) => {
            let mut logging = logging.clone();
            if let Some(level) = &args.log_level {
                logging.level = Some(parse_log_level(level)?);
            }
            if let Some(format) = &args.log_format {
                logging.format = Some(parse_log_format(format)?);
            }
            CustomLogger::init(logging)
        }
        None => init_fallback(args.log_level.as_deref(), args.log_format.as_deref()),
    }
}
