use clap::{Arg, ArgAction, Command};
use hteed::config::{self, Overrides};
use std::path::PathBuf;
use tracing::info;

#[tokio::main]
async fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();

    info!(version = env!("CARGO_PKG_VERSION"), "hteed starting");

    let matches = Command::new("hteed")
        .version(env!("CARGO_PKG_VERSION"))
        .about("Streaming HTTP tee daemon")
        .arg(
            Arg::new("config")
                .help("Path to a TOML config file")
                .short('c')
                .long("config"),
        )
        .arg(
            Arg::new("address")
                .help("Address to bind")
                .short('a')
                .long("address"),
        )
        .arg(
            Arg::new("port")
                .help("Port to bind")
                .short('p')
                .long("port")
                .value_parser(clap::value_parser!(u16)),
        )
        .arg(
            Arg::new("redis_url")
                .help("Redis URL of the stream store")
                .long("redis-url"),
        )
        .arg(
            Arg::new("web_url")
                .help("Authorization upstream URL")
                .long("web-url"),
        )
        .arg(
            Arg::new("web_token")
                .help("Authorization upstream bearer token")
                .long("web-token"),
        )
        .arg(
            Arg::new("key_prefix")
                .help("Prefix for every store key")
                .long("key-prefix"),
        )
        .arg(
            Arg::new("testing")
                .help("Enable the test-only store reset")
                .long("testing")
                .action(ArgAction::SetTrue),
        )
        .get_matches();

    let flags = Overrides {
        bind_address: matches.get_one::<String>("address").cloned(),
        bind_port: matches.get_one::<u16>("port").copied(),
        redis_url: matches.get_one::<String>("redis_url").cloned(),
        web_url: matches.get_one::<String>("web_url").cloned(),
        web_token: matches.get_one::<String>("web_token").cloned(),
        key_prefix: matches.get_one::<String>("key_prefix").cloned(),
        testing: matches.get_flag("testing").then_some(true),
    };

    let config_path = matches.get_one::<String>("config").map(PathBuf::from);
    let cfg = match config::load(config_path.as_deref(), flags) {
        Ok(cfg) => cfg,
        Err(e) => {
            eprintln!("FATAL: failed to load config: {}", e);
            std::process::exit(1);
        }
    };

    info!(
        bind = %format!("{}:{}", cfg.bind_address, cfg.bind_port),
        web = %cfg.web_url,
        "config loaded"
    );

    if let Err(e) = hteed::run(cfg).await {
        eprintln!("FATAL: {}", e);
        std::process::exit(1);
    }
}
