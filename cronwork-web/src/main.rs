//! Binary entry point for the cronwork control plane.

use clap::{Arg, Command};
use cronwork_web::{Server, ServerConfig};
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::from_default_env()
                .add_directive("cronwork=info".parse().expect("valid directive"))
                .add_directive("cronwork_web=info".parse().expect("valid directive")),
        )
        .init();

    let matches = Command::new("cronwork-web")
        .version(env!("CARGO_PKG_VERSION"))
        .about("REST control plane for the cronwork job scheduler")
        .arg(
            Arg::new("config")
                .short('c')
                .long("config")
                .value_name("FILE")
                .help("Path to a TOML configuration file"),
        )
        .arg(
            Arg::new("database-url")
                .short('d')
                .long("database-url")
                .value_name("URL")
                .help("PostgreSQL connection string"),
        )
        .arg(
            Arg::new("bind")
                .short('b')
                .long("bind")
                .value_name("ADDRESS")
                .help("Interface to bind"),
        )
        .arg(
            Arg::new("port")
                .short('p')
                .long("port")
                .value_name("PORT")
                .help("TCP port for the control plane"),
        )
        .get_matches();

    let mut config = match matches.get_one::<String>("config") {
        Some(path) => {
            info!(%path, "loading configuration file");
            match ServerConfig::from_file(path) {
                Ok(config) => config,
                Err(err) => {
                    error!(error = %err, "could not load configuration file");
                    std::process::exit(1);
                }
            }
        }
        None => ServerConfig::new(),
    };
    config = config.apply_env();

    if let Some(url) = matches.get_one::<String>("database-url") {
        config.database_url = url.clone();
    }
    if let Some(bind) = matches.get_one::<String>("bind") {
        config.bind_address = bind.clone();
    }
    if let Some(port) = matches.get_one::<String>("port") {
        match port.parse() {
            Ok(port) => config.port = port,
            Err(_) => {
                error!(%port, "invalid port");
                std::process::exit(1);
            }
        }
    }

    if config.database_url.is_empty() {
        error!(
            "database URL is required; set {} or pass --database-url",
            cronwork_web::config::ENV_DATABASE_URL
        );
        std::process::exit(1);
    }

    if let Err(err) = Server::new(config).run().await {
        error!(error = %err, "server exited with an error");
        std::process::exit(1);
    }
}
