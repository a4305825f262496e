use std::sync::Arc;

use anyhow::Result;
use clap::{Arg, Command};
use tokio::signal;

use conductor::cluster::client::HttpClusterClient;
use conductor::controller::startup::ControllerBuilder;
use conductor::storage::Storage;

/// Wait for shutdown signal (CTRL+C or SIGTERM)
async fn shutdown_signal() {
    let ctrl_c = async {
        signal::ctrl_c()
            .await
            .expect("failed to install Ctrl+C handler");
    };

    #[cfg(unix)]
    let terminate = async {
        signal::unix::signal(signal::unix::SignalKind::terminate())
            .expect("failed to install signal handler")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {
            log::info!("Received CTRL+C, shutting down...");
        },
        _ = terminate => {
            log::info!("Received SIGTERM, shutting down...");
        },
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    if std::env::var("RUST_LOG").is_err() {
        std::env::set_var("RUST_LOG", "info");
    }
    env_logger::init();

    let matches = Command::new("conductor")
        .version("0.1.0")
        .about("Control plane for multi-stage batch pipelines")
        .arg(
            Arg::new("data-dir")
                .long("data-dir")
                .value_name("DIR")
                .help("Directory holding the default manifest templates")
                .default_value("/etc"),
        )
        .arg(
            Arg::new("port")
                .short('p')
                .long("port")
                .value_name("PORT")
                .help("HTTP port for the REST API")
                .default_value("8080"),
        )
        .arg(
            Arg::new("config")
                .short('c')
                .long("config")
                .value_name("URI")
                .help("State checkpoint URI")
                .default_value("file:///data/config.json"),
        )
        .arg(
            Arg::new("cluster-endpoint")
                .long("cluster-endpoint")
                .value_name("URL")
                .help("Workload manager API server base URL")
                .default_value("http://127.0.0.1:8001"),
        )
        .get_matches();

    let data_dir = matches.get_one::<String>("data-dir").unwrap();
    let port: u16 = matches
        .get_one::<String>("port")
        .unwrap()
        .parse()
        .expect("invalid port");
    let checkpoint = matches.get_one::<String>("config").unwrap();
    let endpoint = matches.get_one::<String>("cluster-endpoint").unwrap();

    // Startup misconfiguration is fatal; everything later is logged and
    // retried by the next event or tick.
    let cluster = Arc::new(HttpClusterClient::new(endpoint).expect("cluster client"));
    let storage = Storage::new();

    let mut builder = ControllerBuilder::new(cluster, storage, data_dir);
    if !checkpoint.is_empty() {
        builder = builder.with_checkpoint(checkpoint);
    }
    let controller = builder.build().await.expect("failed to build controller");

    let addr = format!("0.0.0.0:{port}");
    controller.serve_with_shutdown(&addr, shutdown_signal()).await?;

    Ok(())
}
