mod config;
mod service;

use crate::config::ApiServerConfig;
use crate::service::{routes, AppState};
use log::*;
use oss_lib::{Coordinator, HttpChunkMaster, SqliteMetaStore};
use simplelog::{ColorChoice, Config as LogConfig, LevelFilter, TermLogger, TerminalMode};
use std::net::SocketAddr;
use std::sync::Arc;

#[tokio::main]
async fn main() {
    let _ = TermLogger::init(
        LevelFilter::Info,
        LogConfig::default(),
        TerminalMode::Mixed,
        ColorChoice::Auto,
    );

    let config_path = std::env::args()
        .nth(1)
        .unwrap_or_else(|| "oss-apiserver.toml".to_string());
    let config = match ApiServerConfig::load(&config_path) {
        Ok(config) => config,
        Err(e) => {
            error!("load config {} failed: {}", config_path, e);
            std::process::exit(1);
        }
    };

    let master = match HttpChunkMaster::new(
        &config.master.host,
        config.master.port,
        config.io_timeout(),
    ) {
        Ok(master) => Arc::new(master),
        Err(e) => {
            error!("create chunkmaster client failed: {}", e);
            std::process::exit(1);
        }
    };

    let coordinator = Arc::new(Coordinator::new(master, config.route_config()));
    // warm up once so the first request does not race the loops; the
    // background loops recover from a master that is still coming up
    if let Err(e) = coordinator.refresh_route().await {
        warn!("initial route fetch failed: {}", e);
    }
    if let Err(e) = coordinator.refill_fid().await {
        warn!("initial fid lease failed: {}", e);
    }
    tokio::spawn(coordinator.clone().run_topology_loop());
    tokio::spawn(coordinator.clone().run_fid_loop());

    let meta_store = match SqliteMetaStore::new(&config.meta_db_path) {
        Ok(store) => Arc::new(store),
        Err(e) => {
            error!("open meta db {} failed: {}", config.meta_db_path, e);
            std::process::exit(1);
        }
    };

    let addr: SocketAddr = match format!("{}:{}", config.host, config.port).parse() {
        Ok(addr) => addr,
        Err(e) => {
            error!("bad listen address {}:{}: {}", config.host, config.port, e);
            std::process::exit(1);
        }
    };
    let state = AppState {
        coordinator,
        meta_store,
    };
    info!("oss-apiserver listening on {}", addr);
    warp::serve(routes(state)).run(addr).await;
}
