//! Blob cache server binary
//!
//! Loads the configuration, builds the two backend trees and serves them
//! over TCP.

use blobcache::blobstore::factory::new_blob_access;
use blobcache::blobstore::StorageType;
use blobcache::config::Config;
use blobcache::server::{BlobServer, BlobServerConfig};
use clap::Parser;
use env_logger::Env;
use std::path::PathBuf;
use std::process;

#[derive(Parser, Debug)]
#[command(name = "blobcache-server")]
#[command(about = "Content-addressed blob store for remote build caching", long_about = None)]
struct Args {
    /// Path to the TOML configuration file
    #[arg(short, long, default_value = "/etc/blobcache/config.toml")]
    config: PathBuf,
}

fn main() {
    let args = Args::parse();

    let config = match Config::load(&args.config) {
        Ok(config) => config,
        Err(e) => {
            eprintln!("failed to load configuration from {:?}: {}", args.config, e);
            process::exit(1);
        }
    };

    env_logger::Builder::from_env(Env::default().default_filter_or(&config.server.log_level))
        .init();

    log::info!("starting blob cache server");
    log::info!("  bind address: {}", config.server.bind);

    let cas = match new_blob_access(
        &config.content_addressable_storage,
        StorageType::ContentAddressable,
    ) {
        Ok(backend) => backend,
        Err(e) => {
            log::error!("failed to create content-addressable storage: {}", e);
            process::exit(1);
        }
    };
    let ac = match new_blob_access(&config.action_cache, StorageType::ActionCache) {
        Ok(backend) => backend,
        Err(e) => {
            log::error!("failed to create action cache: {}", e);
            process::exit(1);
        }
    };

    let server = BlobServer::new(
        BlobServerConfig {
            bind_addr: config.server.bind.clone(),
        },
        cas,
        ac,
    );

    if let Err(e) = server.run() {
        log::error!("server error: {}", e);
        process::exit(1);
    }
}
