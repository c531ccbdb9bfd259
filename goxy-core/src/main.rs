//! # Goxy Core
//!
//! The proxy engine: service-level TCP/HTTP proxies, the rule compiler,
//! and the filter chain that decides what each connection's traffic is
//! allowed to do. `goxy-api` is the optional control plane sitting on top
//! of a running `Manager`; this binary runs the engine standalone from a
//! YAML config file.

use std::env;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use goxy_core::config;
use goxy_core::export::NoopExporter;
use goxy_core::manager::Manager;

const SHUTDOWN_DEADLINE: Duration = Duration::from_secs(10);

#[tokio::main]
async fn main() {
    env_logger::init();
    eprintln!("[----] Starting goxy...");

    let config_path = env::args().nth(1).unwrap_or_else(|| "goxy.yaml".to_string());
    let root_config = match config::load(&config_path) {
        Ok(c) => c,
        Err(e) => {
            eprintln!("[----] Failed to load config '{config_path}': {e}");
            std::process::exit(1);
        }
    };

    eprintln!(
        "[----] Loaded {} service(s), {} rule(s) from '{}'",
        root_config.services.len(),
        root_config.rules.len(),
        config_path
    );

    let manager = match Manager::new(&root_config, Arc::new(NoopExporter)) {
        Ok(m) => Arc::new(m),
        Err(e) => {
            eprintln!("[----] Failed to build proxies: {e}");
            std::process::exit(1);
        }
    };

    eprintln!("[----] Starting proxies...");
    if let Err(e) = manager.start_all().await {
        eprintln!("[----] Failed to start proxies: {e}");
        std::process::exit(1);
    }

    let shutdown_requested = Arc::new(AtomicBool::new(false));
    let notify = Arc::new(tokio::sync::Notify::new());

    {
        let shutdown_requested = shutdown_requested.clone();
        let notify = notify.clone();
        ctrlc::set_handler(move || {
            eprintln!("\n[----] SIGINT received, shutting down...");
            shutdown_requested.store(true, Ordering::SeqCst);
            notify.notify_one();
        })
        .expect("error installing SIGINT handler");
    }

    eprintln!("[----] goxy is running. Press Ctrl+C to stop.");
    notify.notified().await;

    if shutdown_requested.load(Ordering::SeqCst) {
        match manager.shutdown(SHUTDOWN_DEADLINE).await {
            Ok(()) => eprintln!("[----] All proxies shut down cleanly."),
            Err(e) => eprintln!("[----] Shutdown did not complete cleanly: {e}"),
        }
    }
}
