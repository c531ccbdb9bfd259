//! # Goxy API
//!
//! The control plane for a running goxy proxy fleet. Loads the same YAML
//! config as `goxy-core`, builds and starts a `Manager`, and exposes it to
//! operators over a small REST surface: toggle a proxy's listening state,
//! enable/disable or re-arm a single filter, and read back the fleet's
//! current description.

mod error;
mod routes;

use actix_cors::Cors;
use actix_web::http::header;
use actix_web::{middleware, web, App, HttpServer};
use goxy_core::config;
use goxy_core::export::NoopExporter;
use goxy_core::manager::Manager;
use std::sync::Arc;

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    env_logger::init();

    let matches = clap::Command::new("goxy-api")
        .version("0.1.0")
        .about("REST control plane for the goxy proxy fleet")
        .arg(
            clap::Arg::new("config")
                .long("config")
                .help("Path to the service/rule YAML config")
                .value_name("PATH")
                .default_value("goxy.yaml"),
        )
        .arg(
            clap::Arg::new("ip")
                .long("ip")
                .help("IP address to bind the control-plane server to")
                .value_name("IP")
                .default_value("0.0.0.0"),
        )
        .arg(
            clap::Arg::new("port")
                .long("port")
                .help("Port number to bind the control-plane server to")
                .value_name("PORT")
                .default_value("8088")
                .value_parser(clap::value_parser!(u16)),
        )
        .get_matches();

    let config_path = matches.get_one::<String>("config").unwrap();
    let ip = matches.get_one::<String>("ip").unwrap();
    let port = matches.get_one::<u16>("port").unwrap();
    let bind_address = format!("{ip}:{port}");

    log::info!("Loading config from {config_path}...");
    let root_config = config::load(config_path)?;

    log::info!(
        "Building {} proxies from config...",
        root_config.services.len()
    );
    let manager = Arc::new(Manager::new(&root_config, Arc::new(NoopExporter))?);
    manager.start_all().await?;

    log::info!("Starting control-plane API on {bind_address}...");
    HttpServer::new(move || {
        let cors = Cors::default()
            .allow_any_origin()
            .allowed_methods(vec!["GET", "PUT"])
            .allowed_headers(vec![header::ACCEPT, header::CONTENT_TYPE])
            .max_age(3600);

        App::new()
            .app_data(web::Data::new(manager.clone()))
            .wrap(middleware::Logger::default())
            .wrap(cors)
            .configure(routes::configure)
    })
    .bind(&bind_address)?
    .workers(2)
    .run()
    .await?;

    Ok(())
}
