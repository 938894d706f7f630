//! # Reactor HTTP - Entry Point
//! src/main.rs
//!
//! Servidor de demostración con dos contextos:
//! - `/echo`: devuelve el body del request (gzip si el cliente lo acepta)
//! - `/status`: JSON con el estado del request y la conexión

use reactor_http::config::ServerConfig;
use reactor_http::http::ResponseLength;
use reactor_http::router::GzipFilter;
use reactor_http::server::{Exchange, HttpServer};
use reactor_http::transport::load_server_config;
use std::io::{self, Read, Write};
use std::sync::Arc;
use std::thread;
use tracing::{error, info};

fn echo_handler(exchange: &mut Exchange) -> io::Result<()> {
    let mut body = Vec::new();
    exchange.request_body().read_to_end(&mut body)?;

    let content_type = exchange
        .request_headers()
        .get("Content-Type")
        .unwrap_or("application/octet-stream")
        .to_string();
    exchange.response_headers_mut().set("Content-Type", &content_type);

    if body.is_empty() {
        return exchange.send_response_headers(204u16, ResponseLength::Empty);
    }
    exchange.send_response_headers(200u16, ResponseLength::Fixed(body.len() as u64))?;
    exchange.response_body().write_all(&body)
}

fn status_handler(exchange: &mut Exchange) -> io::Result<()> {
    let metadata = exchange.transport_metadata();
    let json = serde_json::json!({
        "status": "ok",
        "method": exchange.request_method(),
        "path": exchange.request_path(),
        "query": exchange.request_query(),
        "protocol": exchange.protocol(),
        "scheme": metadata.scheme.as_str(),
        "peer": metadata.peer_addr.map(|a| a.to_string()),
        "connection": exchange.connection().id(),
    });
    let body = serde_json::to_vec_pretty(&json)
        .map_err(|e| io::Error::new(io::ErrorKind::Other, e))?;

    exchange
        .response_headers_mut()
        .set("Content-Type", "application/json");
    exchange.send_response_headers(200u16, ResponseLength::Fixed(body.len() as u64))?;
    exchange.response_body().write_all(&body)
}

fn run(config: ServerConfig) -> Result<(), Box<dyn std::error::Error>> {
    config.log_summary();

    let mut server = if config.https {
        let mut server = HttpServer::https(config.clone())?;
        match (&config.tls_cert, &config.tls_key) {
            (Some(cert), Some(key)) => server.set_tls_config(load_server_config(cert, key)?)?,
            _ => error!("https requested without --tls-cert/--tls-key"),
        }
        server
    } else {
        HttpServer::http(config.clone())?
    };

    server.bind(config.address(), config.backlog)?;

    let echo = server.create_context("/echo", Arc::new(echo_handler))?;
    echo.add_filter(Arc::new(GzipFilter::new()));
    server.create_context("/status", Arc::new(status_handler))?;

    server.start()?;
    info!(addr = ?server.local_addr(), "listening");

    loop {
        thread::park();
    }
}

fn main() {
    let config = ServerConfig::new();

    let level = if config.debug {
        tracing::Level::DEBUG
    } else {
        tracing::Level::INFO
    };
    tracing_subscriber::fmt()
        .with_max_level(level)
        .with_target(true)
        .with_thread_names(true)
        .init();

    if let Err(e) = config.validate() {
        error!(error = %e, "invalid configuration");
        std::process::exit(2);
    }

    if let Err(e) = run(config) {
        error!(error = %e, "fatal error");
        std::process::exit(1);
    }
}
