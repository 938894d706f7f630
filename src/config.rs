//! # Configuración del Servidor
//! src/config.rs
//!
//! Configuración del dispatcher con soporte para argumentos CLI, variables
//! de entorno y JSON (para aplicaciones que embeben el servidor).
//!
//! ## Ejemplos de uso
//!
//! ### CLI
//! ```bash
//! ./reactor_http --port 8080 \
//!   --workers 8 \
//!   --idle-interval 30 \
//!   --max-idle-connections 200 \
//!   --max-req-time 10
//! ```
//!
//! ### Variables de entorno
//! ```bash
//! HTTP_PORT=8080 HTTP_HOST=0.0.0.0 MAX_RSP_TIME=20 ./reactor_http
//! ```
//!
//! ### JSON
//! ```
//! use reactor_http::config::ServerConfig;
//!
//! let config = ServerConfig::from_json(r#"{"port": 9000, "max_req_time_secs": 5}"#).unwrap();
//! assert_eq!(config.port, 9000);
//! assert_eq!(config.max_request_time(), Some(std::time::Duration::from_secs(5)));
//! ```

use crate::error::ConfigError;
use clap::Parser;
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::Duration;
use tracing::info;

/// Valor centinela: timeout deshabilitado
pub const DISABLED: i64 = -1;

/// Configuración del servidor HTTP
#[derive(Debug, Clone, Parser, Serialize, Deserialize)]
#[command(name = "reactor_http")]
#[command(about = "Servidor HTTP/HTTPS con reactor mio, pool de workers y keep-alive")]
#[command(version = "0.1.0")]
#[serde(default)]
pub struct ServerConfig {
    /// Puerto en el que escucha el servidor
    #[arg(short, long, default_value = "8080", env = "HTTP_PORT")]
    pub port: u16,

    /// Host/IP en el que escucha
    #[arg(long, default_value = "127.0.0.1", env = "HTTP_HOST")]
    pub host: String,

    /// Backlog del socket de escucha (0 = valor del sistema)
    #[arg(long, default_value = "0", env = "HTTP_BACKLOG")]
    pub backlog: u32,

    /// Número de threads del pool de workers por defecto
    #[arg(long, default_value = "4", env = "WORKERS")]
    pub workers: usize,

    // === HTTPS ===
    /// Sirve https en lugar de http
    #[arg(long, env = "HTTPS")]
    pub https: bool,

    /// Certificado PEM (cadena completa) para https
    #[arg(long = "tls-cert", env = "TLS_CERT")]
    pub tls_cert: Option<PathBuf>,

    /// Llave privada PEM para https
    #[arg(long = "tls-key", env = "TLS_KEY")]
    pub tls_key: Option<PathBuf>,

    // === Timers ===
    /// Periodo del barrido de conexiones idle, en milisegundos
    #[arg(long = "clock-tick", default_value = "500", env = "CLOCK_TICK")]
    pub clock_tick_ms: u64,

    /// Tiempo máximo que una conexión puede estar idle, en segundos
    #[arg(long = "idle-interval", default_value = "30", env = "IDLE_INTERVAL")]
    pub idle_interval_secs: u64,

    /// Capacidad del pool de conexiones idle
    #[arg(long = "max-idle-connections", default_value = "200", env = "MAX_IDLE_CONNECTIONS")]
    pub max_idle_connections: usize,

    /// Periodo del barrido de peers lentos, en milisegundos
    #[arg(long = "timer-millis", default_value = "1000", env = "TIMER_MILLIS")]
    pub timer_millis: u64,

    /// Tiempo máximo para recibir un request, en segundos (-1 = sin límite)
    #[arg(long = "max-req-time", default_value = "-1", allow_negative_numbers = true, env = "MAX_REQ_TIME")]
    pub max_req_time_secs: i64,

    /// Tiempo máximo para enviar una respuesta, en segundos (-1 = sin límite)
    #[arg(long = "max-rsp-time", default_value = "-1", allow_negative_numbers = true, env = "MAX_RSP_TIME")]
    pub max_rsp_time_secs: i64,

    /// Espera máxima del reactor en el multiplexor, en milisegundos
    #[arg(long = "poll-interval", default_value = "1000", env = "POLL_INTERVAL")]
    pub poll_interval_ms: u64,

    // === Límites ===
    /// Bytes de body no leído que se descartan para poder reusar la conexión
    #[arg(long = "drain-amount", default_value = "65536", env = "DRAIN_AMOUNT")]
    pub drain_amount: u64,

    /// Número máximo de headers por request
    #[arg(long = "max-req-headers", default_value = "200", env = "MAX_REQ_HEADERS")]
    pub max_req_headers: usize,

    /// Activa logging de depuración
    #[arg(long, env = "HTTP_DEBUG")]
    pub debug: bool,
}

impl ServerConfig {
    /// Crea una nueva configuración parseando argumentos CLI
    pub fn new() -> Self {
        ServerConfig::parse()
    }

    /// Carga la configuración desde JSON; los campos ausentes toman el default
    pub fn from_json(json: &str) -> Result<Self, ConfigError> {
        let config: ServerConfig =
            serde_json::from_str(json).map_err(|e| ConfigError::Parse(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    /// Obtiene la dirección completa para bind (host:port)
    ///
    /// # Ejemplo
    /// ```rust
    /// use reactor_http::config::ServerConfig;
    ///
    /// let config = ServerConfig::default();
    /// assert_eq!(config.address(), "127.0.0.1:8080");
    /// ```
    pub fn address(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }

    /// Valida la configuración
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.workers == 0 {
            return Err(ConfigError::MustBePositive("workers"));
        }
        if self.clock_tick_ms == 0 {
            return Err(ConfigError::MustBePositive("clock_tick_ms"));
        }
        if self.timer_millis == 0 {
            return Err(ConfigError::MustBePositive("timer_millis"));
        }
        if self.poll_interval_ms == 0 {
            return Err(ConfigError::MustBePositive("poll_interval_ms"));
        }
        if self.max_req_headers == 0 {
            return Err(ConfigError::MustBePositive("max_req_headers"));
        }
        if self.max_req_time_secs < DISABLED {
            return Err(ConfigError::InvalidTimeout("max_req_time_secs"));
        }
        if self.max_rsp_time_secs < DISABLED {
            return Err(ConfigError::InvalidTimeout("max_rsp_time_secs"));
        }
        if self.tls_cert.is_some() != self.tls_key.is_some() {
            return Err(ConfigError::IncompleteTls);
        }
        Ok(())
    }

    pub fn clock_tick(&self) -> Duration {
        Duration::from_millis(self.clock_tick_ms)
    }

    pub fn idle_interval(&self) -> Duration {
        Duration::from_secs(self.idle_interval_secs)
    }

    pub fn timer_period(&self) -> Duration {
        Duration::from_millis(self.timer_millis)
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }

    /// `None` si el límite está deshabilitado (-1)
    pub fn max_request_time(&self) -> Option<Duration> {
        secs_or_disabled(self.max_req_time_secs)
    }

    /// `None` si el límite está deshabilitado (-1)
    pub fn max_response_time(&self) -> Option<Duration> {
        secs_or_disabled(self.max_rsp_time_secs)
    }

    /// El barrido de peers lentos solo corre si hay algún límite
    pub fn slow_peer_sweep_enabled(&self) -> bool {
        self.max_request_time().is_some() || self.max_response_time().is_some()
    }

    /// Valor del header `Keep-Alive` para clientes HTTP/1.0
    pub fn keep_alive_hint(&self) -> String {
        format!(
            "timeout={}, max={}",
            self.idle_interval_secs, self.max_idle_connections
        )
    }

    /// Registra un resumen de la configuración
    pub fn log_summary(&self) {
        info!(
            address = %self.address(),
            https = self.https,
            workers = self.workers,
            backlog = self.backlog,
            "network"
        );
        info!(
            clock_tick_ms = self.clock_tick_ms,
            idle_interval_secs = self.idle_interval_secs,
            max_idle_connections = self.max_idle_connections,
            "keep-alive"
        );
        if self.slow_peer_sweep_enabled() {
            info!(
                timer_millis = self.timer_millis,
                max_req_time_secs = self.max_req_time_secs,
                max_rsp_time_secs = self.max_rsp_time_secs,
                "slow-peer sweep enabled"
            );
        } else {
            info!("slow-peer sweep disabled");
        }
    }
}

fn secs_or_disabled(secs: i64) -> Option<Duration> {
    if secs < 0 {
        None
    } else {
        Some(Duration::from_secs(secs as u64))
    }
}

impl Default for ServerConfig {
    /// Configuración por defecto
    fn default() -> Self {
        Self {
            port: 8080,
            host: "127.0.0.1".to_string(),
            backlog: 0,
            workers: 4,
            https: false,
            tls_cert: None,
            tls_key: None,
            clock_tick_ms: 500,
            idle_interval_secs: 30,
            max_idle_connections: 200,
            timer_millis: 1000,
            max_req_time_secs: DISABLED,
            max_rsp_time_secs: DISABLED,
            poll_interval_ms: 1000,
            drain_amount: 64 * 1024,
            max_req_headers: 200,
            debug: false,
        }
    }
}
