//! # Módulo del Servidor HTTP
//! src/server/mod.rs
//!
//! Motor de despacho de conexiones:
//! 1. El reactor acepta conexiones y espera readiness con mio
//! 2. Cada conexión lista pasa a un worker del executor
//! 3. El worker parsea el request, corre filtros y handler
//! 4. Al terminar la respuesta, el reactor decide: keep-alive o cierre
//!
//! Los timers de mantenimiento cierran conexiones idle vencidas y peers
//! lentos.

pub mod connection;
pub(crate) mod dispatcher;
pub mod exchange;
pub mod executor;
pub mod http_server;
pub mod registry;
pub mod timers;

// Re-exportar para facilitar el uso
pub use connection::{Connection, State};
pub use exchange::{Exchange, ResponseBody};
pub use executor::{Executor, Task, ThreadPool};
pub use http_server::HttpServer;
pub use registry::{ConnectionRegistry, RegistryCounts};
