//! # Registro de Conexiones
//! src/server/registry.rs
//!
//! Tres conjuntos disjuntos: idle, esperando request y esperando respuesta.
//! Cada conjunto tiene su propio mutex. Una transición solo mueve la
//! conexión si sigue en el conjunto de origen; así un sweep que ya la cerró
//! no la ve reaparecer.

use super::connection::{Connection, State};
use crate::clock::Clock;
use crate::config::ServerConfig;
use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;
use tracing::debug;

type ConnectionSet = Mutex<HashMap<u64, Arc<Connection>>>;

fn guard(set: &ConnectionSet) -> MutexGuard<'_, HashMap<u64, Arc<Connection>>> {
    set.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

fn millis(duration: Duration) -> u64 {
    duration.as_millis() as u64
}

/// Cantidad de conexiones por conjunto
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct RegistryCounts {
    pub idle: usize,
    pub awaiting_request: usize,
    pub awaiting_response: usize,
}

/// Conjuntos de conexiones vivas y los límites de tiempo que se les aplican
pub struct ConnectionRegistry {
    idle: ConnectionSet,
    requests: ConnectionSet,
    responses: ConnectionSet,
    clock: Arc<dyn Clock>,
    idle_interval: u64,
    max_idle: usize,
    max_request_time: Option<u64>,
    max_response_time: Option<u64>,
}

impl ConnectionRegistry {
    pub fn new(config: &ServerConfig, clock: Arc<dyn Clock>) -> Self {
        Self {
            idle: Mutex::new(HashMap::new()),
            requests: Mutex::new(HashMap::new()),
            responses: Mutex::new(HashMap::new()),
            clock,
            idle_interval: millis(config.idle_interval()),
            max_idle: config.max_idle_connections,
            max_request_time: config.max_request_time().map(millis),
            max_response_time: config.max_response_time().map(millis),
        }
    }

    pub fn now(&self) -> u64 {
        self.clock.now_millis()
    }

    /// La conexión empieza a leer un request
    pub fn request_started(&self, conn: &Arc<Connection>) {
        if conn.is_closed() {
            return;
        }
        conn.set_creation_time(self.now());
        conn.set_state(State::AwaitingRequest);
        guard(&self.requests).insert(conn.id(), Arc::clone(conn));
    }

    /// El request terminó de leerse; empieza a correr el tiempo de respuesta
    pub fn request_completed(&self, conn: &Arc<Connection>) {
        if guard(&self.requests).remove(&conn.id()).is_none() {
            return;
        }
        conn.set_response_started_time(self.now());
        conn.set_state(State::AwaitingResponse);
        guard(&self.responses).insert(conn.id(), Arc::clone(conn));
    }

    /// La respuesta se envió completa: la conexión queda fuera de los conjuntos
    pub fn response_completed(&self, conn: &Arc<Connection>) {
        guard(&self.requests).remove(&conn.id());
        guard(&self.responses).remove(&conn.id());
        conn.set_state(State::Idle);
    }

    /// Entra al pool idle con su deadline
    pub fn enter_idle(&self, conn: &Arc<Connection>) {
        if conn.is_closed() {
            return;
        }
        conn.set_idle_deadline(self.now() + self.idle_interval);
        conn.set_state(State::Idle);
        guard(&self.idle).insert(conn.id(), Arc::clone(conn));
    }

    /// Saca una conexión del pool idle y la pasa a esperar request
    ///
    /// Retorna `false` si ya no estaba (un sweep la cerró).
    pub fn promote_idle(&self, conn: &Arc<Connection>) -> bool {
        if guard(&self.idle).remove(&conn.id()).is_none() {
            return false;
        }
        self.request_started(conn);
        true
    }

    pub fn idle_len(&self) -> usize {
        guard(&self.idle).len()
    }

    /// El pool idle ya no admite otra conexión
    pub fn idle_full(&self) -> bool {
        self.idle_len() >= self.max_idle
    }

    /// Cierra la conexión y la quita de cualquier conjunto
    pub fn close(&self, conn: &Arc<Connection>) {
        // El estado puede cambiar mientras tanto: se revisan los tres
        guard(&self.idle).remove(&conn.id());
        guard(&self.requests).remove(&conn.id());
        guard(&self.responses).remove(&conn.id());
        conn.close();
    }

    /// Cierra las conexiones idle cuyo deadline ya pasó
    pub fn sweep_idle(&self) -> usize {
        let now = self.now();
        let expired: Vec<Arc<Connection>> = {
            let mut idle = guard(&self.idle);
            let ids: Vec<u64> = idle
                .values()
                .filter(|c| c.idle_deadline() <= now)
                .map(|c| c.id())
                .collect();
            ids.iter().filter_map(|id| idle.remove(id)).collect()
        };

        for conn in &expired {
            debug!(conn = conn.id(), "idle timeout");
            conn.close();
        }
        expired.len()
    }

    /// Cierra las conexiones que tardan demasiado en enviar el request o en
    /// recibir la respuesta
    pub fn sweep_slow_peers(&self) -> usize {
        let now = self.now();
        let mut closed = 0;

        if let Some(max) = self.max_request_time {
            closed += Self::sweep_set(&self.requests, |c| {
                now.saturating_sub(c.creation_time()) > max
            }, "request timeout");
        }

        if let Some(max) = self.max_response_time {
            closed += Self::sweep_set(&self.responses, |c| {
                now.saturating_sub(c.response_started_time()) > max
            }, "response timeout");
        }

        closed
    }

    fn sweep_set<F>(set: &ConnectionSet, expired: F, reason: &'static str) -> usize
    where
        F: Fn(&Connection) -> bool,
    {
        let victims: Vec<Arc<Connection>> = {
            let mut set = guard(set);
            let ids: Vec<u64> = set
                .values()
                .filter(|c| expired(c))
                .map(|c| c.id())
                .collect();
            ids.iter().filter_map(|id| set.remove(id)).collect()
        };

        for conn in &victims {
            debug!(conn = conn.id(), reason, "slow peer");
            conn.close();
        }
        victims.len()
    }

    /// Cierra todo; se usa al detener el servidor
    pub fn close_all(&self) -> usize {
        let mut all: Vec<Arc<Connection>> = Vec::new();
        for set in [&self.idle, &self.requests, &self.responses] {
            all.extend(guard(set).drain().map(|(_, c)| c));
        }
        for conn in &all {
            conn.close();
        }
        all.len()
    }

    pub fn counts(&self) -> RegistryCounts {
        RegistryCounts {
            idle: guard(&self.idle).len(),
            awaiting_request: guard(&self.requests).len(),
            awaiting_response: guard(&self.responses).len(),
        }
    }
}
