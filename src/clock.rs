//! # Reloj del Servidor
//! src/clock.rs
//!
//! Abstracción del tiempo usada por el dispatcher y los timers de
//! mantenimiento. Todos los timestamps de una conexión (`creation_time`,
//! `response_started_time`, `idle_deadline`) son milisegundos de este reloj.
//!
//! - [`SystemClock`]: reloj monotónico real (por defecto)
//! - [`ManualClock`]: reloj controlado a mano para tests deterministas

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Instant;

/// Fuente de tiempo en milisegundos
pub trait Clock: Send + Sync {
    /// Milisegundos transcurridos desde un origen arbitrario pero fijo
    fn now_millis(&self) -> u64;
}

/// Reloj monotónico basado en `Instant`
#[derive(Debug, Clone)]
pub struct SystemClock {
    origin: Instant,
}

impl SystemClock {
    pub fn new() -> Self {
        Self {
            origin: Instant::now(),
        }
    }

    /// Atajo para el tipo que consume el servidor
    pub fn shared() -> Arc<dyn Clock> {
        Arc::new(Self::new())
    }
}

impl Default for SystemClock {
    fn default() -> Self {
        Self::new()
    }
}

impl Clock for SystemClock {
    fn now_millis(&self) -> u64 {
        self.origin.elapsed().as_millis() as u64
    }
}

/// Reloj que solo avanza cuando se le pide
///
/// # Ejemplo
/// ```
/// use reactor_http::clock::{Clock, ManualClock};
///
/// let clock = ManualClock::new(1_000);
/// clock.advance(250);
/// assert_eq!(clock.now_millis(), 1_250);
/// ```
#[derive(Debug, Default)]
pub struct ManualClock {
    now: AtomicU64,
}

impl ManualClock {
    pub fn new(start_millis: u64) -> Self {
        Self {
            now: AtomicU64::new(start_millis),
        }
    }

    /// Avanza el reloj `millis` milisegundos
    pub fn advance(&self, millis: u64) {
        self.now.fetch_add(millis, Ordering::SeqCst);
    }

    /// Fija el instante actual
    pub fn set(&self, millis: u64) {
        self.now.store(millis, Ordering::SeqCst);
    }
}

impl Clock for ManualClock {
    fn now_millis(&self) -> u64 {
        self.now.load(Ordering::SeqCst)
    }
}
