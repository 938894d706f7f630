//! # Timers de Mantenimiento
//! src/server/timers.rs
//!
//! Threads periódicos para los barridos del registro de conexiones. Cada
//! timer espera en un canal con `recv_timeout`: el periodo vence o llega la
//! orden de cancelar.

use std::sync::mpsc::{self, RecvTimeoutError, Sender};
use std::thread::{self, JoinHandle};
use std::time::Duration;
use tracing::trace;

/// Thread que ejecuta una tarea cada `period` hasta que se cancela
pub struct MaintenanceTimer {
    name: String,
    cancel: Option<Sender<()>>,
    handle: Option<JoinHandle<()>>,
}

impl MaintenanceTimer {
    pub fn spawn<F>(name: &str, period: Duration, mut tick: F) -> std::io::Result<Self>
    where
        F: FnMut() + Send + 'static,
    {
        let (tx, rx) = mpsc::channel::<()>();
        let thread_name = name.to_string();

        let handle = thread::Builder::new()
            .name(thread_name.clone())
            .spawn(move || loop {
                match rx.recv_timeout(period) {
                    Err(RecvTimeoutError::Timeout) => {
                        trace!(timer = %thread_name, "tick");
                        tick();
                    }
                    // Cancelado, o el timer fue soltado
                    Ok(()) | Err(RecvTimeoutError::Disconnected) => break,
                }
            })?;

        Ok(Self {
            name: name.to_string(),
            cancel: Some(tx),
            handle: Some(handle),
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Detiene el timer y espera a que su thread termine
    pub fn cancel(&mut self) {
        if let Some(tx) = self.cancel.take() {
            let _ = tx.send(());
        }
        if let Some(handle) = self.handle.take() {
            let _ = handle.join();
        }
    }
}

impl Drop for MaintenanceTimer {
    fn drop(&mut self) {
        self.cancel();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    #[test]
    fn test_timer_ticks_until_cancelled() {
        let ticks = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&ticks);

        let mut timer = MaintenanceTimer::spawn("test-timer", Duration::from_millis(10), move || {
            counter.fetch_add(1, Ordering::SeqCst);
        })
        .unwrap();
        assert_eq!(timer.name(), "test-timer");

        thread::sleep(Duration::from_millis(100));
        timer.cancel();
        let seen = ticks.load(Ordering::SeqCst);
        assert!(seen >= 2, "expected several ticks, got {}", seen);

        thread::sleep(Duration::from_millis(50));
        assert_eq!(ticks.load(Ordering::SeqCst), seen);
    }

    #[test]
    fn test_cancel_is_prompt() {
        let mut timer = MaintenanceTimer::spawn("slow", Duration::from_secs(60), || {}).unwrap();
        let start = std::time::Instant::now();
        timer.cancel();
        assert!(start.elapsed() < Duration::from_secs(5));
    }
}
