//! # Pipeline de Filtros
//! src/router/filter.rs
//!
//! Cada request atraviesa dos cadenas:
//!
//! ```text
//! filtros de usuario ──► LinkHandler ──► filtros de sistema ──► handler
//! ```
//!
//! Un filtro puede delegar (`chain.do_filter(exchange)`), contestar él
//! mismo sin delegar, o envolver los streams del exchange antes de delegar.

use crate::server::exchange::Exchange;
use std::io;
use std::sync::Arc;

/// Código de aplicación que produce la respuesta de un contexto
pub trait Handler: Send + Sync {
    fn handle(&self, exchange: &mut Exchange) -> io::Result<()>;
}

impl<F> Handler for F
where
    F: Fn(&mut Exchange) -> io::Result<()> + Send + Sync,
{
    fn handle(&self, exchange: &mut Exchange) -> io::Result<()> {
        self(exchange)
    }
}

/// Interceptor que corre antes del handler
pub trait Filter: Send + Sync {
    /// Nombre corto para logs
    fn description(&self) -> &str;

    fn do_filter(&self, exchange: &mut Exchange, chain: Chain<'_>) -> io::Result<()>;
}

/// Resto de la cadena a partir de un filtro
#[derive(Clone, Copy)]
pub struct Chain<'a> {
    filters: &'a [Arc<dyn Filter>],
    handler: &'a dyn Handler,
}

impl<'a> Chain<'a> {
    pub fn new(filters: &'a [Arc<dyn Filter>], handler: &'a dyn Handler) -> Self {
        Self { filters, handler }
    }

    /// Filtros que faltan por ejecutar
    pub fn remaining(&self) -> usize {
        self.filters.len()
    }

    /// Invoca el siguiente filtro, o el handler si ya no quedan
    pub fn do_filter(self, exchange: &mut Exchange) -> io::Result<()> {
        match self.filters.split_first() {
            Some((first, rest)) => first.do_filter(
                exchange,
                Chain {
                    filters: rest,
                    handler: self.handler,
                },
            ),
            None => self.handler.handle(exchange),
        }
    }
}

/// Terminal de la cadena de usuario que continúa en la cadena de sistema
pub struct LinkHandler<'a> {
    next: Chain<'a>,
}

impl<'a> LinkHandler<'a> {
    pub fn new(next: Chain<'a>) -> Self {
        Self { next }
    }
}

impl Handler for LinkHandler<'_> {
    fn handle(&self, exchange: &mut Exchange) -> io::Result<()> {
        self.next.do_filter(exchange)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::http::ResponseLength;
    use crate::server::exchange::testing::exchange_for;
    use std::sync::Mutex;

    /// Filtro que deja rastro y delega
    struct Trace {
        name: &'static str,
        log: Arc<Mutex<Vec<String>>>,
    }

    impl Filter for Trace {
        fn description(&self) -> &str {
            self.name
        }

        fn do_filter(&self, exchange: &mut Exchange, chain: Chain<'_>) -> io::Result<()> {
            self.log.lock().unwrap().push(self.name.to_string());
            chain.do_filter(exchange)
        }
    }

    /// Filtro que contesta sin delegar
    struct Deny;

    impl Filter for Deny {
        fn description(&self) -> &str {
            "deny"
        }

        fn do_filter(&self, exchange: &mut Exchange, _chain: Chain<'_>) -> io::Result<()> {
            exchange.send_response_headers(403u16, ResponseLength::Empty)
        }
    }

    fn trace(name: &'static str, log: &Arc<Mutex<Vec<String>>>) -> Arc<dyn Filter> {
        Arc::new(Trace {
            name,
            log: Arc::clone(log),
        })
    }

    #[test]
    fn test_user_then_system_then_handler() {
        let log = Arc::new(Mutex::new(Vec::new()));
        let user = vec![trace("u1", &log), trace("u2", &log)];
        let system = vec![trace("s1", &log), trace("s2", &log)];

        let handler_log = Arc::clone(&log);
        let handler = move |_: &mut Exchange| -> io::Result<()> {
            handler_log.lock().unwrap().push("handler".to_string());
            Ok(())
        };

        let (mut exchange, _out) = exchange_for("GET /x HTTP/1.1", &[], b"");
        let system_chain = Chain::new(&system, &handler);
        let link = LinkHandler::new(system_chain);
        Chain::new(&user, &link).do_filter(&mut exchange).unwrap();

        assert_eq!(
            *log.lock().unwrap(),
            vec!["u1", "u2", "s1", "s2", "handler"]
        );
    }

    #[test]
    fn test_filter_short_circuit() {
        let log = Arc::new(Mutex::new(Vec::new()));
        let user: Vec<Arc<dyn Filter>> = vec![Arc::new(Deny), trace("after", &log)];

        let handler_log = Arc::clone(&log);
        let handler = move |_: &mut Exchange| -> io::Result<()> {
            handler_log.lock().unwrap().push("handler".to_string());
            Ok(())
        };

        let (mut exchange, out) = exchange_for("GET /x HTTP/1.1", &[], b"");
        Chain::new(&user, &handler).do_filter(&mut exchange).unwrap();

        assert!(log.lock().unwrap().is_empty());
        assert_eq!(exchange.response_code(), Some(403));
        let written = String::from_utf8(out.lock().unwrap().clone()).unwrap();
        assert!(written.starts_with("HTTP/1.1 403 Forbidden\r\n"));
    }

    #[test]
    fn test_empty_chain_calls_handler() {
        let handler = |exchange: &mut Exchange| -> io::Result<()> {
            exchange.send_response_headers(200u16, ResponseLength::Empty)
        };
        let chain = Chain::new(&[], &handler);
        assert_eq!(chain.remaining(), 0);

        let (mut exchange, _out) = exchange_for("GET / HTTP/1.1", &[], b"");
        chain.do_filter(&mut exchange).unwrap();
        assert_eq!(exchange.response_code(), Some(200));
    }
}
