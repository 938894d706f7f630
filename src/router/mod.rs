//! # Sistema de Routing
//! src/router/mod.rs
//!
//! Tabla de contextos HTTP: cada contexto asocia un prefijo de path con un
//! handler y sus filtros.
//!
//! ## Arquitectura
//!
//! ```text
//! (scheme, path) → Router → HttpContext { handler, filters, system_filters }
//! ```
//!
//! La resolución usa el prefijo más largo: con `/api` y `/api/users`
//! registrados, `/api/users/7` va al segundo. Si ningún contexto coincide
//! el dispatcher responde 404 Not Found.

pub mod filter;
pub mod gzip;

pub use filter::{Chain, Filter, Handler, LinkHandler};
pub use gzip::GzipFilter;

use crate::error::ServerError;
use crate::transport::Scheme;
use std::any::Any;
use std::collections::HashMap;
use std::fmt;
use std::sync::{Arc, RwLock, RwLockReadGuard, RwLockWriteGuard};

type Attributes = HashMap<String, Arc<dyn Any + Send + Sync>>;

fn read<T>(lock: &RwLock<T>) -> RwLockReadGuard<'_, T> {
    lock.read().unwrap_or_else(|poisoned| poisoned.into_inner())
}

fn write<T>(lock: &RwLock<T>) -> RwLockWriteGuard<'_, T> {
    lock.write().unwrap_or_else(|poisoned| poisoned.into_inner())
}

/// Un contexto registrado en el servidor
pub struct HttpContext {
    path: String,
    scheme: Scheme,
    handler: RwLock<Option<Arc<dyn Handler>>>,
    filters: RwLock<Vec<Arc<dyn Filter>>>,
    system_filters: RwLock<Vec<Arc<dyn Filter>>>,
    attributes: RwLock<Attributes>,
}

impl HttpContext {
    fn new(path: &str, scheme: Scheme, handler: Option<Arc<dyn Handler>>) -> Self {
        Self {
            path: path.to_string(),
            scheme,
            handler: RwLock::new(handler),
            filters: RwLock::new(Vec::new()),
            system_filters: RwLock::new(Vec::new()),
            attributes: RwLock::new(HashMap::new()),
        }
    }

    pub fn path(&self) -> &str {
        &self.path
    }

    pub fn scheme(&self) -> Scheme {
        self.scheme
    }

    pub fn handler(&self) -> Option<Arc<dyn Handler>> {
        read(&self.handler).clone()
    }

    /// Asigna el handler de un contexto creado sin él
    pub fn set_handler(&self, handler: Arc<dyn Handler>) {
        *write(&self.handler) = Some(handler);
    }

    /// Copia de los filtros de usuario, en orden de declaración
    pub fn filters(&self) -> Vec<Arc<dyn Filter>> {
        read(&self.filters).clone()
    }

    pub fn add_filter(&self, filter: Arc<dyn Filter>) {
        write(&self.filters).push(filter);
    }

    pub fn system_filters(&self) -> Vec<Arc<dyn Filter>> {
        read(&self.system_filters).clone()
    }

    pub fn add_system_filter(&self, filter: Arc<dyn Filter>) {
        write(&self.system_filters).push(filter);
    }

    pub fn attribute(&self, name: &str) -> Option<Arc<dyn Any + Send + Sync>> {
        read(&self.attributes).get(name).cloned()
    }

    pub fn set_attribute(&self, name: &str, value: Arc<dyn Any + Send + Sync>) {
        write(&self.attributes).insert(name.to_string(), value);
    }

    /// El contexto cubre `path`: igual al prefijo, o el prefijo seguido de `/`
    fn matches(&self, path: &str) -> bool {
        if self.path == "/" {
            return path.starts_with('/');
        }
        match path.strip_prefix(self.path.as_str()) {
            Some(rest) => rest.is_empty() || rest.starts_with('/') || self.path.ends_with('/'),
            None => false,
        }
    }
}

impl fmt::Debug for HttpContext {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("HttpContext")
            .field("path", &self.path)
            .field("scheme", &self.scheme)
            .field("has_handler", &read(&self.handler).is_some())
            .field("filters", &read(&self.filters).len())
            .finish()
    }
}

/// Router que mapea prefijos de path a contextos
#[derive(Default)]
pub struct Router {
    contexts: RwLock<Vec<Arc<HttpContext>>>,
}

impl Router {
    /// Crea un nuevo router vacío
    pub fn new() -> Self {
        Self::default()
    }

    /// Registra un contexto
    ///
    /// # Ejemplo
    /// ```
    /// use reactor_http::router::Router;
    /// use reactor_http::transport::Scheme;
    ///
    /// let router = Router::new();
    /// let ctx = router.create("/hello", Scheme::Http, None).unwrap();
    /// assert_eq!(ctx.path(), "/hello");
    /// assert!(router.create("/hello", Scheme::Http, None).is_err());
    /// ```
    pub fn create(
        &self,
        path: &str,
        scheme: Scheme,
        handler: Option<Arc<dyn Handler>>,
    ) -> Result<Arc<HttpContext>, ServerError> {
        if !path.starts_with('/') {
            return Err(ServerError::InvalidPath(path.to_string()));
        }

        let mut contexts = write(&self.contexts);
        if contexts
            .iter()
            .any(|c| c.path == path && c.scheme == scheme)
        {
            return Err(ServerError::ContextExists(path.to_string()));
        }

        let context = Arc::new(HttpContext::new(path, scheme, handler));
        contexts.push(Arc::clone(&context));
        Ok(context)
    }

    /// Elimina el contexto con ese path exacto
    ///
    /// Los exchanges en curso conservan su referencia hasta terminar.
    pub fn remove(&self, path: &str, scheme: Scheme) -> Result<Arc<HttpContext>, ServerError> {
        let mut contexts = write(&self.contexts);
        let position = contexts
            .iter()
            .position(|c| c.path == path && c.scheme == scheme)
            .ok_or_else(|| ServerError::ContextNotFound(path.to_string()))?;
        Ok(contexts.remove(position))
    }

    /// Encuentra el contexto con el prefijo más largo que cubra `path`
    pub fn resolve(&self, scheme: Scheme, path: &str) -> Option<Arc<HttpContext>> {
        read(&self.contexts)
            .iter()
            .filter(|c| c.scheme == scheme && c.matches(path))
            .max_by_key(|c| c.path.len())
            .cloned()
    }

    pub fn len(&self) -> usize {
        read(&self.contexts).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
