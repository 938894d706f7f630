//! # Códigos de Estado HTTP
//!
//! Los códigos que el dispatcher sintetiza por sí mismo (100, 400, 404, 500)
//! más los más comunes para los handlers. Los handlers pueden usar cualquier
//! `u16`; [`reason_phrase`] resuelve el texto o devuelve uno genérico.
//!
//! - **1xx**: Informacional (100 Continue para `Expect: 100-continue`)
//! - **2xx**: Éxito
//! - **3xx**: Redirección
//! - **4xx**: Error del cliente
//! - **5xx**: Error del servidor

/// Códigos de estado HTTP conocidos por el servidor
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum StatusCode {
    /// 100 Continue - Respuesta interina a `Expect: 100-continue`
    Continue = 100,

    /// 200 OK - La petición fue exitosa
    Ok = 200,

    /// 201 Created
    Created = 201,

    /// 204 No Content - Petición exitosa sin contenido en el body
    NoContent = 204,

    /// 304 Not Modified
    NotModified = 304,

    /// 400 Bad Request - Request line, headers o framing malformados
    BadRequest = 400,

    /// 403 Forbidden
    Forbidden = 403,

    /// 404 Not Found - Ningún contexto para el path
    NotFound = 404,

    /// 405 Method Not Allowed
    MethodNotAllowed = 405,

    /// 413 Payload Too Large
    PayloadTooLarge = 413,

    /// 500 Internal Server Error - Contexto sin handler u otro defecto del servidor
    InternalServerError = 500,

    /// 503 Service Unavailable
    ServiceUnavailable = 503,
}

impl StatusCode {
    /// Convierte el código a su valor numérico
    ///
    /// # Ejemplo
    /// ```
    /// use reactor_http::http::StatusCode;
    /// assert_eq!(StatusCode::Ok.as_u16(), 200);
    /// ```
    pub fn as_u16(&self) -> u16 {
        *self as u16
    }

    /// Busca la variante de un código numérico
    pub fn from_u16(code: u16) -> Option<Self> {
        let status = match code {
            100 => StatusCode::Continue,
            200 => StatusCode::Ok,
            201 => StatusCode::Created,
            204 => StatusCode::NoContent,
            304 => StatusCode::NotModified,
            400 => StatusCode::BadRequest,
            403 => StatusCode::Forbidden,
            404 => StatusCode::NotFound,
            405 => StatusCode::MethodNotAllowed,
            413 => StatusCode::PayloadTooLarge,
            500 => StatusCode::InternalServerError,
            503 => StatusCode::ServiceUnavailable,
            _ => return None,
        };
        Some(status)
    }

    /// Retorna el texto de razón (reason phrase) asociado al código
    ///
    /// # Ejemplo
    /// ```
    /// use reactor_http::http::StatusCode;
    /// assert_eq!(StatusCode::NotFound.reason_phrase(), "Not Found");
    /// ```
    pub fn reason_phrase(&self) -> &'static str {
        match self {
            StatusCode::Continue => "Continue",
            StatusCode::Ok => "OK",
            StatusCode::Created => "Created",
            StatusCode::NoContent => "No Content",
            StatusCode::NotModified => "Not Modified",
            StatusCode::BadRequest => "Bad Request",
            StatusCode::Forbidden => "Forbidden",
            StatusCode::NotFound => "Not Found",
            StatusCode::MethodNotAllowed => "Method Not Allowed",
            StatusCode::PayloadTooLarge => "Payload Too Large",
            StatusCode::InternalServerError => "Internal Server Error",
            StatusCode::ServiceUnavailable => "Service Unavailable",
        }
    }

    /// Verifica si el código indica error del cliente (4xx)
    pub fn is_client_error(&self) -> bool {
        (400..500).contains(&self.as_u16())
    }

    /// Verifica si el código indica error del servidor (5xx)
    pub fn is_server_error(&self) -> bool {
        (500..600).contains(&self.as_u16())
    }
}

impl From<StatusCode> for u16 {
    fn from(status: StatusCode) -> u16 {
        status.as_u16()
    }
}

/// Reason phrase para cualquier código numérico
pub fn reason_phrase(code: u16) -> &'static str {
    match StatusCode::from_u16(code) {
        Some(status) => status.reason_phrase(),
        None => match code {
            100..=199 => "Informational",
            200..=299 => "Success",
            300..=399 => "Redirection",
            400..=499 => "Client Error",
            _ => "Server Error",
        },
    }
}

/// Los códigos sin body según RFC 7230 §3.3.3
pub fn forbids_body(code: u16) -> bool {
    (100..200).contains(&code) || code == 204 || code == 304
}

impl std::fmt::Display for StatusCode {
    /// Formato: "200 OK"
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{} {}", self.as_u16(), self.reason_phrase())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_status_code_values() {
        assert_eq!(StatusCode::Continue.as_u16(), 100);
        assert_eq!(StatusCode::BadRequest.as_u16(), 400);
        assert_eq!(StatusCode::NotFound.as_u16(), 404);
        assert_eq!(StatusCode::InternalServerError.as_u16(), 500);
    }

    #[test]
    fn test_from_u16_roundtrip_known() {
        assert_eq!(StatusCode::from_u16(404), Some(StatusCode::NotFound));
        assert_eq!(StatusCode::from_u16(418), None);
    }

    #[test]
    fn test_reason_phrase_unknown_code() {
        assert_eq!(reason_phrase(200), "OK");
        assert_eq!(reason_phrase(418), "Client Error");
        assert_eq!(reason_phrase(599), "Server Error");
    }

    #[test]
    fn test_forbids_body() {
        assert!(forbids_body(100));
        assert!(forbids_body(204));
        assert!(forbids_body(304));
        assert!(!forbids_body(200));
    }

    #[test]
    fn test_error_classes() {
        assert!(StatusCode::BadRequest.is_client_error());
        assert!(!StatusCode::Ok.is_client_error());
        assert!(StatusCode::InternalServerError.is_server_error());
    }

    #[test]
    fn test_display() {
        assert_eq!(StatusCode::Ok.to_string(), "200 OK");
        assert_eq!(StatusCode::Continue.to_string(), "100 Continue");
    }
}
