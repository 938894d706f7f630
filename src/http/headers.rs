//! # Headers HTTP
//! src/http/headers.rs
//!
//! Mapa de headers insensible a mayúsculas que conserva el orden de
//! inserción y admite valores múltiples por nombre.

/// Colección de headers HTTP
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Headers {
    entries: Vec<(String, String)>,
}

impl Headers {
    pub fn new() -> Self {
        Self::default()
    }

    /// Primer valor del header `name`
    pub fn get(&self, name: &str) -> Option<&str> {
        self.entries
            .iter()
            .find(|(n, _)| n.eq_ignore_ascii_case(name))
            .map(|(_, v)| v.as_str())
    }

    /// Todos los valores del header `name`, en orden
    pub fn get_all<'a>(&'a self, name: &'a str) -> impl Iterator<Item = &'a str> + 'a {
        self.entries
            .iter()
            .filter(move |(n, _)| n.eq_ignore_ascii_case(name))
            .map(|(_, v)| v.as_str())
    }

    pub fn contains(&self, name: &str) -> bool {
        self.get(name).is_some()
    }

    /// Compara el primer valor sin distinguir mayúsculas
    pub fn value_is(&self, name: &str, expected: &str) -> bool {
        self.get(name)
            .map(|v| v.trim().eq_ignore_ascii_case(expected))
            .unwrap_or(false)
    }

    /// Agrega un valor sin reemplazar los existentes
    pub fn add(&mut self, name: &str, value: &str) {
        self.entries.push((name.to_string(), value.to_string()));
    }

    /// Reemplaza todos los valores de `name` por uno solo
    pub fn set(&mut self, name: &str, value: &str) {
        self.remove(name);
        self.add(name, value);
    }

    pub fn remove(&mut self, name: &str) {
        self.entries.retain(|(n, _)| !n.eq_ignore_ascii_case(name));
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &str)> {
        self.entries.iter().map(|(n, v)| (n.as_str(), v.as_str()))
    }

    /// Agrega un header ya separado en nombre y valor por el parser
    pub(crate) fn append_raw(&mut self, name: String, value: String) {
        self.entries.push((name, value));
    }

    /// Extiende el último valor (líneas de continuación obsoletas)
    pub(crate) fn extend_last(&mut self, continuation: &str) -> bool {
        match self.entries.last_mut() {
            Some((_, value)) => {
                value.push(' ');
                value.push_str(continuation.trim());
                true
            }
            None => false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_case_insensitive_lookup() {
        let mut headers = Headers::new();
        headers.add("Content-Length", "10");
        assert_eq!(headers.get("content-length"), Some("10"));
        assert_eq!(headers.get("CONTENT-LENGTH"), Some("10"));
        assert!(headers.get("Host").is_none());
    }

    #[test]
    fn test_multiple_values() {
        let mut headers = Headers::new();
        headers.add("Accept", "text/html");
        headers.add("accept", "application/json");
        let values: Vec<_> = headers.get_all("Accept").collect();
        assert_eq!(values, vec!["text/html", "application/json"]);
        assert_eq!(headers.get("Accept"), Some("text/html"));
    }

    #[test]
    fn test_set_replaces() {
        let mut headers = Headers::new();
        headers.add("Connection", "keep-alive");
        headers.add("connection", "upgrade");
        headers.set("Connection", "close");
        assert_eq!(headers.len(), 1);
        assert!(headers.value_is("connection", "CLOSE"));
    }

    #[test]
    fn test_extend_last() {
        let mut headers = Headers::new();
        assert!(!headers.extend_last("lost"));
        headers.add("X-Long", "part1");
        assert!(headers.extend_last("  part2"));
        assert_eq!(headers.get("X-Long"), Some("part1 part2"));
    }
}
