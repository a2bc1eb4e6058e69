use indexmap::IndexMap;
use std::fmt;

/// The request methods this server understands.
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub enum Method {
    Options,
    Get,
    Head,
    Post,
    Put,
    Delete,
    Trace,
    Connect,
}

impl Method {
    pub fn from_bytes(word: &[u8]) -> Option<Method> {
        match word {
            b"OPTIONS" => Some(Method::Options),
            b"GET" => Some(Method::Get),
            b"HEAD" => Some(Method::Head),
            b"POST" => Some(Method::Post),
            b"PUT" => Some(Method::Put),
            b"DELETE" => Some(Method::Delete),
            b"TRACE" => Some(Method::Trace),
            b"CONNECT" => Some(Method::Connect),
            _ => None,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Method::Options => "OPTIONS",
            Method::Get => "GET",
            Method::Head => "HEAD",
            Method::Post => "POST",
            Method::Put => "PUT",
            Method::Delete => "DELETE",
            Method::Trace => "TRACE",
            Method::Connect => "CONNECT",
        }
    }

    /// True for methods that may carry a request body.
    #[inline]
    pub fn expects_body(self) -> bool {
        match self {
            Method::Post | Method::Put => true,
            _ => false,
        }
    }
}

impl fmt::Display for Method {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// How the message body is handed to the application.
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub enum BodyMode {
    /// Body bytes are consumed and discarded.
    Ignore,
    /// Body bytes are handed to the handler for this request only.
    Read,
    /// Body bytes are retained on the request until the next reset.
    Copy,
}

/// A case-canonicalizing header multimap that preserves insertion order.
///
/// Keys are stored canonically: the first letter and every letter following
/// a dash uppercased, all others lowercased. Multi-valued headers keep their
/// values in insertion order and serialize comma-joined on the wire.
pub struct Headers {
    map: IndexMap<String, Vec<String>>,
}

impl Headers {
    pub fn new() -> Headers {
        Headers {
            map: IndexMap::new(),
        }
    }

    /// Canonical form of a header key, e.g. `content-LENGTH` becomes
    /// `Content-Length`.
    pub fn canonicalize(key: &str) -> String {
        let mut out = String::with_capacity(key.len());
        let mut upper = true;

        for chr in key.chars() {
            if upper {
                out.extend(chr.to_uppercase());
            } else {
                out.extend(chr.to_lowercase());
            }
            upper = chr == '-';
        }

        out
    }

    #[inline]
    pub fn len(&self) -> usize {
        self.map.len()
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.map.is_empty()
    }

    pub fn clear(&mut self) {
        self.map.clear();
    }

    /// Appends a value under the canonical form of `key`.
    pub fn add(&mut self, key: &str, value: String) {
        self.map
            .entry(Headers::canonicalize(key))
            .or_insert_with(Vec::new)
            .push(value);
    }

    /// Replaces all values of `key` with a single value.
    pub fn set(&mut self, key: &str, value: String) {
        self.map.insert(Headers::canonicalize(key), vec![value]);
    }

    /// Extends the most recently added header's last value with a folded
    /// continuation line. Returns false when no header exists yet.
    pub fn append_to_last(&mut self, continuation: &str) -> bool {
        let last = match self.map.values_mut().last().and_then(|v| v.last_mut()) {
            Some(last) => last,
            None => return false,
        };

        last.push(' ');
        last.push_str(continuation);
        true
    }

    /// First value under `key`, if any.
    pub fn get(&self, key: &str) -> Option<&str> {
        self.map
            .get(&Headers::canonicalize(key))
            .and_then(|values| values.first())
            .map(String::as_str)
    }

    /// All values under `key`, in insertion order.
    pub fn get_all(&self, key: &str) -> &[String] {
        self.map
            .get(&Headers::canonicalize(key))
            .map(Vec::as_slice)
            .unwrap_or(&[])
    }

    pub fn contains(&self, key: &str) -> bool {
        self.map.contains_key(&Headers::canonicalize(key))
    }

    pub fn iter(&self) -> impl Iterator<Item = (&String, &Vec<String>)> {
        self.map.iter()
    }
}

/// One parsed HTTP request. A connection reuses the same instance across
/// requests, resetting it at every request start.
pub struct Request {
    pub method: Method,
    pub uri: String,
    pub minor_version: u8,
    pub headers: Headers,
    pub body_mode: BodyMode,
    pub body: Vec<u8>,
}

impl Request {
    pub fn new() -> Request {
        Request {
            method: Method::Get,
            uri: String::new(),
            minor_version: 1,
            headers: Headers::new(),
            body_mode: BodyMode::Ignore,
            body: Vec::new(),
        }
    }

    pub fn reset(&mut self) {
        self.method = Method::Get;
        self.uri.clear();
        self.minor_version = 1;
        self.headers.clear();
        self.body_mode = BodyMode::Ignore;
        self.body.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_canonicalize() {
        assert_eq!(Headers::canonicalize("content-length"), "Content-Length");
        assert_eq!(Headers::canonicalize("CONNECTION"), "Connection");
        assert_eq!(Headers::canonicalize("x-my-HEADER"), "X-My-Header");
        assert_eq!(Headers::canonicalize("hello"), "Hello");
    }

    #[test]
    fn test_multi_value_headers_keep_order() {
        let mut headers = Headers::new();
        headers.add("Accept", "text/html".to_string());
        headers.add("accept", "text/plain".to_string());

        assert_eq!(headers.len(), 1);
        assert_eq!(headers.get("ACCEPT"), Some("text/html"));
        assert_eq!(headers.get_all("accept"), &["text/html", "text/plain"]);
    }

    #[test]
    fn test_continuation_appends_to_last_value() {
        let mut headers = Headers::new();
        headers.add("hello", "world".to_string());
        assert!(headers.append_to_last("hid!"));

        assert_eq!(headers.get("Hello"), Some("world hid!"));
    }

    #[test]
    fn test_continuation_without_header_fails() {
        let mut headers = Headers::new();
        assert!(!headers.append_to_last("orphan"));
    }

    #[test]
    fn test_method_round_trip() {
        for word in &[
            b"OPTIONS".as_ref(),
            b"GET",
            b"HEAD",
            b"POST",
            b"PUT",
            b"DELETE",
            b"TRACE",
            b"CONNECT",
        ] {
            let method = Method::from_bytes(word).unwrap();
            assert_eq!(method.as_str().as_bytes(), *word);
        }
        assert_eq!(Method::from_bytes(b"BREW"), None);
        assert_eq!(Method::from_bytes(b"get"), None);
    }
}
