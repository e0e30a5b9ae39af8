//! HTTP header model carried inside request/response envelopes.
//!
//! Headers are an ordered list of `(name, value)` pairs with a
//! case-insensitive index, so duplicated headers (`Set-Cookie`, `Via`, ...)
//! keep their order and multiplicity across the tunnel.

use serde::{Deserialize, Serialize};

/// Ordered, duplicate-preserving header list with case-insensitive lookup.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Headers(Vec<(String, String)>);

impl Headers {
    pub fn new() -> Self {
        Self(Vec::new())
    }

    /// Append a header, keeping any existing entries with the same name.
    pub fn push(&mut self, name: impl Into<String>, value: impl Into<String>) {
        self.0.push((name.into(), value.into()));
    }

    /// First value for `name`, compared case-insensitively.
    pub fn get(&self, name: &str) -> Option<&str> {
        self.0
            .iter()
            .find(|(n, _)| n.eq_ignore_ascii_case(name))
            .map(|(_, v)| v.as_str())
    }

    /// All values for `name`, in insertion order.
    pub fn get_all<'a>(&'a self, name: &'a str) -> impl Iterator<Item = &'a str> + 'a {
        self.0
            .iter()
            .filter(move |(n, _)| n.eq_ignore_ascii_case(name))
            .map(|(_, v)| v.as_str())
    }

    pub fn contains(&self, name: &str) -> bool {
        self.get(name).is_some()
    }

    /// Remove every entry named `name`, returning how many were dropped.
    pub fn remove(&mut self, name: &str) -> usize {
        let before = self.0.len();
        self.0.retain(|(n, _)| !n.eq_ignore_ascii_case(name));
        before - self.0.len()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &str)> {
        self.0.iter().map(|(n, v)| (n.as_str(), v.as_str()))
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

/// Hop-by-hop headers (plus `Proxy-*`) that must not cross the tunnel in
/// either direction.
pub fn is_hop_by_hop(name: &str) -> bool {
    name.eq_ignore_ascii_case("connection")
        || name.eq_ignore_ascii_case("keep-alive")
        || name.eq_ignore_ascii_case("transfer-encoding")
        || name.eq_ignore_ascii_case("upgrade")
        || name.eq_ignore_ascii_case("te")
        || name.eq_ignore_ascii_case("trailer")
        || (name.len() >= 6 && name[..6].eq_ignore_ascii_case("proxy-"))
}

impl FromIterator<(String, String)> for Headers {
    fn from_iter<T: IntoIterator<Item = (String, String)>>(iter: T) -> Self {
        Self(iter.into_iter().collect())
    }
}

impl IntoIterator for Headers {
    type Item = (String, String);
    type IntoIter = std::vec::IntoIter<(String, String)>;

    fn into_iter(self) -> Self::IntoIter {
        self.0.into_iter()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn lookup_is_case_insensitive() {
        let mut h = Headers::new();
        h.push("Content-Type", "text/html");
        assert_eq!(h.get("content-type"), Some("text/html"));
        assert_eq!(h.get("CONTENT-TYPE"), Some("text/html"));
        assert!(h.get("content-length").is_none());
    }

    #[test]
    fn duplicates_keep_order_and_multiplicity() {
        let mut h = Headers::new();
        h.push("Set-Cookie", "a=1");
        h.push("X-Other", "x");
        h.push("set-cookie", "b=2");

        let cookies: Vec<&str> = h.get_all("Set-Cookie").collect();
        assert_eq!(cookies, vec!["a=1", "b=2"]);
        assert_eq!(h.get("Set-Cookie"), Some("a=1"));
    }

    #[test]
    fn remove_drops_all_matching_entries() {
        let mut h = Headers::new();
        h.push("Connection", "keep-alive");
        h.push("connection", "upgrade");
        h.push("Host", "example.com");

        assert_eq!(h.remove("CONNECTION"), 2);
        assert_eq!(h.len(), 1);
        assert!(h.contains("host"));
    }

    #[test]
    fn hop_by_hop_classification() {
        for name in [
            "Connection",
            "keep-alive",
            "Transfer-Encoding",
            "Upgrade",
            "TE",
            "Trailer",
            "Proxy-Authorization",
            "proxy-connection",
        ] {
            assert!(is_hop_by_hop(name), "{name} should be hop-by-hop");
        }
        for name in ["Host", "Content-Length", "X-Forwarded-For", "Prox"] {
            assert!(!is_hop_by_hop(name), "{name} should be end-to-end");
        }
    }

    #[test]
    fn serde_roundtrip_is_transparent() {
        let mut h = Headers::new();
        h.push("A", "1");
        h.push("a", "2");

        let json = serde_json::to_string(&h).unwrap();
        assert_eq!(json, r#"[["A","1"],["a","2"]]"#);
        let back: Headers = serde_json::from_str(&json).unwrap();
        assert_eq!(back, h);
    }
}
