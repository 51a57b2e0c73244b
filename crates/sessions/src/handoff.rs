//! The carrier for session identity between devices.

/// Key/value channel the session id travels through (in practice, the
/// query string of the URL opened on the mobile device).
pub trait HandoffChannel {
    fn get(&self, key: &str) -> Option<String>;

    /// Set `key` to `value`, replacing any previous value.
    fn set(&mut self, key: &str, value: &str);
}

/// Query-string backed channel, e.g. `sessionId=abc&theme=dark`.
///
/// Pair order is preserved so round-tripping an externally supplied
/// string does not reshuffle parameters the embedder put there.
#[derive(Debug, Clone, Default)]
pub struct QueryStringChannel {
    pairs: Vec<(String, String)>,
}

impl QueryStringChannel {
    /// Parse a query string, with or without a leading `?`. Entries
    /// without a `=` become keys with an empty value.
    pub fn parse(query: &str) -> Self {
        let query = query.strip_prefix('?').unwrap_or(query);
        let pairs = query
            .split('&')
            .filter(|pair| !pair.is_empty())
            .map(|pair| match pair.split_once('=') {
                Some((k, v)) => (k.to_owned(), v.to_owned()),
                None => (pair.to_owned(), String::new()),
            })
            .collect();
        Self { pairs }
    }

    pub fn to_query_string(&self) -> String {
        self.pairs
            .iter()
            .map(|(k, v)| format!("{k}={v}"))
            .collect::<Vec<_>>()
            .join("&")
    }
}

impl HandoffChannel for QueryStringChannel {
    fn get(&self, key: &str) -> Option<String> {
        self.pairs
            .iter()
            .find(|(k, _)| k == key)
            .map(|(_, v)| v.clone())
    }

    fn set(&mut self, key: &str, value: &str) {
        match self.pairs.iter_mut().find(|(k, _)| k == key) {
            Some((_, v)) => *v = value.to_owned(),
            None => self.pairs.push((key.to_owned(), value.to_owned())),
        }
    }
}
