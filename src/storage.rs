//! Sled-based storage for per-origin chat history.
//!
//! Each origin (scheme, host and port of a page) maps to its conversation with
//! the assistant, oldest message first. Updates are read-modify-write without
//! a transaction: two writers on the same origin can overwrite each other.

use crate::message::Message;
use std::path::Path;
use thiserror::Error;
use tracing::debug;
use url::Url;

/// Messages kept per origin (10 user/assistant exchanges).
pub const MAX_HISTORY_MESSAGES: usize = 20;

const HISTORY_TREE: &str = "chat_history";

#[derive(Error, Debug)]
pub enum StorageError {
    #[error("database error: {0}")]
    DbError(#[from] sled::Error),
    #[error("serialization error: {0}")]
    SerializationError(#[from] serde_json::Error),
    #[error("invalid page URL: {0}")]
    InvalidUrl(#[from] url::ParseError),
    #[error("URL has no origin: {0}")]
    OpaqueOrigin(String),
}

/// Origin of `url` as `scheme://host[:port]`.
pub fn origin_of(url: &str) -> Result<String, StorageError> {
    let origin = Url::parse(url)?.origin();
    if !origin.is_tuple() {
        return Err(StorageError::OpaqueOrigin(url.to_string()));
    }
    Ok(origin.ascii_serialization())
}

/// Keep only the newest [`MAX_HISTORY_MESSAGES`] messages, in order.
pub fn bound_history(history: &mut Vec<Message>) {
    if history.len() > MAX_HISTORY_MESSAGES {
        let excess = history.len() - MAX_HISTORY_MESSAGES;
        history.drain(..excess);
    }
}

/// Chat history keyed by origin.
pub struct HistoryStore {
    tree: sled::Tree,
}

impl HistoryStore {
    /// Open or create storage at the given path
    pub fn open<P: AsRef<Path>>(path: P) -> Result<Self, StorageError> {
        let db = sled::open(path)?;
        Self::from_db(&db)
    }

    /// Store backed by a throwaway database.
    pub fn temporary() -> Result<Self, StorageError> {
        let db = sled::Config::new().temporary(true).open()?;
        Self::from_db(&db)
    }

    fn from_db(db: &sled::Db) -> Result<Self, StorageError> {
        let tree = db.open_tree(HISTORY_TREE)?;
        Ok(Self { tree })
    }

    /// History for `origin`, empty when nothing is stored.
    pub fn load(&self, origin: &str) -> Result<Vec<Message>, StorageError> {
        match self.tree.get(origin.as_bytes())? {
            Some(data) => Ok(serde_json::from_slice(&data)?),
            None => Ok(Vec::new()),
        }
    }

    /// Replace the history for `origin`, bounded to the newest messages.
    pub fn save(&self, origin: &str, history: &[Message]) -> Result<(), StorageError> {
        let start = history.len().saturating_sub(MAX_HISTORY_MESSAGES);
        let value = serde_json::to_vec(&history[start..])?;
        self.tree.insert(origin.as_bytes(), value)?;
        self.tree.flush()?;
        Ok(())
    }

    /// Append one user/assistant exchange and return the stored length.
    pub fn append_exchange(
        &self,
        origin: &str,
        user: Message,
        assistant: Message,
    ) -> Result<usize, StorageError> {
        let mut history = self.load(origin)?;
        history.push(user);
        history.push(assistant);
        bound_history(&mut history);
        self.save(origin, &history)?;
        debug!(origin, messages = history.len(), "saved chat history");
        Ok(history.len())
    }

    /// Forget the history for `origin`. Returns whether anything was stored.
    pub fn clear(&self, origin: &str) -> Result<bool, StorageError> {
        let existed = self.tree.remove(origin.as_bytes())?.is_some();
        self.tree.flush()?;
        Ok(existed)
    }

    /// Origins that currently have history.
    pub fn origins(&self) -> Result<Vec<String>, StorageError> {
        let mut results = Vec::new();
        for item in self.tree.iter() {
            let (key, _value) = item?;
            results.push(String::from_utf8_lossy(&key).into_owned());
        }
        Ok(results)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const ORIGIN: &str = "https://example.com";

    #[test]
    fn test_origin_of() {
        assert_eq!(
            origin_of("https://example.com/blog/post?id=1#top").unwrap(),
            "https://example.com"
        );
        assert_eq!(
            origin_of("http://localhost:8080/a").unwrap(),
            "http://localhost:8080"
        );
        assert_eq!(
            origin_of("https://example.com:443/").unwrap(),
            "https://example.com"
        );
        assert!(origin_of("not a url").is_err());
        assert!(matches!(
            origin_of("data:text/plain,hi"),
            Err(StorageError::OpaqueOrigin(_))
        ));
    }

    #[test]
    fn test_load_missing_origin_is_empty() {
        let store = HistoryStore::temporary().unwrap();
        assert!(store.load(ORIGIN).unwrap().is_empty());
    }

    #[test]
    fn test_history_is_bounded_to_most_recent() {
        let store = HistoryStore::temporary().unwrap();
        for i in 0..15 {
            store
                .append_exchange(
                    ORIGIN,
                    Message::user(format!("q{}", i)),
                    Message::assistant(format!("a{}", i)),
                )
                .unwrap();
        }

        let history = store.load(ORIGIN).unwrap();
        assert_eq!(history.len(), MAX_HISTORY_MESSAGES);
        assert_eq!(history[0], Message::user("q5"));
        assert_eq!(history[19], Message::assistant("a14"));
        let expected: Vec<Message> = (5..15)
            .flat_map(|i| {
                [
                    Message::user(format!("q{}", i)),
                    Message::assistant(format!("a{}", i)),
                ]
            })
            .collect();
        assert_eq!(history, expected);
    }

    #[test]
    fn test_origins_are_isolated() {
        let store = HistoryStore::temporary().unwrap();
        store
            .append_exchange(ORIGIN, Message::user("hi"), Message::assistant("hello"))
            .unwrap();
        assert!(store.load("https://other.org").unwrap().is_empty());
        assert_eq!(store.origins().unwrap(), vec![ORIGIN.to_string()]);
    }

    #[test]
    fn test_clear() {
        let store = HistoryStore::temporary().unwrap();
        store
            .save(ORIGIN, &[Message::user("a"), Message::assistant("b")])
            .unwrap();
        assert!(store.clear(ORIGIN).unwrap());
        assert!(!store.clear(ORIGIN).unwrap());
        assert!(store.load(ORIGIN).unwrap().is_empty());
    }

    #[test]
    fn test_reopen_persists_history() {
        let dir = tempfile::tempdir().unwrap();
        {
            let store = HistoryStore::open(dir.path()).unwrap();
            store
                .append_exchange(ORIGIN, Message::user("q"), Message::assistant("a"))
                .unwrap();
        }
        let store = HistoryStore::open(dir.path()).unwrap();
        assert_eq!(store.load(ORIGIN).unwrap().len(), 2);
    }

    #[test]
    fn test_bound_history_keeps_short_lists() {
        let mut history = vec![Message::user("only")];
        bound_history(&mut history);
        assert_eq!(history.len(), 1);
    }
}
