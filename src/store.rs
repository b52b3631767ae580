//! Storage backend contract and the in-memory ring buffer backend.

use crate::email::EmailRecord;
use chrono::NaiveDate;
use parking_lot::RwLock;
use std::collections::VecDeque;
use std::fmt;
use std::sync::Arc;

/// Errors returned by storage backends.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StorageError {
    /// No record lives at the given location
    NotFound(String),
    /// Location string is not one this backend produced
    InvalidLocation(String),
    /// Backend failure (I/O, database, encoding)
    Backend(String),
}

impl fmt::Display for StorageError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::NotFound(loc) => write!(f, "record not found: {loc}"),
            Self::InvalidLocation(loc) => write!(f, "invalid location: {loc}"),
            Self::Backend(msg) => write!(f, "storage backend error: {msg}"),
        }
    }
}

impl std::error::Error for StorageError {}

impl From<rusqlite::Error> for StorageError {
    fn from(e: rusqlite::Error) -> Self {
        Self::Backend(e.to_string())
    }
}

impl From<serde_json::Error> for StorageError {
    fn from(e: serde_json::Error) -> Self {
        Self::Backend(e.to_string())
    }
}

/// Which stored locations [`Backend::list`] returns.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ListFilter {
    All,
    /// Records received on the given UTC day.
    Day(NaiveDate),
}

impl ListFilter {
    fn matches(self, location: &str) -> bool {
        match self {
            Self::All => true,
            Self::Day(day) => location_day(location) == Some(day),
        }
    }
}

/// One connection to a persistence backend.
///
/// A handle is only ever used by one operation at a time, so methods take
/// `&mut self`. Calls may block; the pipeline runs them on the blocking pool.
pub trait Backend: Send + 'static {
    /// Persist a record and return its opaque location.
    fn store(&mut self, record: &EmailRecord) -> Result<String, StorageError>;
    fn retrieve(&mut self, location: &str) -> Result<EmailRecord, StorageError>;
    fn list(&mut self, filter: ListFilter) -> Result<Vec<String>, StorageError>;
    fn delete(&mut self, location: &str) -> Result<(), StorageError>;
    /// Tear down the connection. Called when the pool discards the handle.
    fn close(&mut self) {}
}

/// Location of a record: `YYYY-MM-DD/<id>`, bucketed by receive day.
#[must_use]
pub fn location_for(record: &EmailRecord) -> String {
    format!("{}/{}", record.received_at.format("%Y-%m-%d"), record.id)
}

fn location_day(location: &str) -> Option<NaiveDate> {
    let (day, _) = location.split_once('/')?;
    NaiveDate::parse_from_str(day, "%Y-%m-%d").ok()
}

fn check_location(location: &str) -> Result<(), StorageError> {
    match location.split_once('/') {
        Some((_, id)) if !id.is_empty() && location_day(location).is_some() => Ok(()),
        _ => Err(StorageError::InvalidLocation(location.to_string())),
    }
}

/// In-memory store with a maximum capacity (ring buffer).
///
/// Every handle created from the same [`MemoryStore`] sees the same records.
#[derive(Clone)]
pub struct MemoryStore {
    max: usize,
    records: Arc<RwLock<VecDeque<(String, EmailRecord)>>>,
}

impl MemoryStore {
    /// Create a new store with the given maximum capacity.
    #[must_use]
    pub fn new(max: usize) -> Self {
        Self {
            max: max.max(1),
            records: Arc::new(RwLock::new(VecDeque::new())),
        }
    }

    /// A new handle onto the shared records.
    #[must_use]
    pub fn backend(&self) -> MemoryBackend {
        MemoryBackend {
            store: self.clone(),
        }
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.records.read().len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// A pooled handle onto a [`MemoryStore`].
pub struct MemoryBackend {
    store: MemoryStore,
}

impl Backend for MemoryBackend {
    fn store(&mut self, record: &EmailRecord) -> Result<String, StorageError> {
        let location = location_for(record);
        let mut records = self.store.records.write();
        records.retain(|(loc, _)| *loc != location);
        records.push_back((location.clone(), record.clone()));
        while records.len() > self.store.max {
            records.pop_front();
        }
        Ok(location)
    }

    fn retrieve(&mut self, location: &str) -> Result<EmailRecord, StorageError> {
        check_location(location)?;
        self.store
            .records
            .read()
            .iter()
            .find(|(loc, _)| loc == location)
            .map(|(_, record)| record.clone())
            .ok_or_else(|| StorageError::NotFound(location.to_string()))
    }

    fn list(&mut self, filter: ListFilter) -> Result<Vec<String>, StorageError> {
        Ok(self
            .store
            .records
            .read()
            .iter()
            .filter(|(loc, _)| filter.matches(loc))
            .map(|(loc, _)| loc.clone())
            .collect())
    }

    fn delete(&mut self, location: &str) -> Result<(), StorageError> {
        check_location(location)?;
        let mut records = self.store.records.write();
        let Some(pos) = records.iter().position(|(loc, _)| loc == location) else {
            return Err(StorageError::NotFound(location.to_string()));
        };
        records.remove(pos);
        Ok(())
    }
}
