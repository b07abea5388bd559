//! Domain→address override table consulted on every query.

use chrono::{DateTime, Utc};
use serde::Serialize;
use std::collections::HashMap;
use std::net::IpAddr;
use std::sync::Mutex;
use thiserror::Error;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum ValidationError {
    #[error("invalid IP address format: '{0}'")]
    InvalidAddress(String),
}

#[derive(Debug, Clone, Serialize, PartialEq, Eq)]
pub struct Mapping {
    pub domain: String,
    pub address: IpAddr,
    pub created_at: DateTime<Utc>,
    pub enabled: bool,
}

/// Keys are normalized to lower case on every operation, so lookups during
/// request handling are case-insensitive. The lock is only ever held for the
/// duration of one operation, never across an await point.
#[derive(Default)]
pub struct MappingTable {
    entries: Mutex<HashMap<String, Mapping>>,
}

impl MappingTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert or replace the override for `domain`. The address must parse
    /// as an IPv4 or IPv6 literal; on failure the table is left untouched.
    pub fn upsert(&self, domain: &str, address: &str) -> Result<Mapping, ValidationError> {
        let ip: IpAddr = address
            .parse()
            .map_err(|_| ValidationError::InvalidAddress(address.to_string()))?;

        let key = domain.to_lowercase();
        let mapping = Mapping {
            domain: key.clone(),
            address: ip,
            created_at: Utc::now(),
            enabled: true,
        };
        self.entries
            .lock()
            .unwrap()
            .insert(key, mapping.clone());

        tracing::info!("Added DNS mapping: {} -> {}", mapping.domain, ip);
        Ok(mapping)
    }

    pub fn remove(&self, domain: &str) -> bool {
        let removed = self
            .entries
            .lock()
            .unwrap()
            .remove(&domain.to_lowercase())
            .is_some();
        if removed {
            tracing::info!("Removed DNS mapping: {}", domain);
        }
        removed
    }

    pub fn get(&self, domain: &str) -> Option<Mapping> {
        self.entries
            .lock()
            .unwrap()
            .get(&domain.to_lowercase())
            .cloned()
    }

    /// Flip the enabled flag; a disabled mapping is forwarded instead of
    /// spoofed. Returns false when the domain has no mapping.
    pub fn set_enabled(&self, domain: &str, enabled: bool) -> bool {
        let mut entries = self.entries.lock().unwrap();
        match entries.get_mut(&domain.to_lowercase()) {
            Some(m) => {
                m.enabled = enabled;
                true
            }
            None => false,
        }
    }

    pub fn list(&self) -> Vec<Mapping> {
        let mut all: Vec<Mapping> = self.entries.lock().unwrap().values().cloned().collect();
        all.sort_by(|a, b| a.domain.cmp(&b.domain));
        all
    }

    pub fn len(&self) -> usize {
        self.entries.lock().unwrap().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
