//! Structured observability events and the bounded in-memory buffer the
//! management API browses. The request engine only ever appends; retention,
//! querying and clearing belong to the surrounding service.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, VecDeque};
use std::sync::Mutex;

const MAX_LOG_ENTRIES: usize = 10_000;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Action {
    Received,
    Spoofed,
    Forwarded,
    Error,
}

impl Action {
    pub fn as_str(&self) -> &'static str {
        match self {
            Action::Received => "received",
            Action::Spoofed => "spoofed",
            Action::Forwarded => "forwarded",
            Action::Error => "error",
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct LogEntry {
    pub timestamp: DateTime<Utc>,
    pub level: String,
    pub message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub domain: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub address: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub client: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub query_type: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub action: Option<Action>,
}

impl LogEntry {
    pub fn new(level: &str, message: impl Into<String>) -> Self {
        Self {
            timestamp: Utc::now(),
            level: level.to_string(),
            message: message.into(),
            domain: None,
            address: None,
            client: None,
            query_type: None,
            action: None,
        }
    }

    pub fn action(mut self, action: Action) -> Self {
        self.action = Some(action);
        self
    }

    pub fn domain(mut self, domain: impl Into<String>) -> Self {
        self.domain = Some(domain.into());
        self
    }

    pub fn address(mut self, address: impl ToString) -> Self {
        self.address = Some(address.to_string());
        self
    }

    pub fn client(mut self, client: impl ToString) -> Self {
        self.client = Some(client.to_string());
        self
    }

    pub fn query_type(mut self, qtype: impl Into<String>) -> Self {
        self.query_type = Some(qtype.into());
        self
    }
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct LogQuery {
    pub page: Option<usize>,
    pub page_size: Option<usize>,
    pub level: Option<String>,
    pub domain: Option<String>,
    pub action: Option<String>,
    pub start_date: Option<DateTime<Utc>>,
    pub end_date: Option<DateTime<Utc>>,
}

#[derive(Debug, Serialize)]
pub struct LogPage {
    pub logs: Vec<LogEntry>,
    pub total_count: usize,
    pub page: usize,
    pub page_size: usize,
    pub total_pages: usize,
}

#[derive(Debug, Serialize)]
pub struct LogStats {
    pub total_logs: usize,
    pub spoofed_count: usize,
    pub forwarded_count: usize,
    pub error_count: usize,
    pub recent_domains: Vec<DomainCount>,
}

#[derive(Debug, Serialize, PartialEq, Eq)]
pub struct DomainCount {
    pub domain: String,
    pub count: usize,
}

/// Append-only ring buffer of events, newest last. At capacity the oldest
/// entry is evicted.
#[derive(Default)]
pub struct EventLog {
    entries: Mutex<VecDeque<LogEntry>>,
}

impl EventLog {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record(&self, entry: LogEntry) {
        let mut entries = self.entries.lock().unwrap();
        if entries.len() >= MAX_LOG_ENTRIES {
            entries.pop_front();
        }
        entries.push_back(entry);
    }

    pub fn query(&self, query: &LogQuery) -> LogPage {
        let entries = self.entries.lock().unwrap();

        // Walk from newest to oldest so entries with equal timestamps keep a
        // stable most-recent-first order through the sort below.
        let mut filtered: Vec<LogEntry> = entries
            .iter()
            .rev()
            .filter(|e| {
                query
                    .level
                    .as_ref()
                    .map_or(true, |l| e.level.eq_ignore_ascii_case(l))
            })
            .filter(|e| {
                query.domain.as_ref().map_or(true, |d| {
                    e.domain
                        .as_ref()
                        .is_some_and(|ed| ed.to_lowercase().contains(&d.to_lowercase()))
                })
            })
            .filter(|e| {
                query.action.as_ref().map_or(true, |a| {
                    e.action.is_some_and(|ea| ea.as_str().eq_ignore_ascii_case(a))
                })
            })
            .filter(|e| query.start_date.map_or(true, |start| e.timestamp >= start))
            .filter(|e| query.end_date.map_or(true, |end| e.timestamp <= end))
            .cloned()
            .collect();

        // Callers browse backwards in time: newest entries on page one.
        filtered.sort_by(|a, b| b.timestamp.cmp(&a.timestamp));

        let total_count = filtered.len();
        let page = query.page.unwrap_or(1).max(1);
        let page_size = query.page_size.unwrap_or(50).max(1);
        let total_pages = total_count.div_ceil(page_size);

        let logs = filtered
            .into_iter()
            .skip((page - 1) * page_size)
            .take(page_size)
            .collect();

        LogPage {
            logs,
            total_count,
            page,
            page_size,
            total_pages,
        }
    }

    pub fn stats(&self) -> LogStats {
        let entries = self.entries.lock().unwrap();

        let mut spoofed_count = 0;
        let mut forwarded_count = 0;
        let mut error_count = 0;
        let mut by_domain: HashMap<&str, usize> = HashMap::new();
        for e in entries.iter() {
            match e.action {
                Some(Action::Spoofed) => spoofed_count += 1,
                Some(Action::Forwarded) => forwarded_count += 1,
                Some(Action::Error) => error_count += 1,
                _ => {}
            }
            if let Some(d) = &e.domain {
                *by_domain.entry(d.as_str()).or_default() += 1;
            }
        }

        let mut recent_domains: Vec<DomainCount> = by_domain
            .into_iter()
            .map(|(domain, count)| DomainCount {
                domain: domain.to_string(),
                count,
            })
            .collect();
        recent_domains.sort_by(|a, b| b.count.cmp(&a.count).then(a.domain.cmp(&b.domain)));
        recent_domains.truncate(10);

        LogStats {
            total_logs: entries.len(),
            spoofed_count,
            forwarded_count,
            error_count,
            recent_domains,
        }
    }

    pub fn clear(&self) {
        self.entries.lock().unwrap().clear();
    }

    pub fn len(&self) -> usize {
        self.entries.lock().unwrap().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
