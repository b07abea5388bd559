//! Settings file parsing and defaults.

use anyhow::{Context, Result};
use serde::Deserialize;
use std::collections::HashMap;
use std::net::{IpAddr, SocketAddr};
use std::time::Duration;

/// What to put in the RCODE field of a composed reply.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RcodePolicy {
    /// Always answer "no error", whatever the upstream said.
    Fixed,
    /// Propagate the RCODE of a forwarded reply (NXDOMAIN, SERVFAIL, ...).
    Upstream,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct Settings {
    pub port: u16,
    pub upstream: String,
    pub api_address: SocketAddr,
    pub rcode_policy: RcodePolicy,
    pub forward_timeout_ms: u64,
    /// Initial domain→address overrides, applied through the upsert path.
    pub mappings: HashMap<String, String>,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            port: 5353,
            upstream: "8.8.8.8".to_string(),
            api_address: "127.0.0.1:8080".parse().unwrap(),
            rcode_policy: RcodePolicy::Fixed,
            forward_timeout_ms: 2000,
            mappings: HashMap::new(),
        }
    }
}

impl Settings {
    pub fn load(path: &str) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file '{}'", path))?;
        serde_json::from_str(&content)
            .with_context(|| format!("Failed to parse config file '{}'", path))
    }

    /// The upstream resolver's socket address. A bare IP (v4 or v6) gets the
    /// standard DNS port 53; an explicit `ip:port` form is used as-is.
    pub fn upstream_addr(&self) -> Result<SocketAddr> {
        if let Ok(addr) = self.upstream.parse::<SocketAddr>() {
            return Ok(addr);
        }
        let ip: IpAddr = self
            .upstream
            .parse()
            .with_context(|| format!("Invalid upstream resolver address '{}'", self.upstream))?;
        Ok(SocketAddr::new(ip, 53))
    }

    pub fn forward_timeout(&self) -> Duration {
        Duration::from_millis(self.forward_timeout_ms)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_match_the_documented_surface() {
        let s = Settings::default();
        assert_eq!(s.port, 5353);
        assert_eq!(s.upstream, "8.8.8.8");
        assert_eq!(s.rcode_policy, RcodePolicy::Fixed);
        assert_eq!(s.upstream_addr().unwrap().port(), 53);
        assert_eq!(s.forward_timeout(), Duration::from_secs(2));
    }

    #[test]
    fn partial_file_fills_in_defaults() {
        let s: Settings = serde_json::from_str(
            r#"{
                "port": 53,
                "upstream": "1.1.1.1:5300",
                "rcode_policy": "upstream",
                "mappings": { "blocked.test": "127.0.0.1" }
            }"#,
        )
        .unwrap();
        assert_eq!(s.port, 53);
        assert_eq!(s.upstream_addr().unwrap(), "1.1.1.1:5300".parse().unwrap());
        assert_eq!(s.rcode_policy, RcodePolicy::Upstream);
        assert_eq!(s.forward_timeout_ms, 2000);
        assert_eq!(s.mappings["blocked.test"], "127.0.0.1");
    }

    #[test]
    fn bare_ipv6_upstream_gets_port_53() {
        let s = Settings {
            upstream: "2001:4860:4860::8888".to_string(),
            ..Default::default()
        };
        let addr = s.upstream_addr().unwrap();
        assert!(addr.is_ipv6());
        assert_eq!(addr.port(), 53);
    }

    #[test]
    fn garbage_upstream_is_an_error() {
        let s = Settings {
            upstream: "not-a-resolver".to_string(),
            ..Default::default()
        };
        assert!(s.upstream_addr().is_err());
    }
}
