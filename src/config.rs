/// Configuration snapshot
///
/// A plain key/value JSON document consumed once at engine start.
/// Live edits never affect a running engine; a change requires an
/// engine restart.
use std::net::{IpAddr, SocketAddr};
use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::error::{GarmError, Result};
use crate::rules::Disposition;
use crate::upstream::Resolver;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct ConfigSnapshot {
    pub auto_start: bool,
    pub ipv6_enabled: bool,
    pub block_logging: bool,
    pub show_notification: bool,
    #[serde(rename = "upstreamList")]
    pub upstreams: Vec<UpstreamConfig>,
    pub host_sources: Vec<HostSource>,
    pub app_inclusion: AppInclusion,
}

impl Default for ConfigSnapshot {
    fn default() -> Self {
        Self {
            auto_start: false,
            ipv6_enabled: false,
            block_logging: false,
            show_notification: true,
            upstreams: vec![],
            host_sources: vec![],
            app_inclusion: AppInclusion::default(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UpstreamConfig {
    pub name: String,
    /// Bare IP (port 53 implied) or full `ip:port` literal.
    pub addr: String,
    #[serde(default = "default_enabled")]
    pub enabled: bool,
}

fn default_enabled() -> bool {
    true
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HostSource {
    pub name: String,
    /// Local file path, or a literal hostname acting as a single-entry
    /// user override.
    pub location: String,
    pub disposition: Disposition,
}

#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct AppInclusion {
    pub default_mode: AppDefaultMode,
    pub included: Vec<String>,
    pub excluded: Vec<String>,
}

/// How applications not explicitly listed are treated by the OS
/// tunnel builder. Opaque to the data plane.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AppDefaultMode {
    All,
    None,
    #[default]
    Auto,
}

impl ConfigSnapshot {
    /// Read the snapshot from a JSON document.
    pub fn load(path: &Path) -> Result<Self> {
        let raw = std::fs::read_to_string(path)
            .map_err(|e| GarmError::ConfigParse(format!("failed to read {}: {e}", path.display())))?;
        let config: ConfigSnapshot = serde_json::from_str(&raw)?;
        Ok(config)
    }

    /// Layer environment-variable overrides over the snapshot.
    pub fn apply_env(&mut self) {
        if let Ok(v) = std::env::var("GARM_AUTO_START") {
            self.auto_start = parse_bool(&v, self.auto_start);
        }
        if let Ok(v) = std::env::var("GARM_IPV6_ENABLED") {
            self.ipv6_enabled = parse_bool(&v, self.ipv6_enabled);
        }
        if let Ok(v) = std::env::var("GARM_BLOCK_LOGGING") {
            self.block_logging = parse_bool(&v, self.block_logging);
        }
        if let Ok(v) = std::env::var("GARM_SHOW_NOTIFICATION") {
            self.show_notification = parse_bool(&v, self.show_notification);
        }
        if let Ok(v) = std::env::var("GARM_UPSTREAM_SERVERS") {
            self.upstreams = v
                .split(',')
                .map(str::trim)
                .filter(|s| !s.is_empty())
                .enumerate()
                .map(|(i, addr)| UpstreamConfig {
                    name: format!("env-{i}"),
                    addr: addr.to_string(),
                    enabled: true,
                })
                .collect();
        }
    }

    /// Reject snapshots the engine must not start with.
    pub fn validate(&self) -> Result<()> {
        for upstream in self.upstreams.iter().filter(|u| u.enabled) {
            parse_resolver_addr(&upstream.addr)?;
        }

        for source in &self.host_sources {
            if source.location.trim().is_empty() {
                return Err(GarmError::InvalidHostSource(format!(
                    "host source {} has an empty location",
                    source.name
                )));
            }
        }

        for package in &self.app_inclusion.included {
            if self.app_inclusion.excluded.contains(package) {
                return Err(GarmError::InvalidAppInclusion(format!(
                    "package {package} is both included and excluded"
                )));
            }
        }

        Ok(())
    }

    /// The enabled resolvers, in configured order.
    pub fn enabled_resolvers(&self) -> Result<Vec<Resolver>> {
        self.upstreams
            .iter()
            .filter(|u| u.enabled)
            .map(|u| {
                Ok(Resolver {
                    name: u.name.clone(),
                    addr: parse_resolver_addr(&u.addr)?,
                    enabled: true,
                })
            })
            .collect()
    }
}

/// Parse a resolver address literal; a bare IP implies port 53.
pub fn parse_resolver_addr(addr: &str) -> Result<SocketAddr> {
    if let Ok(full) = addr.parse::<SocketAddr>() {
        return Ok(full);
    }
    if let Ok(ip) = addr.parse::<IpAddr>() {
        return Ok(SocketAddr::new(ip, crate::dns::DNS_PORT));
    }
    Err(GarmError::InvalidUpstream(addr.to_string()))
}

/// The boot-time autostart gate. Static so the OS boot hook can decide
/// without instantiating the engine.
pub fn should_autostart(config: &ConfigSnapshot, persisted_active: bool) -> bool {
    config.auto_start && persisted_active
}

/// Parse a boolean environment value, falling back on unrecognized
/// input.
pub fn parse_bool(value: &str, default: bool) -> bool {
    match value.to_lowercase().as_str() {
        "true" | "1" | "yes" | "on" => true,
        "false" | "0" | "no" | "off" => false,
        _ => default,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn test_load_document() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        write!(
            file,
            r#"{{
                "autoStart": true,
                "ipv6Enabled": true,
                "blockLogging": true,
                "upstreamList": [
                    {{"name": "Cloudflare", "addr": "1.1.1.1"}},
                    {{"name": "Quad9", "addr": "9.9.9.9:53", "enabled": false}}
                ],
                "hostSources": [
                    {{"name": "StevenBlack", "location": "hosts/stevenblack.txt", "disposition": "deny"}}
                ],
                "appInclusion": {{"defaultMode": "none", "excluded": ["org.example.browser"]}}
            }}"#
        )
        .unwrap();
        file.flush().unwrap();

        let config = ConfigSnapshot::load(file.path()).unwrap();
        assert!(config.auto_start);
        assert!(config.ipv6_enabled);
        assert!(config.block_logging);
        assert!(config.show_notification); // default preserved
        assert_eq!(config.upstreams.len(), 2);
        assert!(config.upstreams[0].enabled);
        assert!(!config.upstreams[1].enabled);
        assert_eq!(config.host_sources[0].disposition, Disposition::Deny);
        assert_eq!(config.app_inclusion.default_mode, AppDefaultMode::None);
    }

    #[test]
    fn test_resolver_addr_literals() {
        assert_eq!(
            parse_resolver_addr("1.1.1.1").unwrap(),
            "1.1.1.1:53".parse().unwrap()
        );
        assert_eq!(
            parse_resolver_addr("8.8.8.8:5353").unwrap(),
            "8.8.8.8:5353".parse().unwrap()
        );
        assert_eq!(
            parse_resolver_addr("2606:4700::1111").unwrap(),
            "[2606:4700::1111]:53".parse().unwrap()
        );
        assert!(parse_resolver_addr("not-an-ip").is_err());
    }

    #[test]
    fn test_validation_rejects_bad_upstream() {
        let mut config = ConfigSnapshot::default();
        config.upstreams.push(UpstreamConfig {
            name: "broken".to_string(),
            addr: "dns.example.com".to_string(),
            enabled: true,
        });
        assert!(config.validate().is_err());

        // A disabled entry may carry an unparseable address
        config.upstreams[0].enabled = false;
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_validation_rejects_conflicting_inclusion() {
        let mut config = ConfigSnapshot::default();
        config.app_inclusion.included.push("org.example.app".into());
        config.app_inclusion.excluded.push("org.example.app".into());
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_enabled_resolvers_keep_order() {
        let mut config = ConfigSnapshot::default();
        config.upstreams = vec![
            UpstreamConfig {
                name: "a".into(),
                addr: "1.1.1.1".into(),
                enabled: true,
            },
            UpstreamConfig {
                name: "b".into(),
                addr: "9.9.9.9".into(),
                enabled: false,
            },
            UpstreamConfig {
                name: "c".into(),
                addr: "8.8.8.8".into(),
                enabled: true,
            },
        ];

        let resolvers = config.enabled_resolvers().unwrap();
        assert_eq!(resolvers.len(), 2);
        assert_eq!(resolvers[0].name, "a");
        assert_eq!(resolvers[1].name, "c");
    }

    #[test]
    fn test_autostart_gate() {
        let mut config = ConfigSnapshot::default();
        assert!(!should_autostart(&config, true));

        config.auto_start = true;
        assert!(should_autostart(&config, true));
        assert!(!should_autostart(&config, false));
    }

    #[test]
    fn test_parse_bool() {
        assert!(parse_bool("true", false));
        assert!(parse_bool("YES", false));
        assert!(!parse_bool("off", true));
        assert!(parse_bool("gibberish", true));
    }
}
