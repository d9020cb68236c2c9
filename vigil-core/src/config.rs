//! TOML configuration for the monitoring daemon.
//!
//! Reads `vigil.toml` (or a custom path) into typed structs. Escalation
//! thresholds have global defaults plus optional per-protocol overrides,
//! so each check protocol can carry its own windows without a separate
//! engine.

use std::collections::HashMap;
use std::path::Path;

use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use crate::scanner::EscalationPolicy;
use crate::types::Protocol;

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct VigilConfig {
    #[serde(default)]
    pub general: GeneralConfig,
    #[serde(default)]
    pub escalation: EscalationConfig,
    /// Per-protocol threshold overrides, keyed by protocol name
    /// (`icmp`, `http`, `https`, `header-security`, `encryption`, `waf`).
    #[serde(default)]
    pub protocols: HashMap<String, ProtocolOverrides>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GeneralConfig {
    pub log_level: String,
    pub snapshot_dir: String,
    pub snapshot_interval_secs: u64,
    pub alert_log: String,
}

impl Default for GeneralConfig {
    fn default() -> Self {
        Self {
            log_level: "info".into(),
            snapshot_dir: "~/.vigil/snapshots".into(),
            snapshot_interval_secs: 300,
            alert_log: "~/.vigil/alerts.jsonl".into(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EscalationConfig {
    pub extended_count_threshold: u32,
    pub additional_downtime_threshold_secs: i64,
    pub short_window_secs: i64,
    pub long_window_secs: i64,
    pub short_scan_interval_secs: u64,
    pub long_scan_interval_secs: u64,
}

impl Default for EscalationConfig {
    fn default() -> Self {
        let policy = EscalationPolicy::default();
        Self {
            extended_count_threshold: policy.extended_count_threshold,
            additional_downtime_threshold_secs: policy.additional_downtime_threshold_secs,
            short_window_secs: policy.short_window_secs,
            long_window_secs: policy.long_window_secs,
            short_scan_interval_secs: 3_600,
            long_scan_interval_secs: 86_400,
        }
    }
}

/// Optional per-protocol overrides; unset fields inherit the globals.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ProtocolOverrides {
    pub extended_count_threshold: Option<u32>,
    pub additional_downtime_threshold_secs: Option<i64>,
    pub short_window_secs: Option<i64>,
    pub long_window_secs: Option<i64>,
}

impl VigilConfig {
    /// Load config from a TOML file path; missing file means defaults.
    pub fn load(path: impl AsRef<Path>) -> Result<Self, String> {
        let path = path.as_ref();
        if !path.exists() {
            warn!(path = %path.display(), "Config file not found, using defaults");
            return Ok(Self::default());
        }
        let content = std::fs::read_to_string(path)
            .map_err(|e| format!("Failed to read config: {e}"))?;
        let config: VigilConfig =
            toml::from_str(&content).map_err(|e| format!("Failed to parse config: {e}"))?;
        for name in config.protocols.keys() {
            if Protocol::from_str_opt(name).is_none() {
                return Err(format!("Unknown protocol '{name}' in [protocols]"));
            }
        }
        info!(
            path = %path.display(),
            overrides = config.protocols.len(),
            "Configuration loaded"
        );
        Ok(config)
    }

    pub fn save(&self, path: impl AsRef<Path>) -> Result<(), String> {
        let content = toml::to_string_pretty(self)
            .map_err(|e| format!("Failed to serialize config: {e}"))?;
        std::fs::write(path, content).map_err(|e| format!("Failed to write config: {e}"))?;
        Ok(())
    }

    /// Escalation thresholds with defaults applied.
    pub fn default_policy(&self) -> EscalationPolicy {
        EscalationPolicy {
            extended_count_threshold: self.escalation.extended_count_threshold,
            additional_downtime_threshold_secs: self.escalation.additional_downtime_threshold_secs,
            short_window_secs: self.escalation.short_window_secs,
            long_window_secs: self.escalation.long_window_secs,
        }
    }

    /// Resolved thresholds for one protocol.
    pub fn policy_for(&self, protocol: Protocol) -> EscalationPolicy {
        let base = self.default_policy();
        let Some(over) = self.protocols.get(protocol.as_str()) else {
            return base;
        };
        EscalationPolicy {
            extended_count_threshold: over
                .extended_count_threshold
                .unwrap_or(base.extended_count_threshold),
            additional_downtime_threshold_secs: over
                .additional_downtime_threshold_secs
                .unwrap_or(base.additional_downtime_threshold_secs),
            short_window_secs: over.short_window_secs.unwrap_or(base.short_window_secs),
            long_window_secs: over.long_window_secs.unwrap_or(base.long_window_secs),
        }
    }

    /// All protocols carrying an override, with their resolved policy.
    pub fn protocol_policies(&self) -> Vec<(Protocol, EscalationPolicy)> {
        self.protocols
            .keys()
            .filter_map(|name| Protocol::from_str_opt(name))
            .map(|p| (p, self.policy_for(p)))
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_match_stock_policy() {
        let config = VigilConfig::default();
        assert_eq!(config.default_policy(), EscalationPolicy::default());
        assert_eq!(config.policy_for(Protocol::Icmp), EscalationPolicy::default());
    }

    #[test]
    fn missing_file_yields_defaults() {
        let config = VigilConfig::load("/nonexistent/vigil.toml").unwrap();
        assert_eq!(config.escalation.extended_count_threshold, 3);
        assert_eq!(config.general.snapshot_interval_secs, 300);
    }

    #[test]
    fn per_protocol_overrides_merge_with_globals() {
        let toml_src = r#"
            [escalation]
            extended_count_threshold = 5
            additional_downtime_threshold_secs = 300
            short_window_secs = 3600
            long_window_secs = 86400
            short_scan_interval_secs = 3600
            long_scan_interval_secs = 86400

            [protocols.waf]
            extended_count_threshold = 1
        "#;
        let config: VigilConfig = toml::from_str(toml_src).unwrap();
        let waf = config.policy_for(Protocol::Waf);
        assert_eq!(waf.extended_count_threshold, 1);
        assert_eq!(waf.short_window_secs, 3_600);
        let icmp = config.policy_for(Protocol::Icmp);
        assert_eq!(icmp.extended_count_threshold, 5);
    }

    #[test]
    fn save_load_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("vigil.toml");
        let mut config = VigilConfig::default();
        config.escalation.extended_count_threshold = 7;
        config
            .protocols
            .insert("encryption".into(), ProtocolOverrides {
                long_window_secs: Some(172_800),
                ..ProtocolOverrides::default()
            });
        config.save(&path).unwrap();

        let loaded = VigilConfig::load(&path).unwrap();
        assert_eq!(loaded.escalation.extended_count_threshold, 7);
        assert_eq!(
            loaded.policy_for(Protocol::Encryption).long_window_secs,
            172_800
        );
    }

    #[test]
    fn unknown_protocol_override_is_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("vigil.toml");
        std::fs::write(&path, "[protocols.gopher]\nextended_count_threshold = 1\n").unwrap();
        assert!(VigilConfig::load(&path).is_err());
    }
}
