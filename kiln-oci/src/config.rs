//! Image configuration JSON: the subset of the OCI image spec the build
//! engine reads (history, diff IDs, platform) and writes (runtime config).
//!
//! Field names serialize to the spec's casing; lowercase aliases keep us
//! tolerant of configs written by older Docker daemons.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use time::OffsetDateTime;

use crate::{Digest, Result};

/// An OS/architecture/variant triple.
#[derive(Debug, Clone, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Platform {
    /// Operating system (`linux`).
    pub os: String,
    /// CPU architecture (`amd64`, `arm64`, …), normalized.
    pub architecture: String,
    /// Architecture variant (`v8`), if any.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub variant: Option<String>,
}

impl Platform {
    /// Parses an `os/arch[/variant]` string, normalizing common
    /// machine-name spellings (`x86_64` → `amd64`, `aarch64` → `arm64`).
    pub fn parse(spec: &str) -> Option<Self> {
        let mut parts = spec.splitn(3, '/');
        let os = parts.next().filter(|s| !s.is_empty())?;
        let arch = parts.next().filter(|s| !s.is_empty())?;
        let variant = parts.next().filter(|s| !s.is_empty());
        Some(Self {
            os: os.to_owned(),
            architecture: normalize_arch(arch).to_owned(),
            variant: variant.map(str::to_owned),
        })
    }

    /// The `os/arch[/variant]` form used by `TARGETPLATFORM`.
    pub fn to_spec(&self) -> String {
        match &self.variant {
            Some(variant) => format!("{}/{}/{}", self.os, self.architecture, variant),
            None => format!("{}/{}", self.os, self.architecture),
        }
    }
}

impl std::fmt::Display for Platform {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.to_spec())
    }
}

/// Maps common `uname -m` spellings onto OCI architecture names.
fn normalize_arch(arch: &str) -> &str {
    match arch {
        "x86_64" | "x86-64" => "amd64",
        "aarch64" => "arm64",
        "armhf" => "arm",
        other => other,
    }
}

/// One image history entry.
///
/// Compared field-by-field: two entries are equal iff all five fields are,
/// with absent optionals only equal to absent optionals.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct HistoryEntry {
    /// When the layer was created.
    #[serde(
        default,
        skip_serializing_if = "Option::is_none",
        with = "time::serde::rfc3339::option"
    )]
    pub created: Option<OffsetDateTime>,
    /// Canonical representation of the instruction that produced the layer.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub created_by: Option<String>,
    /// Free-form author.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub author: Option<String>,
    /// Free-form comment.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub comment: Option<String>,
    /// Whether the entry corresponds to no filesystem diff.
    #[serde(default, skip_serializing_if = "std::ops::Not::not")]
    pub empty_layer: bool,
}

/// The runtime half of an image config (`.config`).
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RuntimeConfig {
    /// Default user (and optional group).
    #[serde(rename = "User", alias = "user", default, skip_serializing_if = "Option::is_none")]
    pub user: Option<String>,
    /// Exposed ports; keys are `port[/proto]`, values empty objects.
    #[serde(
        rename = "ExposedPorts",
        alias = "exposed_ports",
        default,
        skip_serializing_if = "Option::is_none"
    )]
    pub exposed_ports: Option<BTreeMap<String, serde_json::Value>>,
    /// Environment as `KEY=value` strings.
    #[serde(rename = "Env", alias = "env", default, skip_serializing_if = "Vec::is_empty")]
    pub env: Vec<String>,
    /// Entrypoint argv.
    #[serde(
        rename = "Entrypoint",
        alias = "entrypoint",
        default,
        skip_serializing_if = "Option::is_none"
    )]
    pub entrypoint: Option<Vec<String>>,
    /// Default command argv.
    #[serde(rename = "Cmd", alias = "cmd", default, skip_serializing_if = "Option::is_none")]
    pub cmd: Option<Vec<String>>,
    /// Declared volumes; keys are paths, values empty objects.
    #[serde(
        rename = "Volumes",
        alias = "volumes",
        default,
        skip_serializing_if = "Option::is_none"
    )]
    pub volumes: Option<BTreeMap<String, serde_json::Value>>,
    /// Default working directory.
    #[serde(
        rename = "WorkingDir",
        alias = "working_dir",
        default,
        skip_serializing_if = "Option::is_none"
    )]
    pub working_dir: Option<String>,
    /// Image labels.
    #[serde(
        rename = "Labels",
        alias = "labels",
        default,
        skip_serializing_if = "Option::is_none"
    )]
    pub labels: Option<BTreeMap<String, String>>,
    /// Signal used to stop a container.
    #[serde(
        rename = "StopSignal",
        alias = "stop_signal",
        default,
        skip_serializing_if = "Option::is_none"
    )]
    pub stop_signal: Option<String>,
    /// Container healthcheck.
    #[serde(
        rename = "Healthcheck",
        alias = "healthcheck",
        default,
        skip_serializing_if = "Option::is_none"
    )]
    pub healthcheck: Option<HealthcheckConfig>,
    /// Replacement shell for shell-form RUN/CMD.
    #[serde(rename = "Shell", alias = "shell", default, skip_serializing_if = "Option::is_none")]
    pub shell: Option<Vec<String>>,
    /// ONBUILD trigger lines.
    #[serde(
        rename = "OnBuild",
        alias = "onbuild",
        default,
        skip_serializing_if = "Option::is_none"
    )]
    pub onbuild: Option<Vec<String>>,
}

/// Container healthcheck settings (`.config.Healthcheck`).
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct HealthcheckConfig {
    /// Test command: `["NONE"]`, `["CMD", …]`, or `["CMD-SHELL", line]`.
    #[serde(rename = "Test", default, skip_serializing_if = "Vec::is_empty")]
    pub test: Vec<String>,
    /// Interval between checks, in nanoseconds.
    #[serde(rename = "Interval", default, skip_serializing_if = "Option::is_none")]
    pub interval: Option<i64>,
    /// Check timeout, in nanoseconds.
    #[serde(rename = "Timeout", default, skip_serializing_if = "Option::is_none")]
    pub timeout: Option<i64>,
    /// Grace period before checks count, in nanoseconds.
    #[serde(rename = "StartPeriod", default, skip_serializing_if = "Option::is_none")]
    pub start_period: Option<i64>,
    /// Consecutive failures before unhealthy.
    #[serde(rename = "Retries", default, skip_serializing_if = "Option::is_none")]
    pub retries: Option<u32>,
}

/// The layer-diff half of an image config (`.rootfs`).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RootFs {
    /// Always `"layers"`.
    #[serde(rename = "type")]
    pub kind: String,
    /// Uncompressed layer digests, bottom-most first.
    #[serde(default)]
    pub diff_ids: Vec<Digest>,
}

impl Default for RootFs {
    fn default() -> Self {
        Self {
            kind: "layers".into(),
            diff_ids: Vec::new(),
        }
    }
}

/// A whole image configuration blob.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ImageConfig {
    /// Image creation time.
    #[serde(
        default,
        skip_serializing_if = "Option::is_none",
        with = "time::serde::rfc3339::option"
    )]
    pub created: Option<OffsetDateTime>,
    /// Free-form author.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub author: Option<String>,
    /// CPU architecture.
    #[serde(default)]
    pub architecture: String,
    /// Architecture variant.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub variant: Option<String>,
    /// Operating system.
    #[serde(default)]
    pub os: String,
    /// Runtime configuration.
    #[serde(default)]
    pub config: RuntimeConfig,
    /// Layer diff IDs.
    #[serde(default)]
    pub rootfs: RootFs,
    /// Per-layer history, oldest first.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub history: Vec<HistoryEntry>,
}

impl ImageConfig {
    /// Parses a config blob.
    pub fn from_json(data: &[u8]) -> Result<Self> {
        Ok(serde_json::from_slice(data)?)
    }

    /// Serializes the config back to JSON.
    pub fn to_json(&self) -> Result<Vec<u8>> {
        Ok(serde_json::to_vec(self)?)
    }

    /// The image's platform triple.
    pub fn platform(&self) -> Platform {
        Platform {
            os: self.os.clone(),
            architecture: self.architecture.clone(),
            variant: self.variant.clone(),
        }
    }

    /// History entries that carry a filesystem diff, in order.
    pub fn non_empty_history(&self) -> usize {
        self.history.iter().filter(|h| !h.empty_layer).count()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn platform_parse_and_normalize() {
        let p = Platform::parse("linux/x86_64").unwrap();
        assert_eq!(p.architecture, "amd64");
        assert_eq!(p.to_spec(), "linux/amd64");

        let p = Platform::parse("linux/arm64/v8").unwrap();
        assert_eq!(p.variant.as_deref(), Some("v8"));
        assert!(Platform::parse("linux").is_none());
        assert!(Platform::parse("/amd64").is_none());
    }

    #[test]
    fn config_roundtrip_docker_casing() {
        let raw = br#"{
            "architecture": "amd64",
            "os": "linux",
            "config": {
                "Env": ["PATH=/usr/bin"],
                "Cmd": ["/bin/sh"],
                "Labels": {"a": "b"},
                "Volumes": {"/data": {}}
            },
            "rootfs": {"type": "layers", "diff_ids": ["sha256:00"]},
            "history": [
                {"created_by": "/bin/sh -c #(nop) ENV A=1", "empty_layer": true}
            ]
        }"#;
        let cfg = ImageConfig::from_json(raw).unwrap();
        assert_eq!(cfg.config.env, vec!["PATH=/usr/bin".to_owned()]);
        assert_eq!(cfg.rootfs.diff_ids.len(), 1);
        assert!(cfg.history[0].empty_layer);
        assert_eq!(cfg.non_empty_history(), 0);

        let back = cfg.to_json().unwrap();
        let again = ImageConfig::from_json(&back).unwrap();
        assert_eq!(cfg, again);
    }

    #[test]
    fn history_equality_nil_rules() {
        let a = HistoryEntry {
            created_by: Some("RUN x".into()),
            ..HistoryEntry::default()
        };
        let mut b = a.clone();
        assert_eq!(a, b);
        b.comment = Some(String::new());
        assert_ne!(a, b);
    }
}
