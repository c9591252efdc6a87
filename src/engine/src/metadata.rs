//! docker-save image metadata model.
//!
//! These structs mirror the wire documents of a `docker save` archive:
//! `manifest.json`, the image config, and the per-layer "v1" descriptor
//! (which shares the config's shape). Field declaration order IS the
//! wire order: `serde_json` emits struct fields in declaration order,
//! and the assembler hashes exactly the bytes it writes, so the order
//! here must never be rearranged.
//!
//! Deserialization is permissive: unknown fields are ignored and every
//! field is defaulted when absent.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

/// One element of the `manifest.json` array.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ImageManifest {
    #[serde(rename = "Config", default)]
    pub config: String,
    #[serde(rename = "RepoTags", default)]
    pub repo_tags: Option<Vec<String>>,
    #[serde(rename = "Layers", default)]
    pub layers: Vec<String>,
    #[serde(rename = "LayerSources", default)]
    pub layer_sources: Option<BTreeMap<String, LayerSource>>,
}

/// Blob descriptor carried in the manifest's `LayerSources` map.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct LayerSource {
    #[serde(rename = "mediaType", default)]
    pub media_type: String,
    #[serde(default)]
    pub size: i64,
    #[serde(default)]
    pub digest: String,
}

/// Image config document; also the shape of per-layer `json` descriptors.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ImageConfig {
    #[serde(default)]
    pub architecture: String,
    #[serde(default)]
    pub author: String,
    #[serde(default)]
    pub config: RuntimeConfig,
    #[serde(default)]
    pub container_config: RuntimeConfig,
    #[serde(default)]
    pub container: String,
    #[serde(rename = "layerID", default)]
    pub layer_id: String,
    #[serde(default)]
    pub created: String,
    #[serde(default)]
    pub docker_version: String,
    #[serde(default)]
    pub history: Option<Vec<HistoryEntry>>,
    #[serde(default)]
    pub os: String,
    #[serde(default)]
    pub rootfs: Rootfs,
    #[serde(default)]
    pub parent: String,
    #[serde(default)]
    pub id: String,
}

/// Runtime defaults (`config` / `container_config` payload).
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct RuntimeConfig {
    #[serde(default)]
    pub hostname: String,
    #[serde(default)]
    pub domainname: String,
    #[serde(default)]
    pub user: String,
    #[serde(default)]
    pub attach_stdin: bool,
    #[serde(default)]
    pub attach_stdout: bool,
    #[serde(default)]
    pub attach_stderr: bool,
    /// Ports map onto empty objects on the wire.
    #[serde(default)]
    pub exposed_ports: Option<BTreeMap<String, serde_json::Value>>,
    #[serde(default)]
    pub tty: bool,
    #[serde(default)]
    pub open_stdin: bool,
    #[serde(default)]
    pub stdin_once: bool,
    #[serde(default)]
    pub env: Option<Vec<String>>,
    #[serde(default)]
    pub cmd: Option<Vec<String>>,
    #[serde(default)]
    pub healthcheck: Healthcheck,
    #[serde(default)]
    pub image: String,
    #[serde(default)]
    pub volumes: Option<serde_json::Value>,
    #[serde(default)]
    pub working_dir: String,
    #[serde(default)]
    pub entrypoint: Option<Vec<String>>,
    #[serde(default)]
    pub on_build: Option<serde_json::Value>,
    #[serde(default)]
    pub labels: Option<BTreeMap<String, String>>,
}

/// Container health probe.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Healthcheck {
    #[serde(rename = "Test", default)]
    pub test: Option<Vec<String>>,
}

/// One entry of the image config's `history` list.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct HistoryEntry {
    #[serde(default)]
    pub created: String,
    #[serde(default)]
    pub created_by: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub comment: String,
    #[serde(default, skip_serializing_if = "is_false")]
    pub empty_layer: bool,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub author: String,
}

/// Image rootfs: ordered diff ids of the uncompressed layer tars.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Rootfs {
    #[serde(rename = "type", default)]
    pub kind: String,
    #[serde(default)]
    pub diff_ids: Option<Vec<String>>,
}

fn is_false(value: &bool) -> bool {
    !*value
}
