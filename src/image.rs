// Copyright (c) 2019, 2020 Codethink Ltd.
//
// Permission is hereby granted, free of charge, to any person obtaining a copy
// of this software and associated documentation files (the "Software"), to deal
// in the Software without restriction, including without limitation the rights
// to use, copy, modify, merge, publish, distribute, sublicense, and/or sell
// copies of the Software, and to permit persons to whom the Software is
// furnished to do so, subject to the following conditions:
//
// The above copyright notice and this permission notice shall be included in all
// copies or substantial portions of the Software.
//
// THE SOFTWARE IS PROVIDED "AS IS", WITHOUT WARRANTY OF ANY KIND, EXPRESS OR
// IMPLIED, INCLUDING BUT NOT LIMITED TO THE WARRANTIES OF MERCHANTABILITY,
// FITNESS FOR A PARTICULAR PURPOSE AND NONINFRINGEMENT. IN NO EVENT SHALL THE
// AUTHORS OR COPYRIGHT HOLDERS BE LIABLE FOR ANY CLAIM, DAMAGES OR OTHER
// LIABILITY, WHETHER IN AN ACTION OF CONTRACT, TORT OR OTHERWISE, ARISING FROM,
// OUT OF OR IN CONNECTION WITH THE SOFTWARE OR THE USE OR OTHER DEALINGS IN THE
// SOFTWARE.

//! In-memory image: an ordered layer stack, a config document and the
//! manifest that ties them together.
//!
//! Every operation consumes the image and returns a new one, so a failed
//! step never leaves a half-modified image behind.

use std::collections::BTreeMap;
use std::fmt;
use std::path::PathBuf;

use anyhow::{bail, Context, Result};
use serde_json::{json, Map, Value};
use tracing::debug;

use crate::blob::{layer_reader, Blob, Compression};
use crate::util::{sha256_digest, source_date_timestamp};

pub const OCI_MANIFEST: &str = "application/vnd.oci.image.manifest.v1+json";
pub const OCI_CONFIG: &str = "application/vnd.oci.image.config.v1+json";
pub const DOCKER_MANIFEST: &str = "application/vnd.docker.distribution.manifest.v2+json";
pub const DOCKER_CONFIG: &str = "application/vnd.docker.container.image.v1+json";

const CREATED_BY: &str = "strata build";

#[derive(Debug, Clone)]
pub struct Layer {
    pub blob: Blob,
    pub diff_id: String,
}

/// A packaged layer waiting to be appended, with the annotations its
/// descriptor should carry.
#[derive(Debug, Clone)]
pub struct LayerAddendum {
    pub archive: PathBuf,
    pub annotations: BTreeMap<String, String>,
}

/// A single change to the image config.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConfigPatch {
    /// Set the entrypoint to an empty list.
    ClearEntrypoint,
    /// Run the container as this user.
    User(String),
}

impl fmt::Display for ConfigPatch {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ConfigPatch::ClearEntrypoint => write!(f, "clear entrypoint"),
            ConfigPatch::User(user) => write!(f, "run as {:?}", user),
        }
    }
}

/// The pieces of an image as a registry hands them over.
#[derive(Debug, Clone)]
pub struct ImageParts {
    pub media_type: String,
    pub annotations: Option<BTreeMap<String, String>>,
    pub config_media_type: String,
    pub config: Vec<u8>,
    pub layers: Vec<Blob>,
}

/// One path of a flattened image filesystem.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FsEntry {
    Directory,
    File(Vec<u8>),
    Symlink(String),
}

#[derive(Debug, Clone)]
pub struct Image {
    media_type: String,
    annotations: Option<BTreeMap<String, String>>,
    config_media_type: String,
    config: Value,
    layers: Vec<Layer>,
}

impl Image {
    /// An image with no layers and a minimal Linux config for the host
    /// architecture.
    pub fn empty() -> Self {
        Image {
            media_type: OCI_MANIFEST.to_string(),
            annotations: None,
            config_media_type: OCI_CONFIG.to_string(),
            config: json!({
                "architecture": host_architecture(),
                "os": "linux",
                "config": {},
                "rootfs": {
                    "type": "layers",
                    "diff_ids": [],
                },
            }),
            layers: Vec::new(),
        }
    }

    /// Assemble an image from pulled parts, checking that the layer blobs
    /// match their descriptors and the config's diff ids.
    pub fn from_parts(parts: ImageParts) -> Result<Self> {
        let config: Value =
            serde_json::from_slice(&parts.config).context("Failed to parse image config")?;
        if !config.is_object() {
            bail!("Image config is not a JSON object");
        }

        let diff_ids: Vec<String> = config
            .get("rootfs")
            .and_then(|r| r.get("diff_ids"))
            .and_then(|d| d.as_array())
            .map(|ids| {
                ids.iter()
                    .filter_map(|v| v.as_str().map(str::to_string))
                    .collect()
            })
            .unwrap_or_default();
        if diff_ids.len() != parts.layers.len() {
            bail!(
                "Mismatched number of layers and diff ids: {} vs {}",
                parts.layers.len(),
                diff_ids.len()
            );
        }

        let mut layers = Vec::with_capacity(parts.layers.len());
        for (blob, diff_id) in parts.layers.into_iter().zip(diff_ids) {
            if blob.descriptor.digest.starts_with("sha256:") {
                let actual = sha256_digest(&blob.data);
                if actual != blob.descriptor.digest {
                    bail!(
                        "Layer digest mismatch: expected {}, got {}",
                        blob.descriptor.digest,
                        actual
                    );
                }
            }
            layers.push(Layer { blob, diff_id });
        }

        Ok(Image {
            media_type: parts.media_type,
            annotations: parts.annotations,
            config_media_type: parts.config_media_type,
            config,
            layers,
        })
    }

    pub fn media_type(&self) -> &str {
        &self.media_type
    }

    pub fn is_docker(&self) -> bool {
        self.media_type == DOCKER_MANIFEST
    }

    pub fn layers(&self) -> &[Layer] {
        &self.layers
    }

    pub fn config(&self) -> &Value {
        &self.config
    }

    /// Append one layer per addendum, in order, compressing each archive.
    pub fn append_layers(mut self, addenda: &[LayerAddendum], compression: Compression) -> Result<Self> {
        let media_type = compression.layer_media_type(self.is_docker())?;
        let created = source_date_timestamp()?;

        for addendum in addenda {
            let (mut blob, diff_id) =
                Blob::from_layer_archive(&addendum.archive, compression, media_type)?;
            if !addendum.annotations.is_empty() {
                blob.descriptor.annotations = Some(addendum.annotations.clone());
            }
            debug!(
                digest = %blob.descriptor.digest,
                size = blob.descriptor.size,
                "Appending layer"
            );

            diff_ids_mut(&mut self.config)?.push(Value::String(diff_id.clone()));
            let mut entry = Map::new();
            if let Some(ref created) = created {
                entry.insert("created".to_string(), Value::String(created.clone()));
            }
            entry.insert("created_by".to_string(), Value::String(CREATED_BY.to_string()));
            history_mut(&mut self.config)?.push(Value::Object(entry));

            self.layers.push(Layer { blob, diff_id });
        }
        Ok(self)
    }

    pub fn mutate_config(mut self, patch: &ConfigPatch) -> Result<Self> {
        let container_config = container_config_mut(&mut self.config)?;
        match patch {
            ConfigPatch::ClearEntrypoint => {
                container_config.insert("Entrypoint".to_string(), json!([]));
            }
            ConfigPatch::User(user) => {
                container_config.insert("User".to_string(), Value::String(user.clone()));
            }
        }
        Ok(self)
    }

    pub fn config_bytes(&self) -> Result<Vec<u8>> {
        Ok(serde_json::to_vec(&self.config)?)
    }

    pub fn config_blob(&self) -> Result<Blob> {
        Ok(Blob::from_bytes(self.config_bytes()?, &self.config_media_type))
    }

    pub fn manifest(&self) -> Result<Value> {
        let layers: Vec<Value> = self
            .layers
            .iter()
            .map(|layer| layer.blob.descriptor.to_json())
            .collect();
        let mut manifest = json!({
            "schemaVersion": 2,
            "mediaType": self.media_type,
            "config": self.config_blob()?.descriptor.to_json(),
            "layers": layers,
        });
        if let Some(ref annotations) = self.annotations {
            manifest["annotations"] = json!(annotations);
        }
        Ok(manifest)
    }

    /// Serialized manifest. Keys are written in sorted order, so the bytes
    /// depend only on the image content.
    pub fn manifest_bytes(&self) -> Result<Vec<u8>> {
        Ok(serde_json::to_vec(&self.manifest()?)?)
    }

    pub fn digest(&self) -> Result<String> {
        Ok(sha256_digest(&self.manifest_bytes()?))
    }

    /// Replay every layer, lowest first, into a single path map. Whiteout
    /// entries delete what earlier layers put in place.
    pub fn flatten(&self) -> Result<BTreeMap<String, FsEntry>> {
        let mut files: BTreeMap<String, FsEntry> = BTreeMap::new();

        for layer in &self.layers {
            let reader = layer_reader(&layer.blob.data, &layer.blob.descriptor.media_type)?;
            let mut archive = tar::Archive::new(reader);
            for entry in archive.entries()? {
                let mut entry = entry?;
                let raw_path = entry.path()?.to_string_lossy().to_string();
                let path = normalize_entry_path(&raw_path);
                if path.is_empty() {
                    continue;
                }
                let (dirname, basename) = split_path(&path);

                if basename == ".wh..wh..opq" {
                    if dirname.is_empty() {
                        files.clear();
                    } else {
                        let prefix = format!("{}/", dirname);
                        files.retain(|k, _| !k.starts_with(&prefix));
                    }
                } else if let Some(real_name) = basename.strip_prefix(".wh.") {
                    let full_path = if dirname.is_empty() {
                        real_name.to_string()
                    } else {
                        format!("{}/{}", dirname, real_name)
                    };
                    let prefix = format!("{}/", full_path);
                    files.retain(|k, _| k != &full_path && !k.starts_with(&prefix));
                } else {
                    let entry_type = entry.header().entry_type();
                    let fs_entry = match entry_type {
                        tar::EntryType::Directory => FsEntry::Directory,
                        tar::EntryType::Symlink => FsEntry::Symlink(
                            entry
                                .link_name()?
                                .map(|p| p.to_string_lossy().to_string())
                                .unwrap_or_default(),
                        ),
                        tar::EntryType::Regular | tar::EntryType::Continuous => {
                            let mut data = Vec::new();
                            std::io::Read::read_to_end(&mut entry, &mut data)?;
                            FsEntry::File(data)
                        }
                        _ => continue,
                    };
                    files.insert(path, fs_entry);
                }
            }
        }
        Ok(files)
    }
}

fn host_architecture() -> &'static str {
    match std::env::consts::ARCH {
        "x86_64" => "amd64",
        "aarch64" => "arm64",
        "x86" => "386",
        "powerpc64" => "ppc64le",
        other => other,
    }
}

fn object_field<'a>(parent: &'a mut Map<String, Value>, key: &str, default: Value) -> &'a mut Value {
    let value = parent.entry(key.to_string()).or_insert(Value::Null);
    if value.is_null() {
        *value = default;
    }
    value
}

fn diff_ids_mut(config: &mut Value) -> Result<&mut Vec<Value>> {
    let config = config.as_object_mut().context("Image config is not a JSON object")?;
    let rootfs = object_field(config, "rootfs", json!({ "type": "layers" }))
        .as_object_mut()
        .context("Image rootfs is not a JSON object")?;
    object_field(rootfs, "diff_ids", json!([]))
        .as_array_mut()
        .context("Image rootfs diff_ids is not a list")
}

fn history_mut(config: &mut Value) -> Result<&mut Vec<Value>> {
    let config = config.as_object_mut().context("Image config is not a JSON object")?;
    object_field(config, "history", json!([]))
        .as_array_mut()
        .context("Image history is not a list")
}

fn container_config_mut(config: &mut Value) -> Result<&mut Map<String, Value>> {
    let config = config.as_object_mut().context("Image config is not a JSON object")?;
    object_field(config, "config", json!({}))
        .as_object_mut()
        .context("Image container config is not a JSON object")
}

fn normalize_entry_path(path: &str) -> String {
    let path = path.trim_start_matches("./").trim_start_matches('/');
    path.trim_end_matches('/').to_string()
}

fn split_path(path: &str) -> (&str, &str) {
    match path.rfind('/') {
        Some(pos) => (&path[..pos], &path[pos + 1..]),
        None => ("", path),
    }
}
