//! Image manifest parsing.
//!
//! The manifest travels as a JSON document in the archive entry named
//! `manifest`, next to the image's `rootfs/` tree. Fields the store does
//! not interpret are round-tripped verbatim so re-serialization never
//! loses data.

use std::collections::BTreeMap;
use std::io::Read;

use anyhow::Result;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tar::Archive;

use crate::error::StoreError;

/// Name of the manifest entry inside an image archive.
const MANIFEST_ENTRY: &str = "manifest";

/// One `{name, value}` label on an image or dependency.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Label {
    pub name: String,
    pub value: String,
}

impl Label {
    #[must_use]
    pub fn new(name: impl Into<String>, value: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            value: value.into(),
        }
    }
}

/// A dependency on another image, by name and optionally by identity.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Dependency {
    pub image_name: String,
    #[serde(rename = "imageID", default, skip_serializing_if = "Option::is_none")]
    pub image_id: Option<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub labels: Vec<Label>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub size: Option<u64>,
}

/// The manifest of an application container image.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ImageManifest {
    pub name: String,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub labels: Vec<Label>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub dependencies: Vec<Dependency>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub path_whitelist: Vec<String>,
    #[serde(flatten)]
    pub extra: BTreeMap<String, Value>,
}

impl ImageManifest {
    /// Scan an uncompressed image archive for its manifest entry.
    ///
    /// # Errors
    ///
    /// Fails with [`StoreError::Manifest`] when the archive cannot be read,
    /// the entry is absent, or the JSON does not parse.
    pub fn from_archive<R: Read>(archive: R) -> Result<Self> {
        let mut archive = Archive::new(archive);
        let entries = archive
            .entries()
            .map_err(|err| StoreError::Manifest(format!("failed to read archive: {err}")))?;
        for entry in entries {
            let mut entry =
                entry.map_err(|err| StoreError::Manifest(format!("bad archive entry: {err}")))?;
            let path = entry
                .path()
                .map_err(|err| StoreError::Manifest(format!("bad entry path: {err}")))?;
            let is_manifest = path
                .to_str()
                .map(|p| p.trim_start_matches("./") == MANIFEST_ENTRY)
                .unwrap_or(false);
            if !is_manifest {
                continue;
            }
            let mut bytes = Vec::new();
            entry
                .read_to_end(&mut bytes)
                .map_err(|err| StoreError::Manifest(format!("failed to read manifest: {err}")))?;
            let manifest: Self = serde_json::from_slice(&bytes)
                .map_err(|err| StoreError::Manifest(format!("failed to parse manifest: {err}")))?;
            return Ok(manifest);
        }
        Err(StoreError::Manifest("no manifest entry in archive".to_string()).into())
    }

    /// Value of the named label, when present.
    #[must_use]
    pub fn label(&self, name: &str) -> Option<&str> {
        self.labels
            .iter()
            .find(|l| l.name == name)
            .map(|l| l.value.as_str())
    }
}
