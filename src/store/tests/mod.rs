//! Store unit tests, split by topic.

use super::*;
use crate::db;
use crate::keys::{DIGEST_LEN, KEY_LEN, KEY_PREFIX};
use crate::render::{render_aci, render_aci_with_image_id, RenderedAci};

use std::collections::HashSet;
use std::io::Cursor;
use std::thread;

use serde_json::json;
use tempfile::{tempdir, TempDir};

mod migration;

fn new_store() -> Result<(TempDir, Store)> {
    let temp = tempdir()?;
    let store = Store::new(Some(temp.path().to_path_buf()))?;
    Ok((temp, store))
}

fn current_ids() -> (u64, u64) {
    #[cfg(unix)]
    {
        use std::os::unix::fs::MetadataExt;
        let probe = tempfile::NamedTempFile::new().expect("probe file");
        let meta = probe.as_file().metadata().expect("probe metadata");
        (meta.uid() as u64, meta.gid() as u64)
    }
    #[cfg(not(unix))]
    {
        (0, 0)
    }
}

/// Builds image archives the way a packaging tool would: a `manifest`
/// entry plus a `rootfs/` tree, owned by the current process so identity
/// extraction needs no privileges.
struct AciBuilder {
    manifest: serde_json::Value,
    files: Vec<(String, Vec<u8>)>,
}

impl AciBuilder {
    fn new(name: &str) -> Self {
        Self {
            manifest: json!({
                "acKind": "ImageManifest",
                "acVersion": "0.8.11",
                "name": name,
            }),
            files: Vec::new(),
        }
    }

    fn label(mut self, name: &str, value: &str) -> Self {
        let mut labels = self.manifest["labels"].as_array().cloned().unwrap_or_default();
        labels.push(json!({"name": name, "value": value}));
        self.manifest["labels"] = json!(labels);
        self
    }

    fn dependency(mut self, image_name: &str, image_id: &str) -> Self {
        let mut deps = self.manifest["dependencies"]
            .as_array()
            .cloned()
            .unwrap_or_default();
        deps.push(json!({"imageName": image_name, "imageID": image_id}));
        self.manifest["dependencies"] = json!(deps);
        self
    }

    fn file(mut self, path: &str, contents: &[u8]) -> Self {
        self.files.push((path.to_string(), contents.to_vec()));
        self
    }

    fn build(self) -> Result<Vec<u8>> {
        let (uid, gid) = current_ids();
        let mut builder = tar::Builder::new(Vec::new());

        let manifest = serde_json::to_vec(&self.manifest)?;
        let mut header = tar::Header::new_gnu();
        header.set_entry_type(tar::EntryType::Regular);
        header.set_mode(0o644);
        header.set_uid(uid);
        header.set_gid(gid);
        header.set_size(manifest.len() as u64);
        builder.append_data(&mut header, "manifest", manifest.as_slice())?;

        let mut dirs_seen = HashSet::new();
        for (path, contents) in &self.files {
            if let Some((dir_path, _)) = path.rsplit_once('/') {
                let mut parent = String::new();
                for part in dir_path.split('/') {
                    if !parent.is_empty() {
                        parent.push('/');
                    }
                    parent.push_str(part);
                    if dirs_seen.insert(parent.clone()) {
                        let mut header = tar::Header::new_gnu();
                        header.set_entry_type(tar::EntryType::Directory);
                        header.set_mode(0o755);
                        header.set_uid(uid);
                        header.set_gid(gid);
                        header.set_size(0);
                        builder.append_data(&mut header, parent.as_str(), io::empty())?;
                    }
                }
            }
            let mut header = tar::Header::new_gnu();
            header.set_entry_type(tar::EntryType::Regular);
            header.set_mode(0o644);
            header.set_uid(uid);
            header.set_gid(gid);
            header.set_size(contents.len() as u64);
            builder.append_data(&mut header, path.as_str(), contents.as_slice())?;
        }
        Ok(builder.into_inner()?)
    }

    fn build_gzipped(self) -> Result<Vec<u8>> {
        use std::io::Write as _;
        let tar = self.build()?;
        let mut encoder =
            flate2::write::GzEncoder::new(Vec::new(), flate2::Compression::default());
        encoder.write_all(&tar)?;
        Ok(encoder.finish()?)
    }
}

/// The key the store should derive for uncompressed image bytes.
fn expected_key(uncompressed: &[u8]) -> String {
    let digest = Sha512::digest(uncompressed);
    crate::keys::digest_to_key(&digest).expect("sha512 digests always convert")
}

/// Every path of an archive, the way the extractor names them, for use as
/// an all-inclusive file map.
fn full_file_map(archive: &[u8]) -> Result<HashSet<String>> {
    let mut map = HashSet::new();
    let mut archive = tar::Archive::new(archive);
    for entry in archive.entries()? {
        let entry = entry?;
        let path = entry.path()?.display().to_string();
        map.insert(path.trim_start_matches("./").trim_end_matches('/').to_string());
    }
    Ok(map)
}

/// A registry that hands back a fixed rendering sequence for any query.
struct StaticRegistry {
    entries: Vec<RenderedAci>,
}

impl ImageRegistry for StaticRegistry {
    fn rendered_by_id(&self, _key: &str) -> Result<Vec<RenderedAci>> {
        Ok(self.entries.clone())
    }

    fn rendered_by_name(&self, _name: &str, _labels: &[Label]) -> Result<Vec<RenderedAci>> {
        Ok(self.entries.clone())
    }

    fn rendered_from_list(&self, _keys: &[String]) -> Result<Vec<RenderedAci>> {
        Ok(self.entries.clone())
    }
}
