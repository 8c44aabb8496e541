//! Tar extraction under a constrained permission and ownership model.
//!
//! The extractor is deliberately strict: entry paths must stay inside the
//! destination, links may not point out of it, and owner ids are remapped
//! through a [`UidRange`] before anything is chowned.

use std::collections::HashSet;
use std::fs::{self, OpenOptions};
use std::io::{self, Read};
use std::path::{Component, Path, PathBuf};

use anyhow::{anyhow, Context, Result};
use tar::{Archive, Entry, EntryType};
use tracing::debug;

use crate::error::StoreError;
use crate::uid::UidRange;

/// Extract `archive` into `dest`.
///
/// When `overwrite` is false an existing destination file or link fails the
/// extraction (existing directories are tolerated, since parents are shared
/// between entries). `file_map`, when present, names the only paths that
/// are materialized. Owner and group ids are remapped through `uid_range`.
pub fn extract_tar<R: Read>(
    archive: R,
    dest: &Path,
    overwrite: bool,
    uid_range: &UidRange,
    file_map: Option<&HashSet<String>>,
) -> Result<()> {
    fs::create_dir_all(dest)
        .with_context(|| format!("failed to create extraction root {}", dest.display()))?;
    let dest = fs::canonicalize(dest)
        .with_context(|| format!("failed to canonicalize {}", dest.display()))?;

    let mut archive = Archive::new(archive);
    for entry in archive.entries().context("failed to read archive")? {
        let mut entry = entry.context("failed to read archive entry")?;
        let raw_path = entry
            .path()
            .context("failed to read archive entry path")?
            .into_owned();
        let name = normalize_entry_name(&raw_path)?;
        if let Some(map) = file_map {
            if !map.contains(&name) {
                continue;
            }
        }
        extract_entry(&mut entry, &dest, &name, overwrite, uid_range)
            .with_context(|| format!("failed to extract {name}"))?;
    }
    Ok(())
}

fn extract_entry<R: Read>(
    entry: &mut Entry<'_, R>,
    dest: &Path,
    name: &str,
    overwrite: bool,
    uid_range: &UidRange,
) -> Result<()> {
    let target = dest.join(name);
    match entry.header().entry_type() {
        EntryType::Directory => {
            fs::create_dir_all(&target)?;
        }
        EntryType::Regular | EntryType::Continuous | EntryType::GNUSparse => {
            ensure_parent(&target)?;
            let mut file = open_destination(&target, overwrite)?;
            io::copy(entry, &mut file)?;
        }
        EntryType::Symlink => {
            let link_target = entry
                .link_name()?
                .ok_or_else(|| anyhow!("symlink entry has no target"))?
                .into_owned();
            check_link_target(dest, name, &link_target)?;
            ensure_parent(&target)?;
            place_symlink(&link_target, &target, overwrite)?;
            // Ownership applies to the link itself, nothing else does.
            apply_link_ownership(entry, &target, uid_range)?;
            return Ok(());
        }
        EntryType::Link => {
            let original = entry
                .link_name()?
                .ok_or_else(|| anyhow!("hard link entry has no target"))?
                .into_owned();
            let original = normalize_entry_name(&original)?;
            ensure_parent(&target)?;
            match fs::hard_link(dest.join(&original), &target) {
                Ok(()) => {}
                Err(err) if err.kind() == io::ErrorKind::AlreadyExists => {
                    if !overwrite {
                        return Err(StoreError::RenderOverwrite(target).into());
                    }
                    fs::remove_file(&target)?;
                    fs::hard_link(dest.join(&original), &target)?;
                }
                Err(err) => return Err(err.into()),
            }
            // The link shares the target's inode, but the entry's own
            // owner fields still go through the remap.
            apply_link_ownership(entry, &target, uid_range)?;
            return Ok(());
        }
        other => {
            debug!(?other, entry = name, "skipping unsupported archive entry");
            return Ok(());
        }
    }
    apply_metadata(entry, &target, uid_range)
}

fn ensure_parent(target: &Path) -> Result<()> {
    if let Some(parent) = target.parent() {
        fs::create_dir_all(parent)
            .with_context(|| format!("failed to create {}", parent.display()))?;
    }
    Ok(())
}

fn open_destination(target: &Path, overwrite: bool) -> Result<fs::File> {
    let mut options = OpenOptions::new();
    options.write(true);
    if overwrite {
        options.create(true).truncate(true);
    } else {
        options.create_new(true);
    }
    match options.open(target) {
        Ok(file) => Ok(file),
        Err(err) if err.kind() == io::ErrorKind::AlreadyExists => {
            Err(StoreError::RenderOverwrite(target.to_path_buf()).into())
        }
        Err(err) => {
            Err(err).with_context(|| format!("failed to create {}", target.display()))
        }
    }
}

fn place_symlink(link_target: &Path, target: &Path, overwrite: bool) -> Result<()> {
    #[cfg(unix)]
    {
        match std::os::unix::fs::symlink(link_target, target) {
            Ok(()) => Ok(()),
            Err(err) if err.kind() == io::ErrorKind::AlreadyExists => {
                if !overwrite {
                    return Err(StoreError::RenderOverwrite(target.to_path_buf()).into());
                }
                fs::remove_file(target)?;
                std::os::unix::fs::symlink(link_target, target)
                    .with_context(|| format!("failed to create symlink {}", target.display()))
            }
            Err(err) => {
                Err(err).with_context(|| format!("failed to create symlink {}", target.display()))
            }
        }
    }
    #[cfg(not(unix))]
    {
        let _ = (link_target, target, overwrite);
        Err(anyhow!("symlink extraction is only supported on unix"))
    }
}

fn apply_metadata<R: Read>(
    entry: &Entry<'_, R>,
    target: &Path,
    uid_range: &UidRange,
) -> Result<()> {
    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;

        let mode = entry.header().mode().context("bad mode in header")?;
        fs::set_permissions(target, fs::Permissions::from_mode(mode & 0o7777))
            .with_context(|| format!("failed to set mode on {}", target.display()))?;

        let uid = uid_range.remap(entry.header().uid().context("bad uid in header")?)?;
        let gid = uid_range.remap(entry.header().gid().context("bad gid in header")?)?;
        std::os::unix::fs::chown(target, Some(uid as u32), Some(gid as u32))
            .with_context(|| format!("failed to chown {}", target.display()))?;
    }
    #[cfg(not(unix))]
    let _ = (entry, target, uid_range);
    Ok(())
}

fn apply_link_ownership<R: Read>(
    entry: &Entry<'_, R>,
    target: &Path,
    uid_range: &UidRange,
) -> Result<()> {
    #[cfg(unix)]
    {
        let uid = uid_range.remap(entry.header().uid().context("bad uid in header")?)?;
        let gid = uid_range.remap(entry.header().gid().context("bad gid in header")?)?;
        std::os::unix::fs::lchown(target, Some(uid as u32), Some(gid as u32))
            .with_context(|| format!("failed to chown {}", target.display()))?;
    }
    #[cfg(not(unix))]
    let _ = (entry, target, uid_range);
    Ok(())
}

/// Reduce an archive path to a clean relative name. Absolute paths and any
/// `..` component are rejected outright.
fn normalize_entry_name(path: &Path) -> Result<String> {
    let mut parts: Vec<&str> = Vec::new();
    for comp in path.components() {
        match comp {
            Component::CurDir => {}
            Component::Normal(part) => {
                let part = part
                    .to_str()
                    .ok_or_else(|| anyhow!("archive entry path is not valid UTF-8"))?;
                parts.push(part);
            }
            Component::ParentDir | Component::RootDir | Component::Prefix(_) => {
                return Err(anyhow!(
                    "archive entry path escapes the destination: {}",
                    path.display()
                ));
            }
        }
    }
    if parts.is_empty() {
        return Err(anyhow!("archive entry path is empty"));
    }
    Ok(parts.join("/"))
}

/// Verify that a symlink placed at `name` pointing to `link_target` still
/// normalizes to a descendant of `dest`.
fn check_link_target(dest: &Path, name: &str, link_target: &Path) -> Result<()> {
    let escape = || {
        anyhow!(
            "link target {} escapes the destination root",
            link_target.display()
        )
    };
    if link_target.is_absolute() {
        return Err(escape());
    }
    let mut resolved = dest.to_path_buf();
    if let Some((parent, _)) = name.rsplit_once('/') {
        resolved.push(parent);
    }
    for comp in link_target.components() {
        match comp {
            Component::CurDir => {}
            Component::Normal(part) => resolved.push(part),
            Component::ParentDir => {
                if resolved == dest || !resolved.pop() {
                    return Err(escape());
                }
            }
            Component::RootDir | Component::Prefix(_) => return Err(escape()),
        }
    }
    if resolved.starts_with(dest) {
        Ok(())
    } else {
        Err(escape())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    fn current_ids() -> (u64, u64) {
        #[cfg(unix)]
        {
            use std::os::unix::fs::MetadataExt;
            let meta = fs::metadata(std::env::temp_dir()).expect("temp dir metadata");
            // Use the actual process ownership so chown-to-self succeeds
            // without privileges.
            let probe = tempfile::NamedTempFile::new().expect("probe file");
            let meta = probe.as_file().metadata().unwrap_or(meta);
            (meta.uid() as u64, meta.gid() as u64)
        }
        #[cfg(not(unix))]
        {
            (0, 0)
        }
    }

    struct TarBuilder {
        inner: tar::Builder<Vec<u8>>,
        uid: u64,
        gid: u64,
    }

    impl TarBuilder {
        fn new() -> Self {
            let (uid, gid) = current_ids();
            Self {
                inner: tar::Builder::new(Vec::new()),
                uid,
                gid,
            }
        }

        fn header(&self, entry_type: EntryType, size: u64, mode: u32) -> tar::Header {
            let mut header = tar::Header::new_gnu();
            header.set_entry_type(entry_type);
            header.set_size(size);
            header.set_mode(mode);
            header.set_uid(self.uid);
            header.set_gid(self.gid);
            header
        }

        fn dir(&mut self, path: &str) -> Result<&mut Self> {
            let mut header = self.header(EntryType::Directory, 0, 0o755);
            self.inner.append_data(&mut header, path, io::empty())?;
            Ok(self)
        }

        fn file(&mut self, path: &str, contents: &[u8]) -> Result<&mut Self> {
            let mut header = self.header(EntryType::Regular, contents.len() as u64, 0o644);
            self.inner.append_data(&mut header, path, contents)?;
            Ok(self)
        }

        fn symlink(&mut self, path: &str, target: &str) -> Result<&mut Self> {
            let mut header = self.header(EntryType::Symlink, 0, 0o777);
            header.set_link_name(target)?;
            self.inner.append_data(&mut header, path, io::empty())?;
            Ok(self)
        }

        fn hard_link(&mut self, path: &str, target: &str) -> Result<&mut Self> {
            let mut header = self.header(EntryType::Link, 0, 0o644);
            header.set_link_name(target)?;
            self.inner.append_data(&mut header, path, io::empty())?;
            Ok(self)
        }

        fn finish(self) -> Result<Vec<u8>> {
            Ok(self.inner.into_inner()?)
        }
    }

    #[test]
    fn extracts_files_dirs_and_links() -> Result<()> {
        let mut tar = TarBuilder::new();
        tar.dir("rootfs")?
            .dir("rootfs/etc")?
            .file("rootfs/etc/hostname", b"quenya")?
            .symlink("rootfs/etc/alias", "hostname")?
            .hard_link("rootfs/etc/hostname2", "rootfs/etc/hostname")?;
        let bytes = tar.finish()?;

        let dest = tempdir()?;
        extract_tar(
            bytes.as_slice(),
            dest.path(),
            false,
            &UidRange::identity(),
            None,
        )?;

        let root = dest.path();
        assert_eq!(fs::read(root.join("rootfs/etc/hostname"))?, b"quenya");
        assert_eq!(fs::read(root.join("rootfs/etc/hostname2"))?, b"quenya");
        #[cfg(unix)]
        assert_eq!(
            fs::read_link(root.join("rootfs/etc/alias"))?,
            PathBuf::from("hostname")
        );
        Ok(())
    }

    #[test]
    fn file_map_gates_what_is_materialized() -> Result<()> {
        let mut tar = TarBuilder::new();
        tar.dir("rootfs")?
            .file("rootfs/keep", b"keep")?
            .file("rootfs/skip", b"skip")?;
        let bytes = tar.finish()?;

        let map: HashSet<String> = ["rootfs".to_string(), "rootfs/keep".to_string()]
            .into_iter()
            .collect();
        let dest = tempdir()?;
        extract_tar(
            bytes.as_slice(),
            dest.path(),
            false,
            &UidRange::identity(),
            Some(&map),
        )?;

        assert!(dest.path().join("rootfs/keep").is_file());
        assert!(!dest.path().join("rootfs/skip").exists());
        Ok(())
    }

    #[test]
    fn refuses_to_overwrite_existing_files() -> Result<()> {
        let mut tar = TarBuilder::new();
        tar.file("collide", b"second")?;
        let bytes = tar.finish()?;

        let dest = tempdir()?;
        fs::write(dest.path().join("collide"), b"first")?;
        let err = extract_tar(
            bytes.as_slice(),
            dest.path(),
            false,
            &UidRange::identity(),
            None,
        )
        .unwrap_err();
        assert!(
            err.chain().any(|cause| {
                cause
                    .downcast_ref::<StoreError>()
                    .is_some_and(|e| matches!(e, StoreError::RenderOverwrite(_)))
            }),
            "expected an overwrite refusal, got: {err:#}"
        );
        assert_eq!(fs::read(dest.path().join("collide"))?, b"first");
        Ok(())
    }

    #[test]
    fn overwrite_mode_replaces_files() -> Result<()> {
        let mut tar = TarBuilder::new();
        tar.file("collide", b"second")?;
        let bytes = tar.finish()?;

        let dest = tempdir()?;
        fs::write(dest.path().join("collide"), b"first")?;
        extract_tar(
            bytes.as_slice(),
            dest.path(),
            true,
            &UidRange::identity(),
            None,
        )?;
        assert_eq!(fs::read(dest.path().join("collide"))?, b"second");
        Ok(())
    }

    #[cfg(unix)]
    #[test]
    fn rejects_symlinks_escaping_the_destination() -> Result<()> {
        for target in ["../../outside", "/etc/passwd"] {
            let mut tar = TarBuilder::new();
            tar.dir("rootfs")?.symlink("rootfs/evil", target)?;
            let bytes = tar.finish()?;

            let dest = tempdir()?;
            let err = extract_tar(
                bytes.as_slice(),
                dest.path(),
                false,
                &UidRange::identity(),
                None,
            )
            .unwrap_err();
            assert!(
                format!("{err:#}").contains("escapes"),
                "expected an escape refusal for {target:?}, got: {err:#}"
            );
            assert!(!dest.path().join("rootfs/evil").exists());
        }
        Ok(())
    }

    #[test]
    fn rejects_entry_paths_with_parent_components() -> Result<()> {
        let mut builder = tar::Builder::new(Vec::new());
        let mut header = tar::Header::new_gnu();
        header.set_entry_type(EntryType::Regular);
        header.set_size(4);
        header.set_mode(0o644);
        builder.append_data(&mut header, "up/../../evil", &b"evil"[..])?;
        let bytes = builder.into_inner()?;

        let dest = tempdir()?;
        let err = extract_tar(
            bytes.as_slice(),
            dest.path(),
            false,
            &UidRange::identity(),
            None,
        )
        .unwrap_err();
        assert!(format!("{err:#}").contains("escapes"));
        Ok(())
    }

    #[cfg(unix)]
    #[test]
    fn out_of_range_owner_ids_fail_extraction() -> Result<()> {
        let mut tar = TarBuilder::new();
        tar.file("owned", b"x")?;
        let bytes = tar.finish()?;

        // Any real uid sits past a zero-sized (non-identity) range.
        let range = UidRange::new(100_000, 0);
        let dest = tempdir()?;
        let err = extract_tar(bytes.as_slice(), dest.path(), false, &range, None).unwrap_err();
        assert!(
            err.chain().any(|cause| {
                cause
                    .downcast_ref::<StoreError>()
                    .is_some_and(|e| matches!(e, StoreError::UidRange { .. }))
            }),
            "expected a uid range refusal, got: {err:#}"
        );
        Ok(())
    }

    #[cfg(unix)]
    #[test]
    fn out_of_range_owner_ids_fail_hard_link_entries() -> Result<()> {
        let mut tar = TarBuilder::new();
        tar.file("original", b"x")?;
        let mut header = tar.header(EntryType::Link, 0, 0o644);
        header.set_uid(2_000_000);
        header.set_gid(2_000_000);
        header.set_link_name("original")?;
        tar.inner.append_data(&mut header, "alias", io::empty())?;
        let bytes = tar.finish()?;

        // Wide enough to pass the regular entry's real ids through
        // unshifted, so only the link's owner fields can fail.
        let range = UidRange::new(0, 1_000_000);
        let dest = tempdir()?;
        let err = extract_tar(bytes.as_slice(), dest.path(), false, &range, None).unwrap_err();
        assert!(
            err.chain().any(|cause| {
                cause
                    .downcast_ref::<StoreError>()
                    .is_some_and(|e| matches!(e, StoreError::UidRange { id: 2_000_000, .. }))
            }),
            "expected a uid range refusal for the link entry, got: {err:#}"
        );
        Ok(())
    }

    #[test]
    fn preserves_file_modes() -> Result<()> {
        let mut tar = TarBuilder::new();
        let mut header = tar.header(EntryType::Regular, 3, 0o755);
        tar.inner.append_data(&mut header, "bin/run", &b"#!x"[..])?;
        let bytes = tar.finish()?;

        let dest = tempdir()?;
        extract_tar(
            bytes.as_slice(),
            dest.path(),
            false,
            &UidRange::identity(),
            None,
        )?;
        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            let mode = fs::metadata(dest.path().join("bin/run"))?.permissions().mode();
            assert_eq!(mode & 0o777, 0o755);
        }
        Ok(())
    }

    #[test]
    fn writer_helper_roundtrip() -> Result<()> {
        // Keep the helper honest: it must produce archives `tar` can list.
        let mut tar = TarBuilder::new();
        tar.file("a", b"1")?.file("b", b"2")?;
        let bytes = tar.finish()?;
        let mut names = Vec::new();
        let mut archive = Archive::new(bytes.as_slice());
        for entry in archive.entries()? {
            names.push(entry?.path()?.display().to_string());
        }
        assert_eq!(names, vec!["a", "b"]);
        Ok(())
    }
}
