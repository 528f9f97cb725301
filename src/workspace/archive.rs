//! Safe extraction of uploaded archives into a session workspace.
//!
//! ZIP and gzip-compressed tar are accepted. Every entry is validated before
//! anything touches disk:
//! - absolute paths, `..`, prefix and root components are rejected
//! - only regular files and directories are written (no links or devices)
//! - entry count and total extracted size are capped
//! - the canonical parent of each target must stay inside the destination
//! - the destination must still exist before each write

use super::error::{WorkspaceError, WorkspaceResult};
use flate2::read::GzDecoder;
use std::fs;
use std::io::{self, Cursor, Read};
use std::path::{Component, Path, PathBuf};
use tracing::debug;

/// Maximum number of entries allowed in an archive.
pub const MAX_ENTRY_COUNT: usize = 10_000;

/// Maximum total extracted size (500 MB).
pub const MAX_EXTRACTED_SIZE: u64 = 500_000_000;

/// Directory macOS adds to ZIP files; never extracted.
const MACOS_METADATA_DIR: &str = "__MACOSX";

const ZIP_MAGIC: &[&[u8]] = &[b"PK\x03\x04", b"PK\x05\x06"];
const GZIP_MAGIC: &[u8] = &[0x1f, 0x8b];

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ArchiveFormat {
    Zip,
    TarGz,
}

impl ArchiveFormat {
    /// Detect the archive format from its leading bytes
    pub fn detect(bytes: &[u8]) -> WorkspaceResult<Self> {
        if ZIP_MAGIC.iter().any(|magic| bytes.starts_with(magic)) {
            Ok(Self::Zip)
        } else if bytes.starts_with(GZIP_MAGIC) {
            Ok(Self::TarGz)
        } else {
            Err(WorkspaceError::archive_failed(
                "unsupported archive format (expected .zip or .tar.gz)",
            ))
        }
    }
}

#[derive(Debug, Clone, Copy)]
pub struct ExtractionLimits {
    pub max_entries: usize,
    pub max_total_bytes: u64,
}

impl Default for ExtractionLimits {
    fn default() -> Self {
        Self {
            max_entries: MAX_ENTRY_COUNT,
            max_total_bytes: MAX_EXTRACTED_SIZE,
        }
    }
}

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct ExtractionSummary {
    pub entries: usize,
    pub bytes: u64,
}

/// Extract `bytes` into the existing directory `dest`.
///
/// Malicious entry paths fail with [`WorkspaceError::PathEscape`]; every other
/// problem is [`WorkspaceError::ArchiveFailed`]. Partial output is left for
/// the caller to clear.
pub fn extract(
    bytes: &[u8],
    dest: &Path,
    limits: ExtractionLimits,
) -> WorkspaceResult<ExtractionSummary> {
    let dest = dest.canonicalize().map_err(|e| {
        WorkspaceError::archive_failed(format!("failed to canonicalize destination: {e}"))
    })?;

    let format = ArchiveFormat::detect(bytes)?;
    let mut extractor = Extractor {
        dest: &dest,
        limits,
        summary: ExtractionSummary::default(),
    };

    match format {
        ArchiveFormat::Zip => extractor.extract_zip(bytes)?,
        ArchiveFormat::TarGz => extractor.extract_tar_gz(bytes)?,
    }

    if extractor.summary.entries == 0 {
        return Err(WorkspaceError::archive_failed("archive is empty"));
    }

    debug!(
        "Extracted {} entries ({} bytes) into {}",
        extractor.summary.entries,
        extractor.summary.bytes,
        dest.display()
    );
    Ok(extractor.summary)
}

/// The single top-level directory of an extracted tree, if there is exactly one.
///
/// `__MACOSX` and dot entries are ignored. Any top-level file means the tree
/// is flat.
pub fn single_top_level_dir(dest: &Path) -> WorkspaceResult<Option<String>> {
    let entries = fs::read_dir(dest).map_err(|e| {
        WorkspaceError::io(format!("Failed to list {}", dest.display()), e)
    })?;

    let mut dirs = Vec::new();
    for entry in entries {
        let entry =
            entry.map_err(|e| WorkspaceError::io(format!("Failed to list {}", dest.display()), e))?;
        let name = entry.file_name().to_string_lossy().into_owned();
        if name == MACOS_METADATA_DIR || name.starts_with('.') {
            continue;
        }
        let file_type = entry.file_type().map_err(|e| {
            WorkspaceError::io(format!("Failed to stat {}", entry.path().display()), e)
        })?;
        if !file_type.is_dir() {
            return Ok(None);
        }
        dirs.push(name);
    }

    Ok(match dirs.len() {
        1 => dirs.pop(),
        _ => None,
    })
}

struct Extractor<'a> {
    dest: &'a Path,
    limits: ExtractionLimits,
    summary: ExtractionSummary,
}

impl Extractor<'_> {
    fn extract_zip(&mut self, bytes: &[u8]) -> WorkspaceResult<()> {
        let mut archive = zip::ZipArchive::new(Cursor::new(bytes))
            .map_err(|e| WorkspaceError::archive_failed(format!("invalid zip archive: {e}")))?;

        if archive.len() > self.limits.max_entries {
            return Err(self.too_many_entries());
        }

        for index in 0..archive.len() {
            let mut file = archive.by_index(index).map_err(|e| {
                WorkspaceError::archive_failed(format!("failed to read zip entry {index}: {e}"))
            })?;

            let raw_name = file.name().to_string();
            let entry_path = PathBuf::from(&raw_name);
            validate_entry_path(&entry_path)?;
            // enclosed_name rejects anything the component check above missed
            let entry_path = file
                .enclosed_name()
                .ok_or_else(|| WorkspaceError::path_escape(&raw_name))?;
            let entry_path = normalize(&entry_path);

            if is_macos_metadata(&entry_path) || entry_path.as_os_str().is_empty() {
                continue;
            }
            self.count_entry()?;

            if file.unix_mode().is_some_and(is_symlink_mode) {
                return Err(unsafe_entry("symlink", &raw_name));
            }

            let target = self.contained_target(&entry_path)?;
            if file.is_dir() {
                self.create_dir(&target)?;
                continue;
            }

            self.prepare_parent(&target)?;
            let mut output = fs::File::create(&target).map_err(|e| {
                WorkspaceError::archive_failed(format!("failed to create {raw_name}: {e}"))
            })?;
            self.copy_limited(&mut file, &mut output, &raw_name)?;
        }

        Ok(())
    }

    fn extract_tar_gz(&mut self, bytes: &[u8]) -> WorkspaceResult<()> {
        let mut archive = tar::Archive::new(GzDecoder::new(bytes));
        archive.set_preserve_permissions(false);
        archive.set_unpack_xattrs(false);

        let entries = archive.entries().map_err(|e| {
            WorkspaceError::archive_failed(format!("failed to read archive entries: {e}"))
        })?;

        for entry in entries {
            let mut entry = entry.map_err(|e| {
                WorkspaceError::archive_failed(format!("failed to read archive entry: {e}"))
            })?;

            let entry_path = entry
                .path()
                .map_err(|e| {
                    WorkspaceError::archive_failed(format!("failed to read entry path: {e}"))
                })?
                .into_owned();
            validate_entry_path(&entry_path)?;
            let entry_path = normalize(&entry_path);

            let entry_type = entry.header().entry_type();
            if matches!(
                entry_type,
                tar::EntryType::XHeader | tar::EntryType::XGlobalHeader | tar::EntryType::GNULongName
            ) {
                continue;
            }
            if !matches!(entry_type, tar::EntryType::Regular | tar::EntryType::Directory) {
                return Err(unsafe_entry(
                    &format!("{entry_type:?}"),
                    &entry_path.display().to_string(),
                ));
            }
            if is_macos_metadata(&entry_path) || entry_path.as_os_str().is_empty() {
                continue;
            }
            self.count_entry()?;

            let size = entry.header().size().map_err(|e| {
                WorkspaceError::archive_failed(format!("failed to read entry size: {e}"))
            })?;
            self.add_bytes(size)?;

            let target = self.contained_target(&entry_path)?;
            if entry_type == tar::EntryType::Directory {
                self.create_dir(&target)?;
                continue;
            }

            self.prepare_parent(&target)?;
            entry.unpack(&target).map_err(|e| {
                WorkspaceError::archive_failed(format!(
                    "failed to unpack {}: {e}",
                    entry_path.display()
                ))
            })?;
        }

        Ok(())
    }

    fn count_entry(&mut self) -> WorkspaceResult<()> {
        self.summary.entries = self.summary.entries.saturating_add(1);
        if self.summary.entries > self.limits.max_entries {
            return Err(self.too_many_entries());
        }
        Ok(())
    }

    fn add_bytes(&mut self, size: u64) -> WorkspaceResult<()> {
        self.summary.bytes = self.summary.bytes.saturating_add(size);
        if self.summary.bytes > self.limits.max_total_bytes {
            return Err(WorkspaceError::archive_failed(format!(
                "archive exceeds maximum extracted size ({} bytes)",
                self.limits.max_total_bytes
            )));
        }
        Ok(())
    }

    fn too_many_entries(&self) -> WorkspaceError {
        WorkspaceError::archive_failed(format!(
            "archive exceeds maximum entry count ({})",
            self.limits.max_entries
        ))
    }

    /// Copy at most the remaining size budget; declared sizes are not trusted
    fn copy_limited(
        &mut self,
        reader: &mut impl Read,
        writer: &mut impl io::Write,
        name: &str,
    ) -> WorkspaceResult<()> {
        let remaining = self.limits.max_total_bytes.saturating_sub(self.summary.bytes);
        let written = io::copy(&mut reader.take(remaining.saturating_add(1)), writer)
            .map_err(|e| WorkspaceError::archive_failed(format!("failed to write {name}: {e}")))?;
        self.add_bytes(written)
    }

    /// Join an entry path onto the destination, verifying containment
    fn contained_target(&self, entry_path: &Path) -> WorkspaceResult<PathBuf> {
        let target = self.dest.join(entry_path);
        let escape = || WorkspaceError::path_escape(entry_path.display());

        // A parent that already exists may be a symlink; resolve and re-check it
        if let Some(canonical_parent) = target.parent().and_then(|p| p.canonicalize().ok()) {
            let file_name = target.file_name().ok_or_else(escape)?;
            if !canonical_parent.join(file_name).starts_with(self.dest) {
                return Err(escape());
            }
        }
        if target == self.dest {
            return Err(escape());
        }
        Ok(target)
    }

    fn ensure_destination(&self) -> WorkspaceResult<()> {
        if self.dest.is_dir() {
            Ok(())
        } else {
            Err(WorkspaceError::archive_failed(
                "workspace was removed during extraction",
            ))
        }
    }

    fn create_dir(&self, target: &Path) -> WorkspaceResult<()> {
        self.ensure_destination()?;
        fs::create_dir_all(target).map_err(|e| {
            WorkspaceError::archive_failed(format!(
                "failed to create directory {}: {e}",
                target.display()
            ))
        })
    }

    fn prepare_parent(&self, target: &Path) -> WorkspaceResult<()> {
        match target.parent() {
            Some(parent) => self.create_dir(parent),
            None => self.ensure_destination(),
        }
    }
}

/// Reject absolute paths and components that could leave the destination
fn validate_entry_path(path: &Path) -> WorkspaceResult<()> {
    if path.is_absolute() {
        return Err(WorkspaceError::path_escape(path.display()));
    }
    let bytes = path.as_os_str().as_encoded_bytes();
    if bytes.contains(&0) || bytes.starts_with(b"/") || bytes.starts_with(b"\\") {
        return Err(WorkspaceError::path_escape(path.display()));
    }

    for component in path.components() {
        if matches!(
            component,
            Component::ParentDir | Component::Prefix(_) | Component::RootDir
        ) {
            return Err(WorkspaceError::path_escape(path.display()));
        }
    }
    Ok(())
}

/// Drop `.` components so `./src/x` and `src/x` land in the same place
fn normalize(path: &Path) -> PathBuf {
    path.components()
        .filter(|component| matches!(component, Component::Normal(_)))
        .collect()
}

fn is_macos_metadata(path: &Path) -> bool {
    matches!(
        path.components().next(),
        Some(Component::Normal(first)) if first == MACOS_METADATA_DIR
    )
}

fn is_symlink_mode(mode: u32) -> bool {
    mode & 0o170000 == 0o120000
}

fn unsafe_entry(kind: &str, path: &str) -> WorkspaceError {
    WorkspaceError::archive_failed(format!("unsupported {kind} entry: {path}"))
}

#[cfg(test)]
pub(crate) mod test_support {
    use std::io::{Cursor, Write};

    /// Build an in-memory ZIP from `(path, contents)` pairs; paths ending in `/` are directories
    pub fn zip_bytes(entries: &[(&str, &str)]) -> Vec<u8> {
        let mut writer = zip::ZipWriter::new(Cursor::new(Vec::new()));
        let options = zip::write::SimpleFileOptions::default();
        for (path, contents) in entries {
            if path.ends_with('/') {
                writer.add_directory(*path, options).unwrap();
            } else {
                writer.start_file(*path, options).unwrap();
                writer.write_all(contents.as_bytes()).unwrap();
            }
        }
        writer.finish().unwrap().into_inner()
    }

    /// Build an in-memory tar.gz from `(path, contents)` pairs
    pub fn tar_gz_bytes(entries: &[(&str, &str)]) -> Vec<u8> {
        let encoder = flate2::write::GzEncoder::new(Vec::new(), flate2::Compression::fast());
        let mut builder = tar::Builder::new(encoder);
        for (path, contents) in entries {
            let mut header = tar::Header::new_gnu();
            header.set_size(contents.len() as u64);
            header.set_mode(0o644);
            header.set_cksum();
            builder
                .append_data(&mut header, *path, contents.as_bytes())
                .unwrap();
        }
        builder.into_inner().unwrap().finish().unwrap()
    }
}
