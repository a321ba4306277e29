//! Deterministic tar archive creation.
//!
//! Archives are a pure function of their input file set: entries sorted by
//! path, modification times fixed to the epoch, owner and group zeroed,
//! modes normalized, no extended headers, and gzip output without an
//! embedded timestamp. Archiving the same tree twice yields byte-identical
//! output, which is what keeps layer digests stable across rebuilds.

use std::io::Write;
use std::path::{Path, PathBuf};

use flate2::write::GzEncoder;
use flate2::Compression;
use tar::{Builder, EntryType, Header};

use kiln_core::error::Result;

/// Options for directory archiving.
#[derive(Debug, Clone, Default)]
pub struct ArchiveOptions {
    /// Gzip the archive (without embedding a timestamp).
    pub gzip: bool,
    /// Exclude patterns: a bare name matches any path component, `*.ext`
    /// matches by extension.
    pub exclude: Vec<String>,
}

enum ArchiveEntry {
    Dir { path: PathBuf },
    File { path: PathBuf, data: Vec<u8>, mode: u32 },
    Symlink { path: PathBuf, target: PathBuf },
}

/// Archive a directory tree deterministically.
pub fn archive_dir(src: &Path, options: &ArchiveOptions) -> Result<Vec<u8>> {
    let mut entries = Vec::new();
    collect(src, src, &options.exclude, &mut entries)?;
    entries.sort_by(|a, b| entry_path(a).cmp(entry_path(b)));
    write_archive(&entries, options.gzip)
}

/// Archive an in-memory file set deterministically (mode 0644).
pub fn archive_files(files: &[(&str, &[u8])], gzip: bool) -> Result<Vec<u8>> {
    let mut entries: Vec<ArchiveEntry> = files
        .iter()
        .map(|(path, data)| ArchiveEntry::File {
            path: PathBuf::from(path),
            data: data.to_vec(),
            mode: 0o644,
        })
        .collect();
    entries.sort_by(|a, b| entry_path(a).cmp(entry_path(b)));
    write_archive(&entries, gzip)
}

fn entry_path(entry: &ArchiveEntry) -> &PathBuf {
    match entry {
        ArchiveEntry::Dir { path } => path,
        ArchiveEntry::File { path, .. } => path,
        ArchiveEntry::Symlink { path, .. } => path,
    }
}

fn collect(
    root: &Path,
    current: &Path,
    exclude: &[String],
    entries: &mut Vec<ArchiveEntry>,
) -> Result<()> {
    for entry in std::fs::read_dir(current)? {
        let entry = entry?;
        let path = entry.path();
        let relative = path
            .strip_prefix(root)
            .expect("read_dir stays under its root")
            .to_path_buf();

        if excluded(&relative, exclude) {
            continue;
        }

        let metadata = std::fs::symlink_metadata(&path)?;
        if metadata.file_type().is_symlink() {
            entries.push(ArchiveEntry::Symlink {
                path: relative,
                target: std::fs::read_link(&path)?,
            });
        } else if metadata.is_dir() {
            entries.push(ArchiveEntry::Dir {
                path: relative,
            });
            collect(root, &path, exclude, entries)?;
        } else {
            entries.push(ArchiveEntry::File {
                path: relative,
                data: std::fs::read(&path)?,
                mode: normalized_mode(&metadata),
            });
        }
    }
    Ok(())
}

/// Executable files become 0755, everything else 0644. Host umask noise
/// must not leak into the archive bytes.
fn normalized_mode(metadata: &std::fs::Metadata) -> u32 {
    use std::os::unix::fs::PermissionsExt;
    if metadata.permissions().mode() & 0o111 != 0 {
        0o755
    } else {
        0o644
    }
}

fn excluded(path: &Path, patterns: &[String]) -> bool {
    for pattern in patterns {
        if let Some(ext) = pattern.strip_prefix("*.") {
            if path.extension().map(|e| e == ext).unwrap_or(false) {
                return true;
            }
        } else if path.iter().any(|component| component == pattern.as_str()) {
            return true;
        }
    }
    false
}

fn write_archive(entries: &[ArchiveEntry], gzip: bool) -> Result<Vec<u8>> {
    let mut builder = Builder::new(Vec::new());

    for entry in entries {
        match entry {
            ArchiveEntry::Dir { path } => {
                let mut header = base_header(EntryType::Directory, 0o755, 0);
                builder.append_data(&mut header, path, std::io::empty())?;
            }
            ArchiveEntry::File { path, data, mode } => {
                let mut header = base_header(EntryType::Regular, *mode, data.len() as u64);
                builder.append_data(&mut header, path, data.as_slice())?;
            }
            ArchiveEntry::Symlink { path, target } => {
                let mut header = base_header(EntryType::Symlink, 0o777, 0);
                builder.append_link(&mut header, path, target)?;
            }
        }
    }

    let bytes = builder.into_inner()?;
    if !gzip {
        return Ok(bytes);
    }

    // GzEncoder writes a header with mtime 0, so the compressed bytes stay
    // reproducible too.
    let mut encoder = GzEncoder::new(Vec::new(), Compression::default());
    encoder.write_all(&bytes)?;
    Ok(encoder.finish()?)
}

fn base_header(entry_type: EntryType, mode: u32, size: u64) -> Header {
    let mut header = Header::new_gnu();
    header.set_entry_type(entry_type);
    header.set_mode(mode);
    header.set_size(size);
    header.set_mtime(0);
    header.set_uid(0);
    header.set_gid(0);
    header
}
