//! Content-addressed snapshot store.
//!
//! Blobs are stored by SHA-256 in a two-level directory hierarchy to avoid
//! filesystem limits on very large directories. A `Snapshot` is a sorted
//! list of entries (files, directories, symlinks) identified by a
//! `TreeDigest`, the SHA-256 of its canonical encoding. Snapshots are
//! immutable: capture, merge and materialize all produce or consume them
//! without ever mutating stored content, which is what lets unrelated
//! concurrent builds share one store without locking.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

use kiln_core::error::{KilnError, Result};

/// Identifier for an immutable file tree: SHA-256 of the canonical
/// snapshot encoding, as a hex string.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct TreeDigest(String);

impl TreeDigest {
    /// Create from a hex string, validating shape.
    pub fn from_hex(hex: impl Into<String>) -> Result<Self> {
        let s = hex.into();
        if s.len() != 64 || !s.chars().all(|c| c.is_ascii_hexdigit()) {
            return Err(KilnError::Store(format!(
                "tree digest must be 64 hex characters, got `{s}`"
            )));
        }
        Ok(Self(s))
    }

    pub fn as_hex(&self) -> &str {
        &self.0
    }

    /// Shortened prefix for log lines and derived names.
    pub fn short(&self) -> &str {
        &self.0[..12]
    }
}

impl std::fmt::Display for TreeDigest {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// The kind of a snapshot entry.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EntryKind {
    File,
    Dir,
    Symlink { target: PathBuf },
}

/// One entry in a snapshot.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FileEntry {
    /// Path relative to the snapshot root
    pub path: PathBuf,
    /// Blob hash for files; empty for directories and symlinks
    pub blob: String,
    /// Unix mode bits (permissions only)
    pub mode: u32,
    pub kind: EntryKind,
}

/// An immutable, content-addressed view of a file tree.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Snapshot {
    pub digest: TreeDigest,
    /// Entries sorted by path
    pub entries: Vec<FileEntry>,
}

impl Snapshot {
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Look up an entry by relative path.
    pub fn entry(&self, path: impl AsRef<Path>) -> Option<&FileEntry> {
        let path = path.as_ref();
        self.entries.iter().find(|e| e.path == path)
    }
}

/// Disk-backed content-addressed store.
///
/// Layout:
///
/// ```text
/// <root>/blobs/sha256/ab/cd/abcdef...   # file contents
/// <root>/trees/<tree digest>.json       # snapshot manifests
/// ```
#[derive(Debug, Clone)]
pub struct Store {
    root: PathBuf,
}

impl Store {
    /// Open (or initialize) a store rooted at the given directory.
    pub fn open(root: impl Into<PathBuf>) -> Result<Self> {
        let root = root.into();
        std::fs::create_dir_all(root.join("blobs").join("sha256"))?;
        std::fs::create_dir_all(root.join("trees"))?;
        Ok(Self { root })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    fn blob_path(&self, hex: &str) -> PathBuf {
        self.root
            .join("blobs")
            .join("sha256")
            .join(&hex[0..2])
            .join(&hex[2..4])
            .join(hex)
    }

    fn tree_path(&self, digest: &TreeDigest) -> PathBuf {
        self.root.join("trees").join(format!("{}.json", digest.as_hex()))
    }

    /// Store a blob, returning its hash. Writing an existing blob is a no-op.
    pub fn put_blob(&self, data: &[u8]) -> Result<String> {
        let hex = hex::encode(Sha256::digest(data));
        let path = self.blob_path(&hex);
        if path.exists() {
            return Ok(hex);
        }
        let dir = path.parent().expect("blob paths have a parent directory");
        std::fs::create_dir_all(dir)?;
        // Each writer stages into its own uniquely named temp file, so
        // concurrent puts of the same blob each rename a complete copy.
        let tmp = tempfile::NamedTempFile::new_in(dir)
            .map_err(|e| KilnError::Store(format!("failed to stage blob {hex}: {e}")))?;
        std::fs::write(tmp.path(), data)?;
        tmp.persist(&path)
            .map_err(|e| KilnError::Store(format!("failed to persist blob {hex}: {e}")))?;
        Ok(hex)
    }

    fn read_blob(&self, hex: &str) -> Result<Vec<u8>> {
        let path = self.blob_path(hex);
        std::fs::read(&path)
            .map_err(|e| KilnError::Store(format!("missing blob {hex}: {e}")))
    }

    /// Capture a directory tree into the store.
    pub fn capture(&self, dir: &Path) -> Result<Snapshot> {
        let mut entries = Vec::new();
        self.capture_into(dir, dir, &mut entries)?;
        entries.sort_by(|a, b| a.path.cmp(&b.path));
        self.seal(entries)
    }

    fn capture_into(&self, root: &Path, current: &Path, entries: &mut Vec<FileEntry>) -> Result<()> {
        for entry in std::fs::read_dir(current)? {
            let entry = entry?;
            let path = entry.path();
            let relative = path
                .strip_prefix(root)
                .map_err(|e| KilnError::Store(format!("path escaped capture root: {e}")))?
                .to_path_buf();

            let metadata = std::fs::symlink_metadata(&path)?;
            let mode = permissions(&metadata);

            if metadata.file_type().is_symlink() {
                let target = std::fs::read_link(&path)?;
                entries.push(FileEntry {
                    path: relative,
                    blob: String::new(),
                    mode: 0o777,
                    kind: EntryKind::Symlink { target },
                });
            } else if metadata.is_dir() {
                entries.push(FileEntry {
                    path: relative,
                    blob: String::new(),
                    mode,
                    kind: EntryKind::Dir,
                });
                self.capture_into(root, &path, entries)?;
            } else {
                let data = std::fs::read(&path)?;
                let blob = self.put_blob(&data)?;
                entries.push(FileEntry {
                    path: relative,
                    blob,
                    mode,
                    kind: EntryKind::File,
                });
            }
        }
        Ok(())
    }

    /// Build a snapshot from in-memory file contents (mode 0644).
    pub fn snapshot_from_files(&self, files: &[(&str, &[u8])]) -> Result<Snapshot> {
        let mut entries = Vec::new();
        for (path, data) in files {
            let blob = self.put_blob(data)?;
            entries.push(FileEntry {
                path: PathBuf::from(path),
                blob,
                mode: 0o644,
                kind: EntryKind::File,
            });
        }
        entries.sort_by(|a, b| a.path.cmp(&b.path));
        self.seal(entries)
    }

    /// Compute the tree digest for a sorted entry list and persist the
    /// snapshot manifest.
    fn seal(&self, entries: Vec<FileEntry>) -> Result<Snapshot> {
        let mut hasher = Sha256::new();
        for entry in &entries {
            let (tag, detail) = match &entry.kind {
                EntryKind::File => ("f", entry.blob.clone()),
                EntryKind::Dir => ("d", String::new()),
                EntryKind::Symlink { target } => ("l", target.to_string_lossy().into_owned()),
            };
            hasher.update(
                format!("{tag} {:06o} {detail} {}\n", entry.mode, entry.path.display()).as_bytes(),
            );
        }
        let digest = TreeDigest(hex::encode(hasher.finalize()));

        let snapshot = Snapshot {
            digest: digest.clone(),
            entries,
        };
        let manifest = self.tree_path(&digest);
        if !manifest.exists() {
            let data = serde_json::to_vec(&snapshot)?;
            let tmp = tempfile::NamedTempFile::new_in(self.root.join("trees"))
                .map_err(|e| KilnError::Store(format!("failed to stage tree {digest}: {e}")))?;
            std::fs::write(tmp.path(), data)?;
            tmp.persist(&manifest)
                .map_err(|e| KilnError::Store(format!("failed to persist tree {digest}: {e}")))?;
        }
        Ok(snapshot)
    }

    /// Load a previously sealed snapshot by digest.
    pub fn load(&self, digest: &TreeDigest) -> Result<Snapshot> {
        let path = self.tree_path(digest);
        let data = std::fs::read(&path)
            .map_err(|e| KilnError::Store(format!("unknown tree {digest}: {e}")))?;
        Ok(serde_json::from_slice(&data)?)
    }

    /// Set-union merge of snapshots. Entries with the same path must be
    /// identical; diverging content is an error rather than a silent pick.
    pub fn merge(&self, digests: &[&TreeDigest]) -> Result<Snapshot> {
        let mut merged: BTreeMap<PathBuf, FileEntry> = BTreeMap::new();
        for &digest in digests {
            let snapshot = self.load(digest)?;
            for entry in snapshot.entries {
                match merged.get(&entry.path) {
                    None => {
                        merged.insert(entry.path.clone(), entry);
                    }
                    Some(existing) if existing.blob == entry.blob && existing.kind == entry.kind => {}
                    Some(_) => {
                        return Err(KilnError::Store(format!(
                            "conflicting entry `{}` while merging snapshots",
                            entry.path.display()
                        )));
                    }
                }
            }
        }
        self.seal(merged.into_values().collect())
    }

    /// Write a snapshot's tree out to a destination directory.
    pub fn materialize(&self, digest: &TreeDigest, dest: &Path) -> Result<()> {
        use std::os::unix::fs::PermissionsExt;

        let snapshot = self.load(digest)?;
        std::fs::create_dir_all(dest)?;
        for entry in &snapshot.entries {
            let path = dest.join(&entry.path);
            match &entry.kind {
                EntryKind::Dir => {
                    std::fs::create_dir_all(&path)?;
                    std::fs::set_permissions(&path, std::fs::Permissions::from_mode(entry.mode))?;
                }
                EntryKind::File => {
                    if let Some(parent) = path.parent() {
                        std::fs::create_dir_all(parent)?;
                    }
                    let data = self.read_blob(&entry.blob)?;
                    std::fs::write(&path, data)?;
                    std::fs::set_permissions(&path, std::fs::Permissions::from_mode(entry.mode))?;
                }
                EntryKind::Symlink { target } => {
                    if let Some(parent) = path.parent() {
                        std::fs::create_dir_all(parent)?;
                    }
                    if path.exists() || std::fs::symlink_metadata(&path).is_ok() {
                        std::fs::remove_file(&path)?;
                    }
                    std::os::unix::fs::symlink(target, &path)?;
                }
            }
        }
        Ok(())
    }

    /// Read a single file's contents out of a snapshot without
    /// materializing the whole tree.
    pub fn read_file(&self, digest: &TreeDigest, path: impl AsRef<Path>) -> Result<Option<Vec<u8>>> {
        let snapshot = self.load(digest)?;
        match snapshot.entry(path) {
            Some(entry) if matches!(entry.kind, EntryKind::File) => {
                Ok(Some(self.read_blob(&entry.blob)?))
            }
            _ => Ok(None),
        }
    }
}

fn permissions(metadata: &std::fs::Metadata) -> u32 {
    use std::os::unix::fs::PermissionsExt;
    metadata.permissions().mode() & 0o7777
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;
    use std::os::unix::fs::PermissionsExt;
    use tempfile::TempDir;

    fn test_store() -> (TempDir, Store) {
        let tmp = TempDir::new().unwrap();
        let store = Store::open(tmp.path().join("store")).unwrap();
        (tmp, store)
    }

    #[test]
    fn test_capture_and_materialize_roundtrip() {
        let (tmp, store) = test_store();
        let src = tmp.path().join("src");
        fs::create_dir_all(src.join("sub")).unwrap();
        fs::write(src.join("a.txt"), "hello").unwrap();
        fs::write(src.join("sub/b.txt"), "world").unwrap();

        let snapshot = store.capture(&src).unwrap();
        assert_eq!(snapshot.entries.len(), 3);

        let dest = tmp.path().join("dest");
        store.materialize(&snapshot.digest, &dest).unwrap();
        assert_eq!(fs::read_to_string(dest.join("a.txt")).unwrap(), "hello");
        assert_eq!(fs::read_to_string(dest.join("sub/b.txt")).unwrap(), "world");
    }

    #[test]
    fn test_capture_preserves_exec_bit() {
        let (tmp, store) = test_store();
        let src = tmp.path().join("src");
        fs::create_dir_all(&src).unwrap();
        let bin = src.join("tool");
        fs::write(&bin, "#!/bin/sh\n").unwrap();
        fs::set_permissions(&bin, fs::Permissions::from_mode(0o755)).unwrap();

        let snapshot = store.capture(&src).unwrap();
        let dest = tmp.path().join("dest");
        store.materialize(&snapshot.digest, &dest).unwrap();

        let mode = fs::metadata(dest.join("tool")).unwrap().permissions().mode();
        assert_eq!(mode & 0o111, 0o111);
    }

    #[test]
    fn test_capture_preserves_symlinks() {
        let (tmp, store) = test_store();
        let src = tmp.path().join("src");
        fs::create_dir_all(&src).unwrap();
        fs::write(src.join("real.txt"), "data").unwrap();
        std::os::unix::fs::symlink("real.txt", src.join("link.txt")).unwrap();

        let snapshot = store.capture(&src).unwrap();
        let dest = tmp.path().join("dest");
        store.materialize(&snapshot.digest, &dest).unwrap();

        let target = fs::read_link(dest.join("link.txt")).unwrap();
        assert_eq!(target, PathBuf::from("real.txt"));
    }

    #[test]
    fn test_identical_content_has_identical_digest() {
        let (tmp, store) = test_store();
        for name in ["one", "two"] {
            let dir = tmp.path().join(name);
            fs::create_dir_all(dir.join("sub")).unwrap();
            fs::write(dir.join("a.txt"), "same").unwrap();
            fs::write(dir.join("sub/b.txt"), "content").unwrap();
        }

        let first = store.capture(&tmp.path().join("one")).unwrap();
        let second = store.capture(&tmp.path().join("two")).unwrap();
        assert_eq!(first.digest, second.digest);
    }

    #[test]
    fn test_concurrent_puts_of_identical_content() {
        // Two builds producing the same bytes must both land the blob.
        let (_tmp, store) = test_store();
        let handles: Vec<_> = (0..8)
            .map(|_| {
                let store = store.clone();
                std::thread::spawn(move || store.put_blob(b"shared content").unwrap())
            })
            .collect();

        let hashes: Vec<String> = handles.into_iter().map(|h| h.join().unwrap()).collect();
        assert!(hashes.iter().all(|h| h == &hashes[0]));

        let snapshot = store.snapshot_from_files(&[("f", b"shared content")]).unwrap();
        let data = store.read_file(&snapshot.digest, "f").unwrap().unwrap();
        assert_eq!(data, b"shared content");
    }

    #[test]
    fn test_merge_union() {
        let (_tmp, store) = test_store();
        let left = store
            .snapshot_from_files(&[("a.txt", b"a"), ("shared.txt", b"s")])
            .unwrap();
        let right = store
            .snapshot_from_files(&[("b.txt", b"b"), ("shared.txt", b"s")])
            .unwrap();

        let merged = store.merge(&[&left.digest, &right.digest]).unwrap();
        assert_eq!(merged.entries.len(), 3);
        assert!(merged.entry("a.txt").is_some());
        assert!(merged.entry("b.txt").is_some());
    }

    #[test]
    fn test_merge_conflict_is_error() {
        let (_tmp, store) = test_store();
        let left = store.snapshot_from_files(&[("same.txt", b"left")]).unwrap();
        let right = store.snapshot_from_files(&[("same.txt", b"right")]).unwrap();

        let result = store.merge(&[&left.digest, &right.digest]);
        assert!(matches!(result, Err(KilnError::Store(_))));
    }

    #[test]
    fn test_read_file() {
        let (_tmp, store) = test_store();
        let snapshot = store
            .snapshot_from_files(&[("build/index.json", b"{}")])
            .unwrap();

        let data = store.read_file(&snapshot.digest, "build/index.json").unwrap();
        assert_eq!(data, Some(b"{}".to_vec()));
        assert_eq!(store.read_file(&snapshot.digest, "missing").unwrap(), None);
    }

    #[test]
    fn test_load_unknown_tree_is_error() {
        let (_tmp, store) = test_store();
        let digest = TreeDigest::from_hex("0".repeat(64)).unwrap();
        assert!(matches!(store.load(&digest), Err(KilnError::Store(_))));
    }

    #[test]
    fn test_tree_digest_validation() {
        assert!(TreeDigest::from_hex("xyz").is_err());
        let digest = TreeDigest::from_hex("a".repeat(64)).unwrap();
        assert_eq!(digest.short().len(), 12);
    }

    #[test]
    fn test_empty_capture() {
        let (tmp, store) = test_store();
        let src = tmp.path().join("empty");
        fs::create_dir_all(&src).unwrap();
        let snapshot = store.capture(&src).unwrap();
        assert!(snapshot.is_empty());
    }
}
