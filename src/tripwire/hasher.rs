//! BLAKE3 fingerprints for module inputs, module sources, and state blobs.

use serde::Serialize;
use std::io::{self, Read};
use std::path::Path;

const STREAM_BUF_SIZE: usize = 65536;

/// Directories never included in a module source fingerprint.
const SKIPPED_DIRS: &[&str] = &[".terraform", ".git", "node_modules", ".pulumi"];

/// Files the tools write into the module directory themselves.
const SKIPPED_FILES: &[&str] = &[".terraform.lock.hcl"];

fn prefixed(hash: blake3::Hash) -> String {
    format!("blake3:{}", hash.to_hex())
}

/// Hash a string. Returns `"blake3:{hex}"`.
pub fn hash_string(s: &str) -> String {
    hash_bytes(s.as_bytes())
}

/// Hash raw bytes. Returns `"blake3:{hex}"`.
pub fn hash_bytes(bytes: &[u8]) -> String {
    prefixed(blake3::hash(bytes))
}

/// Hash any serializable value through its canonical JSON form.
///
/// `serde_json::Value` objects are key-sorted, so two maps with the same
/// entries in different insertion order hash identically.
pub fn hash_json<T: Serialize>(value: &T) -> String {
    let canonical = serde_json::to_value(value)
        .map(|v| v.to_string())
        .unwrap_or_default();
    hash_string(&canonical)
}

/// Hash a file's contents, streaming.
pub fn hash_file(path: &Path) -> io::Result<String> {
    let mut file = std::fs::File::open(path)?;
    let mut hasher = blake3::Hasher::new();
    let mut buf = vec![0u8; STREAM_BUF_SIZE];
    loop {
        let n = file.read(&mut buf)?;
        if n == 0 {
            break;
        }
        hasher.update(&buf[..n]);
    }
    Ok(prefixed(hasher.finalize()))
}

/// Hash a module directory (sorted walk, relative paths included).
/// Skips symlinks, tool working directories such as `.terraform` and
/// tool-written files such as `.terraform.lock.hcl`.
pub fn hash_directory(path: &Path) -> io::Result<String> {
    fn walk(base: &Path, current: &Path, entries: &mut Vec<(String, String)>) -> io::Result<()> {
        let mut children: Vec<std::fs::DirEntry> =
            std::fs::read_dir(current)?.filter_map(|e| e.ok()).collect();
        children.sort_by_key(|e| e.file_name());

        for entry in children {
            let ft = entry.file_type()?;
            let name = entry.file_name();
            if ft.is_symlink() {
                continue;
            }
            let child = entry.path();
            if ft.is_dir() {
                if SKIPPED_DIRS.iter().any(|s| name == *s) {
                    continue;
                }
                walk(base, &child, entries)?;
            } else if ft.is_file() {
                if SKIPPED_FILES.iter().any(|s| name == *s) {
                    continue;
                }
                let rel = child
                    .strip_prefix(base)
                    .map_err(|e| io::Error::other(e.to_string()))?
                    .to_string_lossy()
                    .to_string();
                entries.push((rel, hash_file(&child)?));
            }
        }
        Ok(())
    }

    let mut entries = Vec::new();
    walk(path, path, &mut entries)?;

    let mut hasher = blake3::Hasher::new();
    for (rel, hash) in &entries {
        hasher.update(rel.as_bytes());
        hasher.update(b"\0");
        hasher.update(hash.as_bytes());
        hasher.update(b"\n");
    }
    Ok(prefixed(hasher.finalize()))
}

/// Compute a composite hash from multiple component hashes.
pub fn composite_hash(components: &[&str]) -> String {
    let mut hasher = blake3::Hasher::new();
    for c in components {
        hasher.update(c.as_bytes());
        hasher.update(b"\0");
    }
    prefixed(hasher.finalize())
}
