//! Per-call execution sandboxes.
//!
//! Local modules are used in place. Remote modules are materialised into a
//! temporary checkout by a [`ModuleFetcher`]. Every call also gets a
//! scratch directory for state, variable and plan files. Both temporary
//! directories are removed when the [`Sandbox`] drops, on every exit path.

use super::{ModuleSource, PluginError};
use crate::core::resolver::ComponentRef;
use async_trait::async_trait;
use std::path::{Path, PathBuf};
use tempfile::TempDir;
use tracing::debug;

/// Materialises remote module references.
#[async_trait]
pub trait ModuleFetcher: Send + Sync {
    /// Place the module's files into the empty directory `dest`.
    async fn fetch(&self, reference: &str, dest: &Path) -> Result<(), PluginError>;
}

/// Serves modules from a local cache laid out as
/// `<cache>/<repository>/<tag | sha256-hex>/` (a directory) or
/// `<cache>/<repository>/<tag | sha256-hex>.tar.gz`.
#[derive(Debug, Clone)]
pub struct CachedModuleFetcher {
    cache_dir: PathBuf,
}

impl CachedModuleFetcher {
    pub fn new(cache_dir: impl Into<PathBuf>) -> Self {
        Self {
            cache_dir: cache_dir.into(),
        }
    }

    fn entry(&self, reference: &str) -> Result<PathBuf, PluginError> {
        match ComponentRef::parse(reference) {
            Ok(ComponentRef::Remote {
                repository,
                tag,
                digest,
            }) => {
                let version = match (digest, tag) {
                    (Some(d), _) => d.replace(':', "-"),
                    (None, Some(t)) => t,
                    (None, None) => "latest".to_string(),
                };
                Ok(self.cache_dir.join(repository).join(version))
            }
            Ok(ComponentRef::Local(_)) => Err(PluginError::Sandbox(format!(
                "'{}' is a local path, not a module reference",
                reference
            ))),
            Err(e) => Err(PluginError::Sandbox(e.to_string())),
        }
    }
}

#[async_trait]
impl ModuleFetcher for CachedModuleFetcher {
    async fn fetch(&self, reference: &str, dest: &Path) -> Result<(), PluginError> {
        let entry = self.entry(reference)?;
        let archive = PathBuf::from(format!("{}.tar.gz", entry.display()));
        let dest = dest.to_path_buf();
        let reference = reference.to_string();

        tokio::task::spawn_blocking(move || {
            if entry.is_dir() {
                debug!(module = %reference, from = %entry.display(), "copying cached module");
                copy_dir(&entry, &dest)
            } else if archive.is_file() {
                debug!(module = %reference, from = %archive.display(), "unpacking cached module");
                unpack(&archive, &dest)
            } else {
                Err(PluginError::Sandbox(format!(
                    "module '{}' is not in the cache (looked for {} and {})",
                    reference,
                    entry.display(),
                    archive.display()
                )))
            }
        })
        .await
        .map_err(|e| PluginError::Sandbox(format!("fetch task failed: {}", e)))?
    }
}

fn copy_dir(from: &Path, to: &Path) -> Result<(), PluginError> {
    std::fs::create_dir_all(to).map_err(PluginError::io(format!("creating {}", to.display())))?;
    let entries =
        std::fs::read_dir(from).map_err(PluginError::io(format!("reading {}", from.display())))?;
    for entry in entries {
        let entry = entry.map_err(PluginError::io(format!("reading {}", from.display())))?;
        let ft = entry
            .file_type()
            .map_err(PluginError::io(format!("inspecting {}", entry.path().display())))?;
        let target = to.join(entry.file_name());
        if ft.is_dir() {
            copy_dir(&entry.path(), &target)?;
        } else if ft.is_file() {
            std::fs::copy(entry.path(), &target)
                .map_err(PluginError::io(format!("copying {}", entry.path().display())))?;
        }
    }
    Ok(())
}

fn unpack(archive: &Path, to: &Path) -> Result<(), PluginError> {
    let file = std::fs::File::open(archive)
        .map_err(PluginError::io(format!("opening {}", archive.display())))?;
    let mut tar = tar::Archive::new(flate2::read::GzDecoder::new(file));
    tar.unpack(to)
        .map_err(PluginError::io(format!("unpacking {}", archive.display())))
}

/// Working directories for one plugin call.
#[derive(Debug)]
pub struct Sandbox {
    module_dir: PathBuf,
    scratch: TempDir,
    _checkout: Option<TempDir>,
}

impl Sandbox {
    /// Resolve the module directory and create the scratch directory.
    pub async fn prepare(
        source: &ModuleSource,
        fetcher: &dyn ModuleFetcher,
    ) -> Result<Self, PluginError> {
        let scratch = temp_dir("strata-run-")?;
        match source {
            ModuleSource::Local(path) => {
                if !path.is_dir() {
                    return Err(PluginError::Module {
                        module: path.display().to_string(),
                        message: "module directory does not exist".to_string(),
                    });
                }
                Ok(Self {
                    module_dir: path.clone(),
                    scratch,
                    _checkout: None,
                })
            }
            ModuleSource::Remote(reference) => {
                let checkout = temp_dir("strata-module-")?;
                fetcher.fetch(reference, checkout.path()).await?;
                Ok(Self {
                    module_dir: checkout.path().to_path_buf(),
                    scratch,
                    _checkout: Some(checkout),
                })
            }
        }
    }

    pub fn module_dir(&self) -> &Path {
        &self.module_dir
    }

    pub fn scratch(&self) -> &Path {
        self.scratch.path()
    }

    /// Write a scratch file, returning its path.
    pub fn write(&self, name: &str, contents: &[u8]) -> Result<PathBuf, PluginError> {
        let path = self.scratch().join(name);
        std::fs::write(&path, contents)
            .map_err(PluginError::io(format!("writing {}", path.display())))?;
        Ok(path)
    }

    /// Read a scratch file if the tool produced it.
    pub fn read(&self, name: &str) -> Result<Option<Vec<u8>>, PluginError> {
        let path = self.scratch().join(name);
        match std::fs::read(&path) {
            Ok(bytes) => Ok(Some(bytes)),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(PluginError::io(format!("reading {}", path.display()))(e)),
        }
    }
}

fn temp_dir(prefix: &str) -> Result<TempDir, PluginError> {
    tempfile::Builder::new()
        .prefix(prefix)
        .tempdir()
        .map_err(PluginError::io("creating temporary directory"))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_sandbox_local_module_used_in_place() {
        let module = tempfile::tempdir().unwrap();
        let fetcher = CachedModuleFetcher::new("/nonexistent");
        let scratch_path;
        {
            let sb = Sandbox::prepare(&ModuleSource::Local(module.path().to_path_buf()), &fetcher)
                .await
                .unwrap();
            assert_eq!(sb.module_dir(), module.path());
            sb.write("vars.json", b"{}").unwrap();
            assert_eq!(sb.read("vars.json").unwrap().as_deref(), Some(&b"{}"[..]));
            assert!(sb.read("missing").unwrap().is_none());
            scratch_path = sb.scratch().to_path_buf();
        }
        assert!(!scratch_path.exists());
        assert!(module.path().exists());
    }

    #[tokio::test]
    async fn test_sandbox_missing_local_module() {
        let fetcher = CachedModuleFetcher::new("/nonexistent");
        let err = Sandbox::prepare(&ModuleSource::Local("/nonexistent/mod".into()), &fetcher)
            .await
            .unwrap_err();
        assert!(matches!(err, PluginError::Module { .. }));
    }

    #[tokio::test]
    async fn test_sandbox_remote_from_cached_directory() {
        let cache = tempfile::tempdir().unwrap();
        let entry = cache.path().join("mods/pg/1.2");
        std::fs::create_dir_all(entry.join("sub")).unwrap();
        std::fs::write(entry.join("main.tf"), "resource {}").unwrap();
        std::fs::write(entry.join("sub/x.tf"), "x").unwrap();

        let fetcher = CachedModuleFetcher::new(cache.path());
        let module_dir;
        {
            let sb = Sandbox::prepare(&ModuleSource::Remote("mods/pg:1.2".into()), &fetcher)
                .await
                .unwrap();
            module_dir = sb.module_dir().to_path_buf();
            assert!(module_dir.join("main.tf").is_file());
            assert!(module_dir.join("sub/x.tf").is_file());
        }
        assert!(!module_dir.exists());
    }

    #[tokio::test]
    async fn test_sandbox_remote_from_archive() {
        let cache = tempfile::tempdir().unwrap();
        std::fs::create_dir_all(cache.path().join("mods/s3")).unwrap();
        let archive = cache.path().join("mods/s3/v1.tar.gz");
        {
            let file = std::fs::File::create(&archive).unwrap();
            let gz = flate2::write::GzEncoder::new(file, flate2::Compression::default());
            let mut builder = tar::Builder::new(gz);
            let body = b"echo apply";
            let mut header = tar::Header::new_gnu();
            header.set_size(body.len() as u64);
            header.set_mode(0o755);
            header.set_cksum();
            builder.append_data(&mut header, "apply", &body[..]).unwrap();
            builder.into_inner().unwrap().finish().unwrap();
        }

        let fetcher = CachedModuleFetcher::new(cache.path());
        let sb = Sandbox::prepare(&ModuleSource::Remote("mods/s3:v1".into()), &fetcher)
            .await
            .unwrap();
        assert_eq!(
            std::fs::read_to_string(sb.module_dir().join("apply")).unwrap(),
            "echo apply"
        );
    }

    #[tokio::test]
    async fn test_sandbox_remote_not_cached() {
        let cache = tempfile::tempdir().unwrap();
        let fetcher = CachedModuleFetcher::new(cache.path());
        let err = Sandbox::prepare(&ModuleSource::Remote("mods/none:v1".into()), &fetcher)
            .await
            .unwrap_err();
        assert!(err.to_string().contains("not in the cache"));
    }
}
