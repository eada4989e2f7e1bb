//! Registry of installed adapter packages: scans package directories for
//! manifests and maps adapter type → launch command.

use std::collections::HashMap;
use std::path::{Path, PathBuf};

use parking_lot::RwLock;

use hearth_domain::{Error, Result};

use crate::manifest::{AdapterManifest, SetupCapabilities, MANIFEST_FILE};

/// How to start an adapter's child process.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LaunchSpec {
    pub program: String,
    pub args: Vec<String>,
}

impl LaunchSpec {
    /// Derive the launch command from an entry path. Script entries run
    /// under their interpreter; anything else is executed directly.
    pub fn for_entry(entry_path: &Path) -> Self {
        let path = entry_path.to_string_lossy().into_owned();
        match entry_path.extension().and_then(|e| e.to_str()) {
            Some("js") | Some("mjs") => LaunchSpec {
                program: "node".into(),
                args: vec![path],
            },
            Some("py") => LaunchSpec {
                program: "python3".into(),
                args: vec![path],
            },
            Some("sh") => LaunchSpec {
                program: "sh".into(),
                args: vec![path],
            },
            _ => LaunchSpec {
                program: path,
                args: Vec::new(),
            },
        }
    }
}

#[derive(Debug, Clone)]
struct InstalledAdapter {
    manifest: AdapterManifest,
    package_dir: PathBuf,
}

/// Scans one or more package directories for `adapter.json` manifests.
/// Manifests are read-only between rescans.
pub struct AdapterRegistry {
    package_dirs: Vec<PathBuf>,
    installed: RwLock<HashMap<String, InstalledAdapter>>,
}

impl AdapterRegistry {
    /// Build the registry and run the initial scan.
    pub fn new(package_dirs: Vec<PathBuf>) -> Self {
        let registry = Self {
            package_dirs,
            installed: RwLock::new(HashMap::new()),
        };
        registry.rescan();
        registry
    }

    /// Reload manifests from disk, replacing the previous view.
    pub fn rescan(&self) {
        let mut found: HashMap<String, InstalledAdapter> = HashMap::new();

        for dir in &self.package_dirs {
            let entries = match std::fs::read_dir(dir) {
                Ok(entries) => entries,
                Err(e) => {
                    tracing::warn!(dir = %dir.display(), error = %e, "cannot scan package dir");
                    continue;
                }
            };

            for entry in entries.flatten() {
                let package_dir = entry.path();
                if !package_dir.is_dir() {
                    continue;
                }
                let manifest_path = package_dir.join(MANIFEST_FILE);
                let data = match std::fs::read_to_string(&manifest_path) {
                    Ok(data) => data,
                    Err(_) => continue, // not an adapter package
                };
                let manifest: AdapterManifest = match serde_json::from_str(&data) {
                    Ok(manifest) => manifest,
                    Err(e) => {
                        tracing::warn!(
                            path = %manifest_path.display(),
                            error = %e,
                            "skipping unparseable adapter manifest"
                        );
                        continue;
                    }
                };
                let errors = manifest.validate();
                if !errors.is_empty() {
                    tracing::warn!(
                        path = %manifest_path.display(),
                        errors = ?errors,
                        "skipping invalid adapter manifest"
                    );
                    continue;
                }
                if let Some(existing) = found.get(&manifest.adapter_type) {
                    tracing::warn!(
                        adapter_type = %manifest.adapter_type,
                        kept = %existing.package_dir.display(),
                        ignored = %package_dir.display(),
                        "duplicate adapter type, keeping first"
                    );
                    continue;
                }
                found.insert(
                    manifest.adapter_type.clone(),
                    InstalledAdapter {
                        manifest,
                        package_dir,
                    },
                );
            }
        }

        tracing::info!(count = found.len(), "adapter registry scanned");
        *self.installed.write() = found;
    }

    /// Resolve an adapter type to its launch command.
    pub fn resolve(&self, adapter_type: &str) -> Result<LaunchSpec> {
        let installed = self.installed.read();
        let adapter = installed
            .get(adapter_type)
            .ok_or_else(|| Error::UnknownAdapterType(adapter_type.to_string()))?;
        let entry_path = adapter.package_dir.join(&adapter.manifest.entry);
        Ok(LaunchSpec::for_entry(&entry_path))
    }

    /// The interactive-onboarding capabilities an adapter declares.
    pub fn setup(&self, adapter_type: &str) -> Result<SetupCapabilities> {
        let installed = self.installed.read();
        let adapter = installed
            .get(adapter_type)
            .ok_or_else(|| Error::UnknownAdapterType(adapter_type.to_string()))?;
        Ok(adapter.manifest.setup.clone().unwrap_or_default())
    }

    /// Whether more than one record of this type may be configured.
    pub fn multi_instance(&self, adapter_type: &str) -> Result<bool> {
        let installed = self.installed.read();
        let adapter = installed
            .get(adapter_type)
            .ok_or_else(|| Error::UnknownAdapterType(adapter_type.to_string()))?;
        Ok(adapter.manifest.multi_instance)
    }

    /// Installed adapter types, sorted.
    pub fn types(&self) -> Vec<String> {
        let mut types: Vec<String> = self.installed.read().keys().cloned().collect();
        types.sort();
        types
    }
}
