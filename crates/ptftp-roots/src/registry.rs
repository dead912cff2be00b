use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::net::Ipv4Addr;
use std::path::{Path, PathBuf};
use tracing::{debug, info};

use crate::error::{Result, RootsError};

/// Wildcard key consulted when a client has no root of its own.
pub const DEFAULT_CLIENT: &str = "0.0.0.0";

/// Resolves the TFTP root directory for a client address.
///
/// Implementations are queried by the dispatcher only, once per accepted
/// request, so a change made between two requests is seen by the second one
/// and never by a transfer that is already running.
pub trait RootRegistry: Send + Sync {
    fn find_root_path(&self, client_ip: &str) -> Result<PathBuf>;
}

fn parse_client(client_ip: &str) -> Result<Ipv4Addr> {
    client_ip
        .parse::<Ipv4Addr>()
        .map_err(|_| RootsError::InvalidClient(client_ip.to_string()))
}

/// Registry backed by a directory holding one file per client.
///
/// The file is named after the client's IPv4 address and contains the root
/// directory path as text. Entries are read on every lookup.
#[derive(Debug, Clone)]
pub struct FileRootRegistry {
    dir: PathBuf,
}

impl FileRootRegistry {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    fn entry_path(&self, client_ip: &str) -> Result<PathBuf> {
        let ip = parse_client(client_ip)?;
        Ok(self.dir.join(ip.to_string()))
    }

    /// Point `client_ip` at `root`, replacing any previous entry.
    ///
    /// The entry is written to a temporary file first and renamed into
    /// place, so a concurrent lookup sees either the old or the new root.
    pub fn set_root(&self, client_ip: &str, root: &Path) -> Result<()> {
        if !root.is_absolute() {
            return Err(RootsError::InvalidRoot(format!(
                "{} is not an absolute path",
                root.display()
            )));
        }
        let root_str = root
            .to_str()
            .ok_or_else(|| RootsError::InvalidRoot(format!("{} is not UTF-8", root.display())))?;

        let entry = self.entry_path(client_ip)?;
        std::fs::create_dir_all(&self.dir)?;
        let staging = self.dir.join(format!(".{}.tmp", client_ip));
        std::fs::write(&staging, root_str)?;
        std::fs::rename(&staging, &entry)?;
        info!("TFTP root for {} set to {}", client_ip, root.display());
        Ok(())
    }

    /// Remove the entry for `client_ip`. Returns whether an entry existed.
    pub fn remove_root(&self, client_ip: &str) -> Result<bool> {
        let entry = self.entry_path(client_ip)?;
        match std::fs::remove_file(&entry) {
            Ok(()) => {
                info!("TFTP root for {} removed", client_ip);
                Ok(true)
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(false),
            Err(e) => Err(e.into()),
        }
    }

    pub fn list_roots(&self) -> Result<BTreeMap<String, PathBuf>> {
        let mut roots = BTreeMap::new();
        let entries = match std::fs::read_dir(&self.dir) {
            Ok(entries) => entries,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(roots),
            Err(e) => return Err(e.into()),
        };
        for entry in entries {
            let entry = entry?;
            let Some(name) = entry.file_name().to_str().map(str::to_owned) else {
                continue;
            };
            // Staging files and anything else not named after a client.
            if parse_client(&name).is_err() {
                continue;
            }
            let root = self.find_root_path(&name)?;
            roots.insert(name, root);
        }
        Ok(roots)
    }
}

impl RootRegistry for FileRootRegistry {
    fn find_root_path(&self, client_ip: &str) -> Result<PathBuf> {
        let entry = self.entry_path(client_ip)?;
        let contents = match std::fs::read_to_string(&entry) {
            Ok(contents) => contents,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                debug!("No root entry at {}", entry.display());
                return Err(RootsError::NotFound(client_ip.to_string()));
            }
            Err(e) => return Err(e.into()),
        };
        let root = contents.trim();
        if root.is_empty() {
            return Err(RootsError::InvalidRoot(format!(
                "{} is empty",
                entry.display()
            )));
        }
        Ok(PathBuf::from(root))
    }
}

/// Fixed client-to-root table, typically loaded from the server config.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(transparent)]
pub struct StaticRootRegistry {
    roots: BTreeMap<String, PathBuf>,
}

impl StaticRootRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_root(mut self, client_ip: impl Into<String>, root: impl Into<PathBuf>) -> Self {
        self.roots.insert(client_ip.into(), root.into());
        self
    }

    pub fn roots(&self) -> &BTreeMap<String, PathBuf> {
        &self.roots
    }

    pub fn is_empty(&self) -> bool {
        self.roots.is_empty()
    }

    /// Check that every key is an IPv4 address and every root is absolute.
    pub fn validate(&self) -> Result<()> {
        for (client_ip, root) in &self.roots {
            parse_client(client_ip)?;
            if !root.is_absolute() {
                return Err(RootsError::InvalidRoot(format!(
                    "root for {} must be absolute: {}",
                    client_ip,
                    root.display()
                )));
            }
        }
        Ok(())
    }
}

impl RootRegistry for StaticRootRegistry {
    fn find_root_path(&self, client_ip: &str) -> Result<PathBuf> {
        self.roots
            .get(client_ip)
            .cloned()
            .ok_or_else(|| RootsError::NotFound(client_ip.to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn file_registry_reads_entry_written_by_hand() -> std::result::Result<(), Box<dyn std::error::Error>>
    {
        let dir = TempDir::new()?;
        std::fs::write(dir.path().join("10.0.0.7"), "/srv/tftp/rpi4\n")?;
        let registry = FileRootRegistry::new(dir.path());

        assert_eq!(
            registry.find_root_path("10.0.0.7")?,
            PathBuf::from("/srv/tftp/rpi4")
        );
        Ok(())
    }

    #[test]
    fn file_registry_reports_missing_entry() -> std::result::Result<(), Box<dyn std::error::Error>> {
        let dir = TempDir::new()?;
        let registry = FileRootRegistry::new(dir.path());

        let result = registry.find_root_path("10.0.0.8");
        assert!(matches!(result, Err(RootsError::NotFound(ip)) if ip == "10.0.0.8"));
        Ok(())
    }

    #[test]
    fn file_registry_observes_updates() -> std::result::Result<(), Box<dyn std::error::Error>> {
        let dir = TempDir::new()?;
        let registry = FileRootRegistry::new(dir.path());

        registry.set_root("10.0.0.9", Path::new("/srv/first"))?;
        assert_eq!(registry.find_root_path("10.0.0.9")?, PathBuf::from("/srv/first"));

        registry.set_root("10.0.0.9", Path::new("/srv/second"))?;
        assert_eq!(registry.find_root_path("10.0.0.9")?, PathBuf::from("/srv/second"));

        assert!(registry.remove_root("10.0.0.9")?);
        assert!(!registry.remove_root("10.0.0.9")?);
        assert!(registry.find_root_path("10.0.0.9").is_err());
        Ok(())
    }

    #[test]
    fn file_registry_rejects_non_ip_keys() -> std::result::Result<(), Box<dyn std::error::Error>> {
        let dir = TempDir::new()?;
        let registry = FileRootRegistry::new(dir.path());

        let result = registry.set_root("../etc", Path::new("/srv"));
        assert!(matches!(result, Err(RootsError::InvalidClient(_))));
        let result = registry.find_root_path("../../passwd");
        assert!(matches!(result, Err(RootsError::InvalidClient(_))));
        Ok(())
    }

    #[test]
    fn file_registry_rejects_relative_roots() -> std::result::Result<(), Box<dyn std::error::Error>> {
        let dir = TempDir::new()?;
        let registry = FileRootRegistry::new(dir.path());

        let result = registry.set_root("10.0.0.1", Path::new("relative/root"));
        assert!(matches!(result, Err(RootsError::InvalidRoot(_))));
        Ok(())
    }

    #[test]
    fn list_skips_foreign_files() -> std::result::Result<(), Box<dyn std::error::Error>> {
        let dir = TempDir::new()?;
        let registry = FileRootRegistry::new(dir.path());
        registry.set_root(DEFAULT_CLIENT, Path::new("/srv/default"))?;
        registry.set_root("192.168.1.20", Path::new("/srv/lab"))?;
        std::fs::write(dir.path().join("README"), "not an entry")?;

        let roots = registry.list_roots()?;
        assert_eq!(roots.len(), 2);
        assert_eq!(roots.get(DEFAULT_CLIENT), Some(&PathBuf::from("/srv/default")));
        Ok(())
    }

    #[test]
    fn list_of_missing_directory_is_empty() -> std::result::Result<(), Box<dyn std::error::Error>> {
        let dir = TempDir::new()?;
        let registry = FileRootRegistry::new(dir.path().join("absent"));
        assert!(registry.list_roots()?.is_empty());
        Ok(())
    }

    #[test]
    fn static_registry_lookup_and_validation() {
        let registry = StaticRootRegistry::new()
            .with_root(DEFAULT_CLIENT, "/srv/tftp")
            .with_root("10.1.1.1", "/srv/special");

        assert_eq!(
            registry.find_root_path("10.1.1.1").ok(),
            Some(PathBuf::from("/srv/special"))
        );
        assert!(matches!(
            registry.find_root_path("10.1.1.2"),
            Err(RootsError::NotFound(_))
        ));
        assert!(registry.validate().is_ok());

        let invalid = StaticRootRegistry::new().with_root("lab-pc", "/srv/tftp");
        assert!(matches!(invalid.validate(), Err(RootsError::InvalidClient(_))));
    }
}
