//! Package → UID resolution.

use std::collections::HashMap;
use std::fs;
use std::path::PathBuf;

use tracing::trace;

use super::error::PlatformError;

/// Resolves a package identifier to the UID the OS assigned it.
pub trait PackageRegistry: Send + Sync {
    /// Look up the UID for `package`.
    fn uid_for_package(&self, package: &str) -> Result<u32, PlatformError>;
}

/// Reads Android's `packages.list`.
///
/// Each line is `<package> <uid> <debuggable> <data dir> ...`; only the
/// first two fields are used. The file is re-read on every lookup so newly
/// installed packages are seen without a restart.
pub struct PackagesListRegistry {
    path: PathBuf,
}

impl PackagesListRegistry {
    /// Create a registry backed by the given file.
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }
}

impl PackageRegistry for PackagesListRegistry {
    fn uid_for_package(&self, package: &str) -> Result<u32, PlatformError> {
        let content = fs::read_to_string(&self.path).map_err(|e| PlatformError::Read {
            path: self.path.clone(),
            source: e,
        })?;
        let uid = parse_packages_list(&content)
            .remove(package)
            .ok_or_else(|| PlatformError::PackageNotFound(package.to_string()))?;
        trace!("Resolved {} to UID {}", package, uid);
        Ok(uid)
    }
}

/// Parse `packages.list` content into a package → UID map.
///
/// Malformed lines are skipped.
pub fn parse_packages_list(content: &str) -> HashMap<String, u32> {
    content
        .lines()
        .filter_map(|line| {
            let mut fields = line.split_whitespace();
            let name = fields.next()?;
            let uid = fields.next()?.parse::<u32>().ok()?;
            Some((name.to_string(), uid))
        })
        .collect()
}

/// In-memory registry.
#[derive(Debug, Default, Clone)]
pub struct StaticPackageRegistry {
    uids: HashMap<String, u32>,
}

impl StaticPackageRegistry {
    /// Create an empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a package mapping.
    pub fn with_package(mut self, package: impl Into<String>, uid: u32) -> Self {
        self.uids.insert(package.into(), uid);
        self
    }
}

impl PackageRegistry for StaticPackageRegistry {
    fn uid_for_package(&self, package: &str) -> Result<u32, PlatformError> {
        self.uids
            .get(package)
            .copied()
            .ok_or_else(|| PlatformError::PackageNotFound(package.to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const SAMPLE: &str = "\
com.android.chrome 10087 0 /data/user/0/com.android.chrome default:targetSdkVersion=33 3003
com.example.game 10123 1 /data/user/0/com.example.game default 3003,3002
broken-line
com.bad.uid notanumber 0 /data
";

    #[test]
    fn test_parse_packages_list() {
        let map = parse_packages_list(SAMPLE);
        assert_eq!(map.len(), 2);
        assert_eq!(map["com.android.chrome"], 10087);
        assert_eq!(map["com.example.game"], 10123);
    }

    #[test]
    fn test_packages_list_registry_lookup() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("packages.list");
        fs::write(&path, SAMPLE).unwrap();

        let registry = PackagesListRegistry::new(&path);
        assert_eq!(registry.uid_for_package("com.example.game").unwrap(), 10123);
        assert!(matches!(
            registry.uid_for_package("com.missing"),
            Err(PlatformError::PackageNotFound(_))
        ));
    }

    #[test]
    fn test_missing_packages_list_is_read_error() {
        let registry = PackagesListRegistry::new("/nonexistent/packages.list");
        assert!(matches!(
            registry.uid_for_package("x"),
            Err(PlatformError::Read { .. })
        ));
    }

    #[test]
    fn test_static_registry() {
        let registry = StaticPackageRegistry::new().with_package("pkg.a", 10001);
        assert_eq!(registry.uid_for_package("pkg.a").unwrap(), 10001);
        assert!(registry.uid_for_package("pkg.b").is_err());
    }
}
