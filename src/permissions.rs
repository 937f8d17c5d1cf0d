//! Key file mode and ownership checks.
//!
//! The engine does not audit arbitrary files; it asks a `PermissionCheck`
//! about its own key files. `OwnerOnly` is the default: mode 0600, owned by
//! the effective user of the process.

use std::fmt;
use std::io;
use std::path::{Path, PathBuf};

use serde::Serialize;

/// Required mode for key files.
pub const KEY_FILE_MODE: u32 = 0o600;

/// A single deviation from the expected secure state of a file.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub enum PermissionIssue {
    /// Mode bits differ from the expected value.
    Mode { expected: u32, actual: u32 },
    /// The file is owned by a different user than the running process.
    Owner { expected: u32, actual: u32 },
}

impl PermissionIssue {
    /// Only mode problems can be repaired from inside the process.
    pub fn is_fixable(&self) -> bool {
        matches!(self, Self::Mode { .. })
    }
}

impl fmt::Display for PermissionIssue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Mode { expected, actual } => {
                write!(f, "mode {actual:o}, expected {expected:o}")
            }
            Self::Owner { expected, actual } => {
                write!(f, "owner uid {actual}, expected {expected}")
            }
        }
    }
}

/// A recoverable permission finding on one key file.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct PermissionWarning {
    pub path: PathBuf,
    pub issue: PermissionIssue,
}

impl fmt::Display for PermissionWarning {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {}", self.path.display(), self.issue)
    }
}

/// Outcome of validating the key files.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct ValidationReport {
    /// Key files that were present and passed the size check.
    pub checked: Vec<PathBuf>,
    /// Issues left after any automatic fixing.
    pub warnings: Vec<PermissionWarning>,
    /// Files whose mode was reset to 0600.
    pub fixed: Vec<PathBuf>,
    /// Active key file created because it was missing.
    pub generated: Option<PathBuf>,
}

impl ValidationReport {
    pub fn is_clean(&self) -> bool {
        self.warnings.is_empty()
    }
}

/// File-permission collaborator consulted during key validation.
pub trait PermissionCheck: Send + Sync {
    /// Report every way `path` deviates from the secure state.
    fn inspect(&self, path: &Path) -> io::Result<Vec<PermissionIssue>>;

    /// Tighten the mode of `path` to the secure value.
    fn restrict(&self, path: &Path) -> io::Result<()>;
}

/// Expects mode 0600 and ownership by the effective uid.
#[derive(Debug, Default, Clone, Copy)]
pub struct OwnerOnly;

#[cfg(unix)]
impl PermissionCheck for OwnerOnly {
    fn inspect(&self, path: &Path) -> io::Result<Vec<PermissionIssue>> {
        use std::os::unix::fs::MetadataExt;

        let meta = std::fs::metadata(path)?;
        let mut issues = Vec::new();

        let mode = meta.mode() & 0o777;
        if mode != KEY_FILE_MODE {
            issues.push(PermissionIssue::Mode {
                expected: KEY_FILE_MODE,
                actual: mode,
            });
        }

        let euid = unsafe { libc::geteuid() };
        if meta.uid() != euid {
            issues.push(PermissionIssue::Owner {
                expected: euid,
                actual: meta.uid(),
            });
        }
        Ok(issues)
    }

    fn restrict(&self, path: &Path) -> io::Result<()> {
        use std::os::unix::fs::PermissionsExt;

        std::fs::set_permissions(path, std::fs::Permissions::from_mode(KEY_FILE_MODE))
    }
}

#[cfg(not(unix))]
impl PermissionCheck for OwnerOnly {
    fn inspect(&self, path: &Path) -> io::Result<Vec<PermissionIssue>> {
        std::fs::metadata(path)?;
        Ok(Vec::new())
    }

    fn restrict(&self, _path: &Path) -> io::Result<()> {
        Ok(())
    }
}

#[cfg(all(test, unix))]
mod tests {
    use std::fs;
    use std::os::unix::fs::PermissionsExt;

    use super::*;

    #[test]
    fn flags_world_readable_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("kek.key");
        fs::write(&path, [0u8; 32]).unwrap();
        fs::set_permissions(&path, fs::Permissions::from_mode(0o644)).unwrap();

        let issues = OwnerOnly.inspect(&path).unwrap();
        assert_eq!(
            issues,
            vec![PermissionIssue::Mode {
                expected: 0o600,
                actual: 0o644
            }]
        );
        assert!(issues[0].is_fixable());
    }

    #[test]
    fn restrict_clears_mode_issue() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("kek.key");
        fs::write(&path, [0u8; 32]).unwrap();
        fs::set_permissions(&path, fs::Permissions::from_mode(0o666)).unwrap();

        OwnerOnly.restrict(&path).unwrap();
        assert!(OwnerOnly.inspect(&path).unwrap().is_empty());
    }

    #[test]
    fn missing_file_is_an_io_error() {
        let dir = tempfile::tempdir().unwrap();
        assert!(OwnerOnly.inspect(&dir.path().join("absent")).is_err());
    }
}
