use std::io;
use std::os::unix::fs::PermissionsExt;
use std::path::{Path, PathBuf};

/// Get the base directory for aquaman data
///
/// # Panics
///
/// Panics if the home directory cannot be determined.
#[must_use]
pub fn base_dir() -> PathBuf {
    #[expect(clippy::expect_used, reason = "home directory is required for operation")]
    dirs::home_dir()
        .expect("Could not find home directory")
        .join(".aquaman")
}

/// Get the default path to the broker Unix socket
#[must_use]
pub fn socket_path() -> PathBuf {
    base_dir().join("aquaman.sock")
}

/// Get the default audit log root directory
#[must_use]
pub fn audit_dir() -> PathBuf {
    base_dir().join("audit")
}

/// Get the default encrypted credential store path
#[must_use]
pub fn store_path() -> PathBuf {
    base_dir().join("credentials.enc")
}

/// Get the directory for log files
#[must_use]
pub fn logs_dir() -> PathBuf {
    base_dir().join("logs")
}

/// Get the path to the broker spawn lock
#[must_use]
pub fn broker_lock_path() -> PathBuf {
    base_dir().join("broker.lock")
}

/// Create a directory (and parents) with owner-only permissions (0700).
pub fn create_private_dir(path: &Path) -> io::Result<()> {
    std::fs::create_dir_all(path)?;
    std::fs::set_permissions(path, std::fs::Permissions::from_mode(0o700))
}

/// Restrict a file (or socket) to owner read/write (0600).
pub fn set_private_file_mode(path: &Path) -> io::Result<()> {
    std::fs::set_permissions(path, std::fs::Permissions::from_mode(0o600))
}
