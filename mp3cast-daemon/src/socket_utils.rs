//! Unix socket path utilities with security-focused defaults
//!
//! Control socket lives in XDG_RUNTIME_DIR with fallback to a user-specific location.

use anyhow::{Context, Result};
use std::path::{Path, PathBuf};

/// Get secure socket directory path
///
/// Priority:
/// 1. XDG_RUNTIME_DIR (user-specific, mode 0700, auto-cleaned)
/// 2. ~/.local/share/mp3cast (user-specific, created on demand)
pub fn get_socket_dir() -> Result<PathBuf> {
    if let Ok(runtime_dir) = std::env::var("XDG_RUNTIME_DIR") {
        let path = PathBuf::from(runtime_dir);
        if path.exists() {
            return Ok(path);
        }
    }

    let home = std::env::var("HOME").context("HOME environment variable not set")?;

    let socket_dir = PathBuf::from(home)
        .join(".local")
        .join("share")
        .join("mp3cast");

    if !socket_dir.exists() {
        std::fs::create_dir_all(&socket_dir).context("Failed to create socket directory")?;
    }

    // Owner-only
    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        let permissions = std::fs::Permissions::from_mode(0o700);
        std::fs::set_permissions(&socket_dir, permissions)
            .context("Failed to set socket directory permissions")?;
    }

    Ok(socket_dir)
}

/// Get path for the control socket
pub fn get_control_socket_path() -> Result<PathBuf> {
    Ok(get_socket_dir()?.join("mp3cast.sock"))
}

/// Set secure permissions on a socket file (0600 = owner read/write only)
#[cfg(unix)]
pub fn secure_socket_permissions(socket_path: &Path) -> Result<()> {
    use std::os::unix::fs::PermissionsExt;

    if socket_path.exists() {
        let permissions = std::fs::Permissions::from_mode(0o600);
        std::fs::set_permissions(socket_path, permissions)
            .context("Failed to set socket permissions")?;
    }

    Ok(())
}

#[cfg(not(unix))]
pub fn secure_socket_permissions(_socket_path: &Path) -> Result<()> {
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_socket_dir_is_absolute() {
        let dir = get_socket_dir().unwrap();
        assert!(dir.is_absolute());
    }

    #[test]
    fn test_control_socket_path() {
        let path = get_control_socket_path().unwrap();
        assert!(path.ends_with("mp3cast.sock"));
        assert!(path.is_absolute());
    }

    #[cfg(unix)]
    #[test]
    fn test_secure_permissions() {
        use std::os::unix::fs::PermissionsExt;

        let dir = tempfile::tempdir().unwrap();
        let file = dir.path().join("sock");
        std::fs::write(&file, b"").unwrap();
        secure_socket_permissions(&file).unwrap();

        let mode = std::fs::metadata(&file).unwrap().permissions().mode();
        assert_eq!(mode & 0o777, 0o600);
    }
}
