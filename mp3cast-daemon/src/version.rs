//! Version information and build metadata display

use std::fmt;

use serde::Serialize;

/// Build information for the daemon binary
#[derive(Debug, Clone, Serialize)]
pub struct VersionInfo {
    /// Package version from Cargo.toml
    pub daemon_version: &'static str,
    /// Version of the streaming core we link against
    pub server_version: &'static str,
    /// Target triple (e.g., x86_64-unknown-linux-gnu)
    pub target: &'static str,
    /// Build profile (debug or release)
    pub profile: &'static str,
    /// Git commit hash (if available)
    pub git_commit: Option<&'static str>,
    pub build_timestamp: &'static str,
}

impl VersionInfo {
    pub fn current() -> Self {
        Self {
            daemon_version: env!("CARGO_PKG_VERSION"),
            server_version: mp3cast_server::VERSION,
            target: env!("TARGET"),
            profile: if cfg!(debug_assertions) {
                "debug"
            } else {
                "release"
            },
            git_commit: option_env!("GIT_COMMIT_HASH"),
            build_timestamp: env!("BUILD_TIMESTAMP"),
        }
    }
}

impl fmt::Display for VersionInfo {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "mp3cast-daemon {}", self.daemon_version)?;
        writeln!(f)?;
        writeln!(f, "Build Information:")?;
        writeln!(f, "  Server core:  {}", self.server_version)?;
        writeln!(f, "  Target:       {}", self.target)?;
        writeln!(f, "  Profile:      {}", self.profile)?;
        writeln!(f, "  Build Date:   {}", self.build_timestamp)?;
        if let Some(commit) = self.git_commit {
            writeln!(f, "  Git Commit:   {}", commit)?;
        }
        Ok(())
    }
}

/// Short version string (for logs)
pub fn version_short() -> String {
    format!("mp3cast-daemon {}", env!("CARGO_PKG_VERSION"))
}

/// Long version string (for --build-info)
pub fn version_long() -> String {
    VersionInfo::current().to_string()
}
