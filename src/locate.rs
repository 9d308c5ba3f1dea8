//! Locating the installed PostgreSQL toolchain.
//!
//! Debian-family images install every major version under
//! `/usr/lib/postgresql/<version>/bin`; source builds put the binaries on
//! `PATH`. The well-known root is scanned first, newest version wins, and
//! `PATH` is the fallback.

use std::{
    env, fs,
    path::{Path, PathBuf},
};

use crate::error::{BootstrapError, BootstrapResult};

/// Versioned install root used by Debian-family postgres packages.
pub const WELL_KNOWN_ROOT: &str = "/usr/lib/postgresql";

/// Binary whose presence marks a usable toolchain directory.
const SERVER_BINARY: &str = "postgres";

/// Find the directory containing the postgres toolchain binaries.
///
/// Scans the immediate children of `well_known` (if it exists) sorted by
/// numeric version descending, picking the highest version with an executable
/// `bin/postgres`. Falls back to searching `PATH`.
pub fn find_bin_dir(well_known: Option<&Path>) -> BootstrapResult<PathBuf> {
    if let Some(root) = well_known
        && root.is_dir()
    {
        let mut versions: Vec<(Vec<u64>, PathBuf)> = fs::read_dir(root)?
            .filter_map(Result::ok)
            .filter_map(|entry| {
                let key = version_key(&entry.file_name().to_string_lossy())?;
                Some((key, entry.path()))
            })
            .collect();

        // Numeric, not lexicographic: "10" must beat "9".
        versions.sort_by(|a, b| b.0.cmp(&a.0));

        for (_, path) in versions {
            let bin = path.join("bin");
            if is_executable(&bin.join(SERVER_BINARY)) {
                return Ok(bin);
            }
        }
    }

    if let Some(paths) = env::var_os("PATH") {
        for dir in env::split_paths(&paths) {
            if is_executable(&dir.join(SERVER_BINARY)) {
                return Ok(dir);
            }
        }
    }

    let searched = match well_known {
        Some(root) => format!("{} and PATH", root.display()),
        None => "PATH".to_string(),
    };
    Err(BootstrapError::BinariesNotFound { searched })
}

/// Parse a directory name like `16` or `9.6` into sortable numeric components.
///
/// Non-numeric names (`common`, `lost+found`) yield `None` and are skipped.
fn version_key(name: &str) -> Option<Vec<u64>> {
    name.split('.').map(|part| part.parse().ok()).collect()
}

fn is_executable(path: &Path) -> bool {
    let Ok(metadata) = fs::metadata(path) else {
        return false;
    };
    if !metadata.is_file() {
        return false;
    }
    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        metadata.permissions().mode() & 0o111 != 0
    }
    #[cfg(not(unix))]
    {
        true
    }
}
