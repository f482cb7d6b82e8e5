//! Per-run output directories

use super::timestamp::format_timestamp;
use eyre::{bail, Context};
use std::{
    fs,
    path::{Path, PathBuf},
};

/// Name of the symlink that points at the most recent run directory
pub const LATEST_LINK: &str = "latest";

/// Create `base/<timestamp>` (suffixed `-N` on collision) and point
/// `base/latest` at it.
pub fn create_log_dir(base: &Path) -> eyre::Result<PathBuf> {
    fs::create_dir_all(base)
        .wrap_err_with(|| format!("unable to create log directory {}", base.display()))?;

    let timestamp = format_timestamp();
    let run_dir = std::iter::once(base.join(&timestamp))
        .chain((1..=1000).map(|n| base.join(format!("{}-{}", timestamp, n))))
        .find(|dir| !dir.exists());
    let Some(run_dir) = run_dir else {
        bail!("no free run directory for timestamp {}", timestamp);
    };

    fs::create_dir(&run_dir)
        .wrap_err_with(|| format!("unable to create directory {}", run_dir.display()))?;

    #[cfg(unix)]
    {
        let latest = base.join(LATEST_LINK);
        if latest.symlink_metadata().is_ok() {
            let _ = fs::remove_file(&latest);
        }
        if let Some(name) = run_dir.file_name() {
            std::os::unix::fs::symlink(name, &latest).wrap_err_with(|| {
                format!("unable to link {} -> {}", latest.display(), run_dir.display())
            })?;
        }
    }

    Ok(run_dir)
}

/// Directory for one service's output inside a run directory.
///
/// The `:` separators of the fully qualified name become `_`.
pub fn service_log_dir(run_dir: &Path, fully_qualified_name: &str) -> PathBuf {
    run_dir.join(fully_qualified_name.replace(':', "_"))
}
