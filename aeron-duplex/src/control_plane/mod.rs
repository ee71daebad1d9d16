//! Resource ownership and lifecycle: driver, event loops, cached handles.

pub(crate) mod driver_manager;
pub(crate) mod resources;

use crate::observability::events;
use std::path::Path;
use tracing::{debug, warn};

/// Removes an embedded driver's directory; missing directories are fine.
pub(crate) fn delete_driver_directory(directory: &Path) {
    match std::fs::remove_dir_all(directory) {
        Ok(()) => debug!(directory = %directory.display(), "deleted driver directory"),
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => {}
        Err(err) => warn!(
            event = events::DRIVER_DIR_DELETE_FAILED,
            directory = %directory.display(),
            err = %err,
            "failed to delete driver directory"
        ),
    }
}
