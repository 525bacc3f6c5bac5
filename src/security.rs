#![forbid(unsafe_code)]

//! Shared safety helpers for the gvarchive binary.

use anyhow::{Result, bail};
use nix::unistd::Uid;

/// Fails fast when the binary is started as root. The archiver writes large
/// trees of downloaded files; running it as a regular user keeps those
/// writes out of system directories.
pub fn ensure_not_root(process: &str) -> Result<()> {
    ensure_not_root_for(Uid::current(), process)
}

fn ensure_not_root_for(uid: Uid, process: &str) -> Result<()> {
    if uid.is_root() {
        bail!(
            "{process} must not be run as root; use a regular user or a dedicated service account"
        );
    }
    Ok(())
}

/// Record ids become directory names directly under the output root, so they
/// must be plain path segments: non-empty, no separators, no parent
/// references, no control characters. Ids that fail this check are handed to
/// the extraction service rather than to the filesystem.
pub fn safe_record_id(id: &str) -> bool {
    !id.is_empty()
        && id != "."
        && id != ".."
        && !id.contains(['/', '\\'])
        && !id.chars().any(char::is_control)
}
