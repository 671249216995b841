//! Free-space probing for the cache volume

use std::path::Path;
use sysinfo::Disks;

/// Available bytes on the volume holding `path`
///
/// Picks the disk whose mount point is the longest prefix of the path.
/// Returns `None` when no disk matches (e.g. in a minimal container),
/// in which case the disk-space floor is treated as satisfied.
pub fn available_bytes(path: &Path) -> Option<u64> {
    let disks = Disks::new_with_refreshed_list();
    let canonical = path.canonicalize().unwrap_or_else(|_| path.to_path_buf());

    disks
        .iter()
        .filter(|disk| canonical.starts_with(disk.mount_point()))
        .max_by_key(|disk| disk.mount_point().as_os_str().len())
        .map(|disk| disk.available_space())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_probe_reports_for_root() {
        // The probe may legitimately return None in sandboxed environments;
        // when it answers, the number is a plausible byte count.
        if let Some(bytes) = available_bytes(Path::new("/")) {
            assert!(bytes > 0);
        }
    }
}
