/// Host mount invariance checks
///
/// A sandbox's mounts must all live under its pool's root directory and all
/// disappear when it is destroyed. These helpers snapshot the host mount
/// table and report anything added or removed since.
use crate::config::types::Result;
use crate::kernel::mount::mountinfo::{parse_mountinfo, MountEntry};
use std::collections::HashSet;
use std::path::Path;

/// Filters out dynamic/ephemeral mounts that are expected to change
pub fn normalize_mountinfo(entries: &[MountEntry]) -> HashSet<String> {
    entries
        .iter()
        .filter(|e| !is_ephemeral_mount(&e.mount_point))
        .map(|e| format!("{}|{}", e.mount_point.display(), e.filesystem_type))
        .collect()
}

fn is_ephemeral_mount(mount_point: &Path) -> bool {
    ["/proc", "/sys", "/dev", "/run"]
        .iter()
        .any(|p| mount_point.starts_with(p))
}

pub fn capture_baseline() -> Result<HashSet<String>> {
    Ok(normalize_mountinfo(&parse_mountinfo()?))
}

/// Returns (added, removed) relative to `baseline`.
pub fn compare_mountinfo(baseline: &HashSet<String>) -> Result<(Vec<String>, Vec<String>)> {
    let current = capture_baseline()?;
    let mut added: Vec<String> = current.difference(baseline).cloned().collect();
    let mut removed: Vec<String> = baseline.difference(&current).cloned().collect();
    added.sort();
    removed.sort();
    Ok((added, removed))
}

pub fn verify_mount_invariance(baseline: &HashSet<String>) -> Result<bool> {
    let (added, removed) = compare_mountinfo(baseline)?;
    for mount in &added {
        log::warn!("Mount invariance violation, added: {}", mount);
    }
    for mount in &removed {
        log::warn!("Mount invariance violation, removed: {}", mount);
    }
    Ok(added.is_empty() && removed.is_empty())
}

/// Mounts added since `baseline` that fall outside `allowed_root`.
pub fn escaped_mounts(baseline: &HashSet<String>, allowed_root: &Path) -> Result<Vec<String>> {
    let (added, _) = compare_mountinfo(baseline)?;
    Ok(added
        .into_iter()
        .filter(|key| {
            let point = key.split('|').next().unwrap_or_default();
            !Path::new(point).starts_with(allowed_root)
        })
        .collect())
}
