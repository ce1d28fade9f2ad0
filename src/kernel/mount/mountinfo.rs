/// Mount table queries via /proc/self/mountinfo
use crate::config::types::{Result, SockError};
use std::fs;
use std::path::{Path, PathBuf};

/// Mount entry from /proc/self/mountinfo
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MountEntry {
    pub mount_id: u32,
    pub parent_id: u32,
    pub root: PathBuf,
    pub mount_point: PathBuf,
    pub mount_options: String,
    pub filesystem_type: String,
}

pub fn parse_mountinfo() -> Result<Vec<MountEntry>> {
    let content = fs::read_to_string("/proc/self/mountinfo").map_err(|e| {
        SockError::UnmountFailed(format!("Failed to read /proc/self/mountinfo: {}", e))
    })?;
    Ok(content.lines().filter_map(parse_mountinfo_line).collect())
}

/// Format: mount_id parent_id major:minor root mount_point options [optional...] - fs_type source super_options
pub fn parse_mountinfo_line(line: &str) -> Option<MountEntry> {
    let parts: Vec<&str> = line.split_whitespace().collect();
    if parts.len() < 10 {
        return None;
    }

    let sep_pos = parts.iter().position(|&p| p == "-")?;
    let filesystem_type = parts.get(sep_pos + 1)?.to_string();

    Some(MountEntry {
        mount_id: parts[0].parse().ok()?,
        parent_id: parts[1].parse().ok()?,
        root: PathBuf::from(unescape(parts[3])),
        mount_point: PathBuf::from(unescape(parts[4])),
        mount_options: parts[5].to_string(),
        filesystem_type,
    })
}

/// The kernel escapes space, tab, newline and backslash as `\ooo`.
fn unescape(field: &str) -> String {
    let bytes = field.as_bytes();
    let mut out = Vec::with_capacity(bytes.len());
    let mut i = 0;
    while i < bytes.len() {
        if bytes[i] == b'\\' && i + 4 <= bytes.len() {
            let decoded = std::str::from_utf8(&bytes[i + 1..i + 4])
                .ok()
                .and_then(|s| u8::from_str_radix(s, 8).ok());
            if let Some(b) = decoded {
                out.push(b);
                i += 4;
                continue;
            }
        }
        out.push(bytes[i]);
        i += 1;
    }
    String::from_utf8_lossy(&out).into_owned()
}

/// Mounts at or below `dir`, innermost last.
pub fn mounts_under(dir: &Path) -> Result<Vec<MountEntry>> {
    Ok(filter_under(parse_mountinfo()?, dir))
}

fn filter_under(entries: Vec<MountEntry>, dir: &Path) -> Vec<MountEntry> {
    entries
        .into_iter()
        .filter(|e| e.mount_point.starts_with(dir))
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    const SAMPLE: &str = "\
22 1 8:1 / / rw,relatime shared:1 - ext4 /dev/sda1 rw
101 22 8:1 /srv/w/lambda /srv/w/sock/7 ro,relatime - ext4 /dev/sda1 rw
102 101 8:1 /code/noop /srv/w/sock/7/handler ro,relatime - ext4 /dev/sda1 rw
103 101 8:1 /srv/w/sock-scratch/7/tmp /srv/w/sock/7/tmp rw,relatime - ext4 /dev/sda1 rw
104 22 8:1 /srv/w/lambda /srv/w/sock/70 ro,relatime - ext4 /dev/sda1 rw
105 22 0:50 / /mnt/with\\040space rw - tmpfs tmpfs rw";

    #[test]
    fn test_parse_line_fields() {
        let entry = parse_mountinfo_line(SAMPLE.lines().nth(1).unwrap()).unwrap();
        assert_eq!(entry.mount_id, 101);
        assert_eq!(entry.parent_id, 22);
        assert_eq!(entry.root, PathBuf::from("/srv/w/lambda"));
        assert_eq!(entry.mount_point, PathBuf::from("/srv/w/sock/7"));
        assert_eq!(entry.filesystem_type, "ext4");
    }

    #[test]
    fn test_parse_optional_fields_and_escapes() {
        let root = parse_mountinfo_line(SAMPLE.lines().next().unwrap()).unwrap();
        assert_eq!(root.filesystem_type, "ext4");

        let spaced = parse_mountinfo_line(SAMPLE.lines().last().unwrap()).unwrap();
        assert_eq!(spaced.mount_point, PathBuf::from("/mnt/with space"));
        assert_eq!(spaced.filesystem_type, "tmpfs");
    }

    #[test]
    fn test_rejects_short_lines() {
        assert!(parse_mountinfo_line("1 2 3").is_none());
    }

    #[test]
    fn test_filter_is_component_wise() {
        let entries: Vec<_> = SAMPLE.lines().filter_map(parse_mountinfo_line).collect();
        let under = filter_under(entries, Path::new("/srv/w/sock/7"));
        let points: Vec<_> = under.iter().map(|e| e.mount_point.clone()).collect();
        assert_eq!(
            points,
            vec![
                PathBuf::from("/srv/w/sock/7"),
                PathBuf::from("/srv/w/sock/7/handler"),
                PathBuf::from("/srv/w/sock/7/tmp"),
            ]
        );
    }

    #[test]
    fn test_live_mount_table_has_root() {
        let entries = parse_mountinfo().unwrap();
        assert!(entries.iter().any(|e| e.mount_point == Path::new("/")));
    }
}
