//! Path parsing utilities for the VFS layer.

/// Splits a path into components, skipping empty segments.
///
/// Leading, trailing, and repeated slashes all collapse.
pub fn components(path: &str) -> impl Iterator<Item = &str> {
    path.split('/').filter(|s| !s.is_empty())
}

/// Returns `true` if the path starts with `/`.
#[must_use]
pub fn is_absolute(path: &str) -> bool {
    path.starts_with('/')
}

/// Finds the longest mount point that prefixes `path`.
///
/// A non-root mount matches only on a component boundary, so `/dev`
/// matches `/dev/input` but not `/device`. The root mount matches
/// everything.
pub fn longest_prefix_match<'a>(
    path: &str,
    mount_points: impl Iterator<Item = &'a str>,
) -> Option<&'a str> {
    let mut best: Option<&str> = None;

    for mount in mount_points {
        let matches = mount == "/"
            || path == mount
            || (path.starts_with(mount) && path.as_bytes().get(mount.len()) == Some(&b'/'));

        if matches && best.is_none_or(|b| mount.len() > b.len()) {
            best = Some(mount);
        }
    }

    best
}

/// Strips a mount prefix, returning the path remainder inside that mount.
#[must_use]
pub fn strip_mount_prefix<'a>(path: &'a str, mount: &str) -> &'a str {
    if mount == "/" {
        path.strip_prefix('/').unwrap_or(path)
    } else if path.len() == mount.len() {
        ""
    } else {
        &path[mount.len() + 1..]
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn components_collapse_slashes() {
        let parts: Vec<_> = components("//usr///bin/ls/").collect();
        assert_eq!(parts, ["usr", "bin", "ls"]);
        assert_eq!(components("/").count(), 0);
    }

    #[test]
    fn longest_prefix_prefers_specific_mount() {
        let mounts = ["/", "/dev", "/dev/input"];
        assert_eq!(
            longest_prefix_match("/dev/input/event0", mounts.iter().copied()),
            Some("/dev/input")
        );
        assert_eq!(
            longest_prefix_match("/dev/null", mounts.iter().copied()),
            Some("/dev")
        );
        assert_eq!(
            longest_prefix_match("/device", mounts.iter().copied()),
            Some("/")
        );
    }

    #[test]
    fn strip_prefix_variants() {
        assert_eq!(strip_mount_prefix("/a/b", "/"), "a/b");
        assert_eq!(strip_mount_prefix("/dev/null", "/dev"), "null");
        assert_eq!(strip_mount_prefix("/dev", "/dev"), "");
    }
}
