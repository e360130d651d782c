//! Hierarchical path helpers
//!
//! Paths are absolute (`/a/b/c`), have no trailing slash except the root and
//! no empty segments. Sequential nodes end with a 10 digit zero-padded suffix.

use crate::common::{Error, Result};

pub const ROOT: &str = "/";

const SEQUENCE_WIDTH: usize = 10;

/// Reject malformed paths
pub fn validate(path: &str) -> Result<()> {
    if !path.starts_with('/') {
        return Err(Error::InvalidPath(format!("{} must start with '/'", path)));
    }
    if path == ROOT {
        return Ok(());
    }
    if path.ends_with('/') {
        return Err(Error::InvalidPath(format!("{} has a trailing '/'", path)));
    }
    if path.contains('\0') {
        return Err(Error::InvalidPath(format!("{:?} contains NUL", path)));
    }
    for segment in path[1..].split('/') {
        if segment.is_empty() {
            return Err(Error::InvalidPath(format!("{} has an empty segment", path)));
        }
        if segment == "." || segment == ".." {
            return Err(Error::InvalidPath(format!("{} has a relative segment", path)));
        }
    }
    Ok(())
}

/// Parent of a path, `None` for the root
pub fn parent(path: &str) -> Option<&str> {
    if path == ROOT {
        return None;
    }
    match path.rfind('/') {
        Some(0) => Some(ROOT),
        Some(idx) => Some(&path[..idx]),
        None => None,
    }
}

/// Last segment of a path
pub fn name(path: &str) -> &str {
    path.rsplit('/').next().unwrap_or(path)
}

/// Append a child name to a path
pub fn join(parent: &str, child: &str) -> String {
    if parent == ROOT {
        format!("/{}", child)
    } else {
        format!("{}/{}", parent, child)
    }
}

/// All proper ancestors from the top down, excluding the root
pub fn ancestors(path: &str) -> Vec<&str> {
    let mut out = Vec::new();
    let mut current = parent(path);
    while let Some(p) = current {
        if p == ROOT {
            break;
        }
        out.push(p);
        current = parent(p);
    }
    out.reverse();
    out
}

/// Path with the store-assigned sequence suffix appended
pub fn with_sequence(path: &str, sequence: u64) -> String {
    format!("{}{:0width$}", path, sequence, width = SEQUENCE_WIDTH)
}

/// Sequence suffix of a node name, if it has one
pub fn sequence_of(name: &str) -> Option<u64> {
    if name.len() < SEQUENCE_WIDTH {
        return None;
    }
    let suffix = &name[name.len() - SEQUENCE_WIDTH..];
    if !suffix.bytes().all(|b| b.is_ascii_digit()) {
        return None;
    }
    suffix.parse().ok()
}

/// Prefix of a sequential node name (`"lock-0000000003"` -> `"lock-"`)
pub fn sequence_prefix(name: &str) -> &str {
    match sequence_of(name) {
        Some(_) => &name[..name.len() - SEQUENCE_WIDTH],
        None => name,
    }
}
