//! Helpers for absolute, slash-separated remote paths.
//!
//! Paths handed to the handle table are always normalized: a leading `/`,
//! no empty segments and no trailing `/` except for the root itself.

use crate::error::{Error, Result};

pub const ROOT: &str = "/";

/// Collapse empty, `.` and `..` segments into an absolute path.
pub fn normalize(p: &str) -> String {
    let mut parts: Vec<&str> = Vec::new();
    for seg in p.split('/') {
        match seg {
            "" | "." => {}
            ".." => {
                parts.pop();
            }
            s => parts.push(s),
        }
    }
    let mut out = String::from("/");
    out.push_str(&parts.join("/"));
    out
}

/// Child path of `parent`. `name` must already be validated.
pub fn join(parent: &str, name: &str) -> String {
    if parent == ROOT {
        format!("/{name}")
    } else {
        format!("{parent}/{name}")
    }
}

/// Parent of a normalized path. The root has none.
pub fn parent(path: &str) -> Option<&str> {
    if path == ROOT {
        return None;
    }
    match path.rfind('/') {
        Some(0) => Some(ROOT),
        Some(n) => Some(&path[..n]),
        None => None,
    }
}

pub fn file_name(path: &str) -> &str {
    match path.rfind('/') {
        Some(n) => &path[n + 1..],
        None => path,
    }
}

/// Remainder of `path` below `ancestor`, if `path` is a strict descendant.
pub fn strip_ancestor<'a>(path: &'a str, ancestor: &str) -> Option<&'a str> {
    if ancestor == ROOT {
        return path.strip_prefix('/').filter(|rest| !rest.is_empty());
    }
    path.strip_prefix(ancestor)
        .and_then(|rest| rest.strip_prefix('/'))
        .filter(|rest| !rest.is_empty())
}

pub fn is_strict_ancestor(ancestor: &str, path: &str) -> bool {
    strip_ancestor(path, ancestor).is_some()
}

/// Reject names that would escape or alias their parent directory.
pub fn validate_name(name: &str) -> Result<()> {
    if name.is_empty() || name == "." || name == ".." || name.contains(['/', '\0']) {
        return Err(Error::InvalidName(name.to_owned()));
    }
    Ok(())
}
