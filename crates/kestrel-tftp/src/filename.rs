//! Request filename sanitization
//!
//! Runs before any resolver call. A path segment starting with `.` is
//! refused outright, which blocks `..` traversal and dotfiles alike.

use thiserror::Error;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum InvalidFilename {
    #[error("empty path")]
    Empty,

    #[error("path contains an empty segment")]
    EmptySegment,

    #[error("path segment {0:?} starts with '.'")]
    DotSegment(String),
}

/// Normalize a client-supplied filename into a relative request path.
pub fn sanitize(raw: &str) -> Result<String, InvalidFilename> {
    let trimmed = raw.strip_prefix('/').unwrap_or(raw);
    let cleaned: String = trimmed.chars().filter(|&c| c != '\\').collect();

    if cleaned.is_empty() {
        return Err(InvalidFilename::Empty);
    }

    for segment in cleaned.split('/') {
        if segment.is_empty() {
            return Err(InvalidFilename::EmptySegment);
        }
        if segment.starts_with('.') {
            return Err(InvalidFilename::DotSegment(segment.to_string()));
        }
    }

    Ok(cleaned)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rejects_traversal_and_dotfiles() {
        assert_eq!(
            sanitize("../../etc/passwd"),
            Err(InvalidFilename::DotSegment("..".to_string()))
        );
        assert_eq!(
            sanitize("/..secrets"),
            Err(InvalidFilename::DotSegment("..secrets".to_string()))
        );
        assert_eq!(
            sanitize("a/../b"),
            Err(InvalidFilename::DotSegment("..".to_string()))
        );
        assert!(sanitize("pxelinux.cfg/.hidden").is_err());
    }

    #[test]
    fn rejects_empty_paths() {
        assert_eq!(sanitize(""), Err(InvalidFilename::Empty));
        assert_eq!(sanitize("/"), Err(InvalidFilename::Empty));
        assert_eq!(sanitize("\\\\"), Err(InvalidFilename::Empty));
    }

    #[test]
    fn rejects_absolute_paths_hidden_behind_extra_slashes() {
        assert_eq!(sanitize("//etc/passwd"), Err(InvalidFilename::EmptySegment));
        assert_eq!(sanitize("\\/etc/passwd"), Err(InvalidFilename::EmptySegment));
        assert_eq!(sanitize("kernel/"), Err(InvalidFilename::EmptySegment));
    }

    #[test]
    fn accepts_plain_relative_paths() {
        assert_eq!(sanitize("kernel/vmlinuz"), Ok("kernel/vmlinuz".to_string()));
        assert_eq!(sanitize("/pxelinux.0"), Ok("pxelinux.0".to_string()));
        assert_eq!(
            sanitize("pxelinux.cfg\\/01-52-54-00-12-34-56"),
            Ok("pxelinux.cfg/01-52-54-00-12-34-56".to_string())
        );
        assert_eq!(sanitize("images/.."), Err(InvalidFilename::DotSegment("..".to_string())));
    }
}
