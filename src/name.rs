//! Document names: validation and mapping to storage locations.
//!
//! A document name comes off the wire as a request path. After stripping the
//! configured prefix and URL-decoding, one leading `/` is the routing
//! separator; anything remaining that still starts with `/` is a *rooted*
//! name used verbatim on the filesystem, everything else is *relative* to
//! the base directory.
//!
//! Validation is deliberately strict: names are used to build filesystem
//! paths, so traversal segments and odd characters are refused outright.

use std::path::{Path, PathBuf};
use std::sync::LazyLock;

use regex::Regex;
use thiserror::Error;

/// Maximum length of a document name in bytes.
pub const MAX_NAME_LEN: usize = 1024;

static ROOTED: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^/[0-9A-Za-z_\-./]+$").expect("rooted name pattern"));
static RELATIVE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^[0-9A-Za-z_\-./]+$").expect("relative name pattern"));

/// Why a name was refused.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum NameError {
    #[error("document name is empty")]
    Empty,
    #[error("document name exceeds {MAX_NAME_LEN} bytes")]
    TooLong,
    #[error("document name contains a '..' segment")]
    Traversal,
    #[error("document name starts with a backslash")]
    LeadingBackslash,
    #[error("document name contains characters outside [\\w\\-./]")]
    InvalidCharacters,
}

/// A validated document name.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct DocName(String);

impl DocName {
    /// Validate a raw name (already prefix-stripped and URL-decoded).
    pub fn parse(raw: &str) -> Result<Self, NameError> {
        if raw.is_empty() {
            return Err(NameError::Empty);
        }
        if raw.len() > MAX_NAME_LEN {
            return Err(NameError::TooLong);
        }
        if raw.starts_with('\\') {
            return Err(NameError::LeadingBackslash);
        }
        if raw.split('/').any(|segment| segment == "..") {
            return Err(NameError::Traversal);
        }
        if !ROOTED.is_match(raw) && !RELATIVE.is_match(raw) {
            return Err(NameError::InvalidCharacters);
        }
        Ok(Self(raw.to_string()))
    }

    /// Derive a name from a socket request path: strip the configured
    /// prefix, URL-decode, drop the single routing `/`.
    pub fn from_request_path(path: &str, prefix: Option<&str>) -> Result<Self, NameError> {
        let stripped = match prefix {
            Some(p) if !p.is_empty() => path.strip_prefix(p).unwrap_or(path),
            _ => path,
        };
        let decoded = urlencoding::decode(stripped).map_err(|_| NameError::InvalidCharacters)?;
        let name = decoded.strip_prefix('/').unwrap_or(&decoded);
        Self::parse(name)
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Rooted names map to absolute filesystem paths verbatim.
    pub fn is_rooted(&self) -> bool {
        self.0.starts_with('/')
    }

    /// Resolve to the text file path. Relative names live under `base_dir`
    /// and get the first configured extension appended when none of the
    /// configured extensions is already present; rooted names are verbatim.
    pub fn file_path(&self, base_dir: &Path, extensions: &[String]) -> PathBuf {
        if self.is_rooted() {
            return PathBuf::from(&self.0);
        }
        let has_ext = extensions
            .iter()
            .any(|ext| self.0.ends_with(&format!(".{ext}")));
        if has_ext || extensions.is_empty() {
            base_dir.join(&self.0)
        } else {
            base_dir.join(format!("{}.{}", self.0, extensions[0]))
        }
    }

    /// Flatten separators for use as a snapshot-slot file name.
    pub fn flattened(&self) -> String {
        self.0.trim_start_matches('/').replace('/', "_")
    }
}

impl std::fmt::Display for DocName {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn md() -> Vec<String> {
        vec!["md".to_string()]
    }

    #[test]
    fn test_valid_relative_names() {
        for name in ["notes", "notes/today", "a-b_c.d", "deep/nested/path/file"] {
            assert!(DocName::parse(name).is_ok(), "{name}");
        }
    }

    #[test]
    fn test_valid_rooted_name() {
        let name = DocName::parse("/var/notes/today.md").unwrap();
        assert!(name.is_rooted());
    }

    #[test]
    fn test_empty_rejected() {
        assert_eq!(DocName::parse(""), Err(NameError::Empty));
    }

    #[test]
    fn test_too_long_rejected() {
        let long = "a".repeat(MAX_NAME_LEN + 1);
        assert_eq!(DocName::parse(&long), Err(NameError::TooLong));
    }

    #[test]
    fn test_traversal_rejected() {
        for name in ["../escape", "notes/../../etc", "a/.."] {
            assert_eq!(DocName::parse(name), Err(NameError::Traversal), "{name}");
        }
    }

    #[test]
    fn test_dotdot_inside_segment_allowed() {
        // "..." and "a..b" are not traversal segments
        assert!(DocName::parse("notes/a..b").is_ok());
        assert!(DocName::parse("...").is_ok());
    }

    #[test]
    fn test_leading_backslash_rejected() {
        assert_eq!(DocName::parse("\\notes"), Err(NameError::LeadingBackslash));
    }

    #[test]
    fn test_invalid_characters_rejected() {
        for name in ["sp ace", "semi;colon", "quo\"te", "null\0", "tab\there"] {
            assert_eq!(
                DocName::parse(name),
                Err(NameError::InvalidCharacters),
                "{name}"
            );
        }
    }

    #[test]
    fn test_request_path_derivation() {
        let name = DocName::from_request_path("/notes/today", None).unwrap();
        assert_eq!(name.as_str(), "notes/today");
        assert!(!name.is_rooted());
    }

    #[test]
    fn test_request_path_double_slash_is_rooted() {
        let name = DocName::from_request_path("//var/notes", None).unwrap();
        assert_eq!(name.as_str(), "/var/notes");
        assert!(name.is_rooted());
    }

    #[test]
    fn test_request_path_prefix_stripped() {
        let name = DocName::from_request_path("/sync/notes", Some("/sync")).unwrap();
        assert_eq!(name.as_str(), "notes");
    }

    #[test]
    fn test_request_path_url_decoded() {
        let name = DocName::from_request_path("/notes%2Ftoday", None).unwrap();
        assert_eq!(name.as_str(), "notes/today");
    }

    #[test]
    fn test_decoded_traversal_still_rejected() {
        assert!(DocName::from_request_path("/%2E%2E/escape", None).is_err());
    }

    #[test]
    fn test_file_path_appends_extension() {
        let name = DocName::parse("notes").unwrap();
        assert_eq!(
            name.file_path(Path::new("/base"), &md()),
            PathBuf::from("/base/notes.md")
        );
    }

    #[test]
    fn test_file_path_keeps_existing_extension() {
        let name = DocName::parse("notes.md").unwrap();
        assert_eq!(
            name.file_path(Path::new("/base"), &md()),
            PathBuf::from("/base/notes.md")
        );
    }

    #[test]
    fn test_file_path_rooted_verbatim() {
        let name = DocName::parse("/elsewhere/doc").unwrap();
        assert_eq!(
            name.file_path(Path::new("/base"), &md()),
            PathBuf::from("/elsewhere/doc")
        );
    }

    #[test]
    fn test_flattened() {
        assert_eq!(DocName::parse("a/b/c").unwrap().flattened(), "a_b_c");
        assert_eq!(DocName::parse("/x/y").unwrap().flattened(), "x_y");
        assert_eq!(DocName::parse("plain").unwrap().flattened(), "plain");
    }
}
