//! Source classification by file extension

use std::collections::HashSet;
use std::path::Path;

use percent_encoding::percent_decode_str;
use url::Url;

use crate::common::config::{normalize_extension, SourceConfig};

/// Which backend owns a source file
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SourceKind {
    Managed,
    Native,
    Unknown,
}

/// Case-insensitive extension lookup against the configured sets
///
/// Classification is recomputed on every call; nothing is cached per path.
#[derive(Debug, Clone)]
pub struct SourceClassifier {
    managed: HashSet<String>,
    native: HashSet<String>,
}

impl SourceClassifier {
    pub fn new(config: &SourceConfig) -> Self {
        Self {
            managed: config
                .managed_extensions
                .iter()
                .map(|e| normalize_extension(e))
                .collect(),
            native: config
                .native_extensions
                .iter()
                .map(|e| normalize_extension(e))
                .collect(),
        }
    }

    pub fn classify(&self, path: &str) -> SourceKind {
        let Some(ext) = Path::new(path).extension().and_then(|e| e.to_str()) else {
            return SourceKind::Unknown;
        };
        let ext = ext.to_ascii_lowercase();
        if self.native.contains(&ext) {
            SourceKind::Native
        } else if self.managed.contains(&ext) {
            SourceKind::Managed
        } else {
            SourceKind::Unknown
        }
    }
}

/// Convert a `file://` URI into a plain path; other strings pass through
///
/// A non-local host is kept as a `//host/...` prefix. Escapes that do not
/// decode to UTF-8 are left encoded.
pub fn normalize_source_path(path: &str) -> String {
    let url = match Url::parse(path) {
        Ok(url) if url.scheme() == "file" => url,
        _ => return path.to_string(),
    };

    let decoded = percent_decode_str(url.path())
        .decode_utf8()
        .map(|p| p.into_owned())
        .unwrap_or_else(|_| url.path().to_string());

    match url.host_str() {
        Some(host) if !host.is_empty() && host != "localhost" => {
            return format!("//{}{}", host, decoded);
        }
        _ => {}
    }

    // `/C:/dir/file.c` -> `C:/dir/file.c`
    let bytes = decoded.as_bytes();
    if bytes.len() >= 3 && bytes[0] == b'/' && bytes[1].is_ascii_alphabetic() && bytes[2] == b':'
    {
        decoded[1..].to_string()
    } else {
        decoded
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn classifier() -> SourceClassifier {
        SourceClassifier::new(&SourceConfig::default())
    }

    #[test]
    fn test_classify_by_extension() {
        let c = classifier();
        assert_eq!(c.classify("/proj/app.py"), SourceKind::Managed);
        assert_eq!(c.classify("/proj/native/ext.cpp"), SourceKind::Native);
        assert_eq!(c.classify("/proj/README.md"), SourceKind::Unknown);
        assert_eq!(c.classify("/proj/Makefile"), SourceKind::Unknown);
    }

    #[test]
    fn test_classify_is_case_insensitive() {
        let c = classifier();
        assert_eq!(c.classify("C:/proj/EXT.CPP"), SourceKind::Native);
        assert_eq!(c.classify("/proj/Main.PY"), SourceKind::Managed);
    }

    #[test]
    fn test_custom_extensions_with_dots() {
        let c = SourceClassifier::new(&SourceConfig {
            managed_extensions: vec![".JS".to_string()],
            native_extensions: vec![".zig".to_string()],
        });
        assert_eq!(c.classify("/a/b.js"), SourceKind::Managed);
        assert_eq!(c.classify("/a/b.zig"), SourceKind::Native);
        assert_eq!(c.classify("/a/b.py"), SourceKind::Unknown);
    }

    #[test]
    fn test_normalize_file_uri() {
        assert_eq!(normalize_source_path("/proj/app.cpp"), "/proj/app.cpp");
        assert_eq!(normalize_source_path("file:///proj/my%20app.cpp"), "/proj/my app.cpp");
        assert_eq!(normalize_source_path("file:///C:/proj/app.cpp"), "C:/proj/app.cpp");
        assert_eq!(normalize_source_path("file://localhost/proj/a.c"), "/proj/a.c");
    }

    #[test]
    fn test_percent_decode_leaves_malformed_escapes() {
        assert_eq!(normalize_source_path("file:///a%2"), "/a%2");
        assert_eq!(normalize_source_path("file:///a%zz.c"), "/a%zz.c");
        assert_eq!(normalize_source_path("file:///proj/%FF.c"), "/proj/%FF.c");
    }

    #[test]
    fn test_normalize_keeps_remote_host() {
        assert_eq!(
            normalize_source_path("file://fileserver/share/ext.c"),
            "//fileserver/share/ext.c"
        );
    }

    #[test]
    fn test_non_file_uris_pass_through() {
        assert_eq!(normalize_source_path("C:/proj/app.cpp"), "C:/proj/app.cpp");
        assert_eq!(normalize_source_path("http://host/a.c"), "http://host/a.c");
        assert_eq!(normalize_source_path("relative/a.c"), "relative/a.c");
    }
}
