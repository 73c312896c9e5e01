//! Canonical storage paths for voice notes.
//!
//! Single source of truth - use this instead of string-replacing paths.
//!
//! | Kind | Layout |
//! |------|--------|
//! | Raw upload | `{tenant}/voice-notes/{file_name}` |
//! | Converted artifact | `{tenant}/voice-notes/converted/{stem}.{ext}` |
//!
//! The mapping is keyed on `(tenant, stem)`: upload names are unique per
//! tenant namespace, so each raw path has exactly one converted path and each
//! converted path identifies exactly one raw stem.

use thiserror::Error;

/// Voice-note namespace segment under each tenant prefix
pub const VOICE_NOTES_DIR: &str = "voice-notes";

/// Sub-namespace holding converted artifacts
pub const CONVERTED_DIR: &str = "converted";

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum PathError {
    #[error("Path is not under a tenant voice-note namespace: {0}")]
    OutsideNamespace(String),

    #[error("Expected a raw voice-note path, got a converted one: {0}")]
    AlreadyConverted(String),

    #[error("Expected a converted voice-note path: {0}")]
    NotConverted(String),
}

/// Where a path sits relative to the voice-note namespace
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum VoiceNotePath<'a> {
    Raw { tenant: &'a str, file_name: &'a str },
    Converted { tenant: &'a str, file_name: &'a str },
}

impl<'a> VoiceNotePath<'a> {
    /// Classify a storage path; `None` if it is outside every tenant's voice-note namespace
    pub fn parse(path: &'a str) -> Option<Self> {
        let marker = format!("/{}/", VOICE_NOTES_DIR);
        let idx = path.find(&marker)?;

        let tenant = &path[..idx];
        let rest = &path[idx + marker.len()..];

        if tenant.is_empty() || tenant.starts_with('/') || rest.is_empty() {
            return None;
        }

        if let Some(file_name) = rest.strip_prefix(&format!("{}/", CONVERTED_DIR)) {
            if file_name.is_empty() || file_name.contains('/') {
                return None;
            }
            return Some(Self::Converted { tenant, file_name });
        }

        if rest.contains('/') {
            return None;
        }

        Some(Self::Raw {
            tenant,
            file_name: rest,
        })
    }

    pub fn tenant(&self) -> &'a str {
        match self {
            Self::Raw { tenant, .. } | Self::Converted { tenant, .. } => tenant,
        }
    }

    pub fn file_name(&self) -> &'a str {
        match self {
            Self::Raw { file_name, .. } | Self::Converted { file_name, .. } => file_name,
        }
    }

    pub fn is_converted(&self) -> bool {
        matches!(self, Self::Converted { .. })
    }
}

/// Identity of a raw upload within a tenant's namespace
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct RawKey {
    pub tenant: String,
    pub stem: String,
}

impl RawKey {
    /// Whether `raw_path` is the upload this key was derived from
    pub fn matches(&self, raw_path: &str) -> bool {
        match VoiceNotePath::parse(raw_path) {
            Some(VoiceNotePath::Raw { tenant, file_name }) => {
                tenant == self.tenant && file_stem(file_name) == self.stem
            }
            _ => false,
        }
    }
}

/// Pure mapping between raw uploads and their converted artifacts
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PathMapper {
    /// Extension of the canonical container (without the dot)
    extension: String,
}

impl Default for PathMapper {
    fn default() -> Self {
        Self::new("ogg")
    }
}

impl PathMapper {
    pub fn new(extension: impl Into<String>) -> Self {
        Self {
            extension: extension.into().trim_start_matches('.').to_string(),
        }
    }

    pub fn extension(&self) -> &str {
        &self.extension
    }

    /// `{tenant}/voice-notes/{name}` → `{tenant}/voice-notes/converted/{stem}.{ext}`
    pub fn converted_path(&self, raw_path: &str) -> Result<String, PathError> {
        match VoiceNotePath::parse(raw_path) {
            Some(VoiceNotePath::Raw { tenant, file_name }) => Ok(format!(
                "{}/{}/{}/{}.{}",
                tenant,
                VOICE_NOTES_DIR,
                CONVERTED_DIR,
                file_stem(file_name),
                self.extension
            )),
            Some(VoiceNotePath::Converted { .. }) => {
                Err(PathError::AlreadyConverted(raw_path.to_string()))
            }
            None => Err(PathError::OutsideNamespace(raw_path.to_string())),
        }
    }

    /// Inverse of [`converted_path`](Self::converted_path)
    pub fn raw_key(&self, converted_path: &str) -> Result<RawKey, PathError> {
        match VoiceNotePath::parse(converted_path) {
            Some(VoiceNotePath::Converted { tenant, file_name }) => Ok(RawKey {
                tenant: tenant.to_string(),
                stem: file_stem(file_name).to_string(),
            }),
            Some(VoiceNotePath::Raw { .. }) => {
                Err(PathError::NotConverted(converted_path.to_string()))
            }
            None => Err(PathError::OutsideNamespace(converted_path.to_string())),
        }
    }

    /// Raw path with the given original extension (`None` for extensionless uploads)
    pub fn raw_path(&self, key: &RawKey, original_extension: Option<&str>) -> String {
        match original_extension {
            Some(ext) => format!("{}/{}/{}.{}", key.tenant, VOICE_NOTES_DIR, key.stem, ext),
            None => format!("{}/{}/{}", key.tenant, VOICE_NOTES_DIR, key.stem),
        }
    }
}

/// File name without its last extension (`note.v2.webm` → `note.v2`)
pub fn file_stem(file_name: &str) -> &str {
    match file_name.rsplit_once('.') {
        Some((stem, _)) if !stem.is_empty() => stem,
        _ => file_name,
    }
}

/// Extension of the last path segment, lowercased
pub fn extension_of(path: &str) -> Option<String> {
    let name = path.rsplit('/').next().unwrap_or(path);
    match name.rsplit_once('.') {
        Some((stem, ext)) if !stem.is_empty() && !ext.is_empty() => Some(ext.to_ascii_lowercase()),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_converted_path_for_webm() {
        let mapper = PathMapper::default();
        assert_eq!(
            mapper.converted_path("acme/voice-notes/note1.webm").unwrap(),
            "acme/voice-notes/converted/note1.ogg"
        );
    }

    #[test]
    fn test_converted_path_keeps_nested_tenant_prefix() {
        let mapper = PathMapper::default();
        assert_eq!(
            mapper
                .converted_path("companies/acme/voice-notes/a.b.m4a")
                .unwrap(),
            "companies/acme/voice-notes/converted/a.b.ogg"
        );
    }

    #[test]
    fn test_extensionless_upload() {
        let mapper = PathMapper::default();
        assert_eq!(
            mapper.converted_path("acme/voice-notes/note1").unwrap(),
            "acme/voice-notes/converted/note1.ogg"
        );
        assert_eq!(
            mapper.converted_path("acme/voice-notes/.hidden").unwrap(),
            "acme/voice-notes/converted/.hidden.ogg"
        );
    }

    #[test]
    fn test_rejects_paths_outside_namespace() {
        let mapper = PathMapper::default();
        assert!(matches!(
            mapper.converted_path("acme/images/cat.png"),
            Err(PathError::OutsideNamespace(_))
        ));
        assert!(matches!(
            mapper.converted_path("voice-notes/note1.webm"),
            Err(PathError::OutsideNamespace(_))
        ));
        assert!(matches!(
            mapper.converted_path("acme/voice-notes/sub/note1.webm"),
            Err(PathError::OutsideNamespace(_))
        ));
    }

    #[test]
    fn test_rejects_converted_input() {
        let mapper = PathMapper::default();
        assert!(matches!(
            mapper.converted_path("acme/voice-notes/converted/note1.ogg"),
            Err(PathError::AlreadyConverted(_))
        ));
    }

    #[test]
    fn test_inverse_identifies_raw_upload() {
        let mapper = PathMapper::default();
        let raw = "acme/voice-notes/note1.webm";
        let converted = mapper.converted_path(raw).unwrap();

        let key = mapper.raw_key(&converted).unwrap();
        assert_eq!(key.tenant, "acme");
        assert_eq!(key.stem, "note1");
        assert!(key.matches(raw));
        assert!(!key.matches("other/voice-notes/note1.webm"));
        assert_eq!(mapper.raw_path(&key, Some("webm")), raw);

        // Round trip back through the forward mapping
        assert_eq!(mapper.converted_path(&mapper.raw_path(&key, None)).unwrap(), converted);
    }

    #[test]
    fn test_classification() {
        let raw = VoiceNotePath::parse("acme/voice-notes/n.webm").unwrap();
        assert!(!raw.is_converted());
        assert_eq!(raw.tenant(), "acme");
        assert_eq!(raw.file_name(), "n.webm");

        let converted = VoiceNotePath::parse("acme/voice-notes/converted/n.ogg").unwrap();
        assert!(converted.is_converted());

        assert!(VoiceNotePath::parse("acme/voice-notes/").is_none());
        assert!(VoiceNotePath::parse("acme/voice-notes/converted/").is_none());
    }

    #[test]
    fn test_extension_of() {
        assert_eq!(extension_of("acme/voice-notes/n.WEBM"), Some("webm".to_string()));
        assert_eq!(extension_of("acme/voice-notes/n"), None);
        assert_eq!(extension_of("acme/voice-notes/.hidden"), None);
    }
}
