//! Source descriptor parsing.
//!
//! A descriptor names the asset for the P2P engine, an optional HTTP mirror
//! holding the same bytes, and whether the stream is fetched for metadata only:
//!
//! ```text
//! [tribe://]<primary>[|<fallback>][;xmlhttp]
//! ```
//!
//! The primary part is either an opaque asset URL for the primary engine, or
//! `<tracker>/<root hash>@<duration>` for the alternate engine.

use std::fmt;
use std::str::FromStr;

use url::Url;

/// Scheme prefix hosts may leave on the descriptor.
pub const SCHEME_PREFIX: &str = "tribe://";

/// Suffix that switches a session into metadata mode.
pub const METADATA_FLAG: &str = ";xmlhttp";

/// Distance between the last `/` and the last `@` of an alternate engine asset.
/// The root hash in between is 40 hex characters.
const ROOT_HASH_SPAN: isize = 41;

/// Errors produced while parsing a source descriptor.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum SourceError {
    #[error("Source descriptor has no primary asset: {descriptor:?}")]
    MissingPrimary { descriptor: String },

    #[error("Invalid fallback URL {url}: {reason}")]
    InvalidFallback { url: String, reason: String },
}

/// Which engine serves the primary asset.
///
/// Chosen once at parse time. The session maps it to a control strategy and
/// never branches on it again.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BackendKind {
    /// Engine reached over the line-based control protocol.
    Primary,
    /// Engine launched per asset that serves it over a local HTTP gateway.
    Alternate {
        /// Tracker locator passed to the engine at launch
        tracker: String,
        /// `<root hash>@<duration>` requested from the gateway
        gateway_path: String,
    },
}

impl BackendKind {
    fn classify(primary: &str) -> Self {
        let last_at = primary.rfind('@').map_or(-1, |i| i as isize);
        let last_slash = primary.rfind('/').map_or(-1, |i| i as isize);

        if last_at - last_slash != ROOT_HASH_SPAN {
            return BackendKind::Primary;
        }

        match primary.split_once('/') {
            Some((tracker, path)) => BackendKind::Alternate {
                tracker: tracker.to_string(),
                gateway_path: path.to_string(),
            },
            None => BackendKind::Alternate {
                tracker: String::new(),
                gateway_path: primary.to_string(),
            },
        }
    }

    /// Short label used in logs.
    pub fn label(&self) -> &'static str {
        match self {
            BackendKind::Primary => "primary",
            BackendKind::Alternate { .. } => "alternate",
        }
    }
}

/// Parsed, immutable description of what a session should stream.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SourceDescriptor {
    primary: String,
    fallback: Option<Url>,
    backend: BackendKind,
    metadata_mode: bool,
}

impl SourceDescriptor {
    /// Parses a descriptor, with or without the `tribe://` prefix.
    ///
    /// The metadata flag is removed first, then the remainder is split on the
    /// first `|`. An empty fallback part counts as no fallback.
    ///
    /// # Errors
    /// - `SourceError::MissingPrimary` - Nothing precedes the `|` separator
    /// - `SourceError::InvalidFallback` - Fallback part is not an absolute URL
    pub fn parse(descriptor: &str) -> Result<Self, SourceError> {
        let body = descriptor
            .trim()
            .strip_prefix(SCHEME_PREFIX)
            .unwrap_or(descriptor.trim());

        let (body, metadata_mode) = match body.find(METADATA_FLAG) {
            Some(index) => {
                let mut stripped = String::with_capacity(body.len() - METADATA_FLAG.len());
                stripped.push_str(&body[..index]);
                stripped.push_str(&body[index + METADATA_FLAG.len()..]);
                (stripped, true)
            }
            None => (body.to_string(), false),
        };

        let (primary, fallback) = match body.split_once('|') {
            Some((primary, fallback)) => (primary, Some(fallback)),
            None => (body.as_str(), None),
        };

        if primary.is_empty() {
            return Err(SourceError::MissingPrimary {
                descriptor: descriptor.to_string(),
            });
        }

        let fallback = match fallback.filter(|f| !f.is_empty()) {
            Some(raw) => Some(Url::parse(raw).map_err(|e| SourceError::InvalidFallback {
                url: raw.to_string(),
                reason: e.to_string(),
            })?),
            None => None,
        };

        Ok(Self {
            primary: primary.to_string(),
            backend: BackendKind::classify(primary),
            fallback,
            metadata_mode,
        })
    }

    /// Asset identifier sent to the engine.
    pub fn primary(&self) -> &str {
        &self.primary
    }

    /// HTTP mirror for intra-playback failover, if any.
    pub fn fallback(&self) -> Option<&Url> {
        self.fallback.as_ref()
    }

    pub fn backend(&self) -> &BackendKind {
        &self.backend
    }

    pub fn metadata_mode(&self) -> bool {
        self.metadata_mode
    }
}

impl FromStr for SourceDescriptor {
    type Err = SourceError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::parse(s)
    }
}

impl fmt::Display for SourceDescriptor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}{}", SCHEME_PREFIX, self.primary)?;
        if let Some(fallback) = &self.fallback {
            write!(f, "|{fallback}")?;
        }
        if self.metadata_mode {
            write!(f, "{METADATA_FLAG}")?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const ROOT_HASH: &str = "0123456789abcdef0123456789abcdef01234567";

    #[test]
    fn test_plain_primary_descriptor() {
        let source = SourceDescriptor::parse("tribe://http://tracker.example/video.torrent")
            .unwrap();

        assert_eq!(source.primary(), "http://tracker.example/video.torrent");
        assert_eq!(source.fallback(), None);
        assert_eq!(source.backend(), &BackendKind::Primary);
        assert!(!source.metadata_mode());
    }

    #[test]
    fn test_fallback_split_on_first_separator() {
        let source =
            SourceDescriptor::parse("asset.torrent|http://mirror.example/video.ogg?a=1|2").unwrap();

        assert_eq!(source.primary(), "asset.torrent");
        assert_eq!(
            source.fallback().map(Url::as_str),
            Some("http://mirror.example/video.ogg?a=1|2")
        );
    }

    #[test]
    fn test_metadata_flag_is_stripped_before_use() {
        let source =
            SourceDescriptor::parse("tribe://asset.torrent|http://mirror.example/v.ogg;xmlhttp")
                .unwrap();

        assert!(source.metadata_mode());
        assert_eq!(source.primary(), "asset.torrent");
        assert_eq!(
            source.fallback().map(Url::as_str),
            Some("http://mirror.example/v.ogg")
        );

        let source = SourceDescriptor::parse("asset.torrent;xmlhttp").unwrap();
        assert!(source.metadata_mode());
        assert_eq!(source.primary(), "asset.torrent");
    }

    #[test]
    fn test_alternate_backend_detected_by_root_hash_span() {
        let descriptor = format!("tracker.example:20000/{ROOT_HASH}@3600");
        let source = SourceDescriptor::parse(&descriptor).unwrap();

        assert_eq!(
            source.backend(),
            &BackendKind::Alternate {
                tracker: "tracker.example:20000".to_string(),
                gateway_path: format!("{ROOT_HASH}@3600"),
            }
        );
    }

    #[test]
    fn test_short_hash_stays_on_primary_backend() {
        let source = SourceDescriptor::parse("tracker.example/abc@3600").unwrap();
        assert_eq!(source.backend(), &BackendKind::Primary);

        // '@' before the last '/' gives a negative span
        let source =
            SourceDescriptor::parse(&format!("user@tracker.example/{ROOT_HASH}")).unwrap();
        assert_eq!(source.backend(), &BackendKind::Primary);
    }

    #[test]
    fn test_empty_fallback_means_none() {
        let source = SourceDescriptor::parse("asset.torrent|").unwrap();
        assert_eq!(source.fallback(), None);
    }

    #[test]
    fn test_missing_primary_rejected() {
        let result = SourceDescriptor::parse("tribe://|http://mirror.example/v.ogg");
        assert!(matches!(result, Err(SourceError::MissingPrimary { .. })));

        assert!(matches!(
            SourceDescriptor::parse(""),
            Err(SourceError::MissingPrimary { .. })
        ));
    }

    #[test]
    fn test_relative_fallback_rejected() {
        let result = SourceDescriptor::parse("asset.torrent|mirror/v.ogg");
        assert!(matches!(result, Err(SourceError::InvalidFallback { .. })));
    }

    #[test]
    fn test_display_restores_prefixed_form() {
        let source: SourceDescriptor = "asset.torrent|http://mirror.example/v.ogg;xmlhttp"
            .parse()
            .unwrap();

        assert_eq!(
            source.to_string(),
            "tribe://asset.torrent|http://mirror.example/v.ogg;xmlhttp"
        );
    }
}
