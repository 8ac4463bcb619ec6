//! Response introspection for metadata-mode sessions.
//!
//! Some consumers inspect the request they are reading from (headers,
//! status, URIs) outside the streaming callbacks. A metadata-mode session
//! answers those questions with what the engine's data connection returned.

use std::sync::Arc;

use parking_lot::RwLock;
use rand::Rng;

use crate::upstream::ResponseHead;

/// Read access to the response behind a stream.
pub trait ResponseMetadata {
    /// Response header by case-insensitive name. `None` when the header is
    /// absent or no response has been seen.
    fn response_header(&self, name: &str) -> Option<String>;

    fn response_status(&self) -> Option<u16>;

    fn content_type(&self) -> Option<String> {
        self.response_header("content-type")
    }

    fn request_method(&self) -> &'static str {
        "GET"
    }
}

/// Response head captured from the engine, shared between the forwarder that
/// records it and the handles that read it.
#[derive(Debug, Clone, Default)]
pub struct ShadowedResponse {
    head: Arc<RwLock<Option<ResponseHead>>>,
}

impl ShadowedResponse {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record(&self, head: &ResponseHead) {
        if let Some(content_type) = head.content_type() {
            tracing::debug!("Shadowing engine response, content type {}", content_type);
        }
        *self.head.write() = Some(head.clone());
    }

    pub fn is_recorded(&self) -> bool {
        self.head.read().is_some()
    }
}

impl ResponseMetadata for ShadowedResponse {
    fn response_header(&self, name: &str) -> Option<String> {
        self.head
            .read()
            .as_ref()
            .and_then(|head| head.header(name).map(str::to_string))
    }

    fn response_status(&self) -> Option<u16> {
        self.head.read().as_ref().and_then(ResponseHead::status)
    }
}

/// Stand-in URIs reported by metadata-mode sessions in place of the
/// descriptor, on a random loopback port.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ShadowUris {
    pub presented: String,
    pub original: String,
}

impl ShadowUris {
    pub fn generate() -> Self {
        let port: u16 = rand::rng().random_range(0..50000);
        Self::on_port(port)
    }

    pub fn on_port(port: u16) -> Self {
        Self {
            presented: format!("http://127.0.0.1:{port}/fakeurl.html"),
            original: format!("http://127.0.0.1:{port}/fakeorigurl.html"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_mocks::head;

    #[test]
    fn test_empty_store_reports_nothing() {
        let store = ShadowedResponse::new();

        assert!(!store.is_recorded());
        assert_eq!(store.response_header("content-type"), None);
        assert_eq!(store.response_status(), None);
        assert_eq!(store.request_method(), "GET");
    }

    #[test]
    fn test_recorded_head_visible_through_clones() {
        let store = ShadowedResponse::new();
        let reader = store.clone();

        store.record(&head(
            200,
            &[("content-type", "application/xml"), ("x-duration", "3600")],
        ));

        assert_eq!(reader.content_type().as_deref(), Some("application/xml"));
        assert_eq!(reader.response_header("X-Duration").as_deref(), Some("3600"));
        assert_eq!(reader.response_header("etag"), None);
        assert_eq!(reader.response_status(), Some(200));
    }

    #[test]
    fn test_shadow_uris_share_port() {
        let uris = ShadowUris::on_port(4242);
        assert_eq!(uris.presented, "http://127.0.0.1:4242/fakeurl.html");
        assert_eq!(uris.original, "http://127.0.0.1:4242/fakeorigurl.html");

        let generated = ShadowUris::generate();
        assert!(generated.presented.ends_with("/fakeurl.html"));
    }
}
