//! Object references handed to transfer adapters.
//!
//! An [`ObjectRef`] names one content-addressed object, the remote link it is
//! moved through and the local path it is read from (uploads) or published to
//! (downloads). It is built by the caller before `add` and never mutated
//! while a transfer is in flight.

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::time::{Duration, SystemTime};

use crate::Oid;

/// A remote location for one object (an upload, download or verify action).
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Link {
    /// The URL for the action.
    pub href: String,
    /// HTTP headers to include in the request.
    #[serde(default)]
    pub header: HashMap<String, String>,
    /// Server-assigned action id (SSH transfers).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<String>,
    /// Server-assigned action token (SSH transfers).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub token: Option<String>,
    /// Point in time after which the link is no longer valid.
    #[serde(skip)]
    pub expires_at: Option<SystemTime>,
}

impl Link {
    pub fn new(href: impl Into<String>) -> Self {
        Link {
            href: href.into(),
            ..Default::default()
        }
    }

    /// Add a request header.
    pub fn with_header(mut self, name: &str, value: &str) -> Self {
        self.header.insert(name.to_string(), value.to_string());
        self
    }

    /// Expire the link `ttl` from now.
    pub fn expires_in(mut self, ttl: Duration) -> Self {
        self.expires_at = Some(SystemTime::now() + ttl);
        self
    }

    /// Expire the link at a fixed time.
    pub fn expires_at(mut self, at: SystemTime) -> Self {
        self.expires_at = Some(at);
        self
    }

    /// Look up a header case-insensitively.
    pub fn header(&self, name: &str) -> Option<&str> {
        self.header
            .iter()
            .find(|(k, _)| k.eq_ignore_ascii_case(name))
            .map(|(_, v)| v.as_str())
    }

    /// Returns the expiry time if the link is expired at `at`.
    pub fn expired_at(&self, at: SystemTime) -> Option<SystemTime> {
        self.expires_at.filter(|expires| *expires <= at)
    }
}

/// One transferable object.
#[derive(Debug, Clone, PartialEq)]
pub struct ObjectRef {
    name: String,
    oid: Oid,
    size: u64,
    link: Option<Link>,
    verify: Option<Link>,
    path: PathBuf,
}

impl ObjectRef {
    /// Create a reference for `oid`/`size`; `path` is the upload source or
    /// the download destination.
    pub fn new(name: impl Into<String>, oid: Oid, size: u64, path: impl Into<PathBuf>) -> Self {
        ObjectRef {
            name: name.into(),
            oid,
            size,
            link: None,
            verify: None,
            path: path.into(),
        }
    }

    /// Set the link the object moves through.
    pub fn with_link(mut self, link: Link) -> Self {
        self.link = Some(link);
        self
    }

    /// Set the link called after a successful upload.
    pub fn with_verify(mut self, link: Link) -> Self {
        self.verify = Some(link);
        self
    }

    /// The working tree file name that triggered the transfer.
    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn oid(&self) -> &Oid {
        &self.oid
    }

    pub fn size(&self) -> u64 {
        self.size
    }

    pub fn link(&self) -> Option<&Link> {
        self.link.as_ref()
    }

    pub fn verify_link(&self) -> Option<&Link> {
        self.verify.as_ref()
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_link_deserialize() {
        let json = r#"{
            "href": "https://example.com/download",
            "header": {
                "Authorization": "Bearer token"
            },
            "expires_in": 3600
        }"#;

        let link: Link = serde_json::from_str(json).unwrap();
        assert_eq!(link.href, "https://example.com/download");
        assert_eq!(link.header("authorization"), Some("Bearer token"));
        assert!(link.expires_at.is_none());
    }

    #[test]
    fn test_link_serialize_skips_empty_ids() {
        let json = serde_json::to_string(&Link::new("https://example.com/x")).unwrap();
        assert!(json.contains("\"href\":\"https://example.com/x\""));
        assert!(!json.contains("token"));
    }

    #[test]
    fn test_link_expiry() {
        let now = SystemTime::now();
        let link = Link::new("https://example.com").expires_at(now);
        assert_eq!(link.expired_at(now + Duration::from_secs(5)), Some(now));
        assert_eq!(link.expired_at(now - Duration::from_secs(5)), None);
        assert_eq!(Link::new("x").expired_at(now), None);
    }

    #[test]
    fn test_object_ref_accessors() {
        let oid = Oid::from_content(b"abc");
        let obj = ObjectRef::new("a.bin", oid.clone(), 3, "/tmp/a.bin")
            .with_link(Link::new("https://example.com/a"));
        assert_eq!(obj.name(), "a.bin");
        assert_eq!(obj.oid(), &oid);
        assert_eq!(obj.size(), 3);
        assert_eq!(obj.path(), Path::new("/tmp/a.bin"));
        assert!(obj.verify_link().is_none());
    }
}
