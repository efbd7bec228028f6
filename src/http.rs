//! Shared HTTP agent for the basic transfer strategies.

use chrono::{DateTime, Utc};
use std::sync::Arc;
use std::time::Duration;
use url::Url;

use crate::config::HttpConfig;
use crate::{Error, Link, ObjectRef, Result};

const USER_AGENT: &str = concat!("lfs-transfer/", env!("CARGO_PKG_VERSION"));

/// HTTP client used by transfer adapters.
///
/// This type is cheaply cloneable - clones share the same underlying agent
/// and connection pool.
#[derive(Clone)]
pub struct HttpClient {
    agent: Arc<ureq::Agent>,
}

impl HttpClient {
    /// Build a client honouring the configured timeouts.
    ///
    /// The TLS handshake happens inside the connect phase, so its timeout is
    /// added to the dial timeout. The keepalive period bounds how long a
    /// connection may sit idle mid-read or mid-write.
    pub fn new(config: &HttpConfig) -> Self {
        let agent = ureq::AgentBuilder::new()
            .timeout_connect(config.dial_timeout + config.tls_timeout)
            .timeout_read(config.keepalive)
            .timeout_write(config.keepalive)
            .user_agent(USER_AGENT)
            .build();
        HttpClient {
            agent: Arc::new(agent),
        }
    }

    /// Start a request for a link, applying the link's headers.
    pub fn request(&self, method: &str, link: &Link) -> Result<ureq::Request> {
        let url = Url::parse(&link.href).map_err(|e| Error::InvalidUrl(format!("{}: {}", link.href, e)))?;
        let mut req = self.agent.request_url(method, &url);
        for (key, value) in &link.header {
            req = req.set(key, value);
        }
        Ok(req)
    }

    /// Tell the server an upload finished.
    pub fn verify_upload(&self, link: &Link, object: &ObjectRef) -> Result<()> {
        let body = serde_json::json!({
            "oid": object.oid().to_hex(),
            "size": object.size(),
        });

        let req = self
            .request("POST", link)?
            .set("Accept", "application/vnd.git-lfs+json")
            .set("Content-Type", "application/vnd.git-lfs+json");
        req.send_json(body)?;
        Ok(())
    }
}

impl Default for HttpClient {
    fn default() -> Self {
        HttpClient::new(&HttpConfig::default())
    }
}

/// Short description of a request target for error messages.
pub(crate) fn describe(method: &str, link: &Link) -> String {
    format!("{} {}", method, link.href)
}

/// Classify a `429 Too Many Requests` answer. The object is retriable, and
/// retriable later when the server sent a usable `Retry-After`.
pub(crate) fn too_many_requests(method: &str, link: &Link, response: ureq::Response) -> Error {
    let after = response
        .header("Retry-After")
        .and_then(|value| parse_retry_after(value, Utc::now()));
    let err = Error::ServerError {
        code: 429,
        message: format!("{}: too many requests", describe(method, link)),
    };
    match after {
        Some(after) => Error::retriable_later(err, after),
        None => Error::retriable(err),
    }
}

/// `Retry-After` is either a number of seconds or an HTTP date. Dates in the
/// past mean "now".
fn parse_retry_after(value: &str, now: DateTime<Utc>) -> Option<Duration> {
    let value = value.trim();
    if let Ok(secs) = value.parse::<u64>() {
        return Some(Duration::from_secs(secs));
    }
    let at = DateTime::parse_from_rfc2822(value).ok()?.with_timezone(&Utc);
    Some((at - now).to_std().unwrap_or(Duration::ZERO))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_request_rejects_bad_url() {
        let client = HttpClient::default();
        let err = client.request("GET", &Link::new("not a url")).unwrap_err();
        assert!(matches!(err, Error::InvalidUrl(_)));
    }

    #[test]
    fn test_request_applies_headers() {
        let client = HttpClient::default();
        let link = Link::new("http://localhost/obj").with_header("X-Token", "abc");
        let req = client.request("GET", &link).unwrap();
        assert_eq!(req.header("X-Token"), Some("abc"));
        assert_eq!(req.method(), "GET");
    }

    #[test]
    fn test_parse_retry_after() {
        let now = DateTime::parse_from_rfc2822("Wed, 21 Oct 2015 07:28:00 GMT")
            .unwrap()
            .with_timezone(&Utc);
        assert_eq!(parse_retry_after("120", now), Some(Duration::from_secs(120)));
        assert_eq!(
            parse_retry_after("Wed, 21 Oct 2015 07:29:30 GMT", now),
            Some(Duration::from_secs(90))
        );
        assert_eq!(
            parse_retry_after("Wed, 21 Oct 2015 07:00:00 GMT", now),
            Some(Duration::ZERO)
        );
        assert_eq!(parse_retry_after("soon", now), None);
        assert_eq!(parse_retry_after("-5", now), None);
    }

    #[test]
    fn test_client_clone_shares_agent() {
        let client1 = HttpClient::default();
        let client2 = client1.clone();
        assert!(Arc::ptr_eq(&client1.agent, &client2.agent));
    }
}
