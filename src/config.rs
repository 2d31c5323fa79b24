//! Client configuration: aggregator endpoint, transport selection and the
//! timeout/interval policy shared by every component.

use std::time::Duration;
use url::Url;

/// Which live transport carries fleet events for this deployment.
///
/// Both transports speak the same envelope contract; exactly one is active
/// per logical stream. Neither can carry custom headers, so the access token
/// rides the `token` query parameter on both.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransportKind {
    WebSocket,
    Sse,
}

#[derive(Debug, Clone)]
pub struct ClientConfig {
    /// Aggregator base URL, e.g. `http://dash.example:3001/api/`.
    /// Always stored with a trailing slash so endpoint joins are relative.
    pub base_url: Url,
    pub transport: TransportKind,

    /// Default timeout for one-shot reads (container list).
    pub read_timeout: Duration,
    /// Timeout for host enumeration, which fans out server-side.
    pub hosts_timeout: Duration,
    /// Timeout for start/stop/restart actions.
    pub action_timeout: Duration,
    /// Timeout for image-update triggers, which can pull on the remote side.
    pub update_timeout: Duration,

    /// Fixed delay between live-stream reconnect attempts.
    pub reconnect_delay: Duration,

    /// Idle span after which the session is force-logged-out.
    pub inactivity_timeout: Duration,
    /// Cadence of the idle check, independent of activity volume.
    pub activity_check_interval: Duration,
}

impl ClientConfig {
    pub fn new(mut base_url: Url) -> Self {
        if !base_url.path().ends_with('/') {
            let path = format!("{}/", base_url.path());
            base_url.set_path(&path);
        }
        Self {
            base_url,
            transport: TransportKind::WebSocket,
            read_timeout: Duration::from_secs(8),
            hosts_timeout: Duration::from_secs(15),
            action_timeout: Duration::from_secs(15),
            update_timeout: Duration::from_secs(30),
            reconnect_delay: Duration::from_secs(3),
            inactivity_timeout: Duration::from_secs(30 * 60),
            activity_check_interval: Duration::from_secs(60),
        }
    }

    pub fn with_transport(mut self, transport: TransportKind) -> Self {
        self.transport = transport;
        self
    }

    /// Resolve a relative endpoint path against the base URL.
    pub fn endpoint(&self, path: &str) -> Result<Url, url::ParseError> {
        self.base_url.join(path.trim_start_matches('/'))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn base_url_gets_trailing_slash() {
        let cfg = ClientConfig::new(Url::parse("http://localhost:3001/api").unwrap());
        assert_eq!(cfg.base_url.as_str(), "http://localhost:3001/api/");
        let url = cfg.endpoint("auth/login").unwrap();
        assert_eq!(url.as_str(), "http://localhost:3001/api/auth/login");
    }

    #[test]
    fn endpoint_ignores_leading_slash() {
        let cfg = ClientConfig::new(Url::parse("http://localhost:3001/api/").unwrap());
        let url = cfg.endpoint("/containers").unwrap();
        assert_eq!(url.as_str(), "http://localhost:3001/api/containers");
    }
}
