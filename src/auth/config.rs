//! Engine configuration.

use url::Url;

const DEFAULT_SESSION_TTL_SECONDS: i64 = 12 * 60 * 60;
const DEFAULT_SECONDARY_TTL_SECONDS: i64 = 5 * 60;
const DEFAULT_STATE_TTL_SECONDS: i64 = 5 * 60;

#[derive(Clone, Debug)]
pub struct AuthConfig {
    base_url: String,
    demo: bool,
    session_ttl_seconds: i64,
    secondary_ttl_seconds: i64,
    state_ttl_seconds: i64,
    rp_id: String,
    rp_name: String,
}

impl AuthConfig {
    #[must_use]
    pub fn new(base_url: String) -> Self {
        let rp_id = Url::parse(&base_url)
            .ok()
            .and_then(|url: Url| url.host_str().map(ToString::to_string))
            .unwrap_or_else(|| "localhost".to_string());

        Self {
            base_url,
            demo: false,
            session_ttl_seconds: DEFAULT_SESSION_TTL_SECONDS,
            secondary_ttl_seconds: DEFAULT_SECONDARY_TTL_SECONDS,
            state_ttl_seconds: DEFAULT_STATE_TTL_SECONDS,
            rp_id,
            rp_name: "Zerogate".to_string(),
        }
    }

    #[must_use]
    pub fn with_demo(mut self, demo: bool) -> Self {
        self.demo = demo;
        self
    }

    #[must_use]
    pub fn with_session_ttl_seconds(mut self, seconds: i64) -> Self {
        self.session_ttl_seconds = seconds;
        self
    }

    #[must_use]
    pub fn with_secondary_ttl_seconds(mut self, seconds: i64) -> Self {
        self.secondary_ttl_seconds = seconds;
        self
    }

    #[must_use]
    pub fn with_state_ttl_seconds(mut self, seconds: i64) -> Self {
        self.state_ttl_seconds = seconds;
        self
    }

    #[must_use]
    pub fn with_rp_name(mut self, name: String) -> Self {
        self.rp_name = name;
        self
    }

    #[must_use]
    pub fn demo(&self) -> bool {
        self.demo
    }

    #[must_use]
    pub fn session_ttl_seconds(&self) -> i64 {
        self.session_ttl_seconds
    }

    #[must_use]
    pub fn secondary_ttl_seconds(&self) -> i64 {
        self.secondary_ttl_seconds
    }

    #[must_use]
    pub fn state_ttl_seconds(&self) -> i64 {
        self.state_ttl_seconds
    }

    #[must_use]
    pub fn session_cookie_secure(&self) -> bool {
        self.base_url.starts_with("https://")
    }

    #[must_use]
    pub fn rp_id(&self) -> &str {
        &self.rp_id
    }

    /// Origin without a trailing slash, for the device verifier.
    #[must_use]
    pub fn rp_origin(&self) -> String {
        self.base_url.trim_end_matches('/').to_string()
    }

    #[must_use]
    pub fn rp_name(&self) -> &str {
        &self.rp_name
    }
}
