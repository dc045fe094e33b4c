use std::time::Duration;

use crate::config::HttpConfig;

/// The `User-Agent` sent with every upstream request.
const USER_AGENT: &str = concat!("subcache/", env!("CARGO_PKG_VERSION"));

/// Creates a [`reqwest::Client`] for upstream sub-requests.
///
/// The connect and overall request timeouts come from `config`. The client transparently
/// decompresses gzip responses and keeps idle connections for 30 seconds.
pub fn create_client(config: &HttpConfig) -> reqwest::Result<reqwest::Client> {
    reqwest::ClientBuilder::new()
        .gzip(true)
        .user_agent(USER_AGENT)
        .connect_timeout(config.connect_timeout)
        .timeout(config.timeout)
        .pool_idle_timeout(Duration::from_secs(30))
        .build()
}
