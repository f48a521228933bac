use crate::config::HttpConfig;
use reqwest::Client;

/// Outbound client shared by every Admin API call. Fails rather than
/// falling back to a client without timeouts.
pub fn build_client(config: &HttpConfig) -> Result<Client, reqwest::Error> {
    Client::builder()
        .timeout(config.timeout)
        .connect_timeout(config.connect_timeout)
        .user_agent(concat!("appraisal-api-rs/", env!("CARGO_PKG_VERSION")))
        .build()
}
