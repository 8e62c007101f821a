//! Outbound HTTP for webhooks.

use std::time::Duration;

use once_cell::sync::Lazy;
use serde::Serialize;

const USER_AGENT: &str = concat!("escrow-jobs/", env!("CARGO_PKG_VERSION"));

/// Pooled client shared by every webhook post.
static WEBHOOK_CLIENT: Lazy<reqwest::Client> = Lazy::new(|| {
    reqwest::Client::builder()
        .user_agent(USER_AGENT)
        .pool_max_idle_per_host(4)
        .connect_timeout(Duration::from_secs(5))
        .timeout(Duration::from_secs(10))
        .build()
        .unwrap_or_default()
});

/// Posts `payload` as JSON. Non-2xx answers come back as errors.
pub async fn post_json<T: Serialize>(url: &str, payload: &T) -> Result<(), reqwest::Error> {
    WEBHOOK_CLIENT
        .post(url)
        .json(payload)
        .send()
        .await?
        .error_for_status()?;
    Ok(())
}
