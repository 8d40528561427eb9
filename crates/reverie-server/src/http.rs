// crates/reverie-server/src/http.rs
// Shared HTTP client for embedding providers

use std::time::Duration;

/// Connect timeout for all requests
pub const CONNECT_TIMEOUT: Duration = Duration::from_secs(10);

/// Request timeout for embedding calls; the memory layer wraps calls in its own
/// shorter deadline as well
pub const FAST_TIMEOUT: Duration = Duration::from_secs(30);

/// Create the shared HTTP client. Build once at startup and clone; reqwest
/// pools connections internally.
pub fn create_shared_client() -> reqwest::Client {
    reqwest::Client::builder()
        .timeout(FAST_TIMEOUT)
        .connect_timeout(CONNECT_TIMEOUT)
        .pool_max_idle_per_host(10)
        .build()
        .unwrap_or_else(|_| reqwest::Client::new())
}
