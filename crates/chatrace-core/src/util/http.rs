use once_cell::sync::Lazy;
use reqwest::Client;
use std::time::Duration;

/// Global HTTP client with connection pooling and keep-alive.
static HTTP_CLIENT: Lazy<Client> = Lazy::new(|| {
    build_client(Duration::from_secs(10)).expect("Failed to create HTTP client")
});

/// Build a client suited to long-lived SSE responses.
///
/// No overall request timeout: streams stay open for the whole completion and
/// the race deadline bounds time to first content.
pub fn build_client(connect_timeout: Duration) -> reqwest::Result<Client> {
    Client::builder()
        .connect_timeout(connect_timeout)
        .pool_max_idle_per_host(50)
        .pool_idle_timeout(Duration::from_secs(90))
        .tcp_keepalive(Duration::from_secs(30))
        .user_agent(concat!("chatrace/", env!("CARGO_PKG_VERSION")))
        .build()
}

/// Get the global HTTP client.
pub fn client() -> &'static Client {
    &HTTP_CLIENT
}
