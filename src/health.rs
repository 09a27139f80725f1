use once_cell::sync::Lazy;
use std::time::Duration;
use tracing::debug;

/// Interval between health probes while waiting for a service to come up.
pub const POLL_INTERVAL: Duration = Duration::from_millis(300);

/// Per-probe request timeout. Shorter than the poll interval budget so a
/// hung connection never starves the loop.
pub const PROBE_TIMEOUT: Duration = Duration::from_millis(800);

// One shared client for all probes; connection pooling is free here.
static CLIENT: Lazy<reqwest::Client> = Lazy::new(reqwest::Client::new);

/// Single health probe: any 2xx response means healthy, anything else
/// (including connection failure) means not-yet-ready.
pub async fn is_up(url: &str, probe_timeout: Duration) -> bool {
    match CLIENT.get(url).timeout(probe_timeout).send().await {
        Ok(resp) => {
            let healthy = resp.status().is_success();
            debug!("Health probe {} -> {}", url, resp.status());
            healthy
        }
        Err(e) => {
            debug!("Health probe {} failed: {}", url, e);
            false
        }
    }
}

/// Poll the health URL until it answers 2xx or the timeout budget runs
/// out. Individual failures are absorbed and retried, never surfaced.
pub async fn wait_for_health(
    url: &str,
    timeout: Duration,
    poll_interval: Duration,
    probe_timeout: Duration,
) -> bool {
    let deadline = tokio::time::Instant::now() + timeout;
    loop {
        if is_up(url, probe_timeout).await {
            return true;
        }
        if tokio::time::Instant::now() >= deadline {
            return false;
        }
        tokio::time::sleep(poll_interval).await;
    }
}
