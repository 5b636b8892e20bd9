// mcp-flow-bridge - Supervisor health watchdog
//
// Periodically probes the child's HTTP health endpoint:
// - success: unhealthy -> running
// - failure: running -> unhealthy (the process keeps running)
// Stops when the token is cancelled (child exited or stop requested).

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use tokio_util::sync::CancellationToken;

use super::lifecycle::ProcessState;
use super::Inner;

const PROBE_TIMEOUT: Duration = Duration::from_secs(5);

pub(super) fn spawn(inner: Arc<Inner>, token: CancellationToken) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        let interval = inner.config.health_interval();
        let url = format!("http://127.0.0.1:{}{}", inner.config.port, inner.config.health_path);
        tracing::info!(
            "watchdog: probing {} every {}ms for {}",
            url,
            interval.as_millis(),
            inner.server_id
        );

        loop {
            tokio::select! {
                _ = token.cancelled() => break,
                _ = tokio::time::sleep(interval) => {}
            }

            let healthy = probe(&inner.http, &url).await;
            *inner.last_health_check.lock().unwrap_or_else(|p| p.into_inner()) = Some(Utc::now());

            let changed = inner.lifecycle().health(healthy);
            match changed {
                Some(ProcessState::Unhealthy) => {
                    tracing::warn!("watchdog: {} is unhealthy ({})", inner.server_id, url)
                }
                Some(state) => tracing::info!("watchdog: {} is {}", inner.server_id, state.as_str()),
                None => tracing::debug!("watchdog: {} health={}", inner.server_id, healthy),
            }
        }
        tracing::debug!("watchdog: stopped for {}", inner.server_id);
    })
}

async fn probe(client: &reqwest::Client, url: &str) -> bool {
    match client.get(url).timeout(PROBE_TIMEOUT).send().await {
        Ok(resp) => resp.status().is_success(),
        Err(e) => {
            tracing::debug!("watchdog: probe {} failed: {}", url, e);
            false
        }
    }
}
