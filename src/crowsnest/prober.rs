//! Advertisement probing
//!
//! Fetches the raw signed advertisement from a suspected gateway. Bounded
//! retries, a hard response-size cap, and per-interface cancellation so an
//! interface-down event aborts whatever is still in flight.

use crate::config::CrowsnestConfig;
use crate::errors::{TollGateError, TollGateResult};
use std::collections::HashMap;
use std::net::IpAddr;
use std::time::Duration;
use tokio::sync::{watch, Mutex};

pub const TOLLGATE_PORT: u16 = 2121;
const USER_AGENT: &str = "TollGate-Crowsnest/1.0";
const MAX_RESPONSE_BYTES: usize = 1024 * 1024;

pub struct TollGateProber {
    client: reqwest::Client,
    config: CrowsnestConfig,
    cancellations: Mutex<HashMap<String, watch::Sender<bool>>>,
    port: u16,
}

impl TollGateProber {
    pub fn new(config: CrowsnestConfig) -> Self {
        let client = reqwest::Client::builder()
            .redirect(reqwest::redirect::Policy::none())
            .build()
            .unwrap();

        Self {
            client,
            config,
            cancellations: Mutex::new(HashMap::new()),
            port: TOLLGATE_PORT,
        }
    }

    #[cfg(test)]
    pub(crate) fn with_port(mut self, port: u16) -> Self {
        self.port = port;
        self
    }

    /// Fetch the advertisement bytes from `gateway`, retrying up to the
    /// configured count. A cancel handle is registered under `interface`
    /// before the first attempt.
    pub async fn probe(&self, interface: &str, gateway: IpAddr) -> TollGateResult<Vec<u8>> {
        let mut cancel_rx = self.register_cancel_handle(interface).await;
        let url = format!("http://{}:{}/", gateway, self.port);

        let mut attempt: u32 = 0;
        loop {
            if *cancel_rx.borrow() {
                return Err(TollGateError::probe(format!(
                    "Probe of {} cancelled for interface {}",
                    gateway, interface
                )));
            }

            attempt += 1;
            match self.fetch(&url).await {
                Ok(bytes) => return Ok(bytes),
                Err(e) if attempt > self.config.probe_retry_count => return Err(e),
                Err(e) => {
                    log::debug!(
                        "Probe attempt {} of {} failed for {} on {}: {}",
                        attempt,
                        self.config.probe_retry_count + 1,
                        gateway,
                        interface,
                        e
                    );
                }
            }

            if cancelled_during(&mut cancel_rx, self.config.probe_retry_delay()).await {
                return Err(TollGateError::probe(format!(
                    "Probe of {} cancelled for interface {}",
                    gateway, interface
                )));
            }
        }
    }

    /// Cancel any in-flight probe registered for `interface`.
    pub async fn cancel_probes_for_interface(&self, interface: &str) {
        let mut cancellations = self.cancellations.lock().await;
        if let Some(tx) = cancellations.remove(interface) {
            let _ = tx.send(true);
        }
    }

    async fn register_cancel_handle(&self, interface: &str) -> watch::Receiver<bool> {
        let mut cancellations = self.cancellations.lock().await;
        match cancellations.get(interface) {
            Some(tx) if !*tx.borrow() => tx.subscribe(),
            _ => {
                let (tx, rx) = watch::channel(false);
                cancellations.insert(interface.to_string(), tx);
                rx
            }
        }
    }

    async fn fetch(&self, url: &str) -> TollGateResult<Vec<u8>> {
        let response = self
            .client
            .get(url)
            .header("User-Agent", USER_AGENT)
            .header("Accept", "application/json")
            .timeout(self.config.probe_timeout())
            .send()
            .await?;

        let status = response.status();
        if status != reqwest::StatusCode::OK {
            return Err(TollGateError::probe(format!(
                "Gateway answered with HTTP {}",
                status
            )));
        }

        let bytes = response.bytes().await?;
        if bytes.is_empty() {
            return Err(TollGateError::probe("Empty advertisement body"));
        }
        if bytes.len() > MAX_RESPONSE_BYTES {
            return Err(TollGateError::probe(format!(
                "Advertisement body of {} bytes exceeds the {} byte cap",
                bytes.len(),
                MAX_RESPONSE_BYTES
            )));
        }

        Ok(bytes.to_vec())
    }
}

/// Sleep for `delay`, returning early with `true` when the cancel flag flips.
pub(crate) async fn cancelled_during(rx: &mut watch::Receiver<bool>, delay: Duration) -> bool {
    let sleep = tokio::time::sleep(delay);
    tokio::pin!(sleep);

    loop {
        tokio::select! {
            _ = &mut sleep => return false,
            changed = rx.changed() => match changed {
                Ok(()) if *rx.borrow() => return true,
                Ok(()) => continue,
                Err(_) => {
                    // Sender gone without cancelling; finish the delay.
                    sleep.as_mut().await;
                    return false;
                }
            },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_http::{http_ok, http_response, TestServer};

    fn config() -> CrowsnestConfig {
        CrowsnestConfig {
            probe_timeout_secs: 2,
            probe_retry_count: 1,
            probe_retry_delay_secs: 0,
            ..CrowsnestConfig::default()
        }
    }

    #[tokio::test]
    async fn test_probe_returns_body() {
        let server = TestServer::start(vec![http_ok("{\"kind\":10021}")]).await;
        let prober = TollGateProber::new(config()).with_port(server.addr.port());

        let bytes = prober
            .probe("wlan0", server.addr.ip())
            .await
            .unwrap();
        assert_eq!(bytes, b"{\"kind\":10021}");
    }

    #[tokio::test]
    async fn test_probe_retries_then_succeeds() {
        let server = TestServer::start(vec![
            http_response(500, "Internal Server Error", ""),
            http_ok("{\"kind\":10021}"),
        ])
        .await;
        let prober = TollGateProber::new(config()).with_port(server.addr.port());

        let bytes = prober.probe("wlan0", server.addr.ip()).await.unwrap();
        assert_eq!(bytes, b"{\"kind\":10021}");
        assert_eq!(server.hits(), 2);
    }

    #[tokio::test]
    async fn test_probe_non_200_exhausts_retries() {
        let server = TestServer::start(vec![http_response(404, "Not Found", "")]).await;
        let prober = TollGateProber::new(config()).with_port(server.addr.port());

        let err = prober.probe("wlan0", server.addr.ip()).await.unwrap_err();
        assert!(matches!(err, TollGateError::Probe(_)));
        // First attempt plus one retry.
        assert_eq!(server.hits(), 2);
    }

    #[tokio::test]
    async fn test_probe_rejects_empty_body() {
        let server = TestServer::start(vec![http_ok("")]).await;
        let prober = TollGateProber::new(config()).with_port(server.addr.port());

        assert!(prober.probe("wlan0", server.addr.ip()).await.is_err());
    }

    #[tokio::test]
    async fn test_probe_rejects_oversized_body() {
        let body = "x".repeat(MAX_RESPONSE_BYTES + 1);
        let server = TestServer::start(vec![http_ok(&body)]).await;
        let prober = TollGateProber::new(config()).with_port(server.addr.port());

        let err = prober.probe("wlan0", server.addr.ip()).await.unwrap_err();
        assert!(matches!(err, TollGateError::Probe(_)));
    }

    #[tokio::test]
    async fn test_cancel_aborts_retry_delay() {
        // Server always fails, long retry delay: the probe sits in backoff
        // until the cancel arrives.
        let server = TestServer::start(vec![http_response(500, "Internal Server Error", "")]).await;
        let slow = CrowsnestConfig {
            probe_retry_delay_secs: 30,
            probe_retry_count: 2,
            probe_timeout_secs: 2,
            ..CrowsnestConfig::default()
        };
        let prober = std::sync::Arc::new(TollGateProber::new(slow).with_port(server.addr.port()));

        let probing = {
            let prober = prober.clone();
            let ip = server.addr.ip();
            tokio::spawn(async move { prober.probe("wlan0", ip).await })
        };

        tokio::time::sleep(Duration::from_millis(100)).await;
        prober.cancel_probes_for_interface("wlan0").await;

        let result = tokio::time::timeout(Duration::from_secs(2), probing)
            .await
            .expect("probe did not abort after cancel")
            .unwrap();
        assert!(result.is_err());
    }
}
