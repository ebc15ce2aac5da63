//! Payment submission loop
//!
//! Shared by initial establishment and renewals. Transport failures are
//! retried indefinitely with linear backoff; a double-spent token is retried
//! immediately with a fresh token, up to a hard cap; anything else is fatal
//! for the current attempt.

use crate::chandler::session::PaymentProposal;
use crate::config::ChandlerConfig;
use crate::crowsnest::prober::cancelled_during;
use crate::errors::{is_token_spent_response, TollGateError, TollGateResult};
use crate::merchant::Merchant;
use crate::protocol::{build_payment_event, calculate_cost, parse_session_event, SessionGrant};
use nostr::Keys;
use std::net::IpAddr;
use std::time::Duration;
use tokio::sync::watch;

const PAYMENT_TIMEOUT: Duration = Duration::from_secs(30);
const WARMUP_TIMEOUT: Duration = Duration::from_secs(1);

pub(crate) struct PaymentClient {
    client: reqwest::Client,
    max_token_retries: u32,
    backoff: Duration,
    overpayment_percent: u64,
    port: u16,
}

enum SubmitError {
    TokenSpent,
    Other(TollGateError),
}

impl PaymentClient {
    pub(crate) fn new(config: &ChandlerConfig) -> Self {
        Self {
            client: reqwest::Client::new(),
            max_token_retries: config.max_token_retries,
            backoff: config.payment_backoff(),
            overpayment_percent: config.token_overpayment_percent,
            port: crate::crowsnest::prober::TOLLGATE_PORT,
        }
    }

    #[cfg(test)]
    pub(crate) fn with_port(mut self, port: u16) -> Self {
        self.port = port;
        self
    }

    /// Run one top-level payment to completion. Counters reset per call.
    /// `cancel_rx` aborts the loop when the interface carrying the gateway
    /// disappears.
    pub(crate) async fn pay(
        &self,
        merchant: &dyn Merchant,
        gateway: IpAddr,
        mac_address: &str,
        customer_keys: &Keys,
        proposal: &PaymentProposal,
        cancel_rx: &mut watch::Receiver<bool>,
    ) -> TollGateResult<SessionGrant> {
        let amount = calculate_cost(&proposal.pricing, proposal.steps);
        let mut retry_count: u32 = 0;
        let mut token_retry_count: u32 = 0;

        loop {
            if *cancel_rx.borrow() {
                return Err(TollGateError::session(format!(
                    "Payment to {} cancelled",
                    proposal.tollgate_pubkey
                )));
            }

            self.warmup(gateway).await;

            // A fresh token every attempt: a previously submitted one may
            // already be burned upstream.
            let token = merchant
                .create_payment_token(
                    &proposal.pricing.mint_url,
                    amount,
                    self.overpayment_percent,
                )
                .await?;

            let event = build_payment_event(
                &proposal.tollgate_pubkey,
                mac_address,
                &token.token,
                customer_keys,
            )?;

            match self.submit(gateway, &event).await {
                Ok(grant) => {
                    log::info!(
                        "Payment accepted: upstream={} gateway={} amount={} steps={} reason={} attempt={}",
                        proposal.tollgate_pubkey,
                        gateway,
                        amount,
                        proposal.steps,
                        proposal.reason.as_str(),
                        retry_count + token_retry_count + 1
                    );
                    return Ok(grant);
                }
                Err(SubmitError::TokenSpent) => {
                    token_retry_count += 1;
                    log::warn!(
                        "Upstream {} reports token already spent ({} of {})",
                        proposal.tollgate_pubkey,
                        token_retry_count,
                        self.max_token_retries
                    );
                    if token_retry_count >= self.max_token_retries {
                        return Err(TollGateError::TokenRetriesExhausted(token_retry_count));
                    }
                    // No backoff: retry at once with the next token.
                }
                Err(SubmitError::Other(e)) => {
                    retry_count += 1;
                    let delay = self.backoff * retry_count;
                    log::warn!(
                        "Payment to {} via {} failed (attempt {}): {}; retrying in {:?}",
                        proposal.tollgate_pubkey,
                        gateway,
                        retry_count,
                        e,
                        delay
                    );
                    if cancelled_during(cancel_rx, delay).await {
                        return Err(TollGateError::session(format!(
                            "Payment to {} cancelled",
                            proposal.tollgate_pubkey
                        )));
                    }
                }
            }
        }
    }

    /// Some captive portals only open the payment port after any HTTP
    /// exchange on port 80. Outcome is ignored.
    async fn warmup(&self, gateway: IpAddr) {
        let url = format!("http://{}:80/", gateway);
        let _ = self
            .client
            .get(&url)
            .timeout(WARMUP_TIMEOUT)
            .send()
            .await;
    }

    async fn submit(
        &self,
        gateway: IpAddr,
        event: &nostr::Event,
    ) -> Result<SessionGrant, SubmitError> {
        let url = format!("http://{}:{}/", gateway, self.port);

        let response = self
            .client
            .post(&url)
            .header("Content-Type", "application/json")
            .header("Connection", "close")
            .json(event)
            .timeout(PAYMENT_TIMEOUT)
            .send()
            .await
            .map_err(|e| SubmitError::Other(e.into()))?;

        let status = response.status();
        let body = response
            .bytes()
            .await
            .map_err(|e| SubmitError::Other(e.into()))?;

        if status == reqwest::StatusCode::OK {
            return match parse_session_event(&body) {
                Ok(grant) => Ok(grant),
                Err(e) => {
                    let text = String::from_utf8_lossy(&body);
                    if is_token_spent_response(&text) {
                        Err(SubmitError::TokenSpent)
                    } else {
                        Err(SubmitError::Other(e))
                    }
                }
            };
        }

        let text = String::from_utf8_lossy(&body);
        if is_token_spent_response(&text) {
            Err(SubmitError::TokenSpent)
        } else {
            Err(SubmitError::Other(TollGateError::PaymentRejected(format!(
                "HTTP {}: {}",
                status, text
            ))))
        }
    }
}
