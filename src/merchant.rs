//! Merchant wallet boundary
//!
//! The ecash wallet that backs payments lives outside the core; sessions only
//! need to know which mints it accepts, what it holds there, and how to cut a
//! single-use bearer token. Implementations wrap the real wallet; tests use an
//! in-memory double.

use crate::errors::TollGateResult;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};

/// A mint the local wallet can pay from, with the unit it denominates in.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AcceptedMint {
    pub url: String,
    pub price_unit: String,
}

/// Single-use bearer token produced for one payment event.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PaymentToken {
    pub token: String,
    pub amount: u64,
    pub mint_url: String,
    pub unit: String,
}

#[async_trait]
pub trait Merchant: Send + Sync {
    /// Mints the wallet holds funds at, in preference order.
    async fn accepted_mints(&self) -> Vec<AcceptedMint>;

    /// Spendable balance at one mint, in that mint's unit.
    async fn balance_by_mint(&self, mint_url: &str) -> TollGateResult<u64>;

    /// Cut a token worth `amount` at `mint_url`. `overpayment_margin_percent`
    /// bounds how far the token may exceed `amount` when the proofs cannot be
    /// split exactly. Each call must return a fresh token; a previously
    /// returned token may have been burned by a failed payment.
    async fn create_payment_token(
        &self,
        mint_url: &str,
        amount: u64,
        overpayment_margin_percent: u64,
    ) -> TollGateResult<PaymentToken>;
}

#[cfg(test)]
pub(crate) mod testing {
    use super::*;
    use std::sync::atomic::{AtomicU64, Ordering};
    use tokio::sync::Mutex;

    /// In-memory merchant double. Hands out sequentially numbered tokens so
    /// tests can assert that retries really got fresh ones.
    pub(crate) struct FakeMerchant {
        mints: Vec<AcceptedMint>,
        balances: Mutex<std::collections::HashMap<String, u64>>,
        token_counter: AtomicU64,
    }

    impl FakeMerchant {
        pub(crate) fn new(mints: Vec<(&str, &str, u64)>) -> Self {
            let accepted = mints
                .iter()
                .map(|(url, unit, _)| AcceptedMint {
                    url: url.to_string(),
                    price_unit: unit.to_string(),
                })
                .collect();
            let balances = mints
                .iter()
                .map(|(url, _, balance)| (url.to_string(), *balance))
                .collect();

            Self {
                mints: accepted,
                balances: Mutex::new(balances),
                token_counter: AtomicU64::new(0),
            }
        }

        pub(crate) fn tokens_issued(&self) -> u64 {
            self.token_counter.load(Ordering::SeqCst)
        }
    }

    #[async_trait]
    impl Merchant for FakeMerchant {
        async fn accepted_mints(&self) -> Vec<AcceptedMint> {
            self.mints.clone()
        }

        async fn balance_by_mint(&self, mint_url: &str) -> TollGateResult<u64> {
            Ok(*self.balances.lock().await.get(mint_url).unwrap_or(&0))
        }

        async fn create_payment_token(
            &self,
            mint_url: &str,
            amount: u64,
            _overpayment_margin_percent: u64,
        ) -> TollGateResult<PaymentToken> {
            let mut balances = self.balances.lock().await;
            let balance = balances.entry(mint_url.to_string()).or_insert(0);
            if *balance < amount {
                return Err(crate::errors::TollGateError::merchant(format!(
                    "balance {} below requested {}",
                    balance, amount
                )));
            }
            *balance -= amount;

            let serial = self.token_counter.fetch_add(1, Ordering::SeqCst);
            Ok(PaymentToken {
                token: format!("cashuTestToken{}", serial),
                amount,
                mint_url: mint_url.to_string(),
                unit: "sat".to_string(),
            })
        }
    }
}
