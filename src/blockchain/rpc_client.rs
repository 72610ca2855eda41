use anyhow::{Context, Result};
use async_trait::async_trait;
use solana_client::rpc_client::RpcClient as SolanaRpcClient;
use solana_sdk::{commitment_config::CommitmentConfig, pubkey::Pubkey};
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::{RwLock, Semaphore};
use tokio::time::{sleep, timeout, Duration};

use crate::core::config::Config;

/// Max accounts per `getMultipleAccounts` request.
const MAX_MULTIPLE_ACCOUNTS: usize = 100;

/// Read capability the engines depend on. Absent accounts are `None`, not errors.
#[async_trait]
pub trait LedgerReader: Send + Sync {
    async fn get_account(&self, address: &Pubkey) -> Result<Option<Vec<u8>>>;

    async fn get_multiple_accounts(&self, addresses: &[Pubkey]) -> Result<Vec<Option<Vec<u8>>>>;

    async fn get_slot(&self) -> Result<u64>;

    async fn account_exists(&self, address: &Pubkey) -> Result<bool> {
        Ok(self.get_account(address).await?.is_some())
    }
}

pub struct RpcClient {
    client: Arc<SolanaRpcClient>,
    rpc_url: String,
    rate_limiter: Arc<Semaphore>,
    request_timeout: Duration,
}

impl RpcClient {
    pub fn new(rpc_url: String, request_timeout: Duration) -> Result<Self> {
        if request_timeout.is_zero() {
            return Err(anyhow::anyhow!("RPC request timeout must be greater than 0"));
        }

        log::info!(
            "RpcClient: Initialized for {} with request_timeout={:?}",
            rpc_url,
            request_timeout
        );

        Ok(RpcClient {
            client: Arc::new(SolanaRpcClient::new_with_commitment(
                rpc_url.clone(),
                CommitmentConfig::confirmed(),
            )),
            rpc_url,
            rate_limiter: Arc::new(Semaphore::new(10)),
            request_timeout,
        })
    }

    pub fn from_config(config: &Config) -> Result<Self> {
        Self::new(
            config.rpc_http_url.clone(),
            Duration::from_secs(config.rpc_timeout_seconds),
        )
    }

    pub fn request_timeout(&self) -> Duration {
        self.request_timeout
    }

    async fn should_retry_rate_limit(&self, error_str: &str, retry_count: &mut u32) -> bool {
        if error_str.contains("429") || error_str.contains("Too many requests") || error_str.contains("rate limit") {
            *retry_count += 1;
            if *retry_count <= 5 {
                let backoff = Duration::from_millis(500 * (*retry_count as u64));
                log::warn!("Rate limit hit (429), backing off for {:?} (attempt {}/{})", backoff, *retry_count, 5);
                sleep(backoff).await;
                return true;
            }
            log::error!("Rate limit exceeded after 5 retries");
        }
        false
    }

    /// Runs a blocking RPC call under the permit, timeout and 429 backoff.
    async fn call<T, F>(&self, what: &str, f: F) -> Result<T>
    where
        T: Send + 'static,
        F: Fn(&SolanaRpcClient) -> std::result::Result<T, solana_client::client_error::ClientError>
            + Send
            + Sync
            + Clone
            + 'static,
    {
        let _permit = self
            .rate_limiter
            .acquire()
            .await
            .context("Failed to acquire rate limiter permit")?;

        let mut retry_count = 0;
        loop {
            let client = Arc::clone(&self.client);
            let rpc_url = self.rpc_url.clone();
            let op = f.clone();

            let result = timeout(
                self.request_timeout,
                tokio::task::spawn_blocking(move || {
                    op(&client).map_err(|e| anyhow::anyhow!("RPC error ({}): {}", rpc_url, e))
                }),
            )
            .await
            .map_err(|_| {
                anyhow::anyhow!("RPC request timeout after {:?} for {}", self.request_timeout, what)
            })?
            .context("Failed to spawn blocking task")?;

            match result {
                Ok(value) => return Ok(value),
                Err(e) => {
                    if !self.should_retry_rate_limit(&e.to_string(), &mut retry_count).await {
                        return Err(e);
                    }
                }
            }
        }
    }
}

#[async_trait]
impl LedgerReader for RpcClient {
    async fn get_account(&self, address: &Pubkey) -> Result<Option<Vec<u8>>> {
        let pubkey = *address;
        let response = self
            .call(&format!("get_account({})", pubkey), move |c| {
                c.get_account_with_commitment(&pubkey, CommitmentConfig::confirmed())
            })
            .await?;
        Ok(response.value.map(|account| account.data))
    }

    async fn get_multiple_accounts(&self, addresses: &[Pubkey]) -> Result<Vec<Option<Vec<u8>>>> {
        let mut out = Vec::with_capacity(addresses.len());
        for chunk in addresses.chunks(MAX_MULTIPLE_ACCOUNTS) {
            let keys = chunk.to_vec();
            let count = keys.len();
            let accounts = self
                .call(&format!("get_multiple_accounts ({} accounts)", count), move |c| {
                    c.get_multiple_accounts(&keys)
                })
                .await?;
            out.extend(accounts.into_iter().map(|a| a.map(|account| account.data)));
        }
        Ok(out)
    }

    async fn get_slot(&self) -> Result<u64> {
        self.call("get_slot", |c| c.get_slot()).await
    }
}

/// Ledger snapshot held in memory. Used for offline planning and tests.
#[derive(Default)]
pub struct InMemoryLedger {
    accounts: RwLock<HashMap<Pubkey, Vec<u8>>>,
    slot: RwLock<u64>,
}

impl InMemoryLedger {
    pub fn new(slot: u64) -> Self {
        InMemoryLedger {
            accounts: RwLock::new(HashMap::new()),
            slot: RwLock::new(slot),
        }
    }

    pub async fn set_account(&self, address: Pubkey, data: Vec<u8>) {
        self.accounts.write().await.insert(address, data);
    }

    pub async fn remove_account(&self, address: &Pubkey) {
        self.accounts.write().await.remove(address);
    }

    pub async fn set_slot(&self, slot: u64) {
        *self.slot.write().await = slot;
    }
}

#[async_trait]
impl LedgerReader for InMemoryLedger {
    async fn get_account(&self, address: &Pubkey) -> Result<Option<Vec<u8>>> {
        Ok(self.accounts.read().await.get(address).cloned())
    }

    async fn get_multiple_accounts(&self, addresses: &[Pubkey]) -> Result<Vec<Option<Vec<u8>>>> {
        let accounts = self.accounts.read().await;
        Ok(addresses.iter().map(|a| accounts.get(a).cloned()).collect())
    }

    async fn get_slot(&self) -> Result<u64> {
        Ok(*self.slot.read().await)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_in_memory_ledger_reports_absence() {
        let ledger = InMemoryLedger::new(42);
        let present = Pubkey::new_unique();
        let absent = Pubkey::new_unique();
        ledger.set_account(present, vec![1, 2, 3]).await;

        assert_eq!(ledger.get_slot().await.unwrap(), 42);
        assert!(ledger.account_exists(&present).await.unwrap());
        assert!(!ledger.account_exists(&absent).await.unwrap());

        let many = ledger.get_multiple_accounts(&[absent, present]).await.unwrap();
        assert_eq!(many, vec![None, Some(vec![1, 2, 3])]);
    }

    #[test]
    fn test_zero_timeout_rejected() {
        assert!(RpcClient::new("http://localhost:8899".to_string(), Duration::ZERO).is_err());
    }
}
