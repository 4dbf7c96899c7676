//! Alchemy address-activity webhook.

use crate::config::Secret;
use crate::error::ApiError;
use crate::reconciler::Reconciler;
use ethers::types::{Bytes, Log, H256, U256, U64};
use hmac::{Hmac, Mac};
use odds_contract::decode_log;
use odds_types::WalletAddress;
use serde::{Deserialize, Serialize};
use sha2::Sha256;
use tracing::{debug, info, warn};

pub const SIGNATURE_HEADER: &str = "x-alchemy-signature";

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AlchemyWebhook {
    #[serde(default)]
    pub id: String,
    pub event: AlchemyEvent,
}

#[derive(Debug, Deserialize)]
pub struct AlchemyEvent {
    pub data: AlchemyData,
}

#[derive(Debug, Deserialize)]
pub struct AlchemyData {
    pub block: AlchemyBlock,
}

#[derive(Debug, Deserialize)]
pub struct AlchemyBlock {
    #[serde(default)]
    pub number: u64,
    #[serde(default)]
    pub logs: Vec<AlchemyLog>,
}

#[derive(Debug, Deserialize)]
pub struct AlchemyAccount {
    pub address: String,
}

#[derive(Debug, Deserialize)]
pub struct AlchemyTransaction {
    pub hash: String,
    #[serde(default)]
    pub nonce: Option<u64>,
    #[serde(default)]
    pub from: Option<AlchemyAccount>,
    #[serde(default)]
    pub to: Option<AlchemyAccount>,
}

#[derive(Debug, Deserialize)]
pub struct AlchemyLog {
    pub data: String,
    pub topics: Vec<String>,
    #[serde(default)]
    pub index: u64,
    pub account: AlchemyAccount,
    pub transaction: AlchemyTransaction,
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize)]
pub struct WebhookSummary {
    pub logs: usize,
    pub applied: usize,
}

fn parse_hex(value: &str) -> Option<Vec<u8>> {
    let value = value.trim();
    hex::decode(value.strip_prefix("0x").unwrap_or(value)).ok()
}

fn parse_h256(value: &str) -> Option<H256> {
    parse_hex(value)
        .filter(|bytes| bytes.len() == 32)
        .map(|bytes| H256::from_slice(&bytes))
}

fn to_wallet(account: Option<&AlchemyAccount>) -> Option<WalletAddress> {
    account.and_then(|account| WalletAddress::parse(&account.address).ok())
}

/// Rebuild an RPC log from the webhook shape. `None` when a field is malformed.
fn to_log(block: u64, log: &AlchemyLog) -> Option<Log> {
    let topics = log
        .topics
        .iter()
        .map(|topic| parse_h256(topic))
        .collect::<Option<Vec<_>>>()?;
    Some(Log {
        address: log.account.address.parse().ok()?,
        topics,
        data: Bytes::from(parse_hex(&log.data)?),
        block_number: Some(U64::from(block)),
        transaction_hash: Some(parse_h256(&log.transaction.hash)?),
        log_index: Some(U256::from(log.index)),
        ..Default::default()
    })
}

#[derive(Clone)]
pub struct WebhookService {
    signing_key: Option<Secret>,
    lottery_contract: Option<WalletAddress>,
    reconciler: Reconciler,
}

impl WebhookService {
    pub fn new(
        signing_key: Option<Secret>,
        lottery_contract: Option<WalletAddress>,
        reconciler: Reconciler,
    ) -> Self {
        Self {
            signing_key,
            lottery_contract,
            reconciler,
        }
    }

    /// Constant-time check of the hex HMAC-SHA256 of `body`.
    pub fn verify_signature(&self, body: &[u8], signature: Option<&str>) -> bool {
        let Some(key) = self.signing_key.as_ref().filter(|key| !key.is_empty()) else {
            return false;
        };
        let Some(signature) = signature.and_then(parse_hex) else {
            return false;
        };
        let Ok(mut mac) = <Hmac<Sha256> as Mac>::new_from_slice(key.expose().as_bytes()) else {
            return false;
        };
        mac.update(body);
        mac.verify_slice(&signature).is_ok()
    }

    pub async fn handle(
        &self,
        body: &[u8],
        signature: Option<&str>,
    ) -> Result<WebhookSummary, ApiError> {
        if !self.verify_signature(body, signature) {
            warn!("rejected webhook with invalid signature");
            return Err(ApiError::Unauthorized(
                "Invalid webhook signature".to_string(),
            ));
        }
        let webhook: AlchemyWebhook = serde_json::from_slice(body)
            .map_err(|err| ApiError::bad_request(format!("Invalid webhook payload: {err}")))?;
        let block = &webhook.event.data.block;
        info!(id = %webhook.id, block = block.number, logs = block.logs.len(), "processing webhook");

        let mut summary = WebhookSummary {
            logs: block.logs.len(),
            applied: 0,
        };
        for raw in &block.logs {
            if let Some(contract) = &self.lottery_contract {
                if !contract.matches(&raw.account.address) {
                    debug!(account = %raw.account.address, "ignoring log from other contract");
                    continue;
                }
            }
            let Some(log) = to_log(block.number, raw) else {
                warn!(tx = %raw.transaction.hash, "malformed webhook log");
                continue;
            };
            let mut observed = match decode_log(&log) {
                Ok(Some(observed)) => observed,
                Ok(None) => continue,
                Err(err) => {
                    warn!(?err, tx = %raw.transaction.hash, "undecodable lottery log");
                    continue;
                }
            };
            observed.meta.from = to_wallet(raw.transaction.from.as_ref());
            observed.meta.to = to_wallet(raw.transaction.to.as_ref());
            observed.meta.nonce = raw.transaction.nonce;
            if self.reconciler.apply_observed(observed).await? {
                summary.applied += 1;
            }
        }
        Ok(summary)
    }
}
