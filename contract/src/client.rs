//! JSON-RPC implementation of [LotteryChain] signing with the contract owner key.

use crate::bindings::{Erc20, LotteryEndedFilter, OddsLottery};
use crate::calls::{approval_amount, with_gas_buffer, PurchaseCalls, UnsignedTx, DEFAULT_GAS_LIMIT};
use crate::events::{outcome_from_filter, to_u64};
use crate::revert::LotteryRevert;
use crate::{
    to_address, to_wallet, validate_new_lottery, validate_purchase, Error, LotteryChain,
    LotteryInfo, Result,
};
use ethers::abi::{Detokenize, RawLog};
use ethers::contract::{ContractCall, ContractError, EthEvent};
use ethers::prelude::*;
use odds_types::WalletAddress;
use std::sync::Arc;
use std::time::Duration;
use tracing::{info, warn};

type OwnerClient = SignerMiddleware<Provider<Http>, LocalWallet>;

/// Connection settings for the lottery contract.
#[derive(Clone)]
pub struct ChainConfig {
    pub rpc_url: String,
    /// Hex private key of the contract owner, with or without `0x`.
    pub private_key: String,
    pub contract_address: String,
    /// Queried from the node when unset.
    pub chain_id: Option<u64>,
    /// How often the provider polls for pending transaction receipts.
    pub receipt_poll_interval: Duration,
}

impl std::fmt::Debug for ChainConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ChainConfig")
            .field("rpc_url", &self.rpc_url)
            .field("private_key", &"<redacted>")
            .field("contract_address", &self.contract_address)
            .field("chain_id", &self.chain_id)
            .field("receipt_poll_interval", &self.receipt_poll_interval)
            .finish()
    }
}

/// Parse a 32-byte owner key. Accepts an optional `0x` prefix.
pub fn parse_private_key(raw: &str) -> Result<LocalWallet> {
    let hex = raw.trim().trim_start_matches("0x");
    if hex.len() != 64 || !hex.chars().all(|c| c.is_ascii_hexdigit()) {
        return Err(Error::Config(
            "private key must be 64 hex characters".to_string(),
        ));
    }
    hex.parse::<LocalWallet>()
        .map_err(|err| Error::Config(format!("invalid private key: {err}")))
}

#[derive(Clone)]
pub struct LotteryClient {
    provider: Provider<Http>,
    lottery: OddsLottery<OwnerClient>,
    reader: OddsLottery<Provider<Http>>,
    contract: Address,
    owner_wallet: Address,
    chain_id: u64,
}

impl LotteryClient {
    pub async fn connect(config: &ChainConfig) -> Result<Self> {
        let wallet = parse_private_key(&config.private_key)?;
        let contract: Address = config
            .contract_address
            .trim()
            .parse()
            .map_err(|_| Error::Config("invalid lottery contract address".to_string()))?;
        let provider = Provider::<Http>::try_from(config.rpc_url.as_str())
            .map_err(|err| Error::Config(format!("invalid RPC URL: {err}")))?
            .interval(config.receipt_poll_interval);

        let chain_id = match config.chain_id {
            Some(chain_id) => chain_id,
            None => provider.get_chainid().await?.low_u64(),
        };
        let wallet = wallet.with_chain_id(chain_id);
        let owner_wallet = wallet.address();
        let signer = SignerMiddleware::new(provider.clone(), wallet);

        info!(
            contract = %format!("{contract:#x}"),
            wallet = %format!("{owner_wallet:#x}"),
            chain_id,
            "lottery client connected"
        );
        Ok(Self {
            lottery: OddsLottery::new(contract, Arc::new(signer)),
            reader: OddsLottery::new(contract, Arc::new(provider.clone())),
            provider,
            contract,
            owner_wallet,
            chain_id,
        })
    }

    pub fn chain_id(&self) -> u64 {
        self.chain_id
    }

    pub fn provider(&self) -> &Provider<Http> {
        &self.provider
    }

    async fn ensure_owner(&self) -> Result<()> {
        let owner = self.reader.owner().call().await.map_err(contract_error)?;
        if owner != self.owner_wallet {
            return Err(Error::NotOwner {
                wallet: self.owner_wallet,
                owner,
            });
        }
        Ok(())
    }

    /// Estimate gas for `call` plus the buffer, falling back to [DEFAULT_GAS_LIMIT].
    async fn gas_limit<M: Middleware, D: Detokenize>(&self, call: &ContractCall<M, D>) -> U256 {
        match call.estimate_gas().await {
            Ok(estimate) => with_gas_buffer(estimate),
            Err(err) => {
                warn!(error = %err, "gas estimation failed; using default limit");
                U256::from(DEFAULT_GAS_LIMIT)
            }
        }
    }

    async fn send_and_confirm(&self, call: ContractCall<OwnerClient, ()>) -> Result<TransactionReceipt> {
        let gas = self.gas_limit(&call).await;
        let call = call.gas(gas);
        let pending = call.send().await.map_err(contract_error)?;
        let hash = format!("{:#x}", *pending);
        let receipt = pending
            .await?
            .ok_or_else(|| Error::MissingReceipt(hash.clone()))?;
        if receipt.status != Some(U64::from(1u64)) {
            return Err(Error::Failed(hash));
        }
        Ok(receipt)
    }
}

impl LotteryChain for LotteryClient {
    async fn create_lottery(&self, lottery_id: u64, max_tickets: u64) -> Result<String> {
        validate_new_lottery(lottery_id, max_tickets)?;
        self.ensure_owner().await?;
        if self.get_lottery(lottery_id).await?.is_some() {
            return Err(Error::LotteryExists(lottery_id));
        }

        let call = self
            .lottery
            .create_lottery(U256::from(lottery_id), U256::from(max_tickets));
        let receipt = self.send_and_confirm(call).await?;
        let hash = format!("{:#x}", receipt.transaction_hash);
        info!(lottery_id, max_tickets, tx = %hash, "lottery created on-chain");
        Ok(hash)
    }

    async fn end_lottery(&self, lottery_id: u64) -> Result<String> {
        self.ensure_owner().await?;
        let lottery = self
            .get_lottery(lottery_id)
            .await?
            .ok_or(Error::LotteryMissing(lottery_id))?;
        if !lottery.is_active {
            return Err(Error::LotteryInactive(lottery_id));
        }
        if lottery.is_drawn {
            return Err(Error::LotteryDrawn(lottery_id));
        }

        let call = self.lottery.end_lottery(U256::from(lottery_id));
        let receipt = self.send_and_confirm(call).await?;
        let hash = format!("{:#x}", receipt.transaction_hash);

        let ended = receipt
            .logs
            .iter()
            .filter(|log| log.topics.first() == Some(&LotteryEndedFilter::signature()))
            .find_map(|log| {
                <LotteryEndedFilter as EthEvent>::decode_log(&RawLog::from(log.clone())).ok()
            });
        match ended.map(outcome_from_filter) {
            Some(Ok(outcome)) => info!(
                lottery_id,
                tx = %hash,
                winners = ?outcome.winning_ticket_ids,
                second_place = ?outcome.second_place_ticket_ids,
                prize_pool = %outcome.prize_pool,
                platform_cut = %outcome.platform_cut,
                "lottery ended on-chain"
            ),
            Some(Err(err)) => warn!(lottery_id, tx = %hash, ?err, "undecodable LotteryEnded log"),
            None => warn!(lottery_id, tx = %hash, "LotteryEnded log missing from receipt"),
        }
        Ok(hash)
    }

    async fn get_lottery(&self, lottery_id: u64) -> Result<Option<LotteryInfo>> {
        if lottery_id == 0 {
            return Ok(None);
        }
        let result = self.reader.get_lottery(U256::from(lottery_id)).call().await;
        let (id, max_tickets, tickets_sold, is_active, is_drawn, created_at) = match result {
            Ok(values) => values,
            Err(ContractError::DecodingError(_)) | Err(ContractError::AbiError(_)) => {
                return Ok(None)
            }
            Err(err) => {
                return match contract_error(err) {
                    Error::Reverted(
                        LotteryRevert::LotteryDoesNotExist | LotteryRevert::InvalidLotteryId,
                    ) => Ok(None),
                    other => Err(other),
                }
            }
        };
        if id.is_zero() {
            return Ok(None);
        }
        Ok(Some(LotteryInfo {
            id: to_u64(id, "id")?,
            max_tickets: to_u64(max_tickets, "maxTickets")?,
            tickets_sold: to_u64(tickets_sold, "ticketsSold")?,
            is_active,
            is_drawn,
            created_at: to_u64(created_at, "createdAt")?,
        }))
    }

    async fn build_purchase(
        &self,
        buyer: WalletAddress,
        lottery_ids: Vec<u64>,
        ticket_count: u64,
    ) -> Result<PurchaseCalls> {
        validate_purchase(&lottery_ids, ticket_count)?;
        for &lottery_id in &lottery_ids {
            if self.get_lottery(lottery_id).await?.is_none() {
                return Err(Error::LotteryMissing(lottery_id));
            }
        }
        let from = to_address(&buyer)?;
        let token = self.reader.usdc().call().await.map_err(contract_error)?;
        let price = self.reader.ticket_price().call().await.map_err(contract_error)?;
        let amount = approval_amount(price, ticket_count, lottery_ids.len());

        let erc20 = Erc20::new(token, Arc::new(self.provider.clone()));
        let approve = erc20.approve(self.contract, amount).from(from);
        let approve_data = approve
            .calldata()
            .ok_or_else(|| Error::Contract("failed to encode approve".to_string()))?;
        let approve_gas = self.gas_limit(&approve).await;

        let ids = lottery_ids.iter().copied().map(U256::from).collect::<Vec<_>>();
        let buy = self
            .reader
            .buy_tickets(ids, U256::from(ticket_count))
            .from(from);
        let buy_data = buy
            .calldata()
            .ok_or_else(|| Error::Contract("failed to encode buyTickets".to_string()))?;
        // Reverts until the approval lands, which lands on the default limit.
        let buy_gas = self.gas_limit(&buy).await;

        Ok(PurchaseCalls {
            approve_tx: UnsignedTx::new(token, &approve_data, &buyer, self.chain_id, approve_gas),
            buy_tx: UnsignedTx::new(self.contract, &buy_data, &buyer, self.chain_id, buy_gas),
        })
    }

    fn contract_address(&self) -> WalletAddress {
        to_wallet(self.contract)
    }
}

/// Map a contract error, decoding custom revert selectors when present.
pub fn contract_error<M: Middleware>(err: ContractError<M>) -> Error {
    if let Some(data) = err.as_revert() {
        return match LotteryRevert::from_revert_data(data) {
            Some(revert) => Error::Reverted(revert),
            None => Error::UnknownRevert(hex::encode(data)),
        };
    }
    Error::Contract(err.to_string())
}
