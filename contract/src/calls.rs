//! Unsigned transactions handed to the buyer's wallet.

use ethers::types::{Address, Bytes, U256};
use odds_types::WalletAddress;
use serde::{Deserialize, Serialize};

/// Fallback gas limit used when estimation fails.
pub const DEFAULT_GAS_LIMIT: u64 = 500_000;

/// Extra gas added on top of an estimate, in percent.
pub const GAS_BUFFER_PERCENT: u64 = 20;

/// A call the client signs and submits. Quantities are decimal strings.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UnsignedTx {
    pub to: WalletAddress,
    pub data: String,
    pub value: String,
    pub from: WalletAddress,
    pub chain_id: u64,
    pub gas: String,
}

impl UnsignedTx {
    pub fn new(to: Address, data: &Bytes, from: &WalletAddress, chain_id: u64, gas: U256) -> Self {
        Self {
            to: crate::to_wallet(to),
            data: format!("0x{}", hex::encode(data.as_ref())),
            value: "0".to_string(),
            from: from.clone(),
            chain_id,
            gas: gas.to_string(),
        }
    }
}

/// Token approval followed by the ticket purchase.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PurchaseCalls {
    pub approve_tx: UnsignedTx,
    pub buy_tx: UnsignedTx,
}

/// Pad an estimate by [GAS_BUFFER_PERCENT].
pub fn with_gas_buffer(estimate: U256) -> U256 {
    estimate.saturating_mul(U256::from(100 + GAS_BUFFER_PERCENT)) / U256::from(100)
}

/// Total token allowance needed for `ticket_count` tickets in each of `lotteries` lotteries.
pub fn approval_amount(ticket_price: U256, ticket_count: u64, lotteries: usize) -> U256 {
    ticket_price
        .saturating_mul(U256::from(ticket_count))
        .saturating_mul(U256::from(lotteries))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn buffer_adds_twenty_percent() {
        assert_eq!(with_gas_buffer(U256::from(100_000u64)), U256::from(120_000u64));
        assert_eq!(with_gas_buffer(U256::zero()), U256::zero());
    }

    #[test]
    fn approval_covers_every_lottery() {
        let price = U256::from(1_000_000u64);
        assert_eq!(approval_amount(price, 3, 2), U256::from(6_000_000u64));
    }

    #[test]
    fn unsigned_tx_encodes_hex_calldata() {
        let to: Address = "0x1111111111111111111111111111111111111111".parse().unwrap();
        let from = WalletAddress::parse("0x2222222222222222222222222222222222222222").unwrap();
        let tx = UnsignedTx::new(to, &Bytes::from(vec![0xab, 0xcd]), &from, 84532, U256::from(21_000u64));
        assert_eq!(tx.data, "0xabcd");
        assert_eq!(tx.value, "0");
        assert_eq!(tx.gas, "21000");
        let json = serde_json::to_value(&tx).unwrap();
        assert_eq!(json["chainId"], 84532);
    }
}
