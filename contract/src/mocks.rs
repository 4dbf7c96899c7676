//! In-memory [LotteryChain] for tests.

use crate::calls::{PurchaseCalls, UnsignedTx};
use crate::{
    validate_new_lottery, validate_purchase, Error, LotteryChain, LotteryInfo, LotteryRevert,
    Result,
};
use odds_types::WalletAddress;
use std::collections::{BTreeMap, HashSet};
use std::sync::{Arc, Mutex};
use tokio::sync::Notify;

const MOCK_CONTRACT: &str = "0x00000000000000000000000000000000000000c0";
const MOCK_TOKEN: &str = "0x00000000000000000000000000000000000000c1";

#[derive(Default)]
struct State {
    lotteries: BTreeMap<u64, LotteryInfo>,
    created: Vec<u64>,
    ended: Vec<u64>,
    failing_creates: HashSet<u64>,
    failing_ends: HashSet<u64>,
    next_tx: u64,
    purchase_gate: Option<Arc<PurchaseGate>>,
}

/// Holds `build_purchase` open until the test releases it.
#[derive(Default)]
pub struct PurchaseGate {
    entered: Notify,
    release: Notify,
}

impl PurchaseGate {
    /// Wait until a purchase is being built.
    pub async fn entered(&self) {
        self.entered.notified().await;
    }

    /// Let the held purchase finish.
    pub fn release(&self) {
        self.release.notify_one();
    }
}

/// Records every call and lets tests script failures per lottery.
#[derive(Clone, Default)]
pub struct MockChain {
    state: Arc<Mutex<State>>,
}

impl MockChain {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a lottery as if it had been created out of band.
    pub fn insert(&self, info: LotteryInfo) {
        self.state.lock().unwrap().lotteries.insert(info.id, info);
    }

    pub fn set_tickets_sold(&self, lottery_id: u64, sold: u64) {
        if let Some(info) = self.state.lock().unwrap().lotteries.get_mut(&lottery_id) {
            info.tickets_sold = sold;
        }
    }

    pub fn fail_create(&self, lottery_id: u64) {
        self.state.lock().unwrap().failing_creates.insert(lottery_id);
    }

    pub fn fail_end(&self, lottery_id: u64) {
        self.state.lock().unwrap().failing_ends.insert(lottery_id);
    }

    pub fn created(&self) -> Vec<u64> {
        self.state.lock().unwrap().created.clone()
    }

    pub fn ended(&self) -> Vec<u64> {
        self.state.lock().unwrap().ended.clone()
    }

    pub fn lottery(&self, lottery_id: u64) -> Option<LotteryInfo> {
        self.state.lock().unwrap().lotteries.get(&lottery_id).cloned()
    }

    /// Pause the next purchase build until the returned gate is released.
    pub fn hold_purchases(&self) -> Arc<PurchaseGate> {
        let gate = Arc::new(PurchaseGate::default());
        self.state.lock().unwrap().purchase_gate = Some(gate.clone());
        gate
    }

    fn tx_hash(state: &mut State) -> String {
        state.next_tx += 1;
        format!("0x{:064x}", state.next_tx)
    }
}

impl LotteryChain for MockChain {
    async fn create_lottery(&self, lottery_id: u64, max_tickets: u64) -> Result<String> {
        validate_new_lottery(lottery_id, max_tickets)?;
        let mut state = self.state.lock().unwrap();
        if state.failing_creates.contains(&lottery_id) {
            return Err(Error::Contract(format!("scripted create failure for {lottery_id}")));
        }
        if state.lotteries.contains_key(&lottery_id) {
            return Err(Error::LotteryExists(lottery_id));
        }
        state.lotteries.insert(
            lottery_id,
            LotteryInfo {
                id: lottery_id,
                max_tickets,
                tickets_sold: 0,
                is_active: true,
                is_drawn: false,
                created_at: 0,
            },
        );
        state.created.push(lottery_id);
        Ok(Self::tx_hash(&mut state))
    }

    async fn end_lottery(&self, lottery_id: u64) -> Result<String> {
        let mut state = self.state.lock().unwrap();
        if state.failing_ends.contains(&lottery_id) {
            return Err(Error::Contract(format!("scripted end failure for {lottery_id}")));
        }
        let info = state
            .lotteries
            .get_mut(&lottery_id)
            .ok_or(Error::LotteryMissing(lottery_id))?;
        if !info.is_active {
            return Err(Error::LotteryInactive(lottery_id));
        }
        if info.is_drawn {
            return Err(Error::LotteryDrawn(lottery_id));
        }
        if info.tickets_sold == 0 {
            return Err(Error::Reverted(LotteryRevert::NoTickets));
        }
        info.is_active = false;
        info.is_drawn = true;
        state.ended.push(lottery_id);
        Ok(Self::tx_hash(&mut state))
    }

    async fn get_lottery(&self, lottery_id: u64) -> Result<Option<LotteryInfo>> {
        Ok(self.lottery(lottery_id))
    }

    async fn build_purchase(
        &self,
        buyer: WalletAddress,
        lottery_ids: Vec<u64>,
        ticket_count: u64,
    ) -> Result<PurchaseCalls> {
        validate_purchase(&lottery_ids, ticket_count)?;
        let gate = self.state.lock().unwrap().purchase_gate.take();
        if let Some(gate) = gate {
            gate.entered.notify_one();
            gate.release.notified().await;
        }
        let state = self.state.lock().unwrap();
        for id in &lottery_ids {
            if !state.lotteries.contains_key(id) {
                return Err(Error::LotteryMissing(*id));
            }
        }
        let ids = lottery_ids
            .iter()
            .map(u64::to_string)
            .collect::<Vec<_>>()
            .join(",");
        let tx = |to: &str, data: String| UnsignedTx {
            to: WalletAddress::parse(to).unwrap(),
            data,
            value: "0".to_string(),
            from: buyer.clone(),
            chain_id: 31337,
            gas: "500000".to_string(),
        };
        Ok(PurchaseCalls {
            approve_tx: tx(MOCK_TOKEN, format!("approve:{}", ticket_count * lottery_ids.len() as u64)),
            buy_tx: tx(MOCK_CONTRACT, format!("buyTickets:[{ids}]:{ticket_count}")),
        })
    }

    fn contract_address(&self) -> WalletAddress {
        WalletAddress::parse(MOCK_CONTRACT).unwrap()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn lifecycle_round_trip() {
        let chain = MockChain::new();
        chain.create_lottery(1, 10).await.unwrap();
        assert!(matches!(
            chain.create_lottery(1, 10).await,
            Err(Error::LotteryExists(1))
        ));
        assert_eq!(
            chain.end_lottery(1).await.unwrap_err().revert(),
            Some(LotteryRevert::NoTickets)
        );

        chain.set_tickets_sold(1, 10);
        chain.end_lottery(1).await.unwrap();
        let info = chain.get_lottery(1).await.unwrap().unwrap();
        assert!(!info.is_active && info.is_drawn);
        assert_eq!(chain.ended(), vec![1]);
    }

    #[tokio::test]
    async fn purchase_requires_existing_lotteries() {
        let chain = MockChain::new();
        chain.create_lottery(1, 10).await.unwrap();
        let buyer = WalletAddress::parse("0x1111111111111111111111111111111111111111").unwrap();
        let calls = chain.build_purchase(buyer.clone(), vec![1], 2).await.unwrap();
        assert_eq!(calls.buy_tx.from, buyer);
        assert!(matches!(
            chain.build_purchase(buyer, vec![1, 2], 2).await,
            Err(Error::LotteryMissing(2))
        ));
    }
}
