//! Confirmed-log scanner for lottery events.
//!
//! The listener walks the chain from a [Cursor] in bounded block ranges, skipping
//! the most recent `confirmations` blocks. Every decoded event is sent in
//! `(block, log_index)` order, followed by a checkpoint once a range is exhausted,
//! so the receiver can persist progress after it applies each update.
//!
//! Provider failures tear down the connection and retry with exponential backoff.

use crate::events::decode_log;
use crate::{ObservedEvent, Result};
use ethers::prelude::*;
use serde::{Deserialize, Serialize};
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::time::sleep;
use tracing::{debug, info, warn};

const INITIAL_BACKOFF: Duration = Duration::from_secs(1);
const MAX_BACKOFF: Duration = Duration::from_secs(60);

/// Position of the last applied log. The next scan starts at `block`.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
pub struct Cursor {
    pub block: u64,
    /// `None` when nothing in `block` has been applied yet.
    pub log_index: Option<u64>,
}

impl Cursor {
    pub fn at_block(block: u64) -> Self {
        Self {
            block,
            log_index: None,
        }
    }

    /// Whether a log at `(block, log_index)` was already applied.
    pub fn covers(&self, block: u64, log_index: u64) -> bool {
        block < self.block
            || (block == self.block && self.log_index.is_some_and(|seen| log_index <= seen))
    }
}

#[derive(Clone, Debug)]
pub struct ListenerConfig {
    pub rpc_url: String,
    pub contract_address: Address,
    pub confirmations: u64,
    /// Maximum blocks per `eth_getLogs` query.
    pub log_range: u64,
    pub poll_interval: Duration,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum ListenerUpdate {
    Event { event: ObservedEvent, cursor: Cursor },
    /// Everything before `cursor` has been delivered.
    Checkpoint(Cursor),
}

/// Exponential retry delay, reset after a successful poll.
#[derive(Clone, Debug)]
pub struct Backoff {
    initial: Duration,
    max: Duration,
    current: Duration,
}

impl Backoff {
    pub fn new(initial: Duration, max: Duration) -> Self {
        Self {
            initial,
            max,
            current: initial,
        }
    }

    pub fn next_delay(&mut self) -> Duration {
        let delay = self.current;
        self.current = (self.current * 2).min(self.max);
        delay
    }

    pub fn reset(&mut self) {
        self.current = self.initial;
    }
}

impl Default for Backoff {
    fn default() -> Self {
        Self::new(INITIAL_BACKOFF, MAX_BACKOFF)
    }
}

pub struct EventListener {
    config: ListenerConfig,
    updates: mpsc::Sender<ListenerUpdate>,
}

impl EventListener {
    pub fn new(config: ListenerConfig, updates: mpsc::Sender<ListenerUpdate>) -> Self {
        Self { config, updates }
    }

    /// Run until the receiver is dropped. With no cursor, scanning starts at the
    /// current confirmed head.
    pub async fn run(self, cursor: Option<Cursor>) {
        let mut cursor = cursor;
        let mut backoff = Backoff::default();
        info!(
            contract = %format!("{:#x}", self.config.contract_address),
            confirmations = self.config.confirmations,
            start = ?cursor,
            "lottery event listener starting"
        );

        loop {
            let provider = match Provider::<Http>::try_from(self.config.rpc_url.as_str()) {
                Ok(provider) => provider,
                Err(err) => {
                    warn!(?err, "invalid RPC URL; listener stopped");
                    return;
                }
            };

            match self.poll_forever(&provider, &mut cursor, &mut backoff).await {
                Ok(()) => {
                    info!("event receiver closed; listener stopped");
                    return;
                }
                Err(err) => {
                    let delay = backoff.next_delay();
                    warn!(?err, retry_in_ms = delay.as_millis() as u64, "event listener disconnected");
                    sleep(delay).await;
                }
            }
        }
    }

    /// Returns `Ok` only when the receiver is gone.
    async fn poll_forever(
        &self,
        provider: &Provider<Http>,
        cursor: &mut Option<Cursor>,
        backoff: &mut Backoff,
    ) -> Result<()> {
        loop {
            let head = provider.get_block_number().await?.as_u64();
            let confirmed = head.saturating_sub(self.config.confirmations);
            let current = *cursor.get_or_insert_with(|| Cursor::at_block(confirmed));

            if confirmed >= current.block {
                let span = self.config.log_range.max(1) - 1;
                let to_block = confirmed.min(current.block.saturating_add(span));
                match self.scan_range(provider, current, to_block).await? {
                    Some(next) => *cursor = Some(next),
                    None => return Ok(()),
                }
                backoff.reset();
                if to_block < confirmed {
                    continue;
                }
            } else {
                backoff.reset();
            }
            sleep(self.config.poll_interval).await;
        }
    }

    /// Deliver logs in `[cursor.block, to_block]`. `None` when the receiver is gone.
    async fn scan_range(
        &self,
        provider: &Provider<Http>,
        cursor: Cursor,
        to_block: u64,
    ) -> Result<Option<Cursor>> {
        let filter = Filter::new()
            .address(self.config.contract_address)
            .from_block(cursor.block)
            .to_block(to_block);
        let logs = provider.get_logs(&filter).await?;

        let mut events = Vec::with_capacity(logs.len());
        for log in &logs {
            match decode_log(log) {
                Ok(Some(event)) => events.push(event),
                Ok(None) => {}
                Err(err) => warn!(?err, "skipping undecodable lottery log"),
            }
        }
        let events = order_events(events, cursor);
        debug!(
            from = cursor.block,
            to = to_block,
            logs = logs.len(),
            events = events.len(),
            "scanned lottery logs"
        );

        for event in events {
            let position = Cursor {
                block: event.meta.block_number,
                log_index: Some(event.meta.log_index),
            };
            if self
                .updates
                .send(ListenerUpdate::Event { event, cursor: position })
                .await
                .is_err()
            {
                return Ok(None);
            }
        }

        let next = Cursor::at_block(to_block.saturating_add(1));
        if self.updates.send(ListenerUpdate::Checkpoint(next)).await.is_err() {
            return Ok(None);
        }
        Ok(Some(next))
    }
}

/// Sort by chain position and drop anything the cursor already covers.
fn order_events(mut events: Vec<ObservedEvent>, cursor: Cursor) -> Vec<ObservedEvent> {
    events.sort_by_key(|event| (event.meta.block_number, event.meta.log_index));
    events.retain(|event| !cursor.covers(event.meta.block_number, event.meta.log_index));
    events
}
