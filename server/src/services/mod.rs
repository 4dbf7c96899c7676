//! Business operations behind the HTTP routes.

pub mod auth;
pub mod raffles;
pub mod referral;
pub mod tickets;
pub mod webhook;

pub use auth::{AuthService, AuthUser, LoginResponse, TokenKeys};
pub use raffles::{PurchaseReceipt, PurchaseRequest, RaffleService, RaffleSummary};
pub use referral::ReferralService;
pub use tickets::{TicketDetails, TicketService};
pub use webhook::WebhookService;

use serde::Serialize;

pub const DEFAULT_PAGE_SIZE: u64 = 10;
pub const MAX_PAGE_SIZE: u64 = 100;

/// One-based page window.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
pub struct Page {
    pub page: u64,
    pub limit: u64,
}

impl Page {
    pub fn new(page: Option<u64>, limit: Option<u64>) -> Self {
        Self {
            page: page.unwrap_or(1).max(1),
            limit: limit.unwrap_or(DEFAULT_PAGE_SIZE).clamp(1, MAX_PAGE_SIZE),
        }
    }

    pub fn offset(&self) -> u64 {
        (self.page - 1).saturating_mul(self.limit)
    }
}

impl Default for Page {
    fn default() -> Self {
        Self::new(None, None)
    }
}
