//! Raffle rounds and their lifecycle.

use crate::{ParseError, Usdc};
use chrono::{DateTime, Duration, NaiveDate, NaiveTime, TimeZone, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// Lifecycle state of a raffle.
///
/// Rounds only move forward: `Pending -> Active -> Completed`.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RaffleStatus {
    Pending,
    Active,
    Completed,
}

impl RaffleStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            RaffleStatus::Pending => "pending",
            RaffleStatus::Active => "active",
            RaffleStatus::Completed => "completed",
        }
    }

    pub fn can_transition_to(self, next: RaffleStatus) -> bool {
        matches!(
            (self, next),
            (RaffleStatus::Pending, RaffleStatus::Active)
                | (RaffleStatus::Active, RaffleStatus::Completed)
        )
    }
}

impl fmt::Display for RaffleStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for RaffleStatus {
    type Err = ParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pending" => Ok(RaffleStatus::Pending),
            "active" => Ok(RaffleStatus::Active),
            "completed" => Ok(RaffleStatus::Completed),
            other => Err(ParseError::UnknownVariant {
                kind: "raffle status",
                value: other.to_string(),
            }),
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Raffle {
    pub id: i64,
    pub title: String,
    pub description: String,
    pub max_tickets: u64,
    /// Tickets sold or reserved so far.
    pub total_tickets: u64,
    pub ticket_price: Usdc,
    pub start_date: Option<DateTime<Utc>>,
    pub end_date: Option<DateTime<Utc>>,
    pub status: RaffleStatus,
    pub winner_id: Option<i64>,
    pub winning_ticket_id: Option<i64>,
    pub total_prize_amount: Usdc,
    pub platform_fee: Usdc,
    pub referral_rewards: Usdc,
    pub distributed_amount: Usdc,
    pub is_distributed: bool,
    /// Whether the matching lottery exists on-chain.
    pub is_created: bool,
    pub transaction_hash: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Raffle {
    pub fn remaining(&self) -> u64 {
        self.max_tickets.saturating_sub(self.total_tickets)
    }

    pub fn is_sold_out(&self) -> bool {
        self.total_tickets >= self.max_tickets
    }

    /// Percentage of capacity sold, in `0.0..=100.0`.
    pub fn progress(&self) -> f64 {
        if self.max_tickets == 0 {
            return 0.0;
        }
        (self.total_tickets as f64 / self.max_tickets as f64 * 100.0).min(100.0)
    }

    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        self.end_date.is_some_and(|end| end < now)
    }

    pub fn has_started(&self, now: DateTime<Utc>) -> bool {
        self.start_date.map_or(true, |start| start <= now)
    }

    /// Referral reward owed on `spent`, proportional to the raffle's referral pool.
    pub fn referral_reward(&self, spent: Usdc) -> Usdc {
        spent.mul_div(self.referral_rewards, self.total_prize_amount)
    }
}

/// Fields required to insert a raffle.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct NewRaffle {
    pub title: String,
    pub description: String,
    pub max_tickets: u64,
    pub ticket_price: Usdc,
    pub start_date: Option<DateTime<Utc>>,
    pub end_date: Option<DateTime<Utc>>,
    pub status: RaffleStatus,
    pub total_prize_amount: Usdc,
    pub platform_fee: Usdc,
    pub referral_rewards: Usdc,
}

/// Economic parameters stamped onto every scheduled raffle.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct RaffleTemplate {
    pub max_tickets: u64,
    pub ticket_price: Usdc,
    pub total_prize_amount: Usdc,
    pub platform_fee: Usdc,
    pub referral_rewards: Usdc,
}

impl Default for RaffleTemplate {
    fn default() -> Self {
        Self {
            max_tickets: 1000,
            ticket_price: Usdc::from_units(1),
            total_prize_amount: Usdc::from_units(1000),
            platform_fee: Usdc::from_units(50),
            referral_rewards: Usdc::from_units(50),
        }
    }
}

impl RaffleTemplate {
    /// A pending raffle covering one UTC day.
    pub fn daily(&self, date: NaiveDate) -> NewRaffle {
        let (start, end) = daily_window(date);
        let day = date.format("%Y-%m-%d");
        NewRaffle {
            title: format!("Daily Raffle {day}"),
            description: format!("Daily raffle for {day}"),
            start_date: Some(start),
            end_date: Some(end),
            status: RaffleStatus::Pending,
            ..self.open_ended()
        }
    }

    /// A pending pool raffle with no time window; it ends when sold out.
    pub fn pooled(&self, now: DateTime<Utc>) -> NewRaffle {
        let stamp = now.to_rfc3339_opts(chrono::SecondsFormat::Millis, true);
        NewRaffle {
            title: format!("Raffle {stamp}"),
            description: format!("Raffle created at {stamp}"),
            ..self.open_ended()
        }
    }

    fn open_ended(&self) -> NewRaffle {
        NewRaffle {
            title: String::new(),
            description: String::new(),
            max_tickets: self.max_tickets,
            ticket_price: self.ticket_price,
            start_date: None,
            end_date: None,
            status: RaffleStatus::Pending,
            total_prize_amount: self.total_prize_amount,
            platform_fee: self.platform_fee,
            referral_rewards: self.referral_rewards,
        }
    }
}

/// `[00:00:00, 23:59:59]` of a UTC day.
pub fn daily_window(date: NaiveDate) -> (DateTime<Utc>, DateTime<Utc>) {
    let start = Utc.from_utc_datetime(&date.and_time(NaiveTime::MIN));
    let end = start + Duration::days(1) - Duration::seconds(1);
    (start, end)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn raffle(total: u64, max: u64) -> Raffle {
        let now = Utc::now();
        Raffle {
            id: 1,
            title: "r".into(),
            description: String::new(),
            max_tickets: max,
            total_tickets: total,
            ticket_price: Usdc::from_units(1),
            start_date: None,
            end_date: None,
            status: RaffleStatus::Active,
            winner_id: None,
            winning_ticket_id: None,
            total_prize_amount: Usdc::from_units(1000),
            platform_fee: Usdc::from_units(50),
            referral_rewards: Usdc::from_units(50),
            distributed_amount: Usdc::ZERO,
            is_distributed: false,
            is_created: false,
            transaction_hash: None,
            created_at: now,
            updated_at: now,
        }
    }

    #[test]
    fn capacity_helpers() {
        let r = raffle(250, 1000);
        assert_eq!(r.remaining(), 750);
        assert!(!r.is_sold_out());
        assert_eq!(r.progress(), 25.0);
        assert!(raffle(1000, 1000).is_sold_out());
        assert_eq!(raffle(5, 0).remaining(), 0);
    }

    #[test]
    fn lifecycle_moves_forward_only() {
        use RaffleStatus::*;
        assert!(Pending.can_transition_to(Active));
        assert!(Active.can_transition_to(Completed));
        assert!(!Completed.can_transition_to(Active));
        assert!(!Pending.can_transition_to(Completed));
    }

    #[test]
    fn daily_template_spans_the_day() {
        let date = NaiveDate::from_ymd_opt(2024, 3, 9).unwrap();
        let new = RaffleTemplate::default().daily(date);
        assert_eq!(new.title, "Daily Raffle 2024-03-09");
        let start = new.start_date.unwrap();
        let end = new.end_date.unwrap();
        assert_eq!(start.to_rfc3339(), "2024-03-09T00:00:00+00:00");
        assert_eq!(end.to_rfc3339(), "2024-03-09T23:59:59+00:00");
    }

    #[test]
    fn expiry_uses_end_date() {
        let mut r = raffle(0, 10);
        let now = Utc::now();
        assert!(!r.is_expired(now));
        r.end_date = Some(now - Duration::seconds(1));
        assert!(r.is_expired(now));
    }
}
