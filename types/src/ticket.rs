use crate::{ParseError, Usdc};
use chrono::{DateTime, Utc};
use rand::Rng;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// Prize tier assigned to a ticket once a draw settles.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum TicketGroup {
    #[serde(rename = "GROUP_1")]
    Group1,
    #[serde(rename = "GROUP_2")]
    Group2,
    #[serde(rename = "GROUP_3")]
    Group3,
}

impl TicketGroup {
    pub fn as_str(self) -> &'static str {
        match self {
            TicketGroup::Group1 => "GROUP_1",
            TicketGroup::Group2 => "GROUP_2",
            TicketGroup::Group3 => "GROUP_3",
        }
    }

    /// Draw a provisional tier: 10% group 1, 30% group 2, 60% group 3.
    pub fn random<R: Rng + ?Sized>(rng: &mut R) -> Self {
        match rng.gen_range(0..100u32) {
            0..=9 => TicketGroup::Group1,
            10..=39 => TicketGroup::Group2,
            _ => TicketGroup::Group3,
        }
    }
}

impl fmt::Display for TicketGroup {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for TicketGroup {
    type Err = ParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "GROUP_1" => Ok(TicketGroup::Group1),
            "GROUP_2" => Ok(TicketGroup::Group2),
            "GROUP_3" => Ok(TicketGroup::Group3),
            other => Err(ParseError::UnknownVariant {
                kind: "ticket group",
                value: other.to_string(),
            }),
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Ticket {
    pub id: i64,
    /// 1-based position within the raffle; matches the on-chain ticket id.
    pub ticket_number: u64,
    pub raffle_id: i64,
    pub owner_id: i64,
    pub referral_code_id: Option<i64>,
    pub purchase_transaction_hash: Option<String>,
    pub is_auto_enrolled: bool,
    pub group: Option<TicketGroup>,
    pub prize_amount: Usdc,
    pub is_distributed: bool,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Ticket {
    pub fn is_winning(&self) -> bool {
        self.is_distributed
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct NewTicket {
    pub ticket_number: u64,
    pub raffle_id: i64,
    pub owner_id: i64,
    pub referral_code_id: Option<i64>,
    pub purchase_transaction_hash: Option<String>,
    pub is_auto_enrolled: bool,
    pub group: Option<TicketGroup>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::{rngs::StdRng, SeedableRng};

    #[test]
    fn random_groups_follow_weights() {
        let mut rng = StdRng::seed_from_u64(7);
        let mut counts = [0u32; 3];
        for _ in 0..10_000 {
            match TicketGroup::random(&mut rng) {
                TicketGroup::Group1 => counts[0] += 1,
                TicketGroup::Group2 => counts[1] += 1,
                TicketGroup::Group3 => counts[2] += 1,
            }
        }
        assert!((800..1200).contains(&counts[0]), "{counts:?}");
        assert!((2700..3300).contains(&counts[1]), "{counts:?}");
        assert!((5600..6400).contains(&counts[2]), "{counts:?}");
    }

    #[test]
    fn group_names_match_wire_format() {
        assert_eq!("GROUP_2".parse::<TicketGroup>().unwrap(), TicketGroup::Group2);
        assert_eq!(
            serde_json::to_string(&TicketGroup::Group1).unwrap(),
            "\"GROUP_1\""
        );
    }
}
