//! Decoding of the lottery contract's custom errors.

use ethers::utils::id;
use serde::Serialize;
use std::fmt;

/// Custom errors declared by `OddsLottery`.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize)]
pub enum LotteryRevert {
    InvalidMaxTickets,
    InvalidLotteryId,
    LotteryIdExists,
    InsufficientBalance,
    InsufficientAllowance,
    LotteryNotActive,
    LotteryAlreadyDrawn,
    NoTickets,
    InsufficientContractBalance,
    LotteryDoesNotExist,
}

impl LotteryRevert {
    pub const ALL: [LotteryRevert; 10] = [
        LotteryRevert::InvalidMaxTickets,
        LotteryRevert::InvalidLotteryId,
        LotteryRevert::LotteryIdExists,
        LotteryRevert::InsufficientBalance,
        LotteryRevert::InsufficientAllowance,
        LotteryRevert::LotteryNotActive,
        LotteryRevert::LotteryAlreadyDrawn,
        LotteryRevert::NoTickets,
        LotteryRevert::InsufficientContractBalance,
        LotteryRevert::LotteryDoesNotExist,
    ];

    pub fn name(self) -> &'static str {
        match self {
            LotteryRevert::InvalidMaxTickets => "InvalidMaxTickets",
            LotteryRevert::InvalidLotteryId => "InvalidLotteryId",
            LotteryRevert::LotteryIdExists => "LotteryIdExists",
            LotteryRevert::InsufficientBalance => "InsufficientBalance",
            LotteryRevert::InsufficientAllowance => "InsufficientAllowance",
            LotteryRevert::LotteryNotActive => "LotteryNotActive",
            LotteryRevert::LotteryAlreadyDrawn => "LotteryAlreadyDrawn",
            LotteryRevert::NoTickets => "NoTickets",
            LotteryRevert::InsufficientContractBalance => "InsufficientContractBalance",
            LotteryRevert::LotteryDoesNotExist => "LotteryDoesNotExist",
        }
    }

    /// First four bytes of `keccak256("<Name>()")`.
    pub fn selector(self) -> [u8; 4] {
        id(format!("{}()", self.name()))
    }

    /// Match revert data against the known selectors.
    pub fn from_revert_data(data: &[u8]) -> Option<Self> {
        let selector: [u8; 4] = data.get(..4)?.try_into().ok()?;
        Self::ALL
            .into_iter()
            .find(|revert| revert.selector() == selector)
    }
}

impl fmt::Display for LotteryRevert {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}
