//! Relational persistence for users, raffles, tickets, referrals, and the ledger.
//!
//! All SQL is written once against [Db], which runs over either backend through
//! the [Exec] trait: SQLite (`rusqlite`) for development and tests, Postgres for
//! production. Every [Store::run] call is a single database transaction executed
//! on the blocking pool; a closure error rolls it back.

use chrono::{DateTime, Utc};
use odds_contract::Cursor;
use odds_types::{
    LeaderboardEntry, LeaderboardSort, NewRaffle, NewTicket, NewTransaction, Raffle,
    RaffleStatus, ReferralCode, SortOrder, Ticket, TicketGroup, Transaction, TransactionKind,
    TransactionStatus, Usdc, User, WalletAddress,
};
use std::path::Path;
use std::str::FromStr;
use std::sync::{Arc, Mutex};
use thiserror::Error;

mod postgres;
mod sqlite;

pub use self::postgres::validate_postgres_url;

#[derive(Error, Debug)]
pub enum StoreError {
    #[error("sqlite error: {0}")]
    Sqlite(#[from] rusqlite::Error),
    #[error("postgres error: {0}")]
    Postgres(#[from] ::postgres::Error),
    #[error("invalid postgres url: {0}")]
    InvalidUrl(String),
    #[error("corrupt row: {0}")]
    Corrupt(String),
    #[error("{0} out of range")]
    Overflow(&'static str),
    #[error("storage task failed: {0}")]
    Join(String),
}

impl StoreError {
    /// Whether the failure was a unique constraint violation.
    pub fn is_unique_violation(&self) -> bool {
        match self {
            StoreError::Sqlite(rusqlite::Error::SqliteFailure(err, _)) => {
                err.code == rusqlite::ErrorCode::ConstraintViolation
            }
            StoreError::Postgres(err) => {
                err.code() == Some(&::postgres::error::SqlState::UNIQUE_VIOLATION)
            }
            _ => false,
        }
    }
}

pub type Result<T> = std::result::Result<T, StoreError>;

/// Row limit meaning "all rows".
pub const NO_LIMIT: u64 = i64::MAX as u64;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub(crate) enum Dialect {
    Sqlite,
    Postgres,
}

/// A bound statement parameter understood by both backends.
#[derive(Clone, Debug, PartialEq)]
pub(crate) enum SqlValue {
    Int(i64),
    Text(String),
    Bool(bool),
    Null,
}

impl From<i64> for SqlValue {
    fn from(value: i64) -> Self {
        SqlValue::Int(value)
    }
}

impl From<bool> for SqlValue {
    fn from(value: bool) -> Self {
        SqlValue::Bool(value)
    }
}

impl From<&str> for SqlValue {
    fn from(value: &str) -> Self {
        SqlValue::Text(value.to_string())
    }
}

impl From<String> for SqlValue {
    fn from(value: String) -> Self {
        SqlValue::Text(value)
    }
}

impl<T: Into<SqlValue>> From<Option<T>> for SqlValue {
    fn from(value: Option<T>) -> Self {
        value.map(Into::into).unwrap_or(SqlValue::Null)
    }
}

impl From<DateTime<Utc>> for SqlValue {
    fn from(value: DateTime<Utc>) -> Self {
        SqlValue::Int(value.timestamp_millis())
    }
}

impl From<&WalletAddress> for SqlValue {
    fn from(value: &WalletAddress) -> Self {
        SqlValue::Text(value.as_str().to_string())
    }
}

fn uint(value: u64, label: &'static str) -> Result<SqlValue> {
    i64::try_from(value)
        .map(SqlValue::Int)
        .map_err(|_| StoreError::Overflow(label))
}

fn usdc(value: Usdc, label: &'static str) -> Result<SqlValue> {
    uint(value.micros(), label)
}

/// Positional column access shared by both backends.
pub(crate) trait RowAccess {
    fn int(&self, idx: usize) -> Result<Option<i64>>;
    fn text(&self, idx: usize) -> Result<Option<String>>;
    fn boolean(&self, idx: usize) -> Result<Option<bool>>;
}

/// Statement execution over one open transaction.
pub(crate) trait Exec {
    fn dialect(&self) -> Dialect;
    fn execute(&mut self, sql: &str, params: &[SqlValue]) -> Result<u64>;
    fn query(
        &mut self,
        sql: &str,
        params: &[SqlValue],
        each: &mut dyn FnMut(&dyn RowAccess) -> Result<()>,
    ) -> Result<()>;
}

/// Sequential column reader.
struct Reader<'a> {
    row: &'a dyn RowAccess,
    idx: usize,
}

impl<'a> Reader<'a> {
    fn new(row: &'a dyn RowAccess) -> Self {
        Self { row, idx: 0 }
    }

    fn advance(&mut self) -> usize {
        let idx = self.idx;
        self.idx += 1;
        idx
    }

    fn opt_i64(&mut self) -> Result<Option<i64>> {
        let idx = self.advance();
        self.row.int(idx)
    }

    fn i64(&mut self) -> Result<i64> {
        let idx = self.idx;
        self.opt_i64()?
            .ok_or_else(|| StoreError::Corrupt(format!("column {idx} is null")))
    }

    fn u64(&mut self) -> Result<u64> {
        let value = self.i64()?;
        u64::try_from(value).map_err(|_| StoreError::Corrupt(format!("negative count {value}")))
    }

    fn opt_u64(&mut self) -> Result<Option<u64>> {
        self.opt_i64()?
            .map(|value| {
                u64::try_from(value)
                    .map_err(|_| StoreError::Corrupt(format!("negative count {value}")))
            })
            .transpose()
    }

    fn usdc(&mut self) -> Result<Usdc> {
        self.u64().map(Usdc::from_micros)
    }

    fn opt_text(&mut self) -> Result<Option<String>> {
        let idx = self.advance();
        self.row.text(idx)
    }

    fn text(&mut self) -> Result<String> {
        let idx = self.idx;
        self.opt_text()?
            .ok_or_else(|| StoreError::Corrupt(format!("column {idx} is null")))
    }

    fn boolean(&mut self) -> Result<bool> {
        let idx = self.advance();
        Ok(self.row.boolean(idx)?.unwrap_or(false))
    }

    fn time(&mut self) -> Result<DateTime<Utc>> {
        let ms = self.i64()?;
        odds_types::from_millis(ms).ok_or_else(|| StoreError::Corrupt(format!("timestamp {ms}")))
    }

    fn opt_time(&mut self) -> Result<Option<DateTime<Utc>>> {
        match self.opt_i64()? {
            Some(ms) => odds_types::from_millis(ms)
                .map(Some)
                .ok_or_else(|| StoreError::Corrupt(format!("timestamp {ms}"))),
            None => Ok(None),
        }
    }

    fn parse<T>(&mut self) -> Result<T>
    where
        T: FromStr,
        T::Err: std::fmt::Display,
    {
        let raw = self.text()?;
        raw.parse()
            .map_err(|err: T::Err| StoreError::Corrupt(err.to_string()))
    }

    fn opt_parse<T>(&mut self) -> Result<Option<T>>
    where
        T: FromStr,
        T::Err: std::fmt::Display,
    {
        match self.opt_text()? {
            Some(raw) if !raw.is_empty() => raw
                .parse()
                .map(Some)
                .map_err(|err: T::Err| StoreError::Corrupt(err.to_string())),
            _ => Ok(None),
        }
    }
}

const USER_COLUMNS: &str = "id, wallet_address, username, email, total_tickets_purchased, \
     total_raffles_won, total_prize_won, total_referral_earnings, referral_points, created_at, \
     updated_at";

const RAFFLE_COLUMNS: &str = "id, title, description, max_tickets, total_tickets, ticket_price, \
     start_date, end_date, status, winner_id, winning_ticket_id, total_prize_amount, platform_fee, \
     referral_rewards, distributed_amount, is_distributed, is_created, transaction_hash, \
     created_at, updated_at";

const TICKET_COLUMNS: &str = "id, ticket_number, raffle_id, owner_id, referral_code_id, \
     purchase_transaction_hash, is_auto_enrolled, ticket_group, prize_amount, is_distributed, \
     created_at, updated_at";

const CODE_COLUMNS: &str = "id, code, is_platform_code, owner_id, total_uses, total_rewards, \
     created_at, updated_at";

const TRANSACTION_COLUMNS: &str = "id, kind, status, amount, transaction_hash, description, \
     from_address, to_address, raffle_id, ticket_id, nonce, metadata, created_at, updated_at";

/// Owner wallet of the ticket row in scope.
const TICKET_OWNER_WALLET: &str =
    "(SELECT wallet_address FROM users WHERE users.id = tickets.owner_id)";

fn read_user(r: &mut Reader<'_>) -> Result<User> {
    Ok(User {
        id: r.i64()?,
        wallet_address: r.parse()?,
        username: r.opt_text()?,
        email: r.opt_text()?,
        total_tickets_purchased: r.u64()?,
        total_raffles_won: r.u64()?,
        total_prize_won: r.usdc()?,
        total_referral_earnings: r.usdc()?,
        referral_points: r.u64()?,
        created_at: r.time()?,
        updated_at: r.time()?,
    })
}

fn read_raffle(r: &mut Reader<'_>) -> Result<Raffle> {
    Ok(Raffle {
        id: r.i64()?,
        title: r.text()?,
        description: r.text()?,
        max_tickets: r.u64()?,
        total_tickets: r.u64()?,
        ticket_price: r.usdc()?,
        start_date: r.opt_time()?,
        end_date: r.opt_time()?,
        status: r.parse()?,
        winner_id: r.opt_i64()?,
        winning_ticket_id: r.opt_i64()?,
        total_prize_amount: r.usdc()?,
        platform_fee: r.usdc()?,
        referral_rewards: r.usdc()?,
        distributed_amount: r.usdc()?,
        is_distributed: r.boolean()?,
        is_created: r.boolean()?,
        transaction_hash: r.opt_text()?,
        created_at: r.time()?,
        updated_at: r.time()?,
    })
}

fn read_ticket(r: &mut Reader<'_>) -> Result<Ticket> {
    Ok(Ticket {
        id: r.i64()?,
        ticket_number: r.u64()?,
        raffle_id: r.i64()?,
        owner_id: r.i64()?,
        referral_code_id: r.opt_i64()?,
        purchase_transaction_hash: r.opt_text()?,
        is_auto_enrolled: r.boolean()?,
        group: r.opt_parse::<TicketGroup>()?,
        prize_amount: r.usdc()?,
        is_distributed: r.boolean()?,
        created_at: r.time()?,
        updated_at: r.time()?,
    })
}

fn read_ticket_view(r: &mut Reader<'_>) -> Result<TicketView> {
    let ticket = read_ticket(r)?;
    let owner = r.parse()?;
    Ok(TicketView { ticket, owner })
}

fn read_code(r: &mut Reader<'_>) -> Result<ReferralCode> {
    Ok(ReferralCode {
        id: r.i64()?,
        code: r.text()?,
        is_platform_code: r.boolean()?,
        owner_id: r.opt_i64()?,
        total_uses: r.u64()?,
        total_rewards: r.usdc()?,
        created_at: r.time()?,
        updated_at: r.time()?,
    })
}

fn read_transaction(r: &mut Reader<'_>) -> Result<Transaction> {
    Ok(Transaction {
        id: r.i64()?,
        kind: r.parse()?,
        status: r.parse()?,
        amount: r.usdc()?,
        transaction_hash: r.opt_text()?.unwrap_or_default(),
        description: r.opt_text()?,
        from_address: r.opt_parse()?,
        to_address: r.opt_parse()?,
        raffle_id: r.opt_i64()?,
        ticket_id: r.opt_i64()?,
        nonce: r.opt_u64()?,
        metadata: r
            .opt_text()?
            .map(|raw| serde_json::from_str(&raw))
            .transpose()
            .map_err(|err| StoreError::Corrupt(format!("metadata: {err}")))?,
        created_at: r.time()?,
        updated_at: r.time()?,
    })
}

fn read_id(r: &mut Reader<'_>) -> Result<i64> {
    r.i64()
}

fn read_count(r: &mut Reader<'_>) -> Result<u64> {
    r.u64()
}

/// A ticket together with its owner's wallet.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct TicketView {
    pub ticket: Ticket,
    pub owner: WalletAddress,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum TicketFilter {
    All,
    Raffle(i64),
    Owner(i64),
}

/// Fields written when a draw settles.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct RaffleSettlement {
    pub winner_id: Option<i64>,
    pub winning_ticket_id: Option<i64>,
    pub total_prize_amount: Usdc,
    pub platform_fee: Usdc,
    pub distributed_amount: Usdc,
    pub transaction_hash: String,
}

/// Partial ticket update; `None` leaves a column untouched.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct TicketUpdate {
    pub group: Option<TicketGroup>,
    pub prize_amount: Option<Usdc>,
    pub is_distributed: Option<bool>,
    pub purchase_transaction_hash: Option<String>,
}

/// Repository over one open transaction.
pub struct Db<'a> {
    exec: &'a mut dyn Exec,
}

impl<'a> Db<'a> {
    pub(crate) fn new(exec: &'a mut dyn Exec) -> Self {
        Self { exec }
    }

    fn rows<T>(
        &mut self,
        sql: &str,
        params: &[SqlValue],
        read: fn(&mut Reader<'_>) -> Result<T>,
    ) -> Result<Vec<T>> {
        let mut out = Vec::new();
        self.exec.query(sql, params, &mut |row: &dyn RowAccess| {
            out.push(read(&mut Reader::new(row))?);
            Ok(())
        })?;
        Ok(out)
    }

    fn row<T>(
        &mut self,
        sql: &str,
        params: &[SqlValue],
        read: fn(&mut Reader<'_>) -> Result<T>,
    ) -> Result<Option<T>> {
        Ok(self.rows(sql, params, read)?.into_iter().next())
    }

    fn insert(&mut self, sql: &str, params: &[SqlValue]) -> Result<i64> {
        self.row(sql, params, read_id)?
            .ok_or_else(|| StoreError::Corrupt("insert returned no id".to_string()))
    }

    fn lock_clause(&self) -> &'static str {
        match self.exec.dialect() {
            Dialect::Postgres => " FOR UPDATE",
            Dialect::Sqlite => "",
        }
    }

    // Users

    pub fn user(&mut self, id: i64) -> Result<Option<User>> {
        let sql = format!("SELECT {USER_COLUMNS} FROM users WHERE id = ?1");
        self.row(&sql, &[id.into()], read_user)
    }

    pub fn user_by_wallet(&mut self, wallet: &WalletAddress) -> Result<Option<User>> {
        let sql = format!("SELECT {USER_COLUMNS} FROM users WHERE wallet_address = ?1");
        self.row(&sql, &[wallet.into()], read_user)
    }

    pub fn insert_user(&mut self, wallet: &WalletAddress, now: DateTime<Utc>) -> Result<User> {
        let id = self.insert(
            "INSERT INTO users (wallet_address, created_at, updated_at) VALUES (?1, ?2, ?2) \
             RETURNING id",
            &[wallet.into(), now.into()],
        )?;
        self.user(id)?
            .ok_or_else(|| StoreError::Corrupt(format!("user {id} vanished")))
    }

    /// Returns the user and whether it was created.
    pub fn get_or_create_user(
        &mut self,
        wallet: &WalletAddress,
        now: DateTime<Utc>,
    ) -> Result<(User, bool)> {
        match self.user_by_wallet(wallet)? {
            Some(user) => Ok((user, false)),
            None => Ok((self.insert_user(wallet, now)?, true)),
        }
    }

    pub fn add_user_tickets(&mut self, user_id: i64, count: u64, now: DateTime<Utc>) -> Result<()> {
        self.exec.execute(
            "UPDATE users SET total_tickets_purchased = total_tickets_purchased + ?2, \
             updated_at = ?3 WHERE id = ?1",
            &[user_id.into(), uint(count, "ticket count")?, now.into()],
        )?;
        Ok(())
    }

    pub fn remove_user_tickets(&mut self, user_id: i64, count: u64, now: DateTime<Utc>) -> Result<()> {
        self.exec.execute(
            "UPDATE users SET total_tickets_purchased = CASE \
             WHEN total_tickets_purchased > ?2 THEN total_tickets_purchased - ?2 ELSE 0 END, \
             updated_at = ?3 WHERE id = ?1",
            &[user_id.into(), uint(count, "ticket count")?, now.into()],
        )?;
        Ok(())
    }

    pub fn record_user_win(&mut self, user_id: i64, prize: Usdc, now: DateTime<Utc>) -> Result<()> {
        self.exec.execute(
            "UPDATE users SET total_raffles_won = total_raffles_won + 1, \
             total_prize_won = total_prize_won + ?2, updated_at = ?3 WHERE id = ?1",
            &[user_id.into(), usdc(prize, "prize")?, now.into()],
        )?;
        Ok(())
    }

    pub fn add_referral_earnings(
        &mut self,
        user_id: i64,
        reward: Usdc,
        points: u64,
        now: DateTime<Utc>,
    ) -> Result<()> {
        self.exec.execute(
            "UPDATE users SET total_referral_earnings = total_referral_earnings + ?2, \
             referral_points = referral_points + ?3, updated_at = ?4 WHERE id = ?1",
            &[
                user_id.into(),
                usdc(reward, "referral reward")?,
                uint(points, "referral points")?,
                now.into(),
            ],
        )?;
        Ok(())
    }

    // Raffles

    pub fn insert_raffle(&mut self, raffle: &NewRaffle, now: DateTime<Utc>) -> Result<Raffle> {
        let id = self.insert(
            "INSERT INTO raffles (title, description, max_tickets, total_tickets, ticket_price, \
             start_date, end_date, status, total_prize_amount, platform_fee, referral_rewards, \
             distributed_amount, is_distributed, is_created, created_at, updated_at) \
             VALUES (?1, ?2, ?3, 0, ?4, ?5, ?6, ?7, ?8, ?9, ?10, 0, FALSE, FALSE, ?11, ?11) \
             RETURNING id",
            &[
                raffle.title.as_str().into(),
                raffle.description.as_str().into(),
                uint(raffle.max_tickets, "max tickets")?,
                usdc(raffle.ticket_price, "ticket price")?,
                raffle.start_date.into(),
                raffle.end_date.into(),
                raffle.status.as_str().into(),
                usdc(raffle.total_prize_amount, "prize amount")?,
                usdc(raffle.platform_fee, "platform fee")?,
                usdc(raffle.referral_rewards, "referral rewards")?,
                now.into(),
            ],
        )?;
        self.raffle(id)?
            .ok_or_else(|| StoreError::Corrupt(format!("raffle {id} vanished")))
    }

    pub fn raffle(&mut self, id: i64) -> Result<Option<Raffle>> {
        let sql = format!("SELECT {RAFFLE_COLUMNS} FROM raffles WHERE id = ?1");
        self.row(&sql, &[id.into()], read_raffle)
    }

    /// Like [Db::raffle], but holds a row lock until commit.
    pub fn lock_raffle(&mut self, id: i64) -> Result<Option<Raffle>> {
        let sql = format!(
            "SELECT {RAFFLE_COLUMNS} FROM raffles WHERE id = ?1{}",
            self.lock_clause()
        );
        self.row(&sql, &[id.into()], read_raffle)
    }

    pub fn raffles_by_status(
        &mut self,
        status: RaffleStatus,
        order: SortOrder,
        offset: u64,
        limit: u64,
    ) -> Result<Vec<Raffle>> {
        let sql = format!(
            "SELECT {RAFFLE_COLUMNS} FROM raffles WHERE status = ?1 ORDER BY id {} \
             LIMIT ?2 OFFSET ?3",
            order.as_sql()
        );
        self.rows(
            &sql,
            &[
                status.as_str().into(),
                uint(limit, "limit")?,
                uint(offset, "offset")?,
            ],
            read_raffle,
        )
    }

    pub fn count_raffles(&mut self, status: RaffleStatus) -> Result<u64> {
        Ok(self
            .row(
                "SELECT COUNT(*) FROM raffles WHERE status = ?1",
                &[status.as_str().into()],
                read_count,
            )?
            .unwrap_or(0))
    }

    /// Active raffles with an id above `id`, ascending and locked.
    pub fn active_raffles_after(&mut self, id: i64, limit: u64) -> Result<Vec<Raffle>> {
        let sql = format!(
            "SELECT {RAFFLE_COLUMNS} FROM raffles WHERE status = 'active' AND id > ?1 \
             ORDER BY id ASC LIMIT ?2{}",
            self.lock_clause()
        );
        self.rows(&sql, &[id.into(), uint(limit, "limit")?], read_raffle)
    }

    /// Pending raffles in activation order. With `starts_before`, only dated raffles
    /// whose window has opened, earliest first; otherwise by id.
    pub fn pending_raffles(
        &mut self,
        starts_before: Option<DateTime<Utc>>,
        limit: u64,
    ) -> Result<Vec<Raffle>> {
        match starts_before {
            Some(now) => {
                let sql = format!(
                    "SELECT {RAFFLE_COLUMNS} FROM raffles WHERE status = 'pending' \
                     AND start_date IS NOT NULL AND start_date <= ?1 \
                     ORDER BY start_date ASC, id ASC LIMIT ?2"
                );
                self.rows(&sql, &[now.into(), uint(limit, "limit")?], read_raffle)
            }
            None => {
                let sql = format!(
                    "SELECT {RAFFLE_COLUMNS} FROM raffles WHERE status = 'pending' \
                     ORDER BY id ASC LIMIT ?1"
                );
                self.rows(&sql, &[uint(limit, "limit")?], read_raffle)
            }
        }
    }

    /// Start dates of every raffle starting inside `[from, to]`, any status.
    pub fn raffle_start_dates(
        &mut self,
        from: DateTime<Utc>,
        to: DateTime<Utc>,
    ) -> Result<Vec<DateTime<Utc>>> {
        self.rows(
            "SELECT start_date FROM raffles WHERE start_date >= ?1 AND start_date <= ?2 \
             ORDER BY start_date",
            &[from.into(), to.into()],
            |r| r.time(),
        )
    }

    pub fn expired_active_raffles(&mut self, now: DateTime<Utc>) -> Result<Vec<Raffle>> {
        let sql = format!(
            "SELECT {RAFFLE_COLUMNS} FROM raffles WHERE status = 'active' \
             AND end_date IS NOT NULL AND end_date < ?1 ORDER BY id ASC"
        );
        self.rows(&sql, &[now.into()], read_raffle)
    }

    pub fn sold_out_active_raffles(&mut self) -> Result<Vec<Raffle>> {
        let sql = format!(
            "SELECT {RAFFLE_COLUMNS} FROM raffles WHERE status = 'active' \
             AND total_tickets >= max_tickets ORDER BY id ASC"
        );
        self.rows(&sql, &[], read_raffle)
    }

    pub fn set_raffle_status(
        &mut self,
        id: i64,
        status: RaffleStatus,
        is_distributed: Option<bool>,
        now: DateTime<Utc>,
    ) -> Result<()> {
        self.exec.execute(
            "UPDATE raffles SET status = ?2, is_distributed = COALESCE(?3, is_distributed), \
             updated_at = ?4 WHERE id = ?1",
            &[
                id.into(),
                status.as_str().into(),
                is_distributed.into(),
                now.into(),
            ],
        )?;
        Ok(())
    }

    /// Move a pending raffle to active. Returns false if it was not pending.
    pub fn activate_raffle(&mut self, id: i64, now: DateTime<Utc>) -> Result<bool> {
        let changed = self.exec.execute(
            "UPDATE raffles SET status = 'active', updated_at = ?2 \
             WHERE id = ?1 AND status = 'pending'",
            &[id.into(), now.into()],
        )?;
        Ok(changed > 0)
    }

    /// Move an active raffle to completed. A settled raffle stays distributed.
    pub fn complete_raffle(&mut self, id: i64, drawn: bool, now: DateTime<Utc>) -> Result<bool> {
        let changed = self.exec.execute(
            "UPDATE raffles SET status = 'completed', is_distributed = (is_distributed OR ?2), \
             updated_at = ?3 WHERE id = ?1 AND status = 'active'",
            &[id.into(), drawn.into(), now.into()],
        )?;
        Ok(changed > 0)
    }

    pub fn add_raffle_tickets(&mut self, id: i64, count: u64, now: DateTime<Utc>) -> Result<()> {
        self.exec.execute(
            "UPDATE raffles SET total_tickets = total_tickets + ?2, updated_at = ?3 WHERE id = ?1",
            &[id.into(), uint(count, "ticket count")?, now.into()],
        )?;
        Ok(())
    }

    /// Raise the sold count to at least `sold`.
    pub fn raise_raffle_tickets(&mut self, id: i64, sold: u64, now: DateTime<Utc>) -> Result<()> {
        self.exec.execute(
            "UPDATE raffles SET total_tickets = CASE WHEN total_tickets < ?2 THEN ?2 \
             ELSE total_tickets END, updated_at = ?3 WHERE id = ?1",
            &[id.into(), uint(sold, "ticket count")?, now.into()],
        )?;
        Ok(())
    }

    pub fn mark_raffle_created(&mut self, id: i64, tx_hash: &str, now: DateTime<Utc>) -> Result<()> {
        self.exec.execute(
            "UPDATE raffles SET is_created = TRUE, transaction_hash = ?2, updated_at = ?3 \
             WHERE id = ?1",
            &[id.into(), tx_hash.into(), now.into()],
        )?;
        Ok(())
    }

    pub fn settle_raffle(
        &mut self,
        id: i64,
        settlement: &RaffleSettlement,
        now: DateTime<Utc>,
    ) -> Result<()> {
        self.exec.execute(
            "UPDATE raffles SET status = 'completed', is_distributed = TRUE, winner_id = ?2, \
             winning_ticket_id = ?3, total_prize_amount = ?4, platform_fee = ?5, \
             distributed_amount = ?6, transaction_hash = ?7, updated_at = ?8 WHERE id = ?1",
            &[
                id.into(),
                settlement.winner_id.into(),
                settlement.winning_ticket_id.into(),
                usdc(settlement.total_prize_amount, "prize amount")?,
                usdc(settlement.platform_fee, "platform fee")?,
                usdc(settlement.distributed_amount, "distributed amount")?,
                settlement.transaction_hash.as_str().into(),
                now.into(),
            ],
        )?;
        Ok(())
    }

    // Tickets

    pub fn insert_ticket(&mut self, ticket: &NewTicket, now: DateTime<Utc>) -> Result<Ticket> {
        let id = self.insert(
            "INSERT INTO tickets (ticket_number, raffle_id, owner_id, referral_code_id, \
             purchase_transaction_hash, is_auto_enrolled, ticket_group, prize_amount, \
             is_distributed, created_at, updated_at) \
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, 0, FALSE, ?8, ?8) RETURNING id",
            &[
                uint(ticket.ticket_number, "ticket number")?,
                ticket.raffle_id.into(),
                ticket.owner_id.into(),
                ticket.referral_code_id.into(),
                ticket.purchase_transaction_hash.clone().into(),
                ticket.is_auto_enrolled.into(),
                ticket.group.map(|group| group.as_str()).into(),
                now.into(),
            ],
        )?;
        self.ticket(id)?
            .ok_or_else(|| StoreError::Corrupt(format!("ticket {id} vanished")))
    }

    pub fn ticket(&mut self, id: i64) -> Result<Option<Ticket>> {
        let sql = format!("SELECT {TICKET_COLUMNS} FROM tickets WHERE id = ?1");
        self.row(&sql, &[id.into()], read_ticket)
    }

    pub fn ticket_by_number(&mut self, raffle_id: i64, number: u64) -> Result<Option<Ticket>> {
        let sql = format!(
            "SELECT {TICKET_COLUMNS} FROM tickets WHERE raffle_id = ?1 AND ticket_number = ?2"
        );
        self.row(
            &sql,
            &[raffle_id.into(), uint(number, "ticket number")?],
            read_ticket,
        )
    }

    fn ticket_filter(filter: TicketFilter) -> (&'static str, Vec<SqlValue>) {
        match filter {
            TicketFilter::All => ("TRUE", Vec::new()),
            TicketFilter::Raffle(id) => ("raffle_id = ?1", vec![id.into()]),
            TicketFilter::Owner(id) => ("owner_id = ?1", vec![id.into()]),
        }
    }

    /// Tickets with owner wallets, ordered by raffle then ticket number.
    pub fn tickets(
        &mut self,
        filter: TicketFilter,
        offset: u64,
        limit: u64,
    ) -> Result<Vec<TicketView>> {
        let (clause, mut params) = Self::ticket_filter(filter);
        let next = params.len() + 1;
        let sql = format!(
            "SELECT {TICKET_COLUMNS}, {TICKET_OWNER_WALLET} FROM tickets WHERE {clause} \
             ORDER BY raffle_id ASC, ticket_number ASC LIMIT ?{next} OFFSET ?{}",
            next + 1
        );
        params.push(uint(limit, "limit")?);
        params.push(uint(offset, "offset")?);
        self.rows(&sql, &params, read_ticket_view)
    }

    pub fn count_tickets(&mut self, filter: TicketFilter) -> Result<u64> {
        let (clause, params) = Self::ticket_filter(filter);
        let sql = format!("SELECT COUNT(*) FROM tickets WHERE {clause}");
        Ok(self.row(&sql, &params, read_count)?.unwrap_or(0))
    }

    /// Distributed first-place ticket with the lowest number.
    pub fn winning_ticket(&mut self, raffle_id: i64) -> Result<Option<TicketView>> {
        let sql = format!(
            "SELECT {TICKET_COLUMNS}, {TICKET_OWNER_WALLET} FROM tickets \
             WHERE raffle_id = ?1 AND is_distributed = TRUE AND ticket_group = ?2 \
             ORDER BY ticket_number ASC LIMIT 1"
        );
        self.row(
            &sql,
            &[raffle_id.into(), TicketGroup::Group1.as_str().into()],
            read_ticket_view,
        )
    }

    pub fn update_ticket(&mut self, id: i64, update: &TicketUpdate, now: DateTime<Utc>) -> Result<bool> {
        let changed = self.exec.execute(
            "UPDATE tickets SET ticket_group = COALESCE(?2, ticket_group), \
             prize_amount = COALESCE(?3, prize_amount), \
             is_distributed = COALESCE(?4, is_distributed), \
             purchase_transaction_hash = COALESCE(?5, purchase_transaction_hash), \
             updated_at = ?6 WHERE id = ?1",
            &[
                id.into(),
                update.group.map(|group| group.as_str()).into(),
                update
                    .prize_amount
                    .map(|prize| usdc(prize, "prize"))
                    .transpose()?
                    .unwrap_or(SqlValue::Null),
                update.is_distributed.into(),
                update.purchase_transaction_hash.clone().into(),
                now.into(),
            ],
        )?;
        Ok(changed > 0)
    }

    /// Hand a ticket to another user, dropping any referral attribution.
    pub fn reassign_ticket(&mut self, id: i64, owner_id: i64, now: DateTime<Utc>) -> Result<bool> {
        let changed = self.exec.execute(
            "UPDATE tickets SET owner_id = ?2, referral_code_id = NULL, updated_at = ?3 WHERE id = ?1",
            &[id.into(), owner_id.into(), now.into()],
        )?;
        Ok(changed > 0)
    }

    pub fn delete_ticket(&mut self, id: i64) -> Result<bool> {
        let deleted = self
            .exec
            .execute("DELETE FROM tickets WHERE id = ?1", &[id.into()])?;
        Ok(deleted > 0)
    }

    // Referral codes

    pub fn referral_code(&mut self, code: &str) -> Result<Option<ReferralCode>> {
        let sql = format!("SELECT {CODE_COLUMNS} FROM referral_codes WHERE code = ?1");
        self.row(&sql, &[code.into()], read_code)
    }

    pub fn referral_code_by_id(&mut self, id: i64) -> Result<Option<ReferralCode>> {
        let sql = format!("SELECT {CODE_COLUMNS} FROM referral_codes WHERE id = ?1");
        self.row(&sql, &[id.into()], read_code)
    }

    pub fn referral_code_by_owner(&mut self, user_id: i64) -> Result<Option<ReferralCode>> {
        let sql = format!("SELECT {CODE_COLUMNS} FROM referral_codes WHERE owner_id = ?1");
        self.row(&sql, &[user_id.into()], read_code)
    }

    pub fn insert_referral_code(
        &mut self,
        code: &str,
        owner_id: Option<i64>,
        is_platform_code: bool,
        now: DateTime<Utc>,
    ) -> Result<ReferralCode> {
        let id = self.insert(
            "INSERT INTO referral_codes (code, is_platform_code, owner_id, total_uses, \
             total_rewards, created_at, updated_at) VALUES (?1, ?2, ?3, 0, 0, ?4, ?4) \
             RETURNING id",
            &[
                code.into(),
                is_platform_code.into(),
                owner_id.into(),
                now.into(),
            ],
        )?;
        self.referral_code_by_id(id)?
            .ok_or_else(|| StoreError::Corrupt(format!("referral code {id} vanished")))
    }

    pub fn record_referral_use(
        &mut self,
        id: i64,
        uses: u64,
        reward: Usdc,
        now: DateTime<Utc>,
    ) -> Result<()> {
        self.exec.execute(
            "UPDATE referral_codes SET total_uses = total_uses + ?2, \
             total_rewards = total_rewards + ?3, updated_at = ?4 WHERE id = ?1",
            &[
                id.into(),
                uint(uses, "referral uses")?,
                usdc(reward, "referral reward")?,
                now.into(),
            ],
        )?;
        Ok(())
    }

    pub fn platform_codes(&mut self) -> Result<Vec<ReferralCode>> {
        let sql = format!(
            "SELECT {CODE_COLUMNS} FROM referral_codes WHERE is_platform_code = TRUE ORDER BY id"
        );
        self.rows(&sql, &[], read_code)
    }

    pub fn referral_leaderboard(
        &mut self,
        sort: LeaderboardSort,
        order: SortOrder,
        limit: u64,
    ) -> Result<Vec<LeaderboardEntry>> {
        let column = match sort {
            LeaderboardSort::Referees => "c.total_uses",
            LeaderboardSort::Earnings => "c.total_rewards",
        };
        let sql = format!(
            "SELECT u.wallet_address, c.total_uses, c.total_rewards, c.code \
             FROM referral_codes c JOIN users u ON u.id = c.owner_id \
             WHERE c.is_platform_code = FALSE ORDER BY {column} {}, c.id ASC LIMIT ?1",
            order.as_sql()
        );
        self.rows(&sql, &[uint(limit, "limit")?], |r| {
            Ok(LeaderboardEntry {
                wallet: r.parse()?,
                referees: r.u64()?,
                earnings: r.usdc()?,
                referral_code: r.text()?,
            })
        })
    }

    pub fn upsert_referral(
        &mut self,
        referrer_id: i64,
        wallet: &WalletAddress,
        points: u64,
        now: DateTime<Utc>,
    ) -> Result<()> {
        self.exec.execute(
            "INSERT INTO referrals (referrer_id, referred_wallet_address, points_earned, \
             is_active, last_activity_date, created_at, updated_at) \
             VALUES (?1, ?2, ?3, TRUE, ?4, ?4, ?4) \
             ON CONFLICT (referrer_id, referred_wallet_address) DO UPDATE SET \
             points_earned = referrals.points_earned + excluded.points_earned, \
             is_active = TRUE, last_activity_date = excluded.last_activity_date, \
             updated_at = excluded.updated_at",
            &[
                referrer_id.into(),
                wallet.into(),
                uint(points, "referral points")?,
                now.into(),
            ],
        )?;
        Ok(())
    }

    pub fn count_referrals(&mut self, referrer_id: i64) -> Result<u64> {
        Ok(self
            .row(
                "SELECT COUNT(*) FROM referrals WHERE referrer_id = ?1",
                &[referrer_id.into()],
                read_count,
            )?
            .unwrap_or(0))
    }

    // Transactions

    pub fn insert_transaction(
        &mut self,
        tx: &NewTransaction,
        now: DateTime<Utc>,
    ) -> Result<Transaction> {
        let metadata = tx.metadata.as_ref().map(|value| value.to_string());
        let id = self.insert(
            "INSERT INTO transactions (kind, status, amount, transaction_hash, description, \
             from_address, to_address, raffle_id, ticket_id, nonce, metadata, created_at, \
             updated_at) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?12) \
             RETURNING id",
            &[
                tx.kind.as_str().into(),
                tx.status.as_str().into(),
                usdc(tx.amount, "amount")?,
                tx.transaction_hash.as_str().into(),
                tx.description.clone().into(),
                tx.from_address.as_ref().into(),
                tx.to_address.as_ref().into(),
                tx.raffle_id.into(),
                tx.ticket_id.into(),
                tx.nonce
                    .map(|nonce| uint(nonce, "nonce"))
                    .transpose()?
                    .unwrap_or(SqlValue::Null),
                metadata.into(),
                now.into(),
            ],
        )?;
        self.transaction(id)?
            .ok_or_else(|| StoreError::Corrupt(format!("transaction {id} vanished")))
    }

    pub fn transaction(&mut self, id: i64) -> Result<Option<Transaction>> {
        let sql = format!("SELECT {TRANSACTION_COLUMNS} FROM transactions WHERE id = ?1");
        self.row(&sql, &[id.into()], read_transaction)
    }

    /// Ledger entry of `kind` for an on-chain hash, optionally scoped to one raffle.
    pub fn transaction_by_hash(
        &mut self,
        hash: &str,
        kind: TransactionKind,
        raffle_id: Option<i64>,
    ) -> Result<Option<Transaction>> {
        match raffle_id {
            Some(raffle_id) => {
                let sql = format!(
                    "SELECT {TRANSACTION_COLUMNS} FROM transactions WHERE transaction_hash = ?1 \
                     AND kind = ?2 AND raffle_id = ?3 ORDER BY id LIMIT 1"
                );
                self.row(
                    &sql,
                    &[hash.into(), kind.as_str().into(), raffle_id.into()],
                    read_transaction,
                )
            }
            None => {
                let sql = format!(
                    "SELECT {TRANSACTION_COLUMNS} FROM transactions WHERE transaction_hash = ?1 \
                     AND kind = ?2 ORDER BY id LIMIT 1"
                );
                self.row(&sql, &[hash.into(), kind.as_str().into()], read_transaction)
            }
        }
    }

    pub fn update_transaction(
        &mut self,
        id: i64,
        status: TransactionStatus,
        amount: Usdc,
        metadata: Option<&serde_json::Value>,
        now: DateTime<Utc>,
    ) -> Result<()> {
        self.exec.execute(
            "UPDATE transactions SET status = ?2, amount = ?3, \
             metadata = COALESCE(?4, metadata), updated_at = ?5 WHERE id = ?1",
            &[
                id.into(),
                status.as_str().into(),
                usdc(amount, "amount")?,
                metadata.map(|value| value.to_string()).into(),
                now.into(),
            ],
        )?;
        Ok(())
    }

    /// Oldest purchase reservation from `wallet` for `raffle_id` not yet matched to a hash.
    pub fn pending_reservation(
        &mut self,
        wallet: &WalletAddress,
        raffle_id: i64,
    ) -> Result<Option<Transaction>> {
        let sql = format!(
            "SELECT {TRANSACTION_COLUMNS} FROM transactions WHERE kind = ?1 AND status = ?2 \
             AND transaction_hash = '' AND from_address = ?3 AND raffle_id = ?4 \
             ORDER BY id LIMIT 1"
        );
        self.row(
            &sql,
            &[
                TransactionKind::TicketPurchase.as_str().into(),
                TransactionStatus::Pending.as_str().into(),
                wallet.into(),
                raffle_id.into(),
            ],
            read_transaction,
        )
    }

    pub fn attach_transaction_hash(
        &mut self,
        id: i64,
        hash: &str,
        nonce: Option<u64>,
        now: DateTime<Utc>,
    ) -> Result<()> {
        self.exec.execute(
            "UPDATE transactions SET transaction_hash = ?2, nonce = COALESCE(?3, nonce), \
             updated_at = ?4 WHERE id = ?1",
            &[
                id.into(),
                hash.into(),
                nonce
                    .map(|nonce| uint(nonce, "nonce"))
                    .transpose()?
                    .unwrap_or(SqlValue::Null),
                now.into(),
            ],
        )?;
        Ok(())
    }

    /// Entries sent from or to `wallet`, newest first.
    pub fn wallet_transactions(&mut self, wallet: &WalletAddress) -> Result<Vec<Transaction>> {
        let sql = format!(
            "SELECT {TRANSACTION_COLUMNS} FROM transactions \
             WHERE from_address = ?1 OR to_address = ?1 ORDER BY created_at DESC, id DESC"
        );
        self.rows(&sql, &[wallet.into()], read_transaction)
    }

    // Listener cursor

    pub fn cursor(&mut self, name: &str) -> Result<Option<Cursor>> {
        self.row(
            "SELECT block, log_index FROM listener_cursors WHERE name = ?1",
            &[name.into()],
            |r| {
                Ok(Cursor {
                    block: r.u64()?,
                    log_index: r.opt_u64()?,
                })
            },
        )
    }

    pub fn save_cursor(&mut self, name: &str, cursor: Cursor, now: DateTime<Utc>) -> Result<()> {
        self.exec.execute(
            "INSERT INTO listener_cursors (name, block, log_index, updated_at) \
             VALUES (?1, ?2, ?3, ?4) ON CONFLICT (name) DO UPDATE SET \
             block = excluded.block, log_index = excluded.log_index, \
             updated_at = excluded.updated_at",
            &[
                name.into(),
                uint(cursor.block, "cursor block")?,
                cursor
                    .log_index
                    .map(|index| uint(index, "cursor log index"))
                    .transpose()?
                    .unwrap_or(SqlValue::Null),
                now.into(),
            ],
        )?;
        Ok(())
    }
}

/// Table definitions. `{id}` is replaced with the backend's key column type.
pub(crate) const SCHEMA: &str = "
CREATE TABLE IF NOT EXISTS users (
    id {id},
    wallet_address TEXT NOT NULL UNIQUE,
    username TEXT,
    email TEXT,
    total_tickets_purchased BIGINT NOT NULL DEFAULT 0,
    total_raffles_won BIGINT NOT NULL DEFAULT 0,
    total_prize_won BIGINT NOT NULL DEFAULT 0,
    total_referral_earnings BIGINT NOT NULL DEFAULT 0,
    referral_points BIGINT NOT NULL DEFAULT 0,
    created_at BIGINT NOT NULL,
    updated_at BIGINT NOT NULL
);
CREATE TABLE IF NOT EXISTS raffles (
    id {id},
    title TEXT NOT NULL,
    description TEXT NOT NULL,
    max_tickets BIGINT NOT NULL,
    total_tickets BIGINT NOT NULL DEFAULT 0,
    ticket_price BIGINT NOT NULL,
    start_date BIGINT,
    end_date BIGINT,
    status TEXT NOT NULL,
    winner_id BIGINT,
    winning_ticket_id BIGINT,
    total_prize_amount BIGINT NOT NULL DEFAULT 0,
    platform_fee BIGINT NOT NULL DEFAULT 0,
    referral_rewards BIGINT NOT NULL DEFAULT 0,
    distributed_amount BIGINT NOT NULL DEFAULT 0,
    is_distributed BOOLEAN NOT NULL DEFAULT FALSE,
    is_created BOOLEAN NOT NULL DEFAULT FALSE,
    transaction_hash TEXT,
    created_at BIGINT NOT NULL,
    updated_at BIGINT NOT NULL
);
CREATE INDEX IF NOT EXISTS raffles_status_id ON raffles(status, id);
CREATE INDEX IF NOT EXISTS raffles_start_date ON raffles(start_date);
CREATE TABLE IF NOT EXISTS referral_codes (
    id {id},
    code TEXT NOT NULL UNIQUE,
    is_platform_code BOOLEAN NOT NULL DEFAULT FALSE,
    owner_id BIGINT UNIQUE REFERENCES users(id),
    total_uses BIGINT NOT NULL DEFAULT 0,
    total_rewards BIGINT NOT NULL DEFAULT 0,
    created_at BIGINT NOT NULL,
    updated_at BIGINT NOT NULL
);
CREATE TABLE IF NOT EXISTS tickets (
    id {id},
    ticket_number BIGINT NOT NULL,
    raffle_id BIGINT NOT NULL REFERENCES raffles(id),
    owner_id BIGINT NOT NULL REFERENCES users(id),
    referral_code_id BIGINT REFERENCES referral_codes(id),
    purchase_transaction_hash TEXT,
    is_auto_enrolled BOOLEAN NOT NULL DEFAULT FALSE,
    ticket_group TEXT,
    prize_amount BIGINT NOT NULL DEFAULT 0,
    is_distributed BOOLEAN NOT NULL DEFAULT FALSE,
    created_at BIGINT NOT NULL,
    updated_at BIGINT NOT NULL,
    UNIQUE (raffle_id, ticket_number)
);
CREATE INDEX IF NOT EXISTS tickets_owner ON tickets(owner_id);
CREATE TABLE IF NOT EXISTS referrals (
    id {id},
    referrer_id BIGINT NOT NULL REFERENCES users(id),
    referred_wallet_address TEXT NOT NULL,
    points_earned BIGINT NOT NULL DEFAULT 0,
    is_active BOOLEAN NOT NULL DEFAULT TRUE,
    last_activity_date BIGINT,
    created_at BIGINT NOT NULL,
    updated_at BIGINT NOT NULL,
    UNIQUE (referrer_id, referred_wallet_address)
);
CREATE TABLE IF NOT EXISTS transactions (
    id {id},
    kind TEXT NOT NULL,
    status TEXT NOT NULL,
    amount BIGINT NOT NULL DEFAULT 0,
    transaction_hash TEXT NOT NULL DEFAULT '',
    description TEXT,
    from_address TEXT,
    to_address TEXT,
    raffle_id BIGINT,
    ticket_id BIGINT,
    nonce BIGINT,
    metadata TEXT,
    created_at BIGINT NOT NULL,
    updated_at BIGINT NOT NULL
);
CREATE INDEX IF NOT EXISTS transactions_from ON transactions(from_address);
CREATE INDEX IF NOT EXISTS transactions_to ON transactions(to_address);
CREATE INDEX IF NOT EXISTS transactions_hash ON transactions(transaction_hash, kind);
CREATE TABLE IF NOT EXISTS listener_cursors (
    name TEXT PRIMARY KEY,
    block BIGINT NOT NULL,
    log_index BIGINT,
    updated_at BIGINT NOT NULL
);
";

enum Backend {
    Sqlite(rusqlite::Connection),
    Postgres(::postgres::Client),
}

impl Backend {
    fn transaction<T, E, F>(&mut self, f: F) -> std::result::Result<T, E>
    where
        F: FnOnce(&mut Db<'_>) -> std::result::Result<T, E>,
        E: From<StoreError>,
    {
        match self {
            Backend::Sqlite(conn) => sqlite::transaction(conn, f),
            Backend::Postgres(client) => self::postgres::transaction(client, f),
        }
    }
}

/// Shared handle to the database.
#[derive(Clone)]
pub struct Store {
    backend: Arc<Mutex<Backend>>,
}

impl Store {
    pub fn open_sqlite(path: &Path) -> Result<Self> {
        let conn = sqlite::open(path)?;
        Ok(Self::from_backend(Backend::Sqlite(conn)))
    }

    pub fn open_in_memory() -> Result<Self> {
        let conn = sqlite::open_in_memory()?;
        Ok(Self::from_backend(Backend::Sqlite(conn)))
    }

    /// Blocking; call from `spawn_blocking` when a runtime is active.
    pub fn connect_postgres(url: &str, allow_public: bool, allow_hostname: bool) -> Result<Self> {
        validate_postgres_url(url, allow_public, allow_hostname)?;
        let client = self::postgres::connect(url)?;
        Ok(Self::from_backend(Backend::Postgres(client)))
    }

    fn from_backend(backend: Backend) -> Self {
        Self {
            backend: Arc::new(Mutex::new(backend)),
        }
    }

    /// Run `f` in one transaction on the blocking pool.
    pub async fn run<T, E, F>(&self, f: F) -> std::result::Result<T, E>
    where
        F: FnOnce(&mut Db<'_>) -> std::result::Result<T, E> + Send + 'static,
        T: Send + 'static,
        E: From<StoreError> + Send + 'static,
    {
        let backend = self.backend.clone();
        tokio::task::spawn_blocking(move || {
            // A panicking transaction was rolled back, so the connection is still usable.
            let mut backend = backend.lock().unwrap_or_else(|poisoned| poisoned.into_inner());
            backend.transaction(f)
        })
        .await
        .map_err(|err| E::from(StoreError::Join(err.to_string())))?
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;
    use odds_types::RaffleTemplate;

    fn wallet(byte: u8) -> WalletAddress {
        WalletAddress::from_bytes([byte; 20])
    }

    async fn seeded_store() -> Store {
        Store::open_in_memory().unwrap()
    }

    #[tokio::test]
    async fn users_are_unique_by_wallet() {
        let store = seeded_store().await;
        let (first, created) = store
            .run(|db| db.get_or_create_user(&wallet(1), Utc::now()))
            .await
            .unwrap();
        assert!(created);
        let (second, created) = store
            .run(|db| db.get_or_create_user(&wallet(1), Utc::now()))
            .await
            .unwrap();
        assert!(!created);
        assert_eq!(first.id, second.id);

        let err = store
            .run(|db| db.insert_user(&wallet(1), Utc::now()))
            .await
            .unwrap_err();
        assert!(err.is_unique_violation(), "{err}");
    }

    #[tokio::test]
    async fn raffle_queries_follow_status_and_order() {
        let store = seeded_store().await;
        let now = Utc::now();
        store
            .run(move |db| {
                let template = RaffleTemplate::default();
                for _ in 0..3 {
                    let raffle = db.insert_raffle(&template.pooled(now), now)?;
                    db.set_raffle_status(raffle.id, RaffleStatus::Active, None, now)?;
                }
                db.insert_raffle(&template.pooled(now), now)?;
                Ok::<_, StoreError>(())
            })
            .await
            .unwrap();

        let (active, pending, after) = store
            .run(|db| {
                Ok::<_, StoreError>((
                    db.raffles_by_status(RaffleStatus::Active, SortOrder::Desc, 0, 10)?,
                    db.count_raffles(RaffleStatus::Pending)?,
                    db.active_raffles_after(1, 5)?,
                ))
            })
            .await
            .unwrap();
        assert_eq!(active.iter().map(|r| r.id).collect::<Vec<_>>(), vec![3, 2, 1]);
        assert_eq!(pending, 1);
        assert_eq!(after.iter().map(|r| r.id).collect::<Vec<_>>(), vec![2, 3]);
    }

    #[tokio::test]
    async fn failed_closure_rolls_back() {
        let store = seeded_store().await;
        let result: std::result::Result<(), StoreError> = store
            .run(|db| {
                db.insert_user(&wallet(9), Utc::now())?;
                Err(StoreError::Corrupt("abort".into()))
            })
            .await;
        assert!(result.is_err());
        let user = store.run(|db| db.user_by_wallet(&wallet(9))).await.unwrap();
        assert!(user.is_none());
    }

    #[tokio::test]
    async fn ticket_updates_are_partial() {
        let store = seeded_store().await;
        let now = Utc::now();
        let (ticket, updated) = store
            .run(move |db| {
                let user = db.insert_user(&wallet(2), now)?;
                let raffle = db.insert_raffle(&RaffleTemplate::default().pooled(now), now)?;
                let ticket = db.insert_ticket(
                    &NewTicket {
                        ticket_number: 1,
                        raffle_id: raffle.id,
                        owner_id: user.id,
                        referral_code_id: None,
                        purchase_transaction_hash: None,
                        is_auto_enrolled: false,
                        group: None,
                    },
                    now,
                )?;
                db.update_ticket(
                    ticket.id,
                    &TicketUpdate {
                        purchase_transaction_hash: Some("0xabc".into()),
                        ..Default::default()
                    },
                    now,
                )?;
                db.update_ticket(
                    ticket.id,
                    &TicketUpdate {
                        group: Some(TicketGroup::Group2),
                        prize_amount: Some(Usdc::from_units(5)),
                        is_distributed: Some(true),
                        ..Default::default()
                    },
                    now,
                )?;
                let updated = db.ticket(ticket.id)?;
                Ok::<_, StoreError>((ticket, updated))
            })
            .await
            .unwrap();
        let updated = updated.unwrap();
        assert_eq!(updated.id, ticket.id);
        assert_eq!(updated.purchase_transaction_hash.as_deref(), Some("0xabc"));
        assert_eq!(updated.group, Some(TicketGroup::Group2));
        assert_eq!(updated.prize_amount, Usdc::from_units(5));
        assert!(updated.is_distributed);
    }

    #[tokio::test]
    async fn lifecycle_updates_are_guarded_by_status() {
        let store = seeded_store().await;
        let now = Utc::now();
        let (activated, completed_pending, completed, again, raffle) = store
            .run(move |db| {
                let raffle = db.insert_raffle(&RaffleTemplate::default().pooled(now), now)?;
                let completed_pending = db.complete_raffle(raffle.id, true, now)?;
                let activated = db.activate_raffle(raffle.id, now)?;
                let completed = db.complete_raffle(raffle.id, false, now)?;
                let again = db.activate_raffle(raffle.id, now)?;
                let raffle = db.raffle(raffle.id)?;
                Ok::<_, StoreError>((activated, completed_pending, completed, again, raffle))
            })
            .await
            .unwrap();
        assert!(!completed_pending);
        assert!(activated);
        assert!(completed);
        assert!(!again);
        let raffle = raffle.unwrap();
        assert_eq!(raffle.status, RaffleStatus::Completed);
        assert!(!raffle.is_distributed);
    }

    #[tokio::test]
    async fn reservations_match_by_wallet_and_raffle() {
        let store = seeded_store().await;
        let now = Utc::now();
        let (found, other, after) = store
            .run(move |db| {
                let mut tx = NewTransaction::new(
                    TransactionKind::TicketPurchase,
                    TransactionStatus::Pending,
                    Usdc::from_units(2),
                );
                tx.from_address = Some(wallet(3));
                tx.raffle_id = Some(7);
                let tx = db.insert_transaction(&tx, now)?;
                let found = db.pending_reservation(&wallet(3), 7)?;
                let other = db.pending_reservation(&wallet(4), 7)?;
                db.attach_transaction_hash(tx.id, "0xfeed", Some(5), now)?;
                let after = db.pending_reservation(&wallet(3), 7)?;
                Ok::<_, StoreError>((found, other, after))
            })
            .await
            .unwrap();
        assert_eq!(found.map(|tx| tx.amount), Some(Usdc::from_units(2)));
        assert!(other.is_none());
        assert!(after.is_none());
    }

    #[tokio::test]
    async fn cursor_upserts() {
        let store = seeded_store().await;
        let now = Utc::now();
        store
            .run(move |db| {
                db.save_cursor("lottery", Cursor::at_block(10), now)?;
                db.save_cursor(
                    "lottery",
                    Cursor {
                        block: 12,
                        log_index: Some(3),
                    },
                    now,
                )
            })
            .await
            .unwrap();
        let cursor = store.run(|db| db.cursor("lottery")).await.unwrap();
        assert_eq!(
            cursor,
            Some(Cursor {
                block: 12,
                log_index: Some(3)
            })
        );
    }

    #[tokio::test]
    async fn start_dates_cover_window() {
        let store = seeded_store().await;
        let today = Utc::now().date_naive();
        let dates = store
            .run(move |db| {
                let template = RaffleTemplate::default();
                for offset in 0..3 {
                    db.insert_raffle(&template.daily(today + Duration::days(offset)), Utc::now())?;
                }
                let (from, _) = odds_types::daily_window(today);
                let (_, to) = odds_types::daily_window(today + Duration::days(1));
                db.raffle_start_dates(from, to)
            })
            .await
            .unwrap();
        assert_eq!(dates.len(), 2);
    }
}
