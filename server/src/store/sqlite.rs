use super::{Db, Dialect, Exec, Result, RowAccess, SqlValue, StoreError, SCHEMA};
use rusqlite::types::{ToSqlOutput, Value};
use rusqlite::{params_from_iter, Connection, ToSql, TransactionBehavior};
use std::path::Path;
use std::time::Duration;

const BUSY_TIMEOUT: Duration = Duration::from_secs(5);

impl ToSql for SqlValue {
    fn to_sql(&self) -> rusqlite::Result<ToSqlOutput<'_>> {
        Ok(match self {
            SqlValue::Int(value) => ToSqlOutput::from(*value),
            SqlValue::Text(value) => ToSqlOutput::from(value.as_str()),
            SqlValue::Bool(value) => ToSqlOutput::from(*value),
            SqlValue::Null => ToSqlOutput::Owned(Value::Null),
        })
    }
}

struct SqliteRow<'a, 'stmt>(&'a rusqlite::Row<'stmt>);

impl RowAccess for SqliteRow<'_, '_> {
    fn int(&self, idx: usize) -> Result<Option<i64>> {
        Ok(self.0.get(idx)?)
    }

    fn text(&self, idx: usize) -> Result<Option<String>> {
        Ok(self.0.get(idx)?)
    }

    fn boolean(&self, idx: usize) -> Result<Option<bool>> {
        Ok(self.0.get(idx)?)
    }
}

struct SqliteExec<'a> {
    conn: &'a Connection,
}

impl Exec for SqliteExec<'_> {
    fn dialect(&self) -> Dialect {
        Dialect::Sqlite
    }

    fn execute(&mut self, sql: &str, params: &[SqlValue]) -> Result<u64> {
        let mut stmt = self.conn.prepare_cached(sql)?;
        let changed = stmt.execute(params_from_iter(params.iter()))?;
        Ok(changed as u64)
    }

    fn query(
        &mut self,
        sql: &str,
        params: &[SqlValue],
        each: &mut dyn FnMut(&dyn RowAccess) -> Result<()>,
    ) -> Result<()> {
        let mut stmt = self.conn.prepare_cached(sql)?;
        let mut rows = stmt.query(params_from_iter(params.iter()))?;
        while let Some(row) = rows.next()? {
            each(&SqliteRow(row))?;
        }
        Ok(())
    }
}

fn init_schema(conn: &Connection) -> Result<()> {
    conn.busy_timeout(BUSY_TIMEOUT)?;
    conn.execute_batch("PRAGMA foreign_keys=ON;")?;
    conn.execute_batch(&SCHEMA.replace("{id}", "INTEGER PRIMARY KEY AUTOINCREMENT"))?;
    Ok(())
}

pub(super) fn open(path: &Path) -> Result<Connection> {
    let conn = Connection::open(path)?;
    conn.execute_batch("PRAGMA journal_mode=WAL; PRAGMA synchronous=NORMAL;")?;
    init_schema(&conn)?;
    Ok(conn)
}

pub(super) fn open_in_memory() -> Result<Connection> {
    let conn = Connection::open_in_memory()?;
    init_schema(&conn)?;
    Ok(conn)
}

/// Run `f` inside an immediate transaction, committing on success.
pub(super) fn transaction<T, E, F>(conn: &mut Connection, f: F) -> std::result::Result<T, E>
where
    F: FnOnce(&mut Db<'_>) -> std::result::Result<T, E>,
    E: From<StoreError>,
{
    let tx = conn
        .transaction_with_behavior(TransactionBehavior::Immediate)
        .map_err(|err| E::from(StoreError::from(err)))?;
    let value = {
        let mut exec = SqliteExec { conn: &tx };
        let mut db = Db::new(&mut exec);
        f(&mut db)?
    };
    tx.commit().map_err(|err| E::from(StoreError::from(err)))?;
    Ok(value)
}

#[cfg(test)]
mod tests {
    use super::super::Store;
    use chrono::Utc;
    use odds_types::WalletAddress;

    #[tokio::test]
    async fn file_store_survives_reopen() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("odds.db");
        let wallet = WalletAddress::from_bytes([7; 20]);

        let store = Store::open_sqlite(&path).unwrap();
        let inserted = {
            let wallet = wallet.clone();
            store
                .run(move |db| db.insert_user(&wallet, Utc::now()))
                .await
                .unwrap()
        };
        drop(store);

        let reopened = Store::open_sqlite(&path).unwrap();
        let found = reopened
            .run(move |db| db.user_by_wallet(&wallet))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(found.id, inserted.id);
    }
}
