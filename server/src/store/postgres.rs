use super::{Db, Dialect, Exec, Result, RowAccess, SqlValue, StoreError, SCHEMA};
use bytes::BytesMut;
use postgres::types::{to_sql_checked, IsNull, ToSql, Type};
use postgres::{Client, NoTls};
use std::error::Error as StdError;
use std::net::IpAddr;
use url::Url;

impl ToSql for SqlValue {
    fn to_sql(
        &self,
        ty: &Type,
        out: &mut BytesMut,
    ) -> std::result::Result<IsNull, Box<dyn StdError + Sync + Send>> {
        match self {
            SqlValue::Int(value) if *ty == Type::INT8 => value.to_sql(ty, out),
            SqlValue::Int(value) if *ty == Type::INT4 => i32::try_from(*value)?.to_sql(ty, out),
            SqlValue::Text(value) if *ty == Type::TEXT || *ty == Type::VARCHAR => {
                value.as_str().to_sql(ty, out)
            }
            SqlValue::Bool(value) if *ty == Type::BOOL => value.to_sql(ty, out),
            SqlValue::Null => Ok(IsNull::Yes),
            other => Err(format!("cannot bind {other:?} as {ty}").into()),
        }
    }

    fn accepts(ty: &Type) -> bool {
        matches!(
            *ty,
            Type::INT8 | Type::INT4 | Type::TEXT | Type::VARCHAR | Type::BOOL
        )
    }

    to_sql_checked!();
}

struct PgRow<'a>(&'a postgres::Row);

impl RowAccess for PgRow<'_> {
    fn int(&self, idx: usize) -> Result<Option<i64>> {
        Ok(self.0.try_get(idx)?)
    }

    fn text(&self, idx: usize) -> Result<Option<String>> {
        Ok(self.0.try_get(idx)?)
    }

    fn boolean(&self, idx: usize) -> Result<Option<bool>> {
        Ok(self.0.try_get(idx)?)
    }
}

struct PgExec<'a, 'b> {
    tx: &'a mut postgres::Transaction<'b>,
}

/// Rewrite `?N` placeholders as `$N`.
fn placeholders(sql: &str) -> String {
    sql.replace('?', "$")
}

fn bind(params: &[SqlValue]) -> Vec<&(dyn ToSql + Sync)> {
    params
        .iter()
        .map(|param| param as &(dyn ToSql + Sync))
        .collect()
}

impl Exec for PgExec<'_, '_> {
    fn dialect(&self) -> Dialect {
        Dialect::Postgres
    }

    fn execute(&mut self, sql: &str, params: &[SqlValue]) -> Result<u64> {
        Ok(self.tx.execute(placeholders(sql).as_str(), &bind(params))?)
    }

    fn query(
        &mut self,
        sql: &str,
        params: &[SqlValue],
        each: &mut dyn FnMut(&dyn RowAccess) -> Result<()>,
    ) -> Result<()> {
        for row in self.tx.query(placeholders(sql).as_str(), &bind(params))? {
            each(&PgRow(&row))?;
        }
        Ok(())
    }
}

pub(super) fn connect(url: &str) -> Result<Client> {
    let mut client = Client::connect(url, NoTls)?;
    client.batch_execute(&SCHEMA.replace("{id}", "BIGSERIAL PRIMARY KEY"))?;
    Ok(client)
}

pub(super) fn transaction<T, E, F>(client: &mut Client, f: F) -> std::result::Result<T, E>
where
    F: FnOnce(&mut Db<'_>) -> std::result::Result<T, E>,
    E: From<StoreError>,
{
    let mut tx = client
        .transaction()
        .map_err(|err| E::from(StoreError::from(err)))?;
    let value = {
        let mut exec = PgExec { tx: &mut tx };
        let mut db = Db::new(&mut exec);
        f(&mut db)?
    };
    tx.commit().map_err(|err| E::from(StoreError::from(err)))?;
    Ok(value)
}

/// Reject database URLs that point at public hosts unless explicitly allowed.
pub fn validate_postgres_url(url: &str, allow_public: bool, allow_hostname: bool) -> Result<()> {
    if allow_public {
        return Ok(());
    }

    let parsed = Url::parse(url).map_err(|err| StoreError::InvalidUrl(err.to_string()))?;
    let scheme = parsed.scheme();
    if scheme != "postgres" && scheme != "postgresql" {
        return Err(StoreError::InvalidUrl(
            "must start with postgres:// or postgresql://".to_string(),
        ));
    }

    let host = parsed
        .host_str()
        .ok_or_else(|| StoreError::InvalidUrl("missing host".to_string()))?;
    if host.eq_ignore_ascii_case("localhost") {
        return Ok(());
    }

    let bare = host.trim_start_matches('[').trim_end_matches(']');
    if let Ok(ip) = bare.parse::<IpAddr>() {
        if is_private_ip(ip) {
            return Ok(());
        }
        return Err(StoreError::InvalidUrl(
            "host is public; set DATABASE_ALLOW_PUBLIC=1 to override".to_string(),
        ));
    }

    if allow_hostname {
        return Ok(());
    }
    Err(StoreError::InvalidUrl(
        "host must be a private IP; set DATABASE_ALLOW_HOSTNAME=1 to allow hostnames".to_string(),
    ))
}

fn is_private_ip(ip: IpAddr) -> bool {
    match ip {
        IpAddr::V4(v4) => v4.is_private() || v4.is_loopback(),
        IpAddr::V6(v6) => {
            let first = v6.segments()[0];
            v6.is_loopback() || (first & 0xfe00) == 0xfc00 || (first & 0xffc0) == 0xfe80
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn placeholders_are_rewritten() {
        assert_eq!(
            placeholders("UPDATE t SET a = ?2 WHERE id = ?1"),
            "UPDATE t SET a = $2 WHERE id = $1"
        );
    }

    #[test]
    fn postgres_urls_must_be_private() {
        assert!(validate_postgres_url("postgres://u:p@localhost/odds", false, false).is_ok());
        assert!(validate_postgres_url("postgresql://u:p@10.0.0.5:5432/odds", false, false).is_ok());
        assert!(validate_postgres_url("postgres://u:p@[fd00::1]/odds", false, false).is_ok());
        assert!(validate_postgres_url("postgres://u:p@8.8.8.8/odds", false, false).is_err());
        assert!(validate_postgres_url("postgres://u:p@8.8.8.8/odds", true, false).is_ok());
        assert!(validate_postgres_url("mysql://u:p@localhost/odds", false, false).is_err());
        assert!(validate_postgres_url("postgres://u:p@db.internal/odds", false, false).is_err());
        assert!(validate_postgres_url("postgres://u:p@db.internal/odds", false, true).is_ok());
    }
}
