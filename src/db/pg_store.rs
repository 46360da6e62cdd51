//! Postgres implementation of [`CapacityStore`] over sea-orm.
//!
//! Statements are built with sea-query from allow-listed identifiers and
//! bound values; the catalog queries are fixed text with bound parameters.

use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sea_orm::sea_query::{Alias, Expr, Query, SimpleExpr};
use sea_orm::{
    ConnectOptions, ConnectionTrait, Database, DatabaseConnection, DatabaseTransaction, DbBackend,
    DbErr, ExecResult, FromQueryResult, QueryResult, RuntimeErr, Statement, StatementBuilder,
    TransactionTrait, Value,
};
use tracing::{debug, info};

use super::schema::{
    Association, Table, DATE_MODIFIED, DECOMMISSION, DECOMMISSION_DATE, ID, TABLE_PREFIX,
};
use super::store::{CapacityStore, StoreError};
use super::{DbParams, PersistError};
use crate::capacity::{FieldValue, Fields};
use crate::credentials::CredentialProvider;

const UNDEFINED_COLUMN: &str = "42703";

const SCHEMA_DDL: &str = include_str!("../../migrations/20250301000000_capacity_schema.sql");

const TABLES_SQL: &str = "SELECT table_name::text AS table_name \
     FROM information_schema.tables \
     WHERE table_schema = current_schema() \
       AND table_type = 'BASE TABLE' \
       AND table_name LIKE $1 \
     ORDER BY table_name";

const FOREIGN_KEYS_SQL: &str = "SELECT kcu.table_name::text AS table_name, \
            kcu.column_name::text AS column_name \
     FROM information_schema.table_constraints tc \
     JOIN information_schema.key_column_usage kcu \
       ON kcu.constraint_name = tc.constraint_name \
      AND kcu.table_schema = tc.table_schema \
     JOIN information_schema.constraint_column_usage ccu \
       ON ccu.constraint_name = tc.constraint_name \
      AND ccu.table_schema = tc.table_schema \
     WHERE tc.constraint_type = 'FOREIGN KEY' \
       AND tc.table_schema = current_schema() \
       AND ccu.table_name = $1 \
     ORDER BY kcu.table_name, kcu.column_name";

#[derive(Debug, FromQueryResult)]
struct TableNameRow {
    table_name: String,
}

#[derive(Debug, FromQueryResult)]
struct ForeignKeyRow {
    table_name: String,
    column_name: String,
}

/// Opens a single-connection pool to `params`, resolving the password
/// through `credentials`.
pub async fn open_connection(
    params: &DbParams,
    credentials: &dyn CredentialProvider,
) -> Result<DatabaseConnection, PersistError> {
    let password = credentials.password(&params.user)?;
    let url = format!(
        "postgres://{}:{}@{}:{}/{}",
        urlencoding::encode(&params.user),
        urlencoding::encode(&password),
        params.host,
        params.port,
        params.database
    );
    let mut opt = ConnectOptions::new(url);
    opt.max_connections(1)
        .min_connections(1)
        .connect_timeout(Duration::from_secs(10))
        .sqlx_logging(false);

    let target = format!("{}@{}", params.database, params.host);
    let db = Database::connect(opt)
        .await
        .map_err(|e| PersistError::Connection(format!("{target}: {e}")))?;
    debug!(host = %params.host, database = %params.database, "Opened database connection.");
    Ok(db)
}

pub struct PgStore {
    db: Option<DatabaseConnection>,
    txn: Option<DatabaseTransaction>,
}

impl PgStore {
    pub fn new(db: DatabaseConnection) -> Self {
        Self {
            db: Some(db),
            txn: None,
        }
    }

    pub async fn connect(
        params: &DbParams,
        credentials: &dyn CredentialProvider,
    ) -> Result<Self, PersistError> {
        Ok(Self::new(open_connection(params, credentials).await?))
    }

    /// Creates the reporting tables that do not exist yet.
    pub async fn apply_schema(&self) -> Result<(), StoreError> {
        let db = self.db.as_ref().ok_or(StoreError::Closed)?;
        db.execute_unprepared(SCHEMA_DDL).await?;
        info!("Reporting schema is in place.");
        Ok(())
    }

    async fn query_all(
        &self,
        table: Table,
        stmt: Statement,
    ) -> Result<Vec<QueryResult>, StoreError> {
        let result = match (&self.txn, &self.db) {
            (Some(txn), _) => txn.query_all(stmt).await,
            (None, Some(db)) => db.query_all(stmt).await,
            (None, None) => return Err(StoreError::Closed),
        };
        result.map_err(|e| classify(e, table))
    }

    async fn query_one(
        &self,
        table: Table,
        stmt: Statement,
    ) -> Result<Option<QueryResult>, StoreError> {
        let result = match (&self.txn, &self.db) {
            (Some(txn), _) => txn.query_one(stmt).await,
            (None, Some(db)) => db.query_one(stmt).await,
            (None, None) => return Err(StoreError::Closed),
        };
        result.map_err(|e| classify(e, table))
    }

    async fn execute(&self, table: Table, stmt: Statement) -> Result<ExecResult, StoreError> {
        let result = match (&self.txn, &self.db) {
            (Some(txn), _) => txn.execute(stmt).await,
            (None, Some(db)) => db.execute(stmt).await,
            (None, None) => return Err(StoreError::Closed),
        };
        result.map_err(|e| classify(e, table))
    }
}

fn build<S: StatementBuilder>(statement: &S) -> Statement {
    DbBackend::Postgres.build(statement)
}

fn to_value(value: &FieldValue) -> Value {
    match value {
        FieldValue::Int(v) => Value::BigInt(Some(*v)),
        FieldValue::Float(v) => Value::Double(Some(*v)),
        FieldValue::Bool(v) => Value::Bool(Some(*v)),
        FieldValue::Text(v) => Value::String(v.clone().map(Box::new)),
        FieldValue::Date(v) => Value::ChronoDate(v.map(Box::new)),
        FieldValue::Timestamp(v) => Value::ChronoDateTimeUtc(v.map(Box::new)),
    }
}

fn allowed(table: Table, column: &str) -> Result<&'static str, StoreError> {
    table.column(column).ok_or_else(|| StoreError::UndefinedColumn {
        table: table.name().to_string(),
        column: column.to_string(),
    })
}

/// Maps SQLSTATE 42703 to [`StoreError::UndefinedColumn`]; everything else
/// stays a database error.
fn classify(err: DbErr, table: Table) -> StoreError {
    let undefined = match &err {
        DbErr::Exec(RuntimeErr::SqlxError(e)) | DbErr::Query(RuntimeErr::SqlxError(e)) => e
            .as_database_error()
            .filter(|d| d.code().as_deref() == Some(UNDEFINED_COLUMN))
            .map(|d| quoted_name(d.message()).unwrap_or_default().to_string()),
        _ => None,
    };
    match undefined {
        Some(column) => StoreError::UndefinedColumn {
            table: table.name().to_string(),
            column,
        },
        None => StoreError::Database(err),
    }
}

/// First `"..."` in a server message, which for 42703 is the column name.
fn quoted_name(message: &str) -> Option<&str> {
    let start = message.find('"')? + 1;
    let len = message[start..].find('"')?;
    Some(&message[start..start + len])
}

fn id_of(row: &QueryResult, column: &str) -> Result<i32, StoreError> {
    Ok(row.try_get::<i32>("", column)?)
}

#[async_trait]
impl CapacityStore for PgStore {
    async fn begin(&mut self) -> Result<(), StoreError> {
        if self.txn.is_some() {
            return Err(StoreError::Query("transaction already open".to_string()));
        }
        let db = self.db.as_ref().ok_or(StoreError::Closed)?;
        self.txn = Some(db.begin().await?);
        Ok(())
    }

    async fn commit(&mut self) -> Result<(), StoreError> {
        let txn = self
            .txn
            .take()
            .ok_or_else(|| StoreError::Query("no open transaction".to_string()))?;
        txn.commit().await?;
        Ok(())
    }

    async fn rollback(&mut self) -> Result<(), StoreError> {
        if let Some(txn) = self.txn.take() {
            txn.rollback().await?;
        }
        Ok(())
    }

    async fn close(&mut self) -> Result<(), StoreError> {
        let rolled_back = self.rollback().await;
        if let Some(db) = self.db.take() {
            db.close().await?;
            debug!("Closed database connection.");
        }
        rolled_back
    }

    async fn find_id(
        &mut self,
        table: Table,
        key_column: &'static str,
        key: &FieldValue,
    ) -> Result<Option<i32>, StoreError> {
        let key_column = allowed(table, key_column)?;
        let stmt = build(
            Query::select()
                .column(Alias::new(ID))
                .from(Alias::new(table.name()))
                .and_where(Expr::col(Alias::new(key_column)).eq(to_value(key)))
                .limit(1),
        );
        match self.query_one(table, stmt).await? {
            Some(row) => Ok(Some(id_of(&row, ID)?)),
            None => Ok(None),
        }
    }

    async fn insert(&mut self, table: Table, fields: &Fields) -> Result<i32, StoreError> {
        let columns = fields
            .columns()
            .map(|c| allowed(table, c).map(Alias::new))
            .collect::<Result<Vec<_>, _>>()?;
        let values: Vec<SimpleExpr> = fields
            .iter()
            .map(|(_, v)| SimpleExpr::Value(to_value(v)))
            .collect();
        let mut insert = Query::insert();
        insert
            .into_table(Alias::new(table.name()))
            .columns(columns)
            .values(values)
            .map_err(|e| StoreError::Query(e.to_string()))?
            .returning_col(Alias::new(ID));
        let row = self
            .query_one(table, build(&insert))
            .await?
            .ok_or_else(|| StoreError::Query(format!("insert into {table} returned no id")))?;
        id_of(&row, ID)
    }

    async fn update(&mut self, table: Table, id: i32, fields: &Fields) -> Result<(), StoreError> {
        let values = fields
            .iter()
            .map(|(c, v)| -> Result<(Alias, SimpleExpr), StoreError> {
                Ok((Alias::new(allowed(table, c)?), SimpleExpr::Value(to_value(v))))
            })
            .collect::<Result<Vec<_>, _>>()?;
        let stmt = build(
            Query::update()
                .table(Alias::new(table.name()))
                .values(values)
                .and_where(Expr::col(Alias::new(ID)).eq(id)),
        );
        self.execute(table, stmt).await?;
        Ok(())
    }

    async fn association_members(
        &mut self,
        assoc: &Association,
        owner_id: i32,
    ) -> Result<Vec<i32>, StoreError> {
        let stmt = build(
            Query::select()
                .column(Alias::new(assoc.member_column))
                .from(Alias::new(assoc.table.name()))
                .and_where(Expr::col(Alias::new(assoc.owner_column)).eq(owner_id)),
        );
        self.query_all(assoc.table, stmt)
            .await?
            .iter()
            .map(|row| id_of(row, assoc.member_column))
            .collect()
    }

    async fn insert_association(
        &mut self,
        assoc: &Association,
        owner_id: i32,
        member_id: i32,
    ) -> Result<(), StoreError> {
        let mut insert = Query::insert();
        insert
            .into_table(Alias::new(assoc.table.name()))
            .columns([
                Alias::new(assoc.owner_column),
                Alias::new(assoc.member_column),
            ])
            .values([
                SimpleExpr::Value(Value::Int(Some(owner_id))),
                SimpleExpr::Value(Value::Int(Some(member_id))),
            ])
            .map_err(|e| StoreError::Query(e.to_string()))?;
        self.execute(assoc.table, build(&insert)).await?;
        Ok(())
    }

    async fn delete_association(
        &mut self,
        assoc: &Association,
        owner_id: i32,
        member_id: i32,
    ) -> Result<(), StoreError> {
        let stmt = build(
            Query::delete()
                .from_table(Alias::new(assoc.table.name()))
                .and_where(Expr::col(Alias::new(assoc.owner_column)).eq(owner_id))
                .and_where(Expr::col(Alias::new(assoc.member_column)).eq(member_id)),
        );
        self.execute(assoc.table, stmt).await?;
        Ok(())
    }

    async fn capacity_tables(&mut self) -> Result<Vec<String>, StoreError> {
        let pattern = format!("{}%", TABLE_PREFIX.replace('_', "\\_"));
        let stmt = Statement::from_sql_and_values(
            DbBackend::Postgres,
            TABLES_SQL,
            [pattern.into()],
        );
        self.query_all(Table::SourceSystem, stmt)
            .await?
            .iter()
            .map(|row| -> Result<String, StoreError> {
                Ok(TableNameRow::from_query_result(row, "")?.table_name)
            })
            .collect()
    }

    async fn stale_ids(
        &mut self,
        table: Table,
        cutoff: DateTime<Utc>,
    ) -> Result<Vec<i32>, StoreError> {
        // Issued against every prefixed table; junction tables answer 42703.
        let stmt = build(
            Query::select()
                .column(Alias::new(ID))
                .from(Alias::new(table.name()))
                .and_where(Expr::col(Alias::new(DATE_MODIFIED)).lt(cutoff))
                .and_where(Expr::col(Alias::new(DECOMMISSION)).eq(false)),
        );
        self.query_all(table, stmt)
            .await?
            .iter()
            .map(|row| id_of(row, ID))
            .collect()
    }

    async fn mark_decommissioned(
        &mut self,
        table: Table,
        id: i32,
        at: DateTime<Utc>,
    ) -> Result<(), StoreError> {
        let stmt = build(
            Query::update()
                .table(Alias::new(table.name()))
                .value(Alias::new(DECOMMISSION), true)
                .value(Alias::new(DECOMMISSION_DATE), at)
                .and_where(Expr::col(Alias::new(ID)).eq(id)),
        );
        self.execute(table, stmt).await?;
        Ok(())
    }

    async fn foreign_keys_into(
        &mut self,
        table: Table,
    ) -> Result<Vec<(String, String)>, StoreError> {
        let stmt = Statement::from_sql_and_values(
            DbBackend::Postgres,
            FOREIGN_KEYS_SQL,
            [table.name().into()],
        );
        self.query_all(table, stmt)
            .await?
            .iter()
            .map(|row| -> Result<(String, String), StoreError> {
                let fk = ForeignKeyRow::from_query_result(row, "")?;
                Ok((fk.table_name, fk.column_name))
            })
            .collect()
    }

    async fn delete_referencing(
        &mut self,
        table: Table,
        column: &'static str,
        id: i32,
    ) -> Result<u64, StoreError> {
        let column = allowed(table, column)?;
        let stmt = build(
            Query::delete()
                .from_table(Alias::new(table.name()))
                .and_where(Expr::col(Alias::new(column)).eq(id)),
        );
        Ok(self.execute(table, stmt).await?.rows_affected())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::reconcile::discover_foreign_keys;

    const TEST_DATABASE_URL: &str = "CAPACITY_TEST_DATABASE_URL";

    #[test]
    fn test_quoted_name_extracts_the_column() {
        assert_eq!(
            quoted_name("column \"date_modified\" does not exist"),
            Some("date_modified")
        );
        assert_eq!(quoted_name("no quotes here"), None);
    }

    #[test]
    fn test_statements_bind_values_and_quote_identifiers() {
        let injected = to_value(&FieldValue::from("host-1' OR 1=1"));
        let stmt = build(
            Query::select()
                .column(Alias::new(ID))
                .from(Alias::new(Table::Host.name()))
                .and_where(Expr::col(Alias::new("mo_id")).eq(injected)),
        );
        assert_eq!(
            stmt.sql,
            r#"SELECT "id" FROM "capacity_host" WHERE "mo_id" = $1"#
        );
        assert_eq!(stmt.values.map(|v| v.0.len()), Some(1));
    }

    #[test]
    fn test_unknown_columns_never_reach_sql() {
        let hostile = "name; DROP TABLE capacity_cluster";
        let err = allowed(Table::Cluster, hostile).unwrap_err();
        assert!(matches!(err, StoreError::UndefinedColumn { .. }));
        let column = allowed(Table::Cluster, "vmhost_count").unwrap();
        assert_eq!(column, "vmhost_count");
    }

    #[test]
    fn test_schema_ddl_creates_every_known_table() {
        for table in Table::ALL {
            assert!(
                SCHEMA_DDL.contains(&format!("CREATE TABLE IF NOT EXISTS {} (", table.name())),
                "{table} missing from DDL"
            );
        }
    }

    /// Needs a scratch Postgres database in `CAPACITY_TEST_DATABASE_URL`.
    #[tokio::test]
    #[ignore]
    async fn test_live_catalog_reports_foreign_keys_and_missing_columns() {
        let Ok(url) = std::env::var(TEST_DATABASE_URL) else {
            eprintln!("{TEST_DATABASE_URL} is not set; skipping");
            return;
        };
        let mut store = PgStore::new(Database::connect(url).await.unwrap());
        store.apply_schema().await.unwrap();

        let tables = store.capacity_tables().await.unwrap();
        for table in Table::ALL {
            assert!(tables.iter().any(|name| name == table.name()), "{table}");
        }

        let keys = discover_foreign_keys(&mut store, Table::Host)
            .await
            .unwrap();
        assert_eq!(keys.len(), 3);
        assert!(keys.contains(&(Table::ClusterHost, "host_id")));
        assert!(keys.contains(&(Table::HostVmSize, "host_id")));
        assert!(keys.contains(&(Table::HostSourceSystem, "host_id")));

        let err = store
            .stale_ids(Table::ClusterHost, Utc::now())
            .await
            .unwrap_err();
        match err {
            StoreError::UndefinedColumn { table, column } => {
                assert_eq!(table, Table::ClusterHost.name());
                assert_eq!(column, DATE_MODIFIED);
            }
            other => panic!("unexpected error: {other}"),
        }
        store.close().await.unwrap();
    }
}
