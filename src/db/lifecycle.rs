use chrono::NaiveDate;
use sea_orm::{DbBackend, FromQueryResult, Statement};
use tracing::{info, warn};

use super::pg_store::open_connection;
use super::store::StoreError;
use super::{DbParams, PersistError};
use crate::credentials::CredentialProvider;
use crate::inventory::{index_lifecycle, LifecycleMap, LifecycleRecord};

const LIFECYCLE_SQL: &str = "\
    SELECT common_name, serial_number, contract_expiring, end_of_life FROM corp \
    UNION \
    SELECT common_name, serial_number, contract_expiring, end_of_life FROM stores";

#[derive(Debug, FromQueryResult)]
struct LifecycleRow {
    common_name: String,
    serial_number: Option<String>,
    contract_expiring: Option<NaiveDate>,
    end_of_life: Option<NaiveDate>,
}

impl From<LifecycleRow> for LifecycleRecord {
    fn from(row: LifecycleRow) -> Self {
        LifecycleRecord {
            common_name: row.common_name,
            serial_number: row.serial_number,
            contract_expiring: row.contract_expiring,
            end_of_life: row.end_of_life,
        }
    }
}

/// Reads contract and end-of-life dates for every asset known to the
/// lifecycle database.
pub async fn load_lifecycle_map(
    params: &DbParams,
    credentials: &dyn CredentialProvider,
) -> Result<LifecycleMap, PersistError> {
    let db = open_connection(params, credentials).await?;
    let stmt = Statement::from_string(DbBackend::Postgres, LIFECYCLE_SQL);
    let rows = LifecycleRow::find_by_statement(stmt).all(&db).await;
    if let Err(e) = db.close().await {
        warn!(error = %e, "Failed to close lifecycle database connection.");
    }
    let rows = rows.map_err(StoreError::from)?;

    let map = index_lifecycle(rows.into_iter().map(LifecycleRecord::from).collect());
    info!(entries = map.len(), "Lifecycle records loaded.");
    Ok(map)
}
