use crate::db::models::{NewSyncLog, SyncLog, sync_status};
use crate::schema;
use chrono::{DateTime, Utc};
use diesel::PgConnection;
use diesel::prelude::*;

pub fn start(conn: &mut PgConnection, sync_type: &str, started_at: DateTime<Utc>) -> Result<i64, String> {
    use schema::sync_logs::dsl as L;
    diesel::insert_into(L::sync_logs)
        .values(&NewSyncLog {
            sync_type: sync_type.to_string(),
            status: sync_status::STARTED.to_string(),
            started_at,
        })
        .returning(L::id)
        .get_result(conn)
        .map_err(|e| format!("insert sync log failed: {}", e))
}

/// Put a run resumed from a checkpoint back into `started`.
pub fn reopen(conn: &mut PgConnection, id: i64) -> Result<(), String> {
    use schema::sync_logs::dsl as L;
    let updated = diesel::update(L::sync_logs.find(id))
        .set((
            L::status.eq(sync_status::STARTED),
            L::completed_at.eq(None::<DateTime<Utc>>),
            L::error_message.eq(None::<String>),
        ))
        .execute(conn)
        .map_err(|e| format!("reopen sync log {} failed: {}", id, e))?;
    if updated == 0 {
        return Err(format!(
            "checkpoint refers to sync log {} which does not exist (delete the checkpoint to start over)",
            id
        ));
    }
    Ok(())
}

pub fn complete(
    conn: &mut PgConnection,
    id: i64,
    records_processed: u64,
    metadata: serde_json::Value,
) -> Result<(), String> {
    use schema::sync_logs::dsl as L;
    diesel::update(L::sync_logs.find(id))
        .set((
            L::status.eq(sync_status::COMPLETED),
            L::completed_at.eq(Some(Utc::now())),
            L::records_processed.eq(i64::try_from(records_processed).unwrap_or(i64::MAX)),
            L::error_message.eq(None::<String>),
            L::metadata.eq(Some(metadata)),
        ))
        .execute(conn)
        .map(|_| ())
        .map_err(|e| format!("complete sync log {} failed: {}", id, e))
}

pub fn fail(
    conn: &mut PgConnection,
    id: i64,
    error: &str,
    records_processed: u64,
    metadata: serde_json::Value,
) -> Result<(), String> {
    use schema::sync_logs::dsl as L;
    diesel::update(L::sync_logs.find(id))
        .set((
            L::status.eq(sync_status::FAILED),
            L::completed_at.eq(Some(Utc::now())),
            L::records_processed.eq(i64::try_from(records_processed).unwrap_or(i64::MAX)),
            L::error_message.eq(Some(error)),
            L::metadata.eq(Some(metadata)),
        ))
        .execute(conn)
        .map(|_| ())
        .map_err(|e| format!("fail sync log {} failed: {}", id, e))
}

pub fn recent(conn: &mut PgConnection, limit: i64) -> Result<Vec<SyncLog>, String> {
    use schema::sync_logs::dsl as L;
    L::sync_logs
        .order((L::started_at.desc(), L::id.desc()))
        .limit(limit)
        .select(SyncLog::as_select())
        .load(conn)
        .map_err(|e| format!("load sync logs failed: {}", e))
}

pub fn last_with_status(conn: &mut PgConnection, status: &str) -> Result<Option<SyncLog>, String> {
    use schema::sync_logs::dsl as L;
    L::sync_logs
        .filter(L::status.eq(status))
        .order((L::started_at.desc(), L::id.desc()))
        .select(SyncLog::as_select())
        .first(conn)
        .optional()
        .map_err(|e| format!("load last {} sync failed: {}", status, e))
}

pub fn count_since(conn: &mut PgConnection, since: DateTime<Utc>) -> Result<i64, String> {
    use schema::sync_logs::dsl as L;
    L::sync_logs
        .filter(L::started_at.ge(since))
        .count()
        .get_result(conn)
        .map_err(|e| format!("count sync logs failed: {}", e))
}
