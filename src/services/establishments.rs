//! Establishments and staff admins: the reference data every later stage links to.

use crate::db::models::{NewEstablishment, NewStaffAdmin};
use crate::models::knack::{KnackRecord, fields};
use crate::models::vespa::Region;
use crate::schema;
use crate::services::sync::BatchOutcome;
use crate::utils::dedupe_last_by_key;
use chrono::Utc;
use diesel::PgConnection;
use diesel::prelude::*;
use diesel::upsert::excluded;
use log::warn;
use std::collections::HashMap;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct EstablishmentRef {
    pub id: i64,
    pub region: Region,
}

/// Knack record id -> database row, loaded from the store so resumed runs see
/// establishments written by earlier runs.
#[derive(Debug, Clone, Default)]
pub struct EstablishmentIndex {
    by_knack_id: HashMap<String, EstablishmentRef>,
    by_db_id: HashMap<i64, Region>,
}

impl EstablishmentIndex {
    pub fn load(conn: &mut PgConnection) -> Result<Self, String> {
        use schema::establishments::dsl as E;
        let rows: Vec<(i64, String, bool)> = E::establishments
            .select((E::id, E::knack_id, E::is_australian))
            .load(conn)
            .map_err(|e| format!("load establishments failed: {}", e))?;
        Ok(Self::from_rows(rows))
    }

    pub fn from_rows(rows: impl IntoIterator<Item = (i64, String, bool)>) -> Self {
        let mut index = EstablishmentIndex::default();
        for (id, knack_id, is_australian) in rows {
            let region = Region::from_australian_flag(is_australian);
            index.by_knack_id.insert(knack_id, EstablishmentRef { id, region });
            index.by_db_id.insert(id, region);
        }
        index
    }

    pub fn get(&self, knack_id: &str) -> Option<EstablishmentRef> {
        self.by_knack_id.get(knack_id).copied()
    }

    pub fn region_of(&self, db_id: i64) -> Option<Region> {
        self.by_db_id.get(&db_id).copied()
    }

    pub fn len(&self) -> usize {
        self.by_knack_id.len()
    }

    pub fn is_empty(&self) -> bool {
        self.by_knack_id.is_empty()
    }

    /// `Ok(None)` when the record has no connection; `Err` when it points at
    /// an establishment the store does not know.
    pub fn resolve(&self, record: &KnackRecord, field: &str) -> Result<Option<EstablishmentRef>, String> {
        match record.first_connection(field) {
            None => Ok(None),
            Some(knack_id) => self
                .get(&knack_id)
                .map(Some)
                .ok_or_else(|| format!("unknown establishment {}", knack_id)),
        }
    }
}

pub fn transform_establishment(record: &KnackRecord) -> Result<NewEstablishment, String> {
    if record.id.trim().is_empty() {
        return Err("establishment record without id".to_string());
    }
    let name = record
        .text(fields::ESTABLISHMENT_NAME)
        .ok_or_else(|| format!("establishment {} has no name", record.id))?;
    Ok(NewEstablishment {
        knack_id: record.id.clone(),
        name,
        is_australian: record.boolean(fields::ESTABLISHMENT_AUSTRALIAN).unwrap_or(false),
        trust_name: record.text(fields::ESTABLISHMENT_TRUST),
    })
}

pub fn transform_staff(record: &KnackRecord, index: &EstablishmentIndex) -> Result<NewStaffAdmin, String> {
    let email = record
        .email(fields::STAFF_EMAIL)
        .ok_or_else(|| format!("staff record {} has no usable email", record.id))?;
    let establishment = index.resolve(record, fields::STAFF_ESTABLISHMENT)?;
    Ok(NewStaffAdmin {
        email,
        knack_id: Some(record.id.clone()),
        name: record.name(fields::STAFF_NAME),
        establishment_id: establishment.map(|e| e.id),
    })
}

pub fn upsert_establishments(conn: &mut PgConnection, rows: Vec<NewEstablishment>) -> Result<usize, String> {
    use schema::establishments::dsl as E;

    let rows = dedupe_last_by_key(rows, |r| r.knack_id.clone());
    if rows.is_empty() {
        return Ok(0);
    }
    diesel::insert_into(E::establishments)
        .values(&rows)
        .on_conflict(E::knack_id)
        .do_update()
        .set((
            E::name.eq(excluded(E::name)),
            E::is_australian.eq(excluded(E::is_australian)),
            E::trust_name.eq(excluded(E::trust_name)),
            E::updated_at.eq(Utc::now()),
        ))
        .execute(conn)
        .map_err(|e| format!("upsert establishments failed: {}", e))
}

pub fn upsert_staff(conn: &mut PgConnection, rows: Vec<NewStaffAdmin>) -> Result<usize, String> {
    use schema::staff_admins::dsl as A;

    let rows = dedupe_last_by_key(rows, |r| r.email.clone());
    if rows.is_empty() {
        return Ok(0);
    }
    diesel::insert_into(A::staff_admins)
        .values(&rows)
        .on_conflict(A::email)
        .do_update()
        .set((
            A::knack_id.eq(excluded(A::knack_id)),
            A::name.eq(excluded(A::name)),
            A::establishment_id.eq(excluded(A::establishment_id)),
            A::updated_at.eq(Utc::now()),
        ))
        .execute(conn)
        .map_err(|e| format!("upsert staff admins failed: {}", e))
}

/// Transform every record, keeping the rows that pass and counting the rest.
fn partition<T>(
    label: &str,
    records: &[KnackRecord],
    transform: impl Fn(&KnackRecord) -> Result<T, String>,
) -> (Vec<T>, BatchOutcome) {
    let mut outcome = BatchOutcome::default();
    let mut rows = Vec::with_capacity(records.len());
    for record in records {
        match transform(record) {
            Ok(row) => {
                rows.push(row);
                outcome.processed += 1;
            }
            Err(reason) => {
                warn!("{}: skipping record {}: {}", label, record.id, reason);
                outcome.skipped += 1;
            }
        }
    }
    (rows, outcome)
}

pub fn process_establishment_batch(conn: &mut PgConnection, records: &[KnackRecord]) -> Result<BatchOutcome, String> {
    let (rows, outcome) = partition("Establishments", records, transform_establishment);
    upsert_establishments(conn, rows)?;
    Ok(outcome)
}

pub fn process_staff_batch(
    conn: &mut PgConnection,
    records: &[KnackRecord],
    index: &EstablishmentIndex,
) -> Result<BatchOutcome, String> {
    let (rows, outcome) = partition("Staff", records, |r| transform_staff(r, index));
    upsert_staff(conn, rows)?;
    Ok(outcome)
}
