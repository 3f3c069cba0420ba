//! Live Postgres for the database tests. They are `#[ignore]`d by default; run
//! them with `TEST_DATABASE_URL=postgres://... cargo test -- --ignored`.
//!
//! Each test runs inside a transaction that is never committed.

use crate::db::models::NewEstablishment;
use crate::services::establishments::{self, EstablishmentIndex};
use diesel::PgConnection;
use diesel::prelude::*;
use diesel_migrations::MigrationHarness;
use std::sync::{Mutex, Once};

static MIGRATE: Once = Once::new();
// Tests share natural keys (fixture emails), so they take turns.
static SERIAL: Mutex<()> = Mutex::new(());

fn database_url() -> String {
    std::env::var("TEST_DATABASE_URL")
        .or_else(|_| std::env::var("DATABASE_URL"))
        .expect("set TEST_DATABASE_URL or DATABASE_URL to run database tests")
}

pub fn with_connection(test: impl FnOnce(&mut PgConnection)) {
    let _turn = SERIAL.lock().unwrap_or_else(|poisoned| poisoned.into_inner());
    let url = database_url();
    MIGRATE.call_once(|| {
        let mut conn = PgConnection::establish(&url).expect("connect to test database");
        conn.run_pending_migrations(crate::MIGRATIONS).expect("apply migrations");
    });
    let mut conn = PgConnection::establish(&url).expect("connect to test database");
    conn.begin_test_transaction().expect("begin test transaction");
    test(&mut conn);
}

/// The two establishments the JSON fixtures point at.
pub fn fixture_establishments(conn: &mut PgConnection) -> EstablishmentIndex {
    establishments::upsert_establishments(
        conn,
        vec![
            NewEstablishment {
                knack_id: "estUK".to_string(),
                name: "Northfield Sixth Form".to_string(),
                is_australian: false,
                trust_name: None,
            },
            NewEstablishment {
                knack_id: "estAU".to_string(),
                name: "Harbour College".to_string(),
                is_australian: true,
                trust_name: None,
            },
        ],
    )
    .expect("insert fixture establishments");
    EstablishmentIndex::load(conn).expect("load establishment index")
}

pub fn count(conn: &mut PgConnection, table: &str) -> i64 {
    #[derive(QueryableByName)]
    struct Count {
        #[diesel(sql_type = diesel::sql_types::BigInt)]
        n: i64,
    }
    diesel::sql_query(format!("SELECT count(*) AS n FROM {}", table))
        .get_result::<Count>(conn)
        .expect("count rows")
        .n
}
