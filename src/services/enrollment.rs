//! Enrollment history. Current years are kept by the `students` trigger; this
//! fills in past years that only exist in score rows.

use diesel::PgConnection;
use diesel::prelude::*;
use diesel::sql_types::BigInt;
use log::info;

#[derive(QueryableByName)]
struct Inserted {
    #[diesel(sql_type = BigInt)]
    inserted: i64,
}

pub fn backfill(conn: &mut PgConnection) -> Result<u64, String> {
    let row: Inserted = diesel::sql_query("SELECT backfill_student_enrollments() AS inserted")
        .get_result(conn)
        .map_err(|e| format!("backfill student enrollments failed: {}", e))?;
    let inserted = u64::try_from(row.inserted).unwrap_or(0);
    info!("Enrollments: {} historical enrollment rows added", inserted);
    Ok(inserted)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::testing;
    use crate::models::knack::RecordPage;
    use crate::schema::student_enrollments::dsl as En;
    use crate::schema::students::dsl as S;
    use crate::services::students;
    use chrono::NaiveDate;

    fn enrollments_of(conn: &mut PgConnection, email: &str) -> Vec<(String, Option<String>)> {
        En::student_enrollments
            .inner_join(S::students)
            .filter(S::email.eq(email))
            .select((En::academic_year, En::year_group))
            .order(En::academic_year)
            .load(conn)
            .unwrap()
    }

    #[test]
    #[ignore = "needs Postgres"]
    fn trigger_records_current_year_and_backfill_adds_past_ones() {
        testing::with_connection(|conn| {
            let index = testing::fixture_establishments(conn);
            let json = std::fs::read_to_string("tests/data/vespa-records.json").unwrap();
            let page: RecordPage = serde_json::from_str(&json).unwrap();
            let today = NaiveDate::from_ymd_opt(2026, 3, 10).unwrap();
            students::process_batch(conn, &page.records, &index, today).unwrap();

            // Ben's first cycle fell in the previous Australian year.
            let email = "ben.nguyen@example.edu.au";
            assert_eq!(enrollments_of(conn, email), vec![("2026/2027".to_string(), Some("Year 11".to_string()))]);

            assert!(backfill(conn).unwrap() >= 1);
            assert_eq!(
                enrollments_of(conn, email),
                vec![
                    ("2025/2026".to_string(), None),
                    ("2026/2027".to_string(), Some("Year 11".to_string())),
                ]
            );
            assert_eq!(backfill(conn).unwrap(), 0);
        });
    }
}
