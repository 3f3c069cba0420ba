//! Students and their VESPA scores.
//!
//! One Knack VESPA record carries a student and up to three cycles of scores.
//! Each cycle's academic year comes from that cycle's own completion date and
//! the student's establishment region.

use crate::db::models::{NewStudent, NewVespaScore};
use crate::models::knack::{KnackRecord, fields};
use crate::models::vespa::{AcademicYear, Cycle, Region, SCORE_MAX, SCORE_MIN, VespaElement};
use crate::schema;
use crate::services::establishments::EstablishmentIndex;
use crate::services::sync::BatchOutcome;
use crate::utils::{dedupe_last_by_key, rows_per_insert};
use chrono::{NaiveDate, Utc};
use diesel::PgConnection;
use diesel::prelude::*;
use diesel::sql_types::{Nullable, Text};
use diesel::upsert::excluded;
use log::warn;
use std::collections::HashMap;

#[derive(Debug, Clone, PartialEq)]
pub struct ScoreDraft {
    pub cycle: Cycle,
    pub academic_year: AcademicYear,
    /// Indexed like `VespaElement::ALL`.
    pub values: [Option<i16>; 6],
    pub completion_date: Option<NaiveDate>,
    pub year_group: Option<String>,
}

impl ScoreDraft {
    pub fn value(&self, element: VespaElement) -> Option<i16> {
        let idx = VespaElement::ALL.iter().position(|e| *e == element)?;
        self.values[idx]
    }

    fn into_row(self, student_id: i64) -> NewVespaScore {
        let [vision, effort, systems, practice, attitude, overall] = self.values;
        NewVespaScore {
            student_id,
            cycle: self.cycle.into(),
            academic_year: self.academic_year.to_string(),
            vision,
            effort,
            systems,
            practice,
            attitude,
            overall,
            completion_date: self.completion_date,
            year_group: self.year_group,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct StudentRecord {
    pub student: NewStudent,
    pub scores: Vec<ScoreDraft>,
}

fn score_value(record: &KnackRecord, field: &str) -> Option<i16> {
    let raw = record.number(field)?;
    let rounded = raw.round();
    if rounded < f64::from(SCORE_MIN) || rounded > f64::from(SCORE_MAX) {
        warn!("Students: record {} field {} out of range ({}); ignored", record.id, field, raw);
        return None;
    }
    Some(rounded as i16)
}

/// `today` stands in for a missing completion date; it is evaluated against
/// this record's region like any other date.
pub fn transform_vespa_record(
    record: &KnackRecord,
    index: &EstablishmentIndex,
    today: NaiveDate,
) -> Result<StudentRecord, String> {
    let email = record
        .email(fields::VESPA_EMAIL)
        .ok_or_else(|| format!("VESPA record {} has no usable email", record.id))?;
    let establishment = index.resolve(record, fields::VESPA_ESTABLISHMENT)?;
    let region = establishment.map(|e| e.region).unwrap_or(Region::Standard);
    let year_group = record.text(fields::VESPA_YEAR_GROUP);

    let mut scores = Vec::new();
    for cycle in Cycle::ALL {
        let field_ids = fields::VESPA_SCORE_FIELDS[cycle.index()];
        let values = field_ids.map(|f| score_value(record, f));
        if values.iter().all(Option::is_none) {
            continue;
        }
        let completion_date = record.date(fields::VESPA_COMPLETION_DATES[cycle.index()]);
        scores.push(ScoreDraft {
            cycle,
            academic_year: AcademicYear::for_date(completion_date.unwrap_or(today), region),
            values,
            completion_date,
            year_group: None,
        });
    }

    let academic_year = scores
        .iter()
        .map(|s| s.academic_year)
        .max()
        .unwrap_or_else(|| AcademicYear::for_date(today, region));
    // The record only knows the current year group; earlier years stay unknown.
    for draft in scores.iter_mut().filter(|s| s.academic_year == academic_year) {
        draft.year_group = year_group.clone();
    }

    Ok(StudentRecord {
        student: NewStudent {
            email,
            knack_id: Some(record.id.clone()),
            name: record.name(fields::VESPA_NAME),
            establishment_id: establishment.map(|e| e.id),
            academic_year: Some(academic_year.to_string()),
            year_group,
            course: record.text(fields::VESPA_COURSE),
            faculty: record.text(fields::VESPA_FACULTY),
        },
        scores,
    })
}

diesel::define_sql_function! {
    fn coalesce(x: Nullable<Text>, y: Nullable<Text>) -> Nullable<Text>;
}

const STUDENT_COLUMNS: usize = 8;
const SCORE_COLUMNS: usize = 11;

/// Upsert by email; returns email -> student id for every row written.
pub fn upsert_students(conn: &mut PgConnection, rows: Vec<NewStudent>) -> Result<HashMap<String, i64>, String> {
    use schema::students::dsl as S;

    let rows = dedupe_last_by_key(rows, |r| r.email.clone());
    if rows.is_empty() {
        return Ok(HashMap::new());
    }
    let mut ids = HashMap::with_capacity(rows.len());
    for chunk in rows.chunks(rows_per_insert(STUDENT_COLUMNS)) {
        let written: Vec<(i64, String)> = diesel::insert_into(S::students)
            .values(chunk)
            .on_conflict(S::email)
            .do_update()
            .set((
                S::knack_id.eq(excluded(S::knack_id)),
                S::name.eq(excluded(S::name)),
                S::establishment_id.eq(excluded(S::establishment_id)),
                S::academic_year.eq(excluded(S::academic_year)),
                S::year_group.eq(excluded(S::year_group)),
                S::course.eq(excluded(S::course)),
                S::faculty.eq(excluded(S::faculty)),
                S::updated_at.eq(Utc::now()),
            ))
            .returning((S::id, S::email))
            .get_results(conn)
            .map_err(|e| format!("upsert students failed: {}", e))?;
        ids.extend(written.into_iter().map(|(id, email)| (email, id)));
    }
    Ok(ids)
}

pub fn upsert_scores(conn: &mut PgConnection, rows: Vec<NewVespaScore>) -> Result<usize, String> {
    use schema::vespa_scores::dsl as V;

    let rows = dedupe_last_by_key(rows, |r| (r.student_id, r.cycle, r.academic_year.clone()));
    if rows.is_empty() {
        return Ok(0);
    }
    let mut written = 0;
    for chunk in rows.chunks(rows_per_insert(SCORE_COLUMNS)) {
        written += diesel::insert_into(V::vespa_scores)
            .values(chunk)
            .on_conflict((V::student_id, V::cycle, V::academic_year))
            .do_update()
            .set((
                V::vision.eq(excluded(V::vision)),
                V::effort.eq(excluded(V::effort)),
                V::systems.eq(excluded(V::systems)),
                V::practice.eq(excluded(V::practice)),
                V::attitude.eq(excluded(V::attitude)),
                V::overall.eq(excluded(V::overall)),
                V::completion_date.eq(excluded(V::completion_date)),
                // A cycle seen again after the student moved up keeps its recorded year group.
                V::year_group.eq(coalesce(excluded(V::year_group), V::year_group)),
                V::updated_at.eq(Utc::now()),
            ))
            .execute(conn)
            .map_err(|e| format!("upsert vespa scores failed: {}", e))?;
    }
    Ok(written)
}

pub fn process_batch(
    conn: &mut PgConnection,
    records: &[KnackRecord],
    index: &EstablishmentIndex,
    today: NaiveDate,
) -> Result<BatchOutcome, String> {
    let mut outcome = BatchOutcome::default();
    let mut transformed = Vec::with_capacity(records.len());
    for record in records {
        match transform_vespa_record(record, index, today) {
            Ok(t) => transformed.push(t),
            Err(reason) => {
                warn!("Students: skipping record {}: {}", record.id, reason);
                outcome.skipped += 1;
            }
        }
    }

    let students = transformed.iter().map(|t| t.student.clone()).collect();
    let ids = upsert_students(conn, students)?;

    let mut score_rows = Vec::new();
    for t in transformed {
        let Some(&student_id) = ids.get(&t.student.email) else {
            warn!("Students: no id returned for {}; scores skipped", t.student.email);
            outcome.skipped += 1;
            continue;
        };
        for draft in t.scores {
            outcome.academic_years.insert(draft.academic_year.to_string());
            score_rows.push(draft.into_row(student_id));
        }
        outcome.processed += 1;
    }
    upsert_scores(conn, score_rows)?;
    Ok(outcome)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn load_fixture() -> Vec<KnackRecord> {
        let json = std::fs::read_to_string("tests/data/vespa-records.json").expect("fixture present");
        let page: crate::models::knack::RecordPage = serde_json::from_str(&json).expect("parse fixture");
        page.records
    }

    fn index() -> EstablishmentIndex {
        EstablishmentIndex::from_rows(vec![(1, "estUK".to_string(), false), (2, "estAU".to_string(), true)])
    }

    fn today() -> NaiveDate {
        NaiveDate::from_ymd_opt(2026, 3, 10).unwrap()
    }

    fn by_id<'a>(records: &'a [KnackRecord], id: &str) -> &'a KnackRecord {
        records.iter().find(|r| r.id == id).expect("record in fixture")
    }

    #[test]
    fn uk_student_with_two_cycles() {
        let records = load_fixture();
        let t = transform_vespa_record(by_id(&records, "stuUK"), &index(), today()).unwrap();

        assert_eq!(t.student.email, "amy.uk@example.ac.uk");
        assert_eq!(t.student.establishment_id, Some(1));
        assert_eq!(t.student.year_group.as_deref(), Some("Year 12"));
        assert_eq!(t.scores.len(), 2);

        let c1 = &t.scores[0];
        assert_eq!(c1.cycle.number(), 1);
        assert_eq!(c1.academic_year.to_string(), "2025/2026");
        assert_eq!(c1.value(VespaElement::Vision), Some(6));
        assert_eq!(c1.value(VespaElement::Overall), Some(6));

        let c2 = &t.scores[1];
        assert_eq!(c2.cycle.number(), 2);
        assert_eq!(c2.completion_date, NaiveDate::from_ymd_opt(2026, 2, 2));
        assert_eq!(t.student.academic_year.as_deref(), Some("2025/2026"));
    }

    #[test]
    fn australian_record_does_not_leak_year_into_next_record() {
        let records = load_fixture();
        let idx = index();
        let au = transform_vespa_record(by_id(&records, "stuAU"), &idx, today()).unwrap();
        let uk = transform_vespa_record(by_id(&records, "stuUK"), &idx, today()).unwrap();

        // Both completed cycle 1 in autumn 2025; only the Australian one is calendar-year based.
        assert_eq!(au.scores[0].academic_year.to_string(), "2025/2026");
        assert_eq!(uk.scores[0].academic_year.to_string(), "2025/2026");

        // A February 2026 completion splits the two regions.
        let au_feb = au.scores.iter().find(|s| s.cycle.number() == 2).unwrap();
        let uk_feb = uk.scores.iter().find(|s| s.cycle.number() == 2).unwrap();
        assert_eq!(au_feb.academic_year.to_string(), "2026/2027");
        assert_eq!(uk_feb.academic_year.to_string(), "2025/2026");
        assert_eq!(au.student.academic_year.as_deref(), Some("2026/2027"));
    }

    #[test]
    fn year_group_only_on_cycles_in_the_current_year() {
        let records = load_fixture();
        let au = transform_vespa_record(by_id(&records, "stuAU"), &index(), today()).unwrap();
        let by_cycle = |n: u8| au.scores.iter().find(|s| s.cycle.number() == n).unwrap();
        assert_eq!(by_cycle(1).year_group, None);
        assert_eq!(by_cycle(2).year_group.as_deref(), Some("Year 11"));

        let uk = transform_vespa_record(by_id(&records, "stuUK"), &index(), today()).unwrap();
        assert!(uk.scores.iter().all(|s| s.year_group.as_deref() == Some("Year 12")));
    }

    #[test]
    fn out_of_range_values_are_dropped() {
        let records = load_fixture();
        let t = transform_vespa_record(by_id(&records, "stuOdd"), &index(), today()).unwrap();
        assert_eq!(t.scores.len(), 1);
        assert_eq!(t.scores[0].value(VespaElement::Effort), None);
        assert_eq!(t.scores[0].value(VespaElement::Vision), Some(4));
    }

    #[test]
    fn missing_completion_date_falls_back_to_today() {
        let records = load_fixture();
        let t = transform_vespa_record(by_id(&records, "stuOdd"), &index(), today()).unwrap();
        assert_eq!(t.scores[0].completion_date, None);
        assert_eq!(t.scores[0].academic_year.to_string(), "2025/2026");
    }

    #[test]
    fn student_without_scores_keeps_current_year() {
        let records = load_fixture();
        let t = transform_vespa_record(by_id(&records, "stuNoScores"), &index(), today()).unwrap();
        assert!(t.scores.is_empty());
        assert_eq!(t.student.establishment_id, None);
        assert_eq!(t.student.academic_year.as_deref(), Some("2025/2026"));
    }

    #[test]
    fn records_without_email_or_with_unknown_school_are_rejected() {
        let records = load_fixture();
        assert!(transform_vespa_record(by_id(&records, "stuNoEmail"), &index(), today()).is_err());
        assert!(transform_vespa_record(by_id(&records, "stuGhostSchool"), &index(), today()).is_err());
    }

    #[test]
    fn draft_maps_values_into_columns() {
        let draft = ScoreDraft {
            cycle: Cycle::try_from(3).unwrap(),
            academic_year: AcademicYear::new(2024),
            values: [Some(1), Some(2), Some(3), Some(4), Some(5), Some(3)],
            completion_date: None,
            year_group: Some("Year 13".into()),
        };
        let row = draft.into_row(99);
        assert_eq!(row.student_id, 99);
        assert_eq!(row.cycle, 3);
        assert_eq!(row.academic_year, "2024/2025");
        assert_eq!((row.vision, row.attitude, row.overall), (Some(1), Some(5), Some(3)));
    }

    #[test]
    #[ignore = "needs Postgres"]
    fn rerunning_the_same_page_changes_no_row_counts() {
        crate::db::testing::with_connection(|conn| {
            use crate::db::testing::count;
            let index = crate::db::testing::fixture_establishments(conn);
            let records = load_fixture();
            let (students_before, scores_before) = (count(conn, "students"), count(conn, "vespa_scores"));

            let first = process_batch(conn, &records, &index, today()).unwrap();
            let after_first = (count(conn, "students"), count(conn, "vespa_scores"));
            let second = process_batch(conn, &records, &index, today()).unwrap();
            let after_second = (count(conn, "students"), count(conn, "vespa_scores"));

            assert_eq!(first, second);
            assert_eq!(first.processed, 4);
            assert_eq!(first.skipped, 2);
            assert_eq!(after_first, (students_before + 4, scores_before + 5));
            assert_eq!(after_first, after_second);
        });
    }

    #[test]
    #[ignore = "needs Postgres"]
    fn second_score_row_for_the_same_cycle_and_year_is_rejected() {
        crate::db::testing::with_connection(|conn| {
            use schema::vespa_scores::dsl as V;
            let index = crate::db::testing::fixture_establishments(conn);
            let records = load_fixture();
            process_batch(conn, &records, &index, today()).unwrap();

            let ids = upsert_students(
                conn,
                vec![transform_vespa_record(by_id(&records, "stuUK"), &index, today()).unwrap().student],
            )
            .unwrap();
            let duplicate = ScoreDraft {
                cycle: Cycle::try_from(1).unwrap(),
                academic_year: AcademicYear::new(2025),
                values: [Some(1); 6],
                completion_date: None,
                year_group: None,
            }
            .into_row(ids["amy.uk@example.ac.uk"]);
            let plain_insert = diesel::insert_into(V::vespa_scores).values(&duplicate).execute(conn);
            assert!(plain_insert.is_err());
        });
    }

    #[test]
    #[ignore = "needs Postgres"]
    fn recorded_year_group_survives_a_later_empty_one() {
        crate::db::testing::with_connection(|conn| {
            use schema::vespa_scores::dsl as V;
            let ids = upsert_students(
                conn,
                vec![NewStudent {
                    email: "year.group@example.ac.uk".to_string(),
                    knack_id: None,
                    name: None,
                    establishment_id: None,
                    academic_year: Some("2025/2026".to_string()),
                    year_group: Some("Year 12".to_string()),
                    course: None,
                    faculty: None,
                }],
            )
            .unwrap();
            let row = |year_group: Option<&str>| NewVespaScore {
                student_id: ids["year.group@example.ac.uk"],
                cycle: 1,
                academic_year: "2025/2026".to_string(),
                vision: Some(5),
                effort: None,
                systems: None,
                practice: None,
                attitude: None,
                overall: None,
                completion_date: None,
                year_group: year_group.map(str::to_string),
            };
            upsert_scores(conn, vec![row(Some("Year 12"))]).unwrap();
            upsert_scores(conn, vec![row(None)]).unwrap();

            let stored: Option<String> = V::vespa_scores
                .filter(V::student_id.eq(ids["year.group@example.ac.uk"]))
                .select(V::year_group)
                .first(conn)
                .unwrap();
            assert_eq!(stored.as_deref(), Some("Year 12"));
        });
    }
}
