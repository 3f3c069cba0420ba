//! Questionnaire answers, one row per student, cycle, academic year and question.

use crate::db::models::NewQuestionResponse;
use crate::models::knack::{KnackRecord, fields};
use crate::models::questions::QuestionCatalogue;
use crate::models::vespa::{AcademicYear, Cycle, RESPONSE_MAX, RESPONSE_MIN, Region};
use crate::schema;
use crate::services::establishments::{EstablishmentIndex, EstablishmentRef};
use crate::services::sync::BatchOutcome;
use crate::utils::{dedupe_last_by_key, rows_per_insert};
use chrono::NaiveDate;
use diesel::PgConnection;
use diesel::prelude::*;
use diesel::upsert::excluded;
use log::warn;
use std::collections::HashMap;

#[derive(Debug, Clone, PartialEq)]
pub struct ResponseDraft {
    pub cycle: Cycle,
    pub question_id: String,
    pub value: i16,
    pub completion_date: Option<NaiveDate>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct QuestionnaireRecord {
    pub email: String,
    pub establishment: Option<EstablishmentRef>,
    pub responses: Vec<ResponseDraft>,
}

impl QuestionnaireRecord {
    /// Rows for one student; the academic year is resolved per answer from its
    /// own cycle date and the given region.
    pub fn into_rows(self, student_id: i64, region: Region, today: NaiveDate) -> Vec<NewQuestionResponse> {
        self.responses
            .into_iter()
            .map(|r| NewQuestionResponse {
                student_id,
                cycle: r.cycle.into(),
                academic_year: AcademicYear::for_date(r.completion_date.unwrap_or(today), region).to_string(),
                question_id: r.question_id,
                response_value: r.value,
            })
            .collect()
    }
}

pub fn transform_questionnaire(
    record: &KnackRecord,
    catalogue: &QuestionCatalogue,
    index: &EstablishmentIndex,
) -> Result<QuestionnaireRecord, String> {
    let email = record
        .email(fields::QUESTIONNAIRE_EMAIL)
        .ok_or_else(|| format!("questionnaire record {} has no usable email", record.id))?;
    let establishment = index.resolve(record, fields::QUESTIONNAIRE_ESTABLISHMENT)?;

    let mut responses = Vec::new();
    for cycle in Cycle::ALL {
        let completion_date = record.date(fields::QUESTIONNAIRE_COMPLETION_DATES[cycle.index()]);
        for question in catalogue.iter() {
            let field = &question.fields[cycle.index()];
            let Some(raw) = record.number(field) else {
                continue;
            };
            let value = raw.round();
            if value < f64::from(RESPONSE_MIN) || value > f64::from(RESPONSE_MAX) {
                warn!(
                    "Responses: record {} question {} cycle {} out of range ({}); ignored",
                    record.id, question.question_id, cycle, raw
                );
                continue;
            }
            responses.push(ResponseDraft {
                cycle,
                question_id: question.question_id.clone(),
                value: value as i16,
                completion_date,
            });
        }
    }

    Ok(QuestionnaireRecord {
        email,
        establishment,
        responses,
    })
}

/// Bind parameters per `NewQuestionResponse` row.
const RESPONSE_COLUMNS: usize = 5;

/// Written in chunks so a full page stays under the bind parameter limit.
/// Run inside the page's transaction.
pub fn upsert_responses(conn: &mut PgConnection, rows: Vec<NewQuestionResponse>) -> Result<usize, String> {
    use schema::question_responses::dsl as Q;

    let rows = dedupe_last_by_key(rows, |r| {
        (r.student_id, r.cycle, r.academic_year.clone(), r.question_id.clone())
    });
    if rows.is_empty() {
        return Ok(0);
    }
    let mut written = 0;
    for chunk in rows.chunks(rows_per_insert(RESPONSE_COLUMNS)) {
        written += diesel::insert_into(Q::question_responses)
            .values(chunk)
            .on_conflict((Q::student_id, Q::cycle, Q::academic_year, Q::question_id))
            .do_update()
            .set(Q::response_value.eq(excluded(Q::response_value)))
            .execute(conn)
            .map_err(|e| format!("upsert question responses failed: {}", e))?;
    }
    Ok(written)
}

fn load_students_by_email(
    conn: &mut PgConnection,
    emails: &[String],
) -> Result<HashMap<String, (i64, Option<i64>)>, String> {
    use schema::students::dsl as S;
    if emails.is_empty() {
        return Ok(HashMap::new());
    }
    let rows: Vec<(String, i64, Option<i64>)> = S::students
        .filter(S::email.eq_any(emails))
        .select((S::email, S::id, S::establishment_id))
        .load(conn)
        .map_err(|e| format!("load students by email failed: {}", e))?;
    Ok(rows.into_iter().map(|(email, id, est)| (email, (id, est))).collect())
}

pub fn process_batch(
    conn: &mut PgConnection,
    records: &[KnackRecord],
    catalogue: &QuestionCatalogue,
    index: &EstablishmentIndex,
    today: NaiveDate,
) -> Result<BatchOutcome, String> {
    let mut outcome = BatchOutcome::default();
    let mut transformed = Vec::with_capacity(records.len());
    for record in records {
        match transform_questionnaire(record, catalogue, index) {
            Ok(t) => transformed.push(t),
            Err(reason) => {
                warn!("Responses: skipping record {}: {}", record.id, reason);
                outcome.skipped += 1;
            }
        }
    }

    let emails: Vec<String> = transformed.iter().map(|t| t.email.clone()).collect();
    let students = load_students_by_email(conn, &emails)?;

    let mut rows = Vec::new();
    for t in transformed {
        let Some(&(student_id, student_establishment)) = students.get(&t.email) else {
            warn!("Responses: no student with email {}; record skipped", t.email);
            outcome.skipped += 1;
            continue;
        };
        let region = t
            .establishment
            .map(|e| e.region)
            .or_else(|| student_establishment.and_then(|id| index.region_of(id)))
            .unwrap_or(Region::Standard);
        rows.extend(t.into_rows(student_id, region, today));
        outcome.processed += 1;
    }
    upsert_responses(conn, rows)?;
    Ok(outcome)
}
