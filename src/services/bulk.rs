//! Bulk edits behind the dashboard's bulk operations page.
//!
//! Every operation selects students first, then changes them in the same
//! transaction. A dry run stops after the selection and reports the count.
//! Changing the academic year fires the enrollment trigger like any other
//! student update; deleting a student removes their scores, responses and
//! enrollment history with it.

use crate::models::vespa::AcademicYear;
use crate::schema;
use crate::services::sync::in_transaction;
use chrono::Utc;
use diesel::PgConnection;
use diesel::prelude::*;
use log::info;
use serde::Serialize;

/// Which students an operation touches. At least one criterion is required.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Selection {
    pub establishment_id: Option<i64>,
    pub academic_year: Option<String>,
    pub year_group: Option<String>,
    pub emails: Vec<String>,
}

impl Selection {
    pub fn is_empty(&self) -> bool {
        self.establishment_id.is_none()
            && self.academic_year.is_none()
            && self.year_group.is_none()
            && self.emails.is_empty()
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BulkAction {
    SetYearGroup(String),
    SetAcademicYear(AcademicYear),
    Delete,
}

impl BulkAction {
    pub fn name(&self) -> &'static str {
        match self {
            BulkAction::SetYearGroup(_) => "set_year_group",
            BulkAction::SetAcademicYear(_) => "set_academic_year",
            BulkAction::Delete => "delete",
        }
    }

    /// Year groups are trimmed; an empty one is refused.
    pub fn set_year_group(raw: &str) -> Result<BulkAction, String> {
        let trimmed = raw.trim();
        if trimmed.is_empty() {
            return Err("year group cannot be empty".to_string());
        }
        Ok(BulkAction::SetYearGroup(trimmed.to_string()))
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct BulkReport {
    pub action: &'static str,
    pub dry_run: bool,
    pub matched: usize,
    pub changed: usize,
}

fn selected_ids(conn: &mut PgConnection, selection: &Selection) -> Result<Vec<i64>, String> {
    use schema::students::dsl as S;

    let mut query = S::students.select(S::id).into_boxed();
    if let Some(id) = selection.establishment_id {
        query = query.filter(S::establishment_id.eq(id));
    }
    if let Some(year) = &selection.academic_year {
        query = query.filter(S::academic_year.eq(year.clone()));
    }
    if let Some(group) = &selection.year_group {
        query = query.filter(S::year_group.eq(group.clone()));
    }
    if !selection.emails.is_empty() {
        query = query.filter(S::email.eq_any(selection.emails.clone()));
    }
    query
        .order(S::id)
        .load(conn)
        .map_err(|e| format!("select students for bulk operation failed: {}", e))
}

pub fn apply(
    conn: &mut PgConnection,
    selection: &Selection,
    action: &BulkAction,
    dry_run: bool,
) -> Result<BulkReport, String> {
    use schema::students::dsl as S;

    if selection.is_empty() {
        return Err("bulk operations need a selection (establishment, academic year, year group or email)".to_string());
    }
    let report = in_transaction(conn, |c| {
        let ids = selected_ids(c, selection)?;
        let mut report = BulkReport {
            action: action.name(),
            dry_run,
            matched: ids.len(),
            changed: 0,
        };
        if dry_run || ids.is_empty() {
            return Ok(report);
        }
        let target = S::students.filter(S::id.eq_any(&ids));
        report.changed = match action {
            BulkAction::SetYearGroup(group) => diesel::update(target)
                .set((S::year_group.eq(group), S::updated_at.eq(Utc::now())))
                .execute(c),
            BulkAction::SetAcademicYear(year) => diesel::update(target)
                .set((S::academic_year.eq(year.to_string()), S::updated_at.eq(Utc::now())))
                .execute(c),
            BulkAction::Delete => diesel::delete(target).execute(c),
        }
        .map_err(|e| format!("bulk {} failed: {}", action.name(), e))?;
        Ok(report)
    })?;
    info!(
        "Bulk {}: {} matched, {} changed{}",
        report.action,
        report.matched,
        report.changed,
        if report.dry_run { " (dry run)" } else { "" }
    );
    Ok(report)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::testing;

    #[test]
    fn empty_selection_is_detected() {
        assert!(Selection::default().is_empty());
        let by_year = Selection {
            academic_year: Some("2025/2026".to_string()),
            ..Selection::default()
        };
        assert!(!by_year.is_empty());
    }

    #[test]
    fn year_group_is_trimmed_and_required() {
        assert_eq!(
            BulkAction::set_year_group("  Year 13 ").unwrap(),
            BulkAction::SetYearGroup("Year 13".to_string())
        );
        assert!(BulkAction::set_year_group("   ").is_err());
    }

    fn seed(conn: &mut PgConnection) -> i64 {
        let index = testing::fixture_establishments(conn);
        let json = std::fs::read_to_string("tests/data/vespa-records.json").unwrap();
        let page: crate::models::knack::RecordPage = serde_json::from_str(&json).unwrap();
        let today = chrono::NaiveDate::from_ymd_opt(2026, 3, 10).unwrap();
        crate::services::students::process_batch(conn, &page.records, &index, today).unwrap();
        index.get("estUK").map(|e| e.id).unwrap()
    }

    #[test]
    #[ignore = "needs Postgres"]
    fn dry_run_counts_without_changing() {
        testing::with_connection(|conn| {
            let uk = seed(conn);
            let selection = Selection {
                establishment_id: Some(uk),
                ..Selection::default()
            };
            let students_before = testing::count(conn, "students");

            let report = apply(conn, &selection, &BulkAction::Delete, true).unwrap();
            assert_eq!((report.matched, report.changed, report.dry_run), (2, 0, true));
            assert_eq!(testing::count(conn, "students"), students_before);
        });
    }

    #[test]
    #[ignore = "needs Postgres"]
    fn promotes_a_year_group_and_deletes_with_scores() {
        testing::with_connection(|conn| {
            use schema::students::dsl as S;
            let uk = seed(conn);
            let year_12 = Selection {
                establishment_id: Some(uk),
                year_group: Some("Year 12".to_string()),
                ..Selection::default()
            };
            let report = apply(conn, &year_12, &BulkAction::set_year_group("Year 13").unwrap(), false).unwrap();
            assert_eq!((report.matched, report.changed), (1, 1));
            let group: Option<String> = S::students
                .filter(S::email.eq("amy.uk@example.ac.uk"))
                .select(S::year_group)
                .first(conn)
                .unwrap();
            assert_eq!(group.as_deref(), Some("Year 13"));

            let scores_before = testing::count(conn, "vespa_scores");
            let amy = Selection {
                emails: vec!["amy.uk@example.ac.uk".to_string()],
                ..Selection::default()
            };
            let report = apply(conn, &amy, &BulkAction::Delete, false).unwrap();
            assert_eq!(report.changed, 1);
            assert_eq!(testing::count(conn, "vespa_scores"), scores_before - 2);
        });
    }

    #[test]
    #[ignore = "needs Postgres"]
    fn refuses_to_touch_every_student() {
        testing::with_connection(|conn| {
            let err = apply(conn, &Selection::default(), &BulkAction::Delete, false).unwrap_err();
            assert!(err.contains("need a selection"), "{}", err);
        });
    }
}
