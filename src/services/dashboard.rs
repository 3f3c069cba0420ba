//! Read-side queries behind the dashboard commands. Everything here returns
//! serializable rows; the CLI prints them as JSON.

use crate::db::models::{Establishment, NationalStatistic, SchoolStatistic, Student, SyncLog, VespaScore, sync_status};
use crate::models::vespa::Region;
use crate::schema;
use crate::services::checkpoint::{self, Stage, StageProgress};
use crate::services::sync_log;
use crate::utils::serde_enum_name;
use chrono::{DateTime, Duration, NaiveDate, Utc};
use diesel::PgConnection;
use diesel::prelude::*;
use diesel::sql_types::{BigInt, Bool, Date, Nullable, Text};
use serde::Serialize;
use std::collections::BTreeMap;
use std::path::Path;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, clap::ValueEnum)]
pub enum StudentSort {
    #[default]
    Name,
    Email,
    YearGroup,
    UpdatedAt,
}

#[derive(Debug, Clone, Default)]
pub struct StudentFilter {
    pub establishment_id: Option<i64>,
    pub academic_year: Option<String>,
    pub year_group: Option<String>,
    /// Case-insensitive substring of name or email.
    pub search: Option<String>,
    pub sort: StudentSort,
    pub descending: bool,
    pub limit: i64,
    pub offset: i64,
}

#[derive(Debug, Serialize)]
pub struct StudentRow {
    #[serde(flatten)]
    pub student: Student,
    pub establishment_name: Option<String>,
}

#[derive(Debug, Serialize)]
pub struct StudentPage {
    pub total: i64,
    pub limit: i64,
    pub offset: i64,
    pub students: Vec<StudentRow>,
}

/// `%` and `_` in user input match literally.
fn like_pattern(search: &str) -> String {
    let escaped = search
        .trim()
        .replace('\\', "\\\\")
        .replace('%', "\\%")
        .replace('_', "\\_");
    format!("%{}%", escaped)
}

macro_rules! filter_students {
    ($query:expr, $filter:expr) => {{
        use schema::students::dsl as S;
        let mut query = $query;
        if let Some(id) = $filter.establishment_id {
            query = query.filter(S::establishment_id.eq(id));
        }
        if let Some(year) = &$filter.academic_year {
            query = query.filter(S::academic_year.eq(year.clone()));
        }
        if let Some(group) = &$filter.year_group {
            query = query.filter(S::year_group.eq(group.clone()));
        }
        if let Some(search) = $filter.search.as_deref().filter(|s| !s.trim().is_empty()) {
            let pattern = like_pattern(search);
            query = query.filter(
                S::email
                    .ilike(pattern.clone())
                    .or(S::name.assume_not_null().ilike(pattern)),
            );
        }
        query
    }};
}

pub fn students(conn: &mut PgConnection, filter: &StudentFilter) -> Result<StudentPage, String> {
    use schema::establishments::dsl as E;
    use schema::students::dsl as S;

    let total: i64 = filter_students!(S::students.into_boxed(), filter)
        .count()
        .get_result(conn)
        .map_err(|e| format!("count students failed: {}", e))?;

    let mut query = filter_students!(
        S::students
            .left_join(E::establishments)
            .select((Student::as_select(), E::name.nullable()))
            .into_boxed(),
        filter
    );
    query = match (filter.sort, filter.descending) {
        (StudentSort::Name, false) => query.order(S::name.asc().nulls_last()),
        (StudentSort::Name, true) => query.order(S::name.desc().nulls_last()),
        (StudentSort::Email, false) => query.order(S::email.asc()),
        (StudentSort::Email, true) => query.order(S::email.desc()),
        (StudentSort::YearGroup, false) => query.order(S::year_group.asc().nulls_last()),
        (StudentSort::YearGroup, true) => query.order(S::year_group.desc().nulls_last()),
        (StudentSort::UpdatedAt, false) => query.order(S::updated_at.asc()),
        (StudentSort::UpdatedAt, true) => query.order(S::updated_at.desc()),
    };
    let rows: Vec<(Student, Option<String>)> = query
        .then_order_by(S::id.asc())
        .limit(filter.limit)
        .offset(filter.offset)
        .load(conn)
        .map_err(|e| format!("load students failed: {}", e))?;

    Ok(StudentPage {
        total,
        limit: filter.limit,
        offset: filter.offset,
        students: rows
            .into_iter()
            .map(|(student, establishment_name)| StudentRow {
                student,
                establishment_name,
            })
            .collect(),
    })
}

#[derive(Debug, Serialize)]
pub struct StudentDetail {
    pub student: Student,
    pub establishment: Option<Establishment>,
    /// Oldest first.
    pub scores: Vec<VespaScore>,
}

pub fn student_detail(conn: &mut PgConnection, email: &str) -> Result<Option<StudentDetail>, String> {
    use schema::establishments::dsl as E;
    use schema::students::dsl as S;
    use schema::vespa_scores::dsl as V;

    let Some(student) = S::students
        .filter(S::email.eq(email))
        .select(Student::as_select())
        .first(conn)
        .optional()
        .map_err(|e| format!("load student {} failed: {}", email, e))?
    else {
        return Ok(None);
    };
    let establishment = match student.establishment_id {
        Some(id) => E::establishments
            .find(id)
            .select(Establishment::as_select())
            .first(conn)
            .optional()
            .map_err(|e| format!("load establishment {} failed: {}", id, e))?,
        None => None,
    };
    let scores = VespaScore::belonging_to(&student)
        .select(VespaScore::as_select())
        .order((V::academic_year, V::cycle))
        .load(conn)
        .map_err(|e| format!("load scores for {} failed: {}", email, e))?;
    Ok(Some(StudentDetail {
        student,
        establishment,
        scores,
    }))
}

#[derive(Debug, QueryableByName)]
struct SchoolAggregate {
    #[diesel(sql_type = BigInt)]
    id: i64,
    #[diesel(sql_type = Text)]
    knack_id: String,
    #[diesel(sql_type = Text)]
    name: String,
    #[diesel(sql_type = Bool)]
    is_australian: bool,
    #[diesel(sql_type = Nullable<Text>)]
    trust_name: Option<String>,
    #[diesel(sql_type = BigInt)]
    student_count: i64,
    #[diesel(sql_type = BigInt)]
    score_count: i64,
    #[diesel(sql_type = Nullable<Date>)]
    last_completion: Option<NaiveDate>,
}

#[derive(Debug, Serialize)]
pub struct SchoolSummary {
    pub id: i64,
    pub knack_id: String,
    pub name: String,
    pub region: Option<String>,
    pub trust_name: Option<String>,
    pub student_count: i64,
    pub score_count: i64,
    pub last_completion: Option<NaiveDate>,
}

pub fn schools(conn: &mut PgConnection) -> Result<Vec<SchoolSummary>, String> {
    let rows: Vec<SchoolAggregate> = diesel::sql_query(
        "SELECT e.id, e.knack_id, e.name, e.is_australian, e.trust_name, \
                COUNT(DISTINCT s.id) AS student_count, \
                COUNT(v.id) AS score_count, \
                MAX(v.completion_date) AS last_completion \
         FROM establishments e \
         LEFT JOIN students s ON s.establishment_id = e.id \
         LEFT JOIN vespa_scores v ON v.student_id = s.id \
         GROUP BY e.id \
         ORDER BY e.name",
    )
    .load(conn)
    .map_err(|e| format!("load schools failed: {}", e))?;

    Ok(rows
        .into_iter()
        .map(|r| SchoolSummary {
            id: r.id,
            knack_id: r.knack_id,
            name: r.name,
            region: serde_enum_name(&Region::from_australian_flag(r.is_australian)),
            trust_name: r.trust_name,
            student_count: r.student_count,
            score_count: r.score_count,
            last_completion: r.last_completion,
        })
        .collect())
}

#[derive(Debug, Serialize)]
pub struct PendingCheckpoint {
    pub run_id: i64,
    pub started_at: DateTime<Utc>,
    pub completed_stages: Vec<Stage>,
    pub current: Option<StageProgress>,
}

#[derive(Debug, Serialize)]
pub struct SyncStatusReport {
    pub last_success: Option<SyncLog>,
    pub last_failure: Option<SyncLog>,
    pub runs_last_24h: i64,
    /// Present when an unfinished run will be resumed by the next sync.
    pub pending_checkpoint: Option<PendingCheckpoint>,
    pub recent: Vec<SyncLog>,
}

pub fn sync_status(conn: &mut PgConnection, checkpoint_file: &Path, limit: i64) -> Result<SyncStatusReport, String> {
    let pending_checkpoint = checkpoint::load(checkpoint_file)?.map(|cp| PendingCheckpoint {
        run_id: cp.run_id,
        started_at: cp.started_at,
        completed_stages: cp.completed_stages,
        current: cp.current,
    });
    Ok(SyncStatusReport {
        last_success: sync_log::last_with_status(conn, sync_status::COMPLETED)?,
        last_failure: sync_log::last_with_status(conn, sync_status::FAILED)?,
        runs_last_24h: sync_log::count_since(conn, Utc::now() - Duration::hours(24))?,
        pending_checkpoint,
        recent: sync_log::recent(conn, limit)?,
    })
}

#[derive(Debug, Serialize, QueryableByName)]
pub struct QualityReport {
    /// Groups sharing (student, cycle, academic year); zero while the unique index holds.
    #[diesel(sql_type = BigInt)]
    pub duplicate_score_groups: i64,
    #[diesel(sql_type = BigInt)]
    pub duplicate_response_groups: i64,
    #[diesel(sql_type = BigInt)]
    pub students_without_establishment: i64,
    #[diesel(sql_type = BigInt)]
    pub students_without_scores: i64,
    #[diesel(sql_type = BigInt)]
    pub scores_out_of_range: i64,
}

pub fn quality(conn: &mut PgConnection) -> Result<QualityReport, String> {
    diesel::sql_query(
        "SELECT \
           (SELECT COUNT(*) FROM (SELECT 1 FROM vespa_scores \
               GROUP BY student_id, cycle, academic_year HAVING COUNT(*) > 1) d) AS duplicate_score_groups, \
           (SELECT COUNT(*) FROM (SELECT 1 FROM question_responses \
               GROUP BY student_id, cycle, academic_year, question_id HAVING COUNT(*) > 1) d) AS duplicate_response_groups, \
           (SELECT COUNT(*) FROM students WHERE establishment_id IS NULL) AS students_without_establishment, \
           (SELECT COUNT(*) FROM students s WHERE NOT EXISTS \
               (SELECT 1 FROM vespa_scores v WHERE v.student_id = s.id)) AS students_without_scores, \
           (SELECT COUNT(*) FROM vespa_scores WHERE \
               vision NOT BETWEEN 0 AND 10 OR effort NOT BETWEEN 0 AND 10 OR \
               systems NOT BETWEEN 0 AND 10 OR practice NOT BETWEEN 0 AND 10 OR \
               attitude NOT BETWEEN 0 AND 10 OR overall NOT BETWEEN 0 AND 10) AS scores_out_of_range",
    )
    .get_result(conn)
    .map_err(|e| format!("quality report failed: {}", e))
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ElementComparison {
    pub cycle: i16,
    pub element: String,
    pub school_mean: f64,
    pub school_std_dev: f64,
    pub school_count: i64,
    pub national_mean: Option<f64>,
    pub national_std_dev: Option<f64>,
    pub national_count: Option<i64>,
    /// School mean minus national mean.
    pub difference: Option<f64>,
}

/// Pair each school row with the national row for the same cycle and element.
pub fn compare(school: Vec<SchoolStatistic>, national: &[NationalStatistic]) -> Vec<ElementComparison> {
    let national: BTreeMap<(i16, &str), &NationalStatistic> = national
        .iter()
        .map(|n| ((n.cycle, n.element.as_str()), n))
        .collect();
    school
        .into_iter()
        .map(|s| {
            let n = national.get(&(s.cycle, s.element.as_str())).copied();
            ElementComparison {
                cycle: s.cycle,
                difference: n.map(|n| s.mean - n.mean),
                national_mean: n.map(|n| n.mean),
                national_std_dev: n.map(|n| n.std_dev),
                national_count: n.map(|n| n.count),
                school_mean: s.mean,
                school_std_dev: s.std_dev,
                school_count: s.count,
                element: s.element,
            }
        })
        .collect()
}

pub fn statistics(
    conn: &mut PgConnection,
    establishment_id: i64,
    academic_year: &str,
    cycle: Option<i16>,
) -> Result<Vec<ElementComparison>, String> {
    use schema::national_statistics::dsl as N;
    use schema::school_statistics::dsl as SS;

    let mut school_query = SS::school_statistics
        .filter(SS::establishment_id.eq(establishment_id))
        .filter(SS::academic_year.eq(academic_year))
        .select(SchoolStatistic::as_select())
        .order((SS::cycle, SS::element))
        .into_boxed();
    let mut national_query = N::national_statistics
        .filter(N::academic_year.eq(academic_year))
        .select(NationalStatistic::as_select())
        .into_boxed();
    if let Some(c) = cycle {
        school_query = school_query.filter(SS::cycle.eq(c));
        national_query = national_query.filter(N::cycle.eq(c));
    }

    let school = school_query
        .load(conn)
        .map_err(|e| format!("load school statistics failed: {}", e))?;
    let national = national_query
        .load(conn)
        .map_err(|e| format!("load national statistics failed: {}", e))?;
    Ok(compare(school, &national))
}

#[derive(Debug, Serialize, QueryableByName)]
pub struct ConnectedStudent {
    #[diesel(sql_type = BigInt)]
    pub student_id: i64,
    #[diesel(sql_type = Text)]
    pub email: String,
    #[diesel(sql_type = Nullable<Text>)]
    pub name: Option<String>,
    #[diesel(sql_type = Nullable<Text>)]
    pub year_group: Option<String>,
    #[diesel(sql_type = Nullable<Text>)]
    pub academic_year: Option<String>,
    #[diesel(sql_type = Nullable<BigInt>)]
    pub establishment_id: Option<i64>,
}

pub fn connected_students(conn: &mut PgConnection, staff_email: &str) -> Result<Vec<ConnectedStudent>, String> {
    diesel::sql_query("SELECT * FROM get_connected_students($1)")
        .bind::<Text, _>(staff_email)
        .load(conn)
        .map_err(|e| format!("load students connected to {} failed: {}", staff_email, e))
}
