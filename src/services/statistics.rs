//! School and national score statistics per academic year, cycle and element.
//!
//! Recomputed wholesale for each academic year a run touched: the year's rows
//! are deleted and rebuilt in one transaction so readers never see a mix.

use crate::db::models::{NewNationalStatistic, NewSchoolStatistic};
use crate::models::vespa::{Cycle, SCORE_MAX, SCORE_MIN, VespaElement};
use crate::schema;
use crate::utils::rows_per_insert;
use diesel::PgConnection;
use diesel::prelude::*;
use log::{info, warn};
use serde::Serialize;
use std::collections::BTreeMap;

const SCHOOL_COLUMNS: usize = 8;
const NATIONAL_COLUMNS: usize = 7;

const BUCKETS: usize = (SCORE_MAX - SCORE_MIN + 1) as usize;

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ElementStats {
    pub mean: f64,
    /// Population standard deviation.
    pub std_dev: f64,
    pub count: u64,
    /// Count of each score from `SCORE_MIN` to `SCORE_MAX`.
    pub distribution: [u64; BUCKETS],
}

/// `None` for an empty sample. Values outside the score range are ignored.
pub fn summarize(values: &[i16]) -> Option<ElementStats> {
    let mut distribution = [0u64; BUCKETS];
    let mut sum = 0f64;
    let mut count = 0u64;
    for &v in values {
        if !(SCORE_MIN..=SCORE_MAX).contains(&v) {
            continue;
        }
        distribution[(v - SCORE_MIN) as usize] += 1;
        sum += f64::from(v);
        count += 1;
    }
    if count == 0 {
        return None;
    }
    let mean = sum / count as f64;
    let variance = values
        .iter()
        .filter(|v| (SCORE_MIN..=SCORE_MAX).contains(*v))
        .map(|&v| (f64::from(v) - mean).powi(2))
        .sum::<f64>()
        / count as f64;
    Some(ElementStats {
        mean,
        std_dev: variance.sqrt(),
        count,
        distribution,
    })
}

/// One score row as read for aggregation.
#[derive(Debug, Clone)]
pub struct ScoreSample {
    pub establishment_id: Option<i64>,
    pub cycle: i16,
    pub values: [Option<i16>; 6],
}

type Groups<K> = BTreeMap<K, Vec<i16>>;

/// Group samples by school and nationally; students without a school only
/// count towards the national figures.
pub fn aggregate(
    academic_year: &str,
    samples: &[ScoreSample],
) -> (Vec<NewSchoolStatistic>, Vec<NewNationalStatistic>) {
    let mut school: Groups<(i64, i16, VespaElement)> = BTreeMap::new();
    let mut national: Groups<(i16, VespaElement)> = BTreeMap::new();

    for sample in samples {
        if Cycle::try_from(sample.cycle).is_err() {
            warn!("Statistics: ignoring score row with cycle {}", sample.cycle);
            continue;
        }
        for (element, value) in VespaElement::ALL.iter().zip(sample.values) {
            let Some(value) = value else { continue };
            national.entry((sample.cycle, *element)).or_default().push(value);
            if let Some(est) = sample.establishment_id {
                school.entry((est, sample.cycle, *element)).or_default().push(value);
            }
        }
    }

    let school_rows = school
        .into_iter()
        .filter_map(|((establishment_id, cycle, element), values)| {
            let stats = summarize(&values)?;
            Some(NewSchoolStatistic {
                establishment_id,
                academic_year: academic_year.to_string(),
                cycle,
                element: element.as_str().to_string(),
                mean: stats.mean,
                std_dev: stats.std_dev,
                count: stats.count as i64,
                distribution: serde_json::json!(stats.distribution),
            })
        })
        .collect();
    let national_rows = national
        .into_iter()
        .filter_map(|((cycle, element), values)| {
            let stats = summarize(&values)?;
            Some(NewNationalStatistic {
                academic_year: academic_year.to_string(),
                cycle,
                element: element.as_str().to_string(),
                mean: stats.mean,
                std_dev: stats.std_dev,
                count: stats.count as i64,
                distribution: serde_json::json!(stats.distribution),
            })
        })
        .collect();
    (school_rows, national_rows)
}

fn load_samples(conn: &mut PgConnection, academic_year: &str) -> Result<Vec<ScoreSample>, String> {
    use schema::students::dsl as S;
    use schema::vespa_scores::dsl as V;

    let rows: Vec<(Option<i64>, i16, Option<i16>, Option<i16>, Option<i16>, Option<i16>, Option<i16>, Option<i16>)> =
        V::vespa_scores
            .inner_join(S::students)
            .filter(V::academic_year.eq(academic_year))
            .select((
                S::establishment_id,
                V::cycle,
                V::vision,
                V::effort,
                V::systems,
                V::practice,
                V::attitude,
                V::overall,
            ))
            .load(conn)
            .map_err(|e| format!("load scores for {} failed: {}", academic_year, e))?;
    Ok(rows
        .into_iter()
        .map(|(establishment_id, cycle, v, e, s, p, a, o)| ScoreSample {
            establishment_id,
            cycle,
            values: [v, e, s, p, a, o],
        })
        .collect())
}

/// Every academic year that has score rows.
pub fn scored_years(conn: &mut PgConnection) -> Result<Vec<String>, String> {
    use schema::vespa_scores::dsl as V;
    V::vespa_scores
        .select(V::academic_year)
        .distinct()
        .order(V::academic_year)
        .load(conn)
        .map_err(|e| format!("load academic years failed: {}", e))
}

/// Rebuild one academic year's statistics. Run inside a transaction.
pub fn recompute_year(conn: &mut PgConnection, academic_year: &str) -> Result<(usize, usize), String> {
    use schema::national_statistics::dsl as N;
    use schema::school_statistics::dsl as SS;

    let samples = load_samples(conn, academic_year)?;
    let (school_rows, national_rows) = aggregate(academic_year, &samples);

    diesel::delete(SS::school_statistics.filter(SS::academic_year.eq(academic_year)))
        .execute(conn)
        .map_err(|e| format!("clear school statistics for {} failed: {}", academic_year, e))?;
    diesel::delete(N::national_statistics.filter(N::academic_year.eq(academic_year)))
        .execute(conn)
        .map_err(|e| format!("clear national statistics for {} failed: {}", academic_year, e))?;

    for chunk in school_rows.chunks(rows_per_insert(SCHOOL_COLUMNS)) {
        diesel::insert_into(SS::school_statistics)
            .values(chunk)
            .execute(conn)
            .map_err(|e| format!("insert school statistics failed: {}", e))?;
    }
    for chunk in national_rows.chunks(rows_per_insert(NATIONAL_COLUMNS)) {
        diesel::insert_into(N::national_statistics)
            .values(chunk)
            .execute(conn)
            .map_err(|e| format!("insert national statistics failed: {}", e))?;
    }
    info!(
        "Statistics: {} from {} score rows ({} school, {} national)",
        academic_year,
        samples.len(),
        school_rows.len(),
        national_rows.len()
    );
    Ok((school_rows.len(), national_rows.len()))
}
