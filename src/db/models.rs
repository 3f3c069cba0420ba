//! Diesel model structs for the VESPA relational store.
//!
//! `New*` structs are what the sync writes; the plain structs are what the
//! dashboard queries read back.

use chrono::{DateTime, NaiveDate, Utc};
use diesel::prelude::*;
use serde::{Deserialize, Serialize};

use crate::schema;

pub mod sync_status {
    pub const STARTED: &str = "started";
    pub const COMPLETED: &str = "completed";
    pub const FAILED: &str = "failed";
}

pub mod sync_type {
    pub const FULL: &str = "full";
    pub const PARTIAL: &str = "partial";
}

#[derive(Debug, Clone, Queryable, Identifiable, Selectable, Serialize, Deserialize)]
#[diesel(table_name = schema::establishments)]
pub struct Establishment {
    pub id: i64,
    pub knack_id: String,
    pub name: String,
    pub is_australian: bool,
    pub trust_name: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Insertable, Serialize, Deserialize)]
#[diesel(table_name = schema::establishments)]
pub struct NewEstablishment {
    pub knack_id: String,
    pub name: String,
    pub is_australian: bool,
    pub trust_name: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Insertable, Serialize, Deserialize)]
#[diesel(table_name = schema::staff_admins)]
pub struct NewStaffAdmin {
    pub email: String,
    pub knack_id: Option<String>,
    pub name: Option<String>,
    pub establishment_id: Option<i64>,
}

#[derive(Debug, Clone, Queryable, Identifiable, Associations, Selectable, Serialize, Deserialize)]
#[diesel(table_name = schema::students)]
#[diesel(belongs_to(Establishment))]
pub struct Student {
    pub id: i64,
    pub email: String,
    pub knack_id: Option<String>,
    pub name: Option<String>,
    pub establishment_id: Option<i64>,
    pub academic_year: Option<String>,
    pub year_group: Option<String>,
    pub course: Option<String>,
    pub faculty: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Insertable, Serialize, Deserialize)]
#[diesel(table_name = schema::students)]
pub struct NewStudent {
    pub email: String,
    pub knack_id: Option<String>,
    pub name: Option<String>,
    pub establishment_id: Option<i64>,
    pub academic_year: Option<String>,
    pub year_group: Option<String>,
    pub course: Option<String>,
    pub faculty: Option<String>,
}

#[derive(Debug, Clone, Queryable, Identifiable, Associations, Selectable, Serialize, Deserialize)]
#[diesel(table_name = schema::vespa_scores)]
#[diesel(belongs_to(Student))]
pub struct VespaScore {
    pub id: i64,
    pub student_id: i64,
    pub cycle: i16,
    pub academic_year: String,
    pub vision: Option<i16>,
    pub effort: Option<i16>,
    pub systems: Option<i16>,
    pub practice: Option<i16>,
    pub attitude: Option<i16>,
    pub overall: Option<i16>,
    pub completion_date: Option<NaiveDate>,
    pub year_group: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Insertable, Serialize, Deserialize)]
#[diesel(table_name = schema::vespa_scores)]
pub struct NewVespaScore {
    pub student_id: i64,
    pub cycle: i16,
    pub academic_year: String,
    pub vision: Option<i16>,
    pub effort: Option<i16>,
    pub systems: Option<i16>,
    pub practice: Option<i16>,
    pub attitude: Option<i16>,
    pub overall: Option<i16>,
    pub completion_date: Option<NaiveDate>,
    pub year_group: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Insertable, Serialize, Deserialize)]
#[diesel(table_name = schema::question_responses)]
pub struct NewQuestionResponse {
    pub student_id: i64,
    pub cycle: i16,
    pub academic_year: String,
    pub question_id: String,
    pub response_value: i16,
}

#[derive(Debug, Clone, Queryable, Identifiable, Selectable, Serialize, Deserialize)]
#[diesel(table_name = schema::sync_logs)]
pub struct SyncLog {
    pub id: i64,
    pub sync_type: String,
    pub status: String,
    pub started_at: DateTime<Utc>,
    pub completed_at: Option<DateTime<Utc>>,
    pub records_processed: i64,
    pub error_message: Option<String>,
    pub metadata: Option<serde_json::Value>,
}

#[derive(Debug, Clone, Insertable, Serialize, Deserialize)]
#[diesel(table_name = schema::sync_logs)]
pub struct NewSyncLog {
    pub sync_type: String,
    pub status: String,
    pub started_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Queryable, Selectable, Serialize, Deserialize)]
#[diesel(table_name = schema::school_statistics)]
pub struct SchoolStatistic {
    pub establishment_id: i64,
    pub academic_year: String,
    pub cycle: i16,
    pub element: String,
    pub mean: f64,
    pub std_dev: f64,
    pub count: i64,
    pub distribution: serde_json::Value,
    pub calculated_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Insertable, Serialize, Deserialize)]
#[diesel(table_name = schema::school_statistics)]
pub struct NewSchoolStatistic {
    pub establishment_id: i64,
    pub academic_year: String,
    pub cycle: i16,
    pub element: String,
    pub mean: f64,
    pub std_dev: f64,
    pub count: i64,
    pub distribution: serde_json::Value,
}

#[derive(Debug, Clone, Queryable, Selectable, Serialize, Deserialize)]
#[diesel(table_name = schema::national_statistics)]
pub struct NationalStatistic {
    pub academic_year: String,
    pub cycle: i16,
    pub element: String,
    pub mean: f64,
    pub std_dev: f64,
    pub count: i64,
    pub distribution: serde_json::Value,
    pub calculated_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Insertable, Serialize, Deserialize)]
#[diesel(table_name = schema::national_statistics)]
pub struct NewNationalStatistic {
    pub academic_year: String,
    pub cycle: i16,
    pub element: String,
    pub mean: f64,
    pub std_dev: f64,
    pub count: i64,
    pub distribution: serde_json::Value,
}
