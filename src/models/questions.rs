//! Questionnaire catalogue: which Knack field holds each question per cycle.

use serde::Deserialize;
use std::path::Path;

const BUILTIN_MAPPING: &str = include_str!("../../data/question_mapping.json");

#[derive(Debug, Clone, Deserialize)]
pub struct QuestionMapping {
    pub question_id: String,
    pub category: String,
    #[serde(default)]
    pub text: Option<String>,
    /// Field id for cycles 1, 2 and 3.
    pub fields: [String; 3],
}

#[derive(Debug, Clone)]
pub struct QuestionCatalogue {
    questions: Vec<QuestionMapping>,
}

impl QuestionCatalogue {
    pub fn builtin() -> Result<Self, String> {
        Self::from_json(BUILTIN_MAPPING).map_err(|e| format!("built-in question mapping is invalid: {}", e))
    }

    pub fn from_file(path: &Path) -> Result<Self, String> {
        let json = std::fs::read_to_string(path)
            .map_err(|e| format!("failed to read question mapping {}: {}", path.display(), e))?;
        Self::from_json(&json).map_err(|e| format!("{}: {}", path.display(), e))
    }

    fn from_json(json: &str) -> Result<Self, String> {
        let de = &mut serde_json::Deserializer::from_str(json);
        let questions: Vec<QuestionMapping> = serde_path_to_error::deserialize(de)
            .map_err(|e| format!("at {}: {}", e.path(), e.inner()))?;
        let mut seen = std::collections::BTreeSet::new();
        for q in &questions {
            if !seen.insert(q.question_id.as_str()) {
                return Err(format!("duplicate question id '{}'", q.question_id));
            }
        }
        Ok(QuestionCatalogue { questions })
    }

    pub fn iter(&self) -> impl Iterator<Item = &QuestionMapping> {
        self.questions.iter()
    }

    pub fn len(&self) -> usize {
        self.questions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.questions.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn builtin_catalogue_loads() {
        let catalogue = QuestionCatalogue::builtin().unwrap();
        assert!(!catalogue.is_empty());
        assert!(catalogue.iter().any(|q| q.question_id == "q1"));
    }

    #[test]
    fn rejects_duplicate_ids() {
        let json = r#"[
            {"question_id": "q1", "category": "vision", "fields": ["a", "b", "c"]},
            {"question_id": "q1", "category": "effort", "fields": ["d", "e", "f"]}
        ]"#;
        let err = QuestionCatalogue::from_json(json).unwrap_err();
        assert!(err.contains("duplicate"), "{}", err);
    }

    #[test]
    fn reports_path_of_bad_entry() {
        let json = r#"[{"question_id": "q1", "category": "vision", "fields": ["a", "b"]}]"#;
        let err = QuestionCatalogue::from_json(json).unwrap_err();
        assert!(err.contains("[0].fields"), "{}", err);
    }
}
