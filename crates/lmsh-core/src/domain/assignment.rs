//! Desired assignment state.

use chrono::NaiveDate;
use lmsh_state::EntityKey;
use serde::{Deserialize, Serialize};

use super::error::ValidationError;
use super::validation::{
    slugify, validate_assignment_key, validate_course_code, validate_org, validate_template,
};

/// An assignment as declared by the operator.
///
/// Identity is (classroom, `key`). `points` falls back to the configured
/// default when absent; the engine resolves it before hashing.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AssignmentSpec {
    pub org: String,
    pub course_code: String,
    pub key: String,
    pub title: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub due_date: Option<NaiveDate>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub points: Option<u32>,
    /// Starter repository, `owner/repo`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub template: Option<String>,
}

impl AssignmentSpec {
    /// New assignment whose key is derived from the title.
    pub fn new(
        org: impl Into<String>,
        course_code: impl Into<String>,
        title: impl Into<String>,
    ) -> Self {
        let title = title.into();
        Self {
            org: org.into(),
            course_code: course_code.into(),
            key: slugify(&title),
            title,
            description: None,
            due_date: None,
            points: None,
            template: None,
        }
    }

    /// Override the derived key. Keys are case-insensitive and stored lowercase.
    pub fn with_key(mut self, key: impl AsRef<str>) -> Self {
        self.key = key.as_ref().trim().to_ascii_lowercase();
        self
    }

    pub fn with_description(mut self, description: Option<String>) -> Self {
        self.description = description.filter(|d| !d.trim().is_empty());
        self
    }

    pub fn with_due_date(mut self, due_date: Option<NaiveDate>) -> Self {
        self.due_date = due_date;
        self
    }

    pub fn with_points(mut self, points: Option<u32>) -> Self {
        self.points = points;
        self
    }

    pub fn with_template(mut self, template: Option<String>) -> Self {
        self.template = template;
        self
    }

    pub fn key(&self) -> EntityKey {
        EntityKey::assignment(&self.org, &self.course_code, &self.key)
    }

    pub fn classroom_key(&self) -> EntityKey {
        EntityKey::classroom(&self.org, &self.course_code)
    }

    /// Copy with `points` filled in from `default_points` when unset.
    pub fn resolved(&self, default_points: u32) -> Self {
        Self {
            points: Some(self.points.unwrap_or(default_points)),
            ..self.clone()
        }
    }

    pub fn validate(&self) -> Result<(), ValidationError> {
        validate_org(&self.org)?;
        validate_course_code(&self.course_code)?;
        if self.title.trim().is_empty() {
            return Err(ValidationError::Empty { field: "title" });
        }
        validate_assignment_key(&self.key)?;
        if let Some(0) = self.points {
            return Err(ValidationError::Points(0));
        }
        if let Some(template) = &self.template {
            validate_template(template)?;
        }
        Ok(())
    }
}

/// Field-level changes to apply to an existing remote assignment.
///
/// The starter template is only used at creation time and never changes
/// remotely.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct AssignmentChanges {
    pub title: Option<String>,
    pub description: Option<Option<String>>,
    pub due_date: Option<Option<NaiveDate>>,
    pub points: Option<u32>,
}

impl AssignmentChanges {
    pub fn between(current: &AssignmentSpec, desired: &AssignmentSpec) -> Self {
        Self {
            title: (current.title != desired.title).then(|| desired.title.clone()),
            description: (current.description != desired.description)
                .then(|| desired.description.clone()),
            due_date: (current.due_date != desired.due_date).then_some(desired.due_date),
            points: desired.points.filter(|p| current.points != Some(*p)),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.title.is_none()
            && self.description.is_none()
            && self.due_date.is_none()
            && self.points.is_none()
    }

    pub fn fields(&self) -> Vec<&'static str> {
        let mut fields = Vec::new();
        if self.title.is_some() {
            fields.push("title");
        }
        if self.description.is_some() {
            fields.push("description");
        }
        if self.due_date.is_some() {
            fields.push("due_date");
        }
        if self.points.is_some() {
            fields.push("points");
        }
        fields
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn midterm() -> AssignmentSpec {
        AssignmentSpec::new("lmsh-test", "CS101", "Midterm")
            .with_due_date(NaiveDate::from_ymd_opt(2024, 10, 15))
            .with_points(Some(100))
    }

    #[test]
    fn test_key_derived_from_title() {
        assert_eq!(midterm().key, "midterm");
        assert_eq!(
            midterm().key().storage_id(),
            "assignment/lmsh-test/CS101/midterm"
        );
        assert_eq!(midterm().with_key("MIDTERM-2024").key, "midterm-2024");
    }

    #[test]
    fn test_validation() {
        assert!(midterm().validate().is_ok());
        assert_eq!(
            midterm().with_points(Some(0)).validate(),
            Err(ValidationError::Points(0))
        );
        let mut untitled = midterm();
        untitled.title = String::new();
        assert_eq!(
            untitled.validate(),
            Err(ValidationError::Empty { field: "title" })
        );
        assert!(matches!(
            midterm().with_template(Some("nope".to_string())).validate(),
            Err(ValidationError::Template { .. })
        ));
    }

    #[test]
    fn test_resolved_keeps_explicit_points() {
        let unset = midterm().with_points(None);
        assert_eq!(unset.resolved(50).points, Some(50));
        assert_eq!(midterm().resolved(50).points, Some(100));
    }

    #[test]
    fn test_changes_between() {
        let current = midterm();
        let desired = midterm()
            .with_points(Some(120))
            .with_due_date(None)
            .with_template(Some("lmsh-test/starter".to_string()));
        let changes = AssignmentChanges::between(&current, &desired);
        assert_eq!(changes.points, Some(120));
        assert_eq!(changes.due_date, Some(None));
        assert!(changes.title.is_none());
        assert_eq!(changes.fields(), vec!["due_date", "points"]);
        assert!(AssignmentChanges::between(&current, &current).is_empty());
    }
}
