//! Desired classroom state.

use std::collections::BTreeSet;

use lmsh_state::EntityKey;
use serde::{Deserialize, Serialize};

use super::error::ValidationError;
use super::validation::{validate_course_code, validate_org, validate_student};

const MARKER_PREFIX: &str = "[lmsh:";

/// Ownership marker embedded in remote descriptions: `[lmsh:<course code>]`.
pub fn ownership_marker(course_code: &str) -> String {
    format!("{MARKER_PREFIX}{course_code}]")
}

/// Extract the course code from the first ownership marker in `text`.
pub fn parse_ownership_marker(text: &str) -> Option<&str> {
    let start = text.find(MARKER_PREFIX)? + MARKER_PREFIX.len();
    let len = text[start..].find(']')?;
    let code = &text[start..start + len];
    (!code.is_empty()).then_some(code)
}

/// A classroom as declared by the operator.
///
/// Identity is (`org`, `course_code`). The roster only ever grows on the
/// remote side; removing a student here does not remove them remotely.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ClassroomSpec {
    pub org: String,
    pub course_code: String,
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    #[serde(default)]
    pub roster: BTreeSet<String>,
}

impl ClassroomSpec {
    pub fn new(
        org: impl Into<String>,
        course_code: impl Into<String>,
        name: impl Into<String>,
    ) -> Self {
        Self {
            org: org.into(),
            course_code: course_code.into(),
            name: name.into(),
            description: None,
            roster: BTreeSet::new(),
        }
    }

    pub fn with_description(mut self, description: Option<String>) -> Self {
        self.description = description.filter(|d| !d.trim().is_empty());
        self
    }

    pub fn with_students<I, S>(mut self, students: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.roster.extend(students.into_iter().map(Into::into));
        self
    }

    pub fn key(&self) -> EntityKey {
        EntityKey::classroom(&self.org, &self.course_code)
    }

    /// Schema validation; runs before any remote call.
    pub fn validate(&self) -> Result<(), ValidationError> {
        validate_org(&self.org)?;
        validate_course_code(&self.course_code)?;
        if self.name.trim().is_empty() {
            return Err(ValidationError::Empty { field: "name" });
        }
        for student in &self.roster {
            validate_student(student)?;
        }
        Ok(())
    }

    /// Whether `candidate` names this classroom by course code, remote id or
    /// display name (case-insensitive).
    pub fn is_named(&self, candidate: &str, remote_id: &str) -> bool {
        let candidate = candidate.trim();
        candidate.eq_ignore_ascii_case(&self.course_code)
            || candidate.eq_ignore_ascii_case(remote_id)
            || candidate.eq_ignore_ascii_case(self.name.trim())
    }
}

/// Field-level changes to apply to an existing remote classroom.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ClassroomChanges {
    pub name: Option<String>,
    /// `Some(None)` clears the description.
    pub description: Option<Option<String>>,
    pub add_members: BTreeSet<String>,
}

impl ClassroomChanges {
    /// Changes that turn `current` into `desired`. Members are never removed.
    pub fn between(current: &ClassroomSpec, desired: &ClassroomSpec) -> Self {
        Self {
            name: (current.name != desired.name).then(|| desired.name.clone()),
            description: (current.description != desired.description)
                .then(|| desired.description.clone()),
            add_members: desired.roster.difference(&current.roster).cloned().collect(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.name.is_none() && self.description.is_none() && self.add_members.is_empty()
    }

    pub fn fields(&self) -> Vec<&'static str> {
        let mut fields = Vec::new();
        if self.name.is_some() {
            fields.push("name");
        }
        if self.description.is_some() {
            fields.push("description");
        }
        if !self.add_members.is_empty() {
            fields.push("roster");
        }
        fields
    }
}
