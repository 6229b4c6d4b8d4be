//! Naming rules for organizations, course codes, assignment keys and students.
//!
//! All checks run before any remote call. Identifiers end up in storage ids
//! (`classroom/<org>/<course>`) and remote names (`<course>-<assignment>`), so
//! none of them may contain `/` or whitespace.

use std::sync::OnceLock;

use chrono::NaiveDate;
use regex::Regex;
use serde::{Deserialize, Deserializer};

use super::error::ValidationError;

/// Hosting-platform login: alphanumerics and single hyphens, at most 39 chars.
const LOGIN_PATTERN: &str = r"^[A-Za-z0-9](?:[A-Za-z0-9]|-[A-Za-z0-9]){0,38}$";
const COURSE_CODE_PATTERN: &str = r"^[A-Za-z0-9][A-Za-z0-9_.-]{0,63}$";
const ASSIGNMENT_KEY_PATTERN: &str = r"^[a-z0-9][a-z0-9_-]{0,63}$";
const TEMPLATE_PATTERN: &str = r"^[A-Za-z0-9-]+/[A-Za-z0-9._-]+$";

static LOGIN_RE: OnceLock<Option<Regex>> = OnceLock::new();
static COURSE_CODE_RE: OnceLock<Option<Regex>> = OnceLock::new();
static ASSIGNMENT_KEY_RE: OnceLock<Option<Regex>> = OnceLock::new();
static TEMPLATE_RE: OnceLock<Option<Regex>> = OnceLock::new();

fn matches(cell: &'static OnceLock<Option<Regex>>, pattern: &str, value: &str) -> bool {
    cell.get_or_init(|| Regex::new(pattern).ok())
        .as_ref()
        .is_some_and(|re| re.is_match(value))
}

pub fn validate_org(org: &str) -> Result<(), ValidationError> {
    if org.trim().is_empty() {
        return Err(ValidationError::Empty {
            field: "organization",
        });
    }
    if !matches(&LOGIN_RE, LOGIN_PATTERN, org) {
        return Err(ValidationError::Organization {
            value: org.to_string(),
            reason: "expected alphanumerics and single hyphens, at most 39 characters"
                .to_string(),
        });
    }
    Ok(())
}

pub fn validate_course_code(code: &str) -> Result<(), ValidationError> {
    if code.trim().is_empty() {
        return Err(ValidationError::Empty {
            field: "course code",
        });
    }
    if !matches(&COURSE_CODE_RE, COURSE_CODE_PATTERN, code) {
        return Err(ValidationError::CourseCode {
            value: code.to_string(),
            reason: "expected letters, digits, '.', '_' or '-', at most 64 characters"
                .to_string(),
        });
    }
    Ok(())
}

pub fn validate_assignment_key(key: &str) -> Result<(), ValidationError> {
    if key.is_empty() {
        return Err(ValidationError::Empty {
            field: "assignment key",
        });
    }
    if !matches(&ASSIGNMENT_KEY_RE, ASSIGNMENT_KEY_PATTERN, key) {
        return Err(ValidationError::AssignmentKey {
            value: key.to_string(),
            reason: "expected lowercase letters, digits, '_' or '-'".to_string(),
        });
    }
    Ok(())
}

pub fn validate_student(student: &str) -> Result<(), ValidationError> {
    if !matches(&LOGIN_RE, LOGIN_PATTERN, student) {
        return Err(ValidationError::Student {
            value: student.to_string(),
        });
    }
    Ok(())
}

pub fn validate_template(template: &str) -> Result<(), ValidationError> {
    if !matches(&TEMPLATE_RE, TEMPLATE_PATTERN, template) {
        return Err(ValidationError::Template {
            value: template.to_string(),
        });
    }
    Ok(())
}

/// Parse a `YYYY-MM-DD` calendar date. Past dates are accepted.
pub fn parse_due_date(value: &str) -> Result<NaiveDate, ValidationError> {
    let trimmed = value.trim();
    // chrono accepts unpadded fields; require the canonical shape too
    let canonical = trimmed.len() == 10
        && trimmed.bytes().enumerate().all(|(i, b)| match i {
            4 | 7 => b == b'-',
            _ => b.is_ascii_digit(),
        });
    if !canonical {
        return Err(ValidationError::DueDate {
            value: value.to_string(),
        });
    }
    NaiveDate::parse_from_str(trimmed, "%Y-%m-%d").map_err(|_| ValidationError::DueDate {
        value: value.to_string(),
    })
}

/// Serde adapter applying [`parse_due_date`] to an optional date field.
pub fn deserialize_due_date<'de, D>(deserializer: D) -> Result<Option<NaiveDate>, D::Error>
where
    D: Deserializer<'de>,
{
    Option::<String>::deserialize(deserializer)?
        .map(|value| parse_due_date(&value).map_err(serde::de::Error::custom))
        .transpose()
}

/// Derive an assignment key from a title: lowercase, runs of other
/// characters collapsed to a single `-`.
///
/// `"Midterm"` → `"midterm"`, `"Lab 2: Pointers"` → `"lab-2-pointers"`.
pub fn slugify(title: &str) -> String {
    let mut slug = String::with_capacity(title.len());
    let mut pending_dash = false;
    for c in title.chars() {
        if c.is_ascii_alphanumeric() || c == '_' {
            if pending_dash && !slug.is_empty() {
                slug.push('-');
            }
            pending_dash = false;
            slug.push(c.to_ascii_lowercase());
        } else {
            pending_dash = true;
        }
    }
    slug.truncate(64);
    slug.trim_end_matches('-').to_string()
}
