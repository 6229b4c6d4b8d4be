//! Canvas-compatible LMS adapter.
//!
//! Courses and students are addressed by SIS id (`sis_course_id:CS101`,
//! `sis_user_id:octocat`). Assignments are matched by `sis_assignment_id`, or
//! failing that by the slug of their name.

use async_trait::async_trait;
use lmsh_core::domain::validation::slugify;
use lmsh_core::{AdapterError, AdapterResult, GradeUpdate, Lms};
use reqwest::Method;
use serde::Deserialize;
use serde_json::json;

use crate::config::{LmsConfig, RemoteError};
use crate::http::HttpClient;

#[derive(Debug, Deserialize)]
struct CanvasAssignment {
    id: u64,
    name: String,
    #[serde(default)]
    sis_assignment_id: Option<String>,
}

impl CanvasAssignment {
    fn matches(&self, key: &str) -> bool {
        self.sis_assignment_id
            .as_deref()
            .is_some_and(|sis| sis.eq_ignore_ascii_case(key))
            || slugify(&self.name) == key.to_ascii_lowercase()
    }
}

#[derive(Debug, Deserialize)]
struct CanvasUser {
    #[serde(default)]
    login_id: Option<String>,
    #[serde(default)]
    sis_user_id: Option<String>,
}

fn course_path(course_code: &str) -> String {
    format!("api/v1/courses/sis_course_id:{course_code}")
}

/// REST implementation of [`Lms`].
#[derive(Debug, Clone)]
pub struct RestLms {
    http: HttpClient,
}

impl RestLms {
    pub fn new(config: &LmsConfig) -> Result<Self, RemoteError> {
        let http = HttpClient::new(
            &config.base_url,
            &config.token,
            config.timeout,
            &[("accept", "application/json")],
        )?;
        Ok(Self { http })
    }

    pub fn from_env() -> Result<Self, RemoteError> {
        Self::new(&LmsConfig::from_env()?)
    }

    async fn assignment_id(&self, course_code: &str, key: &str) -> AdapterResult<u64> {
        let assignments: Vec<CanvasAssignment> = self
            .http
            .get_pages(&format!("{}/assignments", course_path(course_code)), &[])
            .await?;
        assignments
            .iter()
            .find(|a| a.matches(key))
            .map(|a| a.id)
            .ok_or_else(|| {
                AdapterError::NotFound(format!("assignment {key} in course {course_code}"))
            })
    }
}

#[async_trait]
impl Lms for RestLms {
    async fn upsert_grade(&self, grade: &GradeUpdate) -> AdapterResult<()> {
        let id = self
            .assignment_id(&grade.course_code, &grade.assignment)
            .await?;
        let mut body = json!({ "submission": { "posted_grade": grade.score.to_string() } });
        if let Some(feedback) = &grade.feedback {
            body["comment"] = json!({ "text_comment": feedback });
        }
        self.http
            .send_empty(
                Method::PUT,
                &format!(
                    "{}/assignments/{id}/submissions/sis_user_id:{}",
                    course_path(&grade.course_code),
                    grade.student
                ),
                &body,
            )
            .await
    }

    async fn list_roster(&self, course_code: &str) -> AdapterResult<Vec<String>> {
        let users: Vec<CanvasUser> = self
            .http
            .get_pages(
                &format!("{}/users", course_path(course_code)),
                &[("enrollment_type[]", "student".to_string())],
            )
            .await?;
        let mut roster: Vec<String> = users
            .into_iter()
            .filter_map(|u| u.login_id.or(u.sis_user_id))
            .filter(|login| !login.trim().is_empty())
            .collect();
        roster.sort();
        roster.dedup();
        Ok(roster)
    }
}
