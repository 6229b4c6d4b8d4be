//! GitHub as the hosting platform.
//!
//! | Concept | GitHub object |
//! |---|---|
//! | classroom | organization team named after the course code |
//! | roster | team members (role `member`) |
//! | assignment | template repository `<course>-<assignment>` granted to the team |
//! | acceptance link | the template's `/generate` page |
//! | submission | repository `<assignment repo>-<student>`, latest commit |
//! | score | autograding check run reporting `Points X/Y` |
//!
//! Display names and descriptions live in the team/repository description as
//! `<title> | <description> [lmsh:<course>]`; due dates and points are stored
//! as `lmsh-due-YYYY-MM-DD` and `lmsh-points-N` repository topics.

use std::collections::{BTreeMap, BTreeSet};
use std::sync::OnceLock;

use async_trait::async_trait;
use chrono::{DateTime, NaiveDate, Utc};
use lmsh_core::{
    ownership_marker, parse_ownership_marker, AdapterError, AdapterResult, AssignmentChanges,
    AssignmentSpec, ClassroomChanges, ClassroomSpec, GradingStatus, HostingPlatform,
    RemoteAssignment, RemoteClassroom, Submission,
};
use lmsh_state::EntityKey;
use regex::Regex;
use reqwest::Method;
use serde::Deserialize;
use serde_json::json;
use tracing::debug;

use crate::config::{GitHubConfig, RemoteError};
use crate::http::HttpClient;

const DUE_TOPIC: &str = "lmsh-due-";
const POINTS_TOPIC: &str = "lmsh-points-";
const POINTS_PATTERN: &str = r"(?i)points\s+(\d+(?:\.\d+)?)\s*/\s*(\d+(?:\.\d+)?)";

static POINTS_RE: OnceLock<Option<Regex>> = OnceLock::new();

#[derive(Debug, Deserialize)]
struct Team {
    slug: String,
    name: String,
    #[serde(default)]
    description: Option<String>,
    #[serde(default)]
    html_url: Option<String>,
}

#[derive(Debug, Deserialize)]
struct Member {
    login: String,
}

#[derive(Debug, Deserialize)]
struct Repo {
    name: String,
    #[serde(default)]
    description: Option<String>,
    html_url: String,
    #[serde(default)]
    topics: Vec<String>,
    #[serde(default)]
    is_template: bool,
}

#[derive(Debug, Deserialize)]
struct Topics {
    names: Vec<String>,
}

#[derive(Debug, Deserialize)]
struct CommitEntry {
    sha: String,
    commit: CommitDetail,
}

#[derive(Debug, Deserialize)]
struct CommitDetail {
    #[serde(default)]
    committer: Option<GitActor>,
    #[serde(default)]
    author: Option<GitActor>,
}

#[derive(Debug, Deserialize)]
struct GitActor {
    #[serde(default)]
    date: Option<DateTime<Utc>>,
}

#[derive(Debug, Deserialize)]
struct CheckRuns {
    check_runs: Vec<CheckRun>,
}

#[derive(Debug, Deserialize)]
struct CheckRun {
    name: String,
    #[serde(default)]
    conclusion: Option<String>,
    #[serde(default)]
    output: CheckOutput,
}

#[derive(Debug, Default, Deserialize)]
struct CheckOutput {
    #[serde(default)]
    title: Option<String>,
    #[serde(default)]
    summary: Option<String>,
    #[serde(default)]
    text: Option<String>,
}

impl CheckRun {
    fn is_autograding(&self) -> bool {
        self.name.to_ascii_lowercase().contains("autograd")
    }

    /// `(score, max)` from the first output field reporting `Points X/Y`.
    fn points(&self) -> Option<(f64, f64)> {
        let re = POINTS_RE
            .get_or_init(|| Regex::new(POINTS_PATTERN).ok())
            .as_ref()?;
        [&self.output.title, &self.output.summary, &self.output.text]
            .into_iter()
            .flatten()
            .find_map(|text| {
                let caps = re.captures(text)?;
                Some((caps[1].parse().ok()?, caps[2].parse().ok()?))
            })
    }
}

/// Team slug for a course code, as GitHub derives it from the team name.
pub fn team_slug(course_code: &str) -> String {
    let mut slug = String::with_capacity(course_code.len());
    for c in course_code.chars() {
        if c.is_ascii_alphanumeric() || c == '_' {
            slug.push(c.to_ascii_lowercase());
        } else if !slug.ends_with('-') {
            slug.push('-');
        }
    }
    slug.trim_matches('-').to_string()
}

/// Assignment repository name: `<course>-<assignment>`.
pub fn repository_name(course_code: &str, assignment_key: &str) -> String {
    format!("{course_code}-{assignment_key}").to_ascii_lowercase()
}

fn compose_description(title: &str, body: Option<&str>, course_code: &str) -> String {
    let mut text = title.trim().to_string();
    if let Some(body) = body.map(str::trim).filter(|b| !b.is_empty()) {
        text.push_str(" | ");
        text.push_str(body);
    }
    text.push(' ');
    text.push_str(&ownership_marker(course_code));
    text
}

/// Parts of a description written by [`compose_description`].
#[derive(Debug, Default, PartialEq, Eq)]
struct Described {
    owner: Option<String>,
    title: Option<String>,
    body: Option<String>,
}

fn split_description(raw: Option<&str>) -> Described {
    let raw = raw.unwrap_or_default().trim();
    let owner = parse_ownership_marker(raw).map(str::to_string);
    let text = match &owner {
        Some(code) => raw.replacen(&ownership_marker(code), "", 1),
        None => raw.to_string(),
    };
    let text = text.trim();
    let (title, body) = match text.split_once(" | ") {
        Some((title, body)) => (title.trim(), Some(body.trim())),
        None => (text, None),
    };
    Described {
        owner,
        title: (!title.is_empty()).then(|| title.to_string()),
        body: body.filter(|b| !b.is_empty()).map(str::to_string),
    }
}

fn due_from_topics(topics: &[String]) -> Option<NaiveDate> {
    topics
        .iter()
        .find_map(|t| t.strip_prefix(DUE_TOPIC))
        .and_then(|d| NaiveDate::parse_from_str(d, "%Y-%m-%d").ok())
}

fn points_from_topics(topics: &[String]) -> Option<u32> {
    topics
        .iter()
        .find_map(|t| t.strip_prefix(POINTS_TOPIC))
        .and_then(|p| p.parse().ok())
}

/// Replace the lmsh topics in `existing`, keeping everything else.
fn merge_topics(existing: &[String], due: Option<NaiveDate>, points: Option<u32>) -> Vec<String> {
    let mut topics: Vec<String> = existing
        .iter()
        .filter(|t| !t.starts_with(DUE_TOPIC) && !t.starts_with(POINTS_TOPIC))
        .cloned()
        .collect();
    if let Some(due) = due {
        topics.push(format!("{DUE_TOPIC}{}", due.format("%Y-%m-%d")));
    }
    if let Some(points) = points {
        topics.push(format!("{POINTS_TOPIC}{points}"));
    }
    topics
}

fn remote_classroom(team: Team, roster: BTreeSet<String>) -> RemoteClassroom {
    let described = split_description(team.description.as_deref());
    RemoteClassroom {
        id: team.slug,
        name: described.title.unwrap_or(team.name),
        description: described.body,
        owner: described.owner,
        roster,
        url: team.html_url,
    }
}

fn remote_assignment(repo: Repo) -> RemoteAssignment {
    let described = split_description(repo.description.as_deref());
    RemoteAssignment {
        title: described.title.unwrap_or_else(|| repo.name.clone()),
        description: described.body,
        due_date: due_from_topics(&repo.topics),
        points: points_from_topics(&repo.topics),
        owner: described.owner,
        acceptance_url: Some(format!("{}/generate", repo.html_url)),
        id: repo.name,
    }
}

fn assignment_of(key: &EntityKey) -> AdapterResult<&str> {
    key.assignment_key()
        .ok_or_else(|| AdapterError::Rejected(format!("{key} is not an assignment")))
}

/// GitHub REST API implementation of [`HostingPlatform`].
#[derive(Debug, Clone)]
pub struct GitHubClassroom {
    http: HttpClient,
}

impl GitHubClassroom {
    pub fn new(config: &GitHubConfig) -> Result<Self, RemoteError> {
        let http = HttpClient::new(
            &config.api_url,
            &config.token,
            config.timeout,
            &[
                ("accept", "application/vnd.github+json"),
                ("x-github-api-version", "2022-11-28"),
            ],
        )?;
        Ok(Self { http })
    }

    pub fn from_env() -> Result<Self, RemoteError> {
        Self::new(&GitHubConfig::from_env()?)
    }

    async fn team_members(&self, org: &str, slug: &str) -> AdapterResult<BTreeSet<String>> {
        let members: Vec<Member> = self
            .http
            .get_pages(
                &format!("orgs/{org}/teams/{slug}/members"),
                &[("role", "member".to_string())],
            )
            .await?;
        Ok(members.into_iter().map(|m| m.login).collect())
    }

    async fn add_member(&self, org: &str, slug: &str, login: &str) -> AdapterResult<()> {
        self.http
            .send_empty(
                Method::PUT,
                &format!("orgs/{org}/teams/{slug}/memberships/{login}"),
                &json!({ "role": "member" }),
            )
            .await
    }

    async fn mark_template(&self, org: &str, repo: &str) -> AdapterResult<()> {
        self.http
            .send_empty(
                Method::PATCH,
                &format!("repos/{org}/{repo}"),
                &json!({ "is_template": true }),
            )
            .await
    }

    /// Read access for the classroom team; PUT is idempotent.
    async fn grant_team(&self, org: &str, slug: &str, repo: &str) -> AdapterResult<()> {
        self.http
            .send_empty(
                Method::PUT,
                &format!("orgs/{org}/teams/{slug}/repos/{org}/{repo}"),
                &json!({ "permission": "pull" }),
            )
            .await
    }

    /// Latest revision of one student repository, with its autograding score.
    async fn submission(
        &self,
        org: &str,
        repo: &str,
        student: &str,
    ) -> AdapterResult<Option<Submission>> {
        let commits: Vec<CommitEntry> = match self
            .http
            .get(
                &format!("repos/{org}/{repo}/commits"),
                &[("per_page", "1".to_string())],
            )
            .await
        {
            Ok(commits) => commits,
            // 409: the repository has no commits yet
            Err(AdapterError::AlreadyExists(_)) => return Ok(None),
            Err(err) => return Err(err),
        };
        let Some(head) = commits.into_iter().next() else {
            return Ok(None);
        };
        let detail = head.commit;
        let Some(submitted_at) = detail
            .committer
            .and_then(|c| c.date)
            .or_else(|| detail.author.and_then(|a| a.date))
        else {
            debug!(repo = %repo, sha = %head.sha, "commit without a date, skipping");
            return Ok(None);
        };

        let mut submission =
            Submission::new(student, format!("{org}/{repo}"), head.sha.clone(), submitted_at);
        let runs: CheckRuns = self
            .http
            .get(
                &format!("repos/{org}/{repo}/commits/{}/check-runs", head.sha),
                &[],
            )
            .await?;
        if let Some(run) = runs.check_runs.iter().find(|r| r.is_autograding()) {
            match run.points() {
                Some((score, max)) => {
                    submission.status = GradingStatus::AutoGraded;
                    submission.score = Some(score);
                    submission.max_score = Some(max);
                }
                None if run.conclusion.as_deref() == Some("failure") => {
                    submission.status = GradingStatus::Failed;
                }
                None => {}
            }
            submission.feedback = run.output.title.clone();
        }
        Ok(Some(submission))
    }
}

#[async_trait]
impl HostingPlatform for GitHubClassroom {
    async fn find_classroom(&self, key: &EntityKey) -> AdapterResult<Option<RemoteClassroom>> {
        let slug = team_slug(key.course_code());
        let Some(team) = self
            .http
            .get_optional::<Team>(&format!("orgs/{}/teams/{slug}", key.org()))
            .await?
        else {
            return Ok(None);
        };
        let roster = self.team_members(key.org(), &team.slug).await?;
        Ok(Some(remote_classroom(team, roster)))
    }

    async fn create_classroom(&self, spec: &ClassroomSpec) -> AdapterResult<RemoteClassroom> {
        let body = json!({
            "name": spec.course_code,
            "description": compose_description(&spec.name, spec.description.as_deref(), &spec.course_code),
            "privacy": "closed",
        });
        let team: Team = self
            .http
            .send(Method::POST, &format!("orgs/{}/teams", spec.org), &body)
            .await?;
        for student in &spec.roster {
            self.add_member(&spec.org, &team.slug, student).await?;
        }
        Ok(remote_classroom(team, spec.roster.clone()))
    }

    async fn update_classroom(
        &self,
        key: &EntityKey,
        remote_id: &str,
        changes: &ClassroomChanges,
    ) -> AdapterResult<RemoteClassroom> {
        let path = format!("orgs/{}/teams/{remote_id}", key.org());
        let current: Team = self.http.get(&path, &[]).await?;
        let team = if changes.name.is_some() || changes.description.is_some() {
            let described = split_description(current.description.as_deref());
            let name = changes
                .name
                .clone()
                .or(described.title)
                .unwrap_or_else(|| current.name.clone());
            let body = match &changes.description {
                Some(description) => description.clone(),
                None => described.body,
            };
            let description = compose_description(&name, body.as_deref(), key.course_code());
            self.http
                .send(Method::PATCH, &path, &json!({ "description": description }))
                .await?
        } else {
            current
        };

        for student in &changes.add_members {
            self.add_member(key.org(), &team.slug, student).await?;
        }
        let roster = self.team_members(key.org(), &team.slug).await?;
        Ok(remote_classroom(team, roster))
    }

    async fn find_assignment(&self, key: &EntityKey) -> AdapterResult<Option<RemoteAssignment>> {
        let name = repository_name(key.course_code(), assignment_of(key)?);
        let repo = self
            .http
            .get_optional::<Repo>(&format!("repos/{}/{name}", key.org()))
            .await?;
        Ok(repo.map(remote_assignment))
    }

    async fn create_assignment(
        &self,
        classroom_id: &str,
        spec: &AssignmentSpec,
    ) -> AdapterResult<RemoteAssignment> {
        let org = &spec.org;
        let name = repository_name(&spec.course_code, &spec.key);
        let description =
            compose_description(&spec.title, spec.description.as_deref(), &spec.course_code);

        let mut repo: Repo = match &spec.template {
            Some(template) => {
                let body = json!({
                    "owner": org,
                    "name": name,
                    "description": description,
                    "private": true,
                });
                self.http
                    .send(Method::POST, &format!("repos/{template}/generate"), &body)
                    .await?
            }
            None => {
                let body = json!({
                    "name": name,
                    "description": description,
                    "private": true,
                    "auto_init": true,
                });
                self.http
                    .send(Method::POST, &format!("orgs/{org}/repos"), &body)
                    .await?
            }
        };

        let repo_path = format!("repos/{org}/{name}");
        self.mark_template(org, &name).await?;
        let topics: Topics = self
            .http
            .send(
                Method::PUT,
                &format!("{repo_path}/topics"),
                &json!({ "names": merge_topics(&repo.topics, spec.due_date, spec.points) }),
            )
            .await?;
        repo.topics = topics.names;
        self.grant_team(org, classroom_id, &name).await?;
        Ok(remote_assignment(repo))
    }

    async fn update_assignment(
        &self,
        key: &EntityKey,
        remote_id: &str,
        changes: &AssignmentChanges,
    ) -> AdapterResult<RemoteAssignment> {
        let path = format!("repos/{}/{remote_id}", key.org());
        let mut repo: Repo = self.http.get(&path, &[]).await?;

        if changes.title.is_some() || changes.description.is_some() {
            let described = split_description(repo.description.as_deref());
            let title = changes
                .title
                .clone()
                .or(described.title)
                .unwrap_or_else(|| repo.name.clone());
            let body = match &changes.description {
                Some(description) => description.clone(),
                None => described.body,
            };
            let description = compose_description(&title, body.as_deref(), key.course_code());
            let topics = std::mem::take(&mut repo.topics);
            repo = self
                .http
                .send(Method::PATCH, &path, &json!({ "description": description }))
                .await?;
            if repo.topics.is_empty() {
                repo.topics = topics;
            }
        }

        if changes.due_date.is_some() || changes.points.is_some() {
            let due = match changes.due_date {
                Some(due) => due,
                None => due_from_topics(&repo.topics),
            };
            let points = changes.points.or_else(|| points_from_topics(&repo.topics));
            let topics: Topics = self
                .http
                .send(
                    Method::PUT,
                    &format!("{path}/topics"),
                    &json!({ "names": merge_topics(&repo.topics, due, points) }),
                )
                .await?;
            repo.topics = topics.names;
        }
        Ok(remote_assignment(repo))
    }

    async fn link_assignment(
        &self,
        classroom_id: &str,
        key: &EntityKey,
        remote_id: &str,
    ) -> AdapterResult<()> {
        let org = key.org();
        self.mark_template(org, remote_id).await?;
        self.grant_team(org, classroom_id, remote_id).await
    }

    /// Student repositories are `<assignment repo>-<login>` where `login` is
    /// on the classroom team. Other assignments' repositories sharing the
    /// prefix carry an ownership marker or the template flag and are skipped.
    async fn list_submissions(
        &self,
        key: &EntityKey,
        remote_id: &str,
    ) -> AdapterResult<Vec<Submission>> {
        let org = key.org();
        let prefix = format!("{remote_id}-").to_ascii_lowercase();
        let students: BTreeMap<String, String> = self
            .team_members(org, &team_slug(key.course_code()))
            .await?
            .into_iter()
            .map(|login| (login.to_ascii_lowercase(), login))
            .collect();
        let repos: Vec<Repo> = self
            .http
            .get_pages(&format!("orgs/{org}/repos"), &[("type", "all".to_string())])
            .await?;

        let mut submissions = Vec::new();
        for repo in repos {
            let name = repo.name.to_ascii_lowercase();
            let Some(suffix) = name.strip_prefix(&prefix) else {
                continue;
            };
            let managed = parse_ownership_marker(repo.description.as_deref().unwrap_or_default())
                .is_some();
            if repo.is_template || managed {
                debug!(repo = %repo.name, "assignment repository, skipping");
                continue;
            }
            let Some(student) = students.get(suffix) else {
                debug!(repo = %repo.name, "not on the classroom roster, skipping");
                continue;
            };
            if let Some(submission) = self.submission(org, &repo.name, student).await? {
                submissions.push(submission);
            }
        }
        Ok(submissions)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_team_slug() {
        assert_eq!(team_slug("CS101"), "cs101");
        assert_eq!(team_slug("CS101.F24"), "cs101-f24");
        assert_eq!(team_slug("cs_101--a"), "cs_101-a");
    }

    #[test]
    fn test_repository_name() {
        assert_eq!(repository_name("CS101", "midterm"), "cs101-midterm");
    }

    #[test]
    fn test_description_round_trip() {
        let text = compose_description("Intro to CS", Some("Fall term"), "CS101");
        assert_eq!(text, "Intro to CS | Fall term [lmsh:CS101]");
        assert_eq!(
            split_description(Some(&text)),
            Described {
                owner: Some("CS101".to_string()),
                title: Some("Intro to CS".to_string()),
                body: Some("Fall term".to_string()),
            }
        );

        let bare = compose_description("Midterm", None, "CS101");
        assert_eq!(bare, "Midterm [lmsh:CS101]");
        assert_eq!(split_description(Some(&bare)).body, None);
    }

    #[test]
    fn test_foreign_description() {
        let described = split_description(Some("Managed by hand"));
        assert_eq!(described.owner, None);
        assert_eq!(described.title.as_deref(), Some("Managed by hand"));
        assert_eq!(split_description(None), Described::default());
    }

    #[test]
    fn test_topics() {
        let existing = vec!["python".to_string(), "lmsh-points-50".to_string()];
        let merged = merge_topics(&existing, NaiveDate::from_ymd_opt(2024, 10, 15), Some(100));
        assert_eq!(merged, vec!["python", "lmsh-due-2024-10-15", "lmsh-points-100"]);
        assert_eq!(due_from_topics(&merged), NaiveDate::from_ymd_opt(2024, 10, 15));
        assert_eq!(points_from_topics(&merged), Some(100));
        assert_eq!(merge_topics(&merged, None, None), vec!["python"]);
    }

    #[test]
    fn test_check_run_points() {
        let run = CheckRun {
            name: "Autograding".to_string(),
            conclusion: Some("success".to_string()),
            output: CheckOutput {
                title: Some("3 tests passed".to_string()),
                summary: Some("Points 8.5/10".to_string()),
                text: None,
            },
        };
        assert!(run.is_autograding());
        assert_eq!(run.points(), Some((8.5, 10.0)));

        let failing = CheckRun {
            name: "autograding-tests".to_string(),
            conclusion: Some("failure".to_string()),
            output: CheckOutput::default(),
        };
        assert_eq!(failing.points(), None);
    }
}
