//! Batch manifests for `lmsh sync`.
//!
//! ```json
//! {
//!   "classrooms": [
//!     {
//!       "org": "lmsh-test",
//!       "course_code": "CS101",
//!       "name": "Intro to CS",
//!       "roster": ["octocat"],
//!       "assignments": [
//!         { "title": "Midterm", "due_date": "2024-10-15", "points": 100 }
//!       ]
//!     }
//!   ]
//! }
//! ```

use std::collections::HashSet;
use std::path::Path;

use chrono::NaiveDate;
use serde::{Deserialize, Serialize};

use crate::domain::validation::deserialize_due_date;
use crate::domain::{AssignmentSpec, ClassroomSpec, LmshError, Result, ValidationError};

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Manifest {
    pub classrooms: Vec<ManifestClassroom>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ManifestClassroom {
    #[serde(flatten)]
    pub classroom: ClassroomSpec,
    #[serde(default)]
    pub assignments: Vec<ManifestAssignment>,
}

/// Assignment entry; organization and course come from the enclosing classroom.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ManifestAssignment {
    /// Defaults to a slug of the title.
    #[serde(default)]
    pub key: Option<String>,
    pub title: String,
    #[serde(default)]
    pub description: Option<String>,
    #[serde(default, deserialize_with = "deserialize_due_date")]
    pub due_date: Option<NaiveDate>,
    #[serde(default)]
    pub points: Option<u32>,
    #[serde(default)]
    pub template: Option<String>,
}

impl ManifestAssignment {
    fn to_spec(&self, classroom: &ClassroomSpec) -> AssignmentSpec {
        let spec = AssignmentSpec::new(&classroom.org, &classroom.course_code, &self.title)
            .with_description(self.description.clone())
            .with_due_date(self.due_date)
            .with_points(self.points)
            .with_template(self.template.clone());
        match &self.key {
            Some(key) => spec.with_key(key),
            None => spec,
        }
    }
}

fn invalid(msg: String) -> LmshError {
    LmshError::Validation(ValidationError::Other(msg))
}

impl Manifest {
    pub fn from_json(json: &str) -> Result<Self> {
        serde_json::from_str(json).map_err(|e| invalid(format!("manifest: {e}")))
    }

    pub fn from_path(path: &Path) -> Result<Self> {
        let json = std::fs::read_to_string(path)?;
        Self::from_json(&json)
    }

    /// Classroom/assignment plans in declared order.
    ///
    /// Rejects duplicate classrooms and duplicate assignment keys within a
    /// classroom, since those would race on the same record.
    pub fn plans(&self) -> Result<Vec<(ClassroomSpec, Vec<AssignmentSpec>)>> {
        let mut classrooms = HashSet::new();
        let mut plans = Vec::with_capacity(self.classrooms.len());
        for entry in &self.classrooms {
            let key = entry.classroom.key();
            if !classrooms.insert(key.clone()) {
                return Err(invalid(format!("manifest declares {key} twice")));
            }

            let mut keys = HashSet::new();
            let mut assignments = Vec::with_capacity(entry.assignments.len());
            for assignment in &entry.assignments {
                let spec = assignment.to_spec(&entry.classroom);
                if !keys.insert(spec.key.clone()) {
                    return Err(invalid(format!(
                        "manifest declares assignment {} twice",
                        spec.key()
                    )));
                }
                assignments.push(spec);
            }
            plans.push((entry.classroom.clone(), assignments));
        }
        Ok(plans)
    }
}
