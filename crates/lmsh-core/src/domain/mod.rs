//! Domain types for LMSH: desired classrooms and assignments, submissions,
//! validation rules, digests and the error taxonomy.

pub mod assignment;
pub mod classroom;
pub mod digest;
pub mod error;
pub mod submission;
pub mod validation;

pub use assignment::{AssignmentChanges, AssignmentSpec};
pub use classroom::{ownership_marker, parse_ownership_marker, ClassroomChanges, ClassroomSpec};
pub use error::{LmshError, Result, ValidationError};
pub use submission::{select_current, GradingStatus, RevisionMarker, Submission};
