//! lmsh-remote: HTTP adapters for LMSH
//!
//! ## Key Components
//!
//! - `GitHubClassroom`: `HostingPlatform` over the GitHub REST API (teams,
//!   template repositories, student repositories, check runs)
//! - `RestLms`: `Lms` over Canvas-compatible REST endpoints addressed by SIS ids
//! - `GitHubConfig` / `LmsConfig`: credentials and endpoints from the environment

pub mod config;
pub mod github;
mod http;
pub mod lms;

pub use config::{GitHubConfig, LmsConfig, RemoteError};
pub use github::GitHubClassroom;
pub use http::{classify_status, parse_retry_after};
pub use lms::RestLms;
