// src/fetch/mod.rs

//! Integrity-verified resolution of external inputs
//!
//! Two fetch kinds exist: HTTP artifacts (pinned by SHA-256) and git
//! checkouts (pinned by commit + tree hash). Both are content-addressed
//! into a local cache directory and verified on every reuse. The policy
//! engine is consulted before any network access.

mod git;
mod http;

pub use git::{fetch_git, is_commit_sha, GitFetchResult};
pub use http::{fetch_http, HttpFetchResult};
