//! The update pipeline and its surfaces.
//!
//! - `detector` finds candidate files
//! - `dispatcher` + `executor` rewrite them remotely, one job per file
//! - `publisher` + `github` stage, commit, push and open the pull request
//! - `pipeline` sequences a run through its stages
//! - `hub` fans progress events out to observers and the store (`db`)
//! - `api`, `ws`, `server` expose it all over HTTP

pub mod api;
pub mod db;
pub mod detector;
pub mod dispatcher;
pub mod executor;
pub mod github;
pub mod hub;
pub mod models;
pub mod pipeline;
pub mod publisher;
pub mod server;
pub mod ws;
