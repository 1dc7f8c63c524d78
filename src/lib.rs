//! Staged real-estate photo enhancement.
//!
//! Jobs run through a global enhancement pass, an optional declutter pass and
//! optional virtual staging. Each stage output is checked for structural drift
//! against its input, and usage is reserved before processing and settled
//! against the outcome afterwards.

pub mod app_state;
pub mod config;
pub mod db;
pub mod models;
pub mod routes;
pub mod services;
