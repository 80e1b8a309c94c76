//! QRVerse: one generated verse per visitor per day.
//!
//! The interesting part lives in [`application::daily_verse`], which decides
//! whether a visitor gets a freshly generated verse or a replay of the one
//! already handed out inside the current window. Everything else wires that
//! decision to HTTP, configuration and telemetry.

pub mod application;
pub mod cache;
pub mod config;
pub mod domain;
pub mod infra;
