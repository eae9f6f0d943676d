//! ALPR Plate-Hit Alert Dispatch
//!
//! This library turns queued plate-read/hotlist matches into notifications posted
//! to an external receiver, with leased claims, retry with backoff, dead-lettering,
//! and either fixed-interval or Postgres LISTEN/NOTIFY wake-ups.

pub mod app_state;
pub mod config;
pub mod db;
pub mod models;
pub mod routes;
pub mod services;
