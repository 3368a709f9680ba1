// src/lib.rs

//! dealwatch
//!
//! Polls deal sources on a priority schedule, suppresses offers already seen
//! on the same or another platform, and keeps each site inside its request
//! budget. Fetching and publishing are pluggable through
//! [`pipeline::FetchAdapter`] and [`pipeline::Sink`].

pub mod error;
pub mod models;
pub mod pipeline;
pub mod services;
pub mod storage;
pub mod utils;
