pub mod auth;
pub mod config;
pub mod dashboard;
pub mod db;
pub mod error;
pub mod fetcher;
pub mod geocode;
pub mod http;
pub mod mirror;
pub mod models;
pub mod normalizer;
pub mod pipeline;
pub mod warehouse;

pub use error::{AppError, Result};
