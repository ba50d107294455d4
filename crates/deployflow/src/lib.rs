pub mod admin;
pub mod clients;
pub mod config;
pub mod db;
pub mod error;
pub mod events;
pub mod jobs;
pub mod pipelines;
pub mod store;
pub mod telemetry;
pub mod worker;
