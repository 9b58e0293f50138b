pub mod config;
pub mod credits;
pub mod db;
pub mod engine;
pub mod errors;
pub mod fileops;
pub mod models;
pub mod progress;
pub mod sandbox;
pub mod server;
pub mod sse;
pub mod stream;
