pub mod config;
pub mod error;
pub mod executor;
pub mod language;
pub mod routes;
pub mod sandbox;
pub mod web_server;
pub mod workspace;
