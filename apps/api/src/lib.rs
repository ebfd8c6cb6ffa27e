pub mod assistant_client;
pub mod config;
pub mod conversation;
pub mod db;
pub mod errors;
pub mod models;
pub mod routes;
pub mod state;
