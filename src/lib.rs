pub mod config;
pub mod db;
pub mod discord;
pub mod maintenance;
pub mod recovery;
