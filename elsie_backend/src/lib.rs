pub mod config;
pub mod dispatch;
pub mod journal;
pub mod roleplay;
pub mod runtime;
pub mod server;
