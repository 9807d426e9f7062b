pub mod bridge;
pub mod config;
pub mod session;
pub mod stats;
