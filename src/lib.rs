pub mod cli;
pub mod config;
pub mod dispatch;
pub mod error;
pub mod logging;
pub mod retry;
pub mod runner;
pub mod session;
pub mod transcript;
