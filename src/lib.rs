pub mod app;
pub mod cache;
pub mod cli;
pub mod config;
pub mod errors;
pub mod idle;
pub mod imap;
pub mod oauth;
pub mod onboarding;
pub mod sanitize;
pub mod smtp;
pub mod storage;
pub mod sync;
pub mod types;
