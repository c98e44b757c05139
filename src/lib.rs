pub mod agent;
pub mod app;
pub mod auth;
pub mod config;
pub mod error;
pub mod hooks;
pub mod http;
pub mod llm;
pub mod server;
pub mod session;
pub mod tools;
pub mod warehouse;
