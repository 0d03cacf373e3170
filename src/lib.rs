pub mod client;
pub mod common;
pub mod service;
