pub mod config;
pub mod error;
pub mod git;
pub mod repos;
pub mod review;
pub mod server;
