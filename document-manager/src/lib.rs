pub mod config;
pub mod flash;
pub mod handlers;
pub mod models;
pub mod services;
pub mod startup;
