pub mod config;
pub mod dtos;
pub mod handlers;
pub mod middleware;
pub mod models;
pub mod ofx;
pub mod services;
pub mod startup;
