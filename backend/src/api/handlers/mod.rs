//! HTTP request handlers.

pub mod accounts;
pub mod auth;
pub mod events;
pub mod health;
pub mod images;
pub mod instances;
pub mod reports;
pub mod sysconfig;
pub mod users;
