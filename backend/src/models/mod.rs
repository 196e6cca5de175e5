//! Database models (SQLx).

pub mod account;
pub mod instance;
pub mod machine_image;
pub mod user;
