pub mod auth;
pub mod driver;
pub mod pickup;
pub mod token;
pub mod user;
