pub mod auth;
pub mod tus;

pub use auth::*;
pub use tus::*;
