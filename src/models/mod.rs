pub mod event;
pub mod trash;
pub mod upload;
pub mod usage;
pub mod user;

pub use event::*;
pub use trash::*;
pub use upload::*;
pub use usage::*;
pub use user::*;
