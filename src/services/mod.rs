pub mod admission;
pub mod metrics;
pub mod notifications;
pub mod scheduler;
pub mod trash;
pub mod uploads;
pub mod usage_cache;
pub mod watcher;

pub use admission::*;
pub use metrics::*;
pub use notifications::*;
pub use scheduler::*;
pub use trash::*;
pub use uploads::*;
pub use usage_cache::*;
pub use watcher::*;
