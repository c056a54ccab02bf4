pub mod events;
pub mod models;
pub mod topic;
pub mod traits;

pub use events::*;
pub use models::*;
pub use topic::*;
pub use traits::*;
