pub mod errors;
pub mod models;
pub mod retry;

pub use errors::*;
pub use models::*;
