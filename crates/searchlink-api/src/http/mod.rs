//! HTTP routing and handlers.

pub mod document;
pub mod routes;
pub mod state;


pub use routes::create_router;
pub use state::{AllowedSources, AppState};
