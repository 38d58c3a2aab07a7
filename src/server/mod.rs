//! Admin HTTP surface: forced resyncs, listings, liveness and metrics

pub mod handlers;
pub mod state;

pub use handlers::create_router;
pub use state::AppState;
