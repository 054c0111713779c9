pub mod config;
pub mod handlers;
pub mod models;
pub mod services;
pub mod state;
pub mod store;
pub mod utils;

pub use handlers::build_router;
pub use state::AppState;
