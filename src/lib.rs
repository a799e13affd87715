pub mod address;
pub mod annotations;
pub mod database;
pub mod interfaces;
pub mod patches;
pub mod persist;
pub mod store;

pub use database::{Database, DatabaseConfig, SaveScope};

pub fn init_tracing() {
    use tracing_subscriber::EnvFilter;
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::fmt()
        .without_time()
        .with_env_filter(filter)
        .init();
}
