pub mod migrations;
pub mod pool;

pub use migrations::run_migrations;
