pub mod binder;
pub mod jwt;
pub mod middleware;

pub use binder::{Identity, IdentityBinder};
