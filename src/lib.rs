pub mod api;
pub mod config;
pub mod models;
pub mod services;
pub mod validation;

#[cfg(test)]
pub mod test_support;

pub use models::*;
pub use services::*;
pub use validation::*;
