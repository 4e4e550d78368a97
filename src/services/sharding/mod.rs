pub mod algorithm;
pub mod inline;
pub mod key_generator;

pub use algorithm::*;
pub use key_generator::*;
