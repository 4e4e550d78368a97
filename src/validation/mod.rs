pub mod sql_binder;

pub use sql_binder::*;
