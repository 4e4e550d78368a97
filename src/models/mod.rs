pub mod condition;
pub mod query;
pub mod result;
pub mod route;
pub mod rule;
pub mod statement;
pub mod value;

pub use condition::*;
pub use query::*;
pub use result::*;
pub use route::*;
pub use rule::*;
pub use statement::*;
pub use value::*;
