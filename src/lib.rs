pub mod engine;
pub mod error;
pub mod expr;
pub mod schema;
pub mod value;
pub mod view;

pub use engine::{Config, Scope, Tanker};
pub use error::{Error, Result};
pub use schema::Schema;
pub use value::Value;
pub use view::{Rows, View};
