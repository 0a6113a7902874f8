//! Controller-side secret resolution: fetch an item document from the
//! credential manager and project fields out of it with a jq query.

pub mod onepassword;
pub mod query;
pub mod resolver;
pub mod source;

pub use onepassword::OnePasswordCli;
pub use query::{JqEngine, QueryEngine, QueryError};
pub use resolver::SecretResolver;
pub use source::{ItemError, ItemSource};
