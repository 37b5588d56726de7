pub mod schema;
pub mod store;

pub use store::{IngestOutcome, Store};
