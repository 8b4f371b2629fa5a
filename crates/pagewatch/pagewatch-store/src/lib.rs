pub mod error;
pub mod layout;
pub mod store;

pub use error::StoreError;
pub use store::{StoreOptions, ValueStore};
