pub mod ring;

pub use ring::{Ring, DEFAULT_CAPACITY};
