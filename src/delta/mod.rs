//! Delta computation against a reference signature

pub mod search;

pub use search::{search, search_bytes};
