//! Database module

pub mod sqlite;

pub use sqlite::{LocalFileRecord, LocalFileStore};
