//! User directory gateway for cake.
//!
//! This crate provides read and partial-update access to the user population
//! the birthday scheduler works over:
//! - Paginated reads ordered by creation time
//! - A filtered read of users who have never been emailed
//! - Single-record partial updates of delivery state
//!
//! Two implementations of [`DirectoryGateway`] are provided: [`HttpDirectory`]
//! talks to the user-management service, and [`InMemoryDirectory`] keeps
//! records in process (optionally snapshotted to a JSON file).

mod client;
mod error;
mod gateway;
mod memory;
mod types;

pub use client::HttpDirectory;
pub use error::DirectoryError;
pub use gateway::DirectoryGateway;
pub use memory::InMemoryDirectory;
pub use types::{UserPage, UserPatch, UserRecord};
