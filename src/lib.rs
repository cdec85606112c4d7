//! Conduit - remote query execution and result streaming.
//!
//! Submits statements to external engines on behalf of a principal, polls
//! asynchronous executions, pages through results by handle and exports
//! them in bulk.

pub mod config;
pub mod connection;
pub mod db;
pub mod error;
pub mod logging;
pub mod query;
