//! Page image supplier for a manga reader: a two-tier image cache, remote
//! catalog sources behind a rate limiter, and a prefetching page loader.

pub mod backend;
pub mod config;
pub mod error;
pub mod ui;

pub use error::{Error, Result};
