//! rss-actions - run commands when feeds update
//!
//! This crate keeps a feed set in sync with configured subscriptions and
//! OPML lists, polls the feeds for new content, and pipes each updated
//! feed's record into its configured shell command.

pub mod config;
pub mod dispatch;
pub mod fetcher;
pub mod opml;
pub mod store;
pub mod sync;
