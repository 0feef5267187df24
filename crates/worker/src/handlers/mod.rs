//! Per-consumer event handlers and their dispatchers.

pub mod notifications;
pub mod processed;
pub mod search;
pub mod thumbnails;
