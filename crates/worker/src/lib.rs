//! Background worker: notification, search-indexing and thumbnail
//! consumers wired to the event bus.

pub mod app;
pub mod collaborators;
pub mod handlers;
