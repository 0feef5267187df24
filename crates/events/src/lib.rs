//! Typed events, their wire codec, and the worker-side dispatch layer.
//!
//! Producers build an [`Event`] from one of the closed payload types and hand
//! it to an [`EventPublisher`]. Consumers receive decoded events through an
//! [`EventHandler`], usually an [`EventDispatcher`] that routes each event
//! type to exactly one registered handler.

pub mod codec;
pub mod dispatcher;
pub mod event;
pub mod handler;
pub mod in_memory_publisher;
pub mod kind;
pub mod payload;
pub mod publisher;

pub use codec::{DecodeError, EncodeError};
pub use dispatcher::EventDispatcher;
pub use event::Event;
pub use handler::{EventHandler, FnHandler, HandlerError, handler_fn};
pub use in_memory_publisher::{RecordingPublisher, RecordingPublisherError};
pub use kind::{EventType, UnknownEventType};
pub use payload::{
    CommentAdded, DocumentCreated, DocumentDeleted, DocumentUpdated, EventData, FileUploaded,
    UserRegistered,
};
pub use publisher::EventPublisher;
