use std::sync::Arc;

use async_trait::async_trait;
use tracing::debug;

use bookspace_events::{Event, EventData, EventDispatcher, EventHandler, EventType, HandlerError};

use crate::collaborators::Mailer;
use crate::handlers::processed::ProcessedKeys;

/// Welcome email on registration, at most once per `user_id`.
pub struct WelcomeEmail {
    mailer: Arc<dyn Mailer>,
    sent: ProcessedKeys,
}

#[async_trait]
impl EventHandler for WelcomeEmail {
    async fn handle(&self, event: &Event) -> Result<(), HandlerError> {
        let EventData::UserRegistered(user) = event.data() else {
            return Ok(());
        };
        if !self.sent.claim(&user.user_id) {
            debug!(user_id = %user.user_id, "welcome email already sent");
            return Ok(());
        }
        let sent = self
            .mailer
            .send_welcome(&user.user_id, &user.email, &user.display_name)
            .await;
        if let Err(err) = sent {
            self.sent.release(&user.user_id);
            return Err(err.into());
        }
        Ok(())
    }
}

/// Tells document watchers about a new comment, at most once per `comment_id`.
pub struct CommentNotification {
    mailer: Arc<dyn Mailer>,
    sent: ProcessedKeys,
}

#[async_trait]
impl EventHandler for CommentNotification {
    async fn handle(&self, event: &Event) -> Result<(), HandlerError> {
        let EventData::CommentAdded(comment) = event.data() else {
            return Ok(());
        };
        if !self.sent.claim(&comment.comment_id) {
            debug!(comment_id = %comment.comment_id, "comment notification already sent");
            return Ok(());
        }
        let sent = self
            .mailer
            .notify_comment(
                &comment.comment_id,
                &comment.document_id,
                &comment.author_id,
            )
            .await;
        if let Err(err) = sent {
            self.sent.release(&comment.comment_id);
            return Err(err.into());
        }
        Ok(())
    }
}

pub fn dispatcher(mailer: Arc<dyn Mailer>) -> EventDispatcher {
    EventDispatcher::new()
        .with_handler(
            EventType::UserRegistered,
            WelcomeEmail {
                mailer: mailer.clone(),
                sent: ProcessedKeys::new(),
            },
        )
        .with_handler(
            EventType::CommentAdded,
            CommentNotification {
                mailer,
                sent: ProcessedKeys::new(),
            },
        )
}
