//! Delivery of a single due message.
//!
//! Every resolution or delivery failure becomes a terminal update on the
//! message record; the only error that escapes [`Dispatcher::dispatch`] is a
//! store-write failure, which the scheduler treats as the end of the tick.

use chrono::Utc;
use std::sync::Arc;
use std::thread;
use std::time::Duration;
use tracing::{info, warn};

use slack_api_module::SlackClient;

use crate::credential_store::CredentialStore;
use crate::message_store::{MessageStore, MessageStoreError, ScheduledMessage};
use crate::resolver::CredentialResolver;

/// Ceiling on send attempts within one dispatch. Only retryable failures
/// (transport errors, provider rate limiting) are attempted again.
const MAX_SEND_ATTEMPTS: u32 = 3;
const DEFAULT_RETRY_DELAY: Duration = Duration::from_secs(2);

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DispatchOutcome {
    Sent { slack_message_id: String },
    Failed { reason: String },
}

pub struct Dispatcher<M: MessageStore, C: CredentialStore> {
    messages: Arc<M>,
    resolver: CredentialResolver<C>,
    slack: Arc<SlackClient>,
    retry_delay: Duration,
}

impl<M: MessageStore, C: CredentialStore> Dispatcher<M, C> {
    pub fn new(messages: Arc<M>, resolver: CredentialResolver<C>, slack: Arc<SlackClient>) -> Self {
        Self {
            messages,
            resolver,
            slack,
            retry_delay: DEFAULT_RETRY_DELAY,
        }
    }

    /// Override the pause between retryable send attempts (used by tests).
    pub fn with_retry_delay(mut self, retry_delay: Duration) -> Self {
        self.retry_delay = retry_delay;
        self
    }

    /// Attempt delivery of one claimed message and record the outcome.
    pub fn dispatch(
        &self,
        message: &ScheduledMessage,
    ) -> Result<DispatchOutcome, MessageStoreError> {
        info!(
            "dispatching message {} for user {} to channel {}",
            message.id, message.user_id, message.channel_id
        );

        let credential = match self.resolver.resolve(&message.user_id, Utc::now()) {
            Ok(credential) => credential,
            Err(err) => {
                let reason = err.to_string();
                warn!(
                    "credential resolution for message {} failed: {}",
                    message.id, reason
                );
                self.messages.mark_failed(message.id, Utc::now(), &reason)?;
                return Ok(DispatchOutcome::Failed { reason });
            }
        };

        let mut attempt = 1u32;
        loop {
            match self
                .slack
                .post_message(&credential.access_token, &message.channel_id, &message.message)
            {
                Ok(posted) => {
                    self.messages.mark_sent(message.id, Utc::now(), &posted.ts)?;
                    info!(
                        "message {} sent to channel {} as {}",
                        message.id, message.channel_id, posted.ts
                    );
                    return Ok(DispatchOutcome::Sent {
                        slack_message_id: posted.ts,
                    });
                }
                Err(err) if err.is_retryable() && attempt < MAX_SEND_ATTEMPTS => {
                    let retries = self.messages.increment_retry_count(message.id)?;
                    warn!(
                        "send attempt {} for message {} failed: {}; retrying (retry count {})",
                        attempt, message.id, err, retries
                    );
                    thread::sleep(self.retry_delay);
                    attempt += 1;
                }
                Err(err) => {
                    let reason = err.to_string();
                    warn!("message {} failed: {}", message.id, reason);
                    self.messages.mark_failed(message.id, Utc::now(), &reason)?;
                    return Ok(DispatchOutcome::Failed { reason });
                }
            }
        }
    }
}
