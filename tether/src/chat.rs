use crate::{ChatId, MessageId};

/// How the transport should interpret message text.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum TextFormat {
    #[default]
    Plain,
    Markdown,
}

#[derive(Clone, Debug, Default)]
pub struct SendOptions {
    pub format: TextFormat,
    /// Deliver without a notification sound where the platform supports it.
    pub silent: bool,
}

impl SendOptions {
    pub fn markdown() -> Self {
        Self {
            format: TextFormat::Markdown,
            ..Self::default()
        }
    }

    pub fn silent() -> Self {
        Self {
            silent: true,
            ..Self::default()
        }
    }
}

#[derive(Debug, thiserror::Error)]
#[error("chat transport error: {0}")]
pub struct TransportError(pub String);

/// Outbound side of the chat platform. Delivery is best-effort.
#[async_trait::async_trait]
pub trait ChatTransport: Send + Sync {
    async fn send_message(
        &self,
        chat_id: &ChatId,
        text: &str,
        options: SendOptions,
    ) -> Result<MessageId, TransportError>;

    /// Send text that may exceed the platform's message limit. Transports
    /// that need chunking override this.
    async fn send_long_message(
        &self,
        chat_id: &ChatId,
        text: &str,
        options: SendOptions,
    ) -> Result<Vec<MessageId>, TransportError> {
        Ok(vec![self.send_message(chat_id, text, options).await?])
    }

    async fn set_reaction(
        &self,
        chat_id: &ChatId,
        message_id: &MessageId,
        reaction: &str,
    ) -> Result<(), TransportError>;
}
