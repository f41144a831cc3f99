use super::*;
use crate::db::conversation_message::MessageType;

#[derive(Clone, Debug, Deserialize)]
pub struct NewConversationMessage {
    #[serde(default)]
    pub session_id: Option<i32>,
    pub message_type: MessageType,
    pub content: String,
    #[serde(default)]
    pub audio_duration_seconds: i32,
}

impl Database {
    pub async fn save_conversation_message(
        &self,
        user_id: UserId,
        message: &NewConversationMessage,
    ) -> Result<ConversationMessageId> {
        if message.content.trim().is_empty() {
            return Err(Error::InvalidArgument("message content is required".into()));
        }
        if message.audio_duration_seconds < 0 {
            return Err(Error::InvalidArgument(format!(
                "audio duration must not be negative, got {}",
                message.audio_duration_seconds
            )));
        }

        self.transaction(|tx| async move {
            self.get_user_in_tx(user_id, false, &tx).await?;
            let message = conversation_message::Entity::insert(conversation_message::ActiveModel {
                id: ActiveValue::not_set(),
                user_id: ActiveValue::set(user_id),
                session_id: ActiveValue::set(message.session_id),
                message_type: ActiveValue::set(message.message_type),
                content: ActiveValue::set(message.content.clone()),
                audio_duration_seconds: ActiveValue::set(message.audio_duration_seconds),
                created_at: ActiveValue::set(now()),
            })
            .exec_with_returning(&*tx)
            .await?;
            Ok(message.id)
        })
        .await
    }

    /// Returns the user's last `limit` messages, oldest first.
    pub async fn get_recent_conversation(
        &self,
        user_id: UserId,
        limit: u64,
    ) -> Result<Vec<conversation_message::Model>> {
        self.transaction(|tx| async move {
            self.get_user_in_tx(user_id, false, &tx).await?;
            let mut messages = conversation_message::Entity::find()
                .filter(conversation_message::Column::UserId.eq(user_id))
                .order_by_desc(conversation_message::Column::CreatedAt)
                .order_by_desc(conversation_message::Column::Id)
                .limit(limit)
                .all(&*tx)
                .await?;
            messages.reverse();
            Ok(messages)
        })
        .await
    }
}
