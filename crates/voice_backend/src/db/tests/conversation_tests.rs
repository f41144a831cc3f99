use super::*;
use crate::db::conversation_message::MessageType;
use crate::test_both_dbs;
use pretty_assertions::assert_eq;

test_both_dbs!(
    test_recent_conversation,
    test_recent_conversation_postgres,
    test_recent_conversation_sqlite
);

async fn test_recent_conversation(db: &Arc<Database>) {
    let user_id = new_test_user(db, "600").await;
    let other_id = new_test_user(db, "601").await;

    for i in 0..8 {
        let message_type = if i % 2 == 0 {
            MessageType::User
        } else {
            MessageType::Assistant
        };
        db.save_conversation_message(
            user_id,
            &NewConversationMessage {
                session_id: Some(1),
                message_type,
                content: format!("message {i}"),
                audio_duration_seconds: i,
            },
        )
        .await
        .unwrap();
    }
    db.save_conversation_message(
        other_id,
        &NewConversationMessage {
            session_id: None,
            message_type: MessageType::User,
            content: "someone else".into(),
            audio_duration_seconds: 0,
        },
    )
    .await
    .unwrap();

    let messages = db.get_recent_conversation(user_id, 3).await.unwrap();
    assert_eq!(
        messages
            .iter()
            .map(|message| (message.message_type, message.content.as_str()))
            .collect::<Vec<_>>(),
        vec![
            (MessageType::Assistant, "message 5"),
            (MessageType::User, "message 6"),
            (MessageType::Assistant, "message 7"),
        ]
    );
    assert_eq!(db.get_recent_conversation(other_id, 10).await.unwrap().len(), 1);

    let error = db
        .save_conversation_message(
            user_id,
            &NewConversationMessage {
                session_id: None,
                message_type: MessageType::User,
                content: String::new(),
                audio_duration_seconds: 0,
            },
        )
        .await
        .unwrap_err();
    assert!(matches!(error, Error::InvalidArgument(_)));

    assert!(matches!(
        db.get_recent_conversation(UserId(other_id.0 + 100), 10)
            .await
            .unwrap_err(),
        Error::NotFound(_)
    ));
}
