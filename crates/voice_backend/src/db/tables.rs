pub mod conversation_message;
pub mod subscription_plan;
pub mod token_usage;
pub mod user;
pub mod user_subscription;
pub mod voice_prompt;
