use super::*;

pub mod conversations;
pub mod plans;
pub mod prompts;
pub mod subscriptions;
pub mod token_usages;
pub mod users;
