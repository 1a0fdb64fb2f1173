//! 记忆层：对话上下文与持久化

pub mod conversation;
pub mod persistence;

pub use conversation::{ConversationContext, Role, Turn, TurnContent, TurnOrigin};
pub use persistence::ConversationPersistence;
