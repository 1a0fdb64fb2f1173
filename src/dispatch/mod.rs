//! 分派层：模型与能力之间的有界循环、回复解析、过程事件

pub mod events;
pub mod loop_;
pub mod planner;

pub use events::DispatchEvent;
pub use loop_::{
    DispatchOutcome, DispatchSession, DispatchStatus, Dispatcher, Instruction,
};
pub use planner::{parse_model_reply, render_turns, ModelReply, Planner, DEFAULT_SYSTEM_PROMPT};
