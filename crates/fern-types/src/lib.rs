pub mod error;
pub mod events;
pub mod message;

pub use error::FernError;
pub use events::AgentEvent;
pub use message::{Message, Part, Role, TokenUsage, ToolState, ToolStatus, ToolTime};
