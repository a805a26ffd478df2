//! Shared data types for adbrief (stream events, segments, documents).

pub mod documents;
pub mod events;
pub mod transcript;

pub use documents::Section;
pub use events::{SessionEvent, StreamEvent};
pub use transcript::{FinalizedMessage, Segment, ToolCall, ToolStatus};
