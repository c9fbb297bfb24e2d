pub mod buffer;
pub mod frame;
pub mod message;

pub use buffer::{MessageBuffer, UpdateCursor, MESSAGE_BUFFER_CAPACITY};
pub use frame::{DecodeReport, FrameDecoder, FrameError, StreamFrame, WorkflowEvent};
pub use message::{
    strip_forward_keyword, CanonicalMessage, Update, UpdateBatch, UpdatePayload,
    NON_TEXT_PLACEHOLDER, UNKNOWN_SENDER,
};
