//! Server-Sent Events plumbing shared by the race engine and the CLI client.

pub mod frame;
pub mod liveness;
pub mod reply;

pub use frame::{
    frames, to_wire, ByteStream, FrameSplitter, FrameStream, FRAME_DELIMITER, MAX_FRAME_BYTES,
};
pub use liveness::{data_payload, delta_text, is_meaningful, DONE_SENTINEL};
pub use reply::ReplyExtractor;
