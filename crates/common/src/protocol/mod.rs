pub mod frame;

pub use frame::{Frame, FrameError, MessageType};
