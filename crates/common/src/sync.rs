// Role-independent sync step handling.
//
// Step1 carries a state vector and is answered with a Step2 diff. Step2 and
// Update carry ops that are merged into the document; when any of them were
// new to this replica the payload is handed back for fan-out as an Update.

use thiserror::Error;

use crate::crdt::{DocError, GraphDoc};
use crate::protocol::{Frame, MessageType};

#[derive(Debug, Error, PartialEq, Eq)]
pub enum SyncError {
    #[error(transparent)]
    Doc(#[from] DocError),
}

/// What a replica should do after handling one frame.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SyncOutcome {
    /// Frame to send back to the sender.
    pub reply: Option<Frame>,
    /// Frame to fan out to every other peer.
    pub broadcast: Option<Frame>,
    /// The visible graph changed.
    pub changed: bool,
}

pub struct SyncHandler;

impl SyncHandler {
    /// This replica's Step1.
    pub fn step1(doc: &GraphDoc) -> Frame {
        Frame::sync_step1(doc.state_vector().encode())
    }

    pub fn handle(doc: &mut GraphDoc, frame: &Frame) -> Result<SyncOutcome, SyncError> {
        match frame.kind {
            MessageType::SyncStep1 => {
                let diff = doc.diff_encoded(&frame.payload)?;
                Ok(SyncOutcome { reply: Some(Frame::sync_step2(diff)), ..SyncOutcome::default() })
            }
            MessageType::SyncStep2 | MessageType::Update => {
                let applied = doc.apply_remote_update(&frame.payload)?;
                Ok(SyncOutcome {
                    reply: None,
                    broadcast: (applied.fresh > 0).then(|| Frame::update(frame.payload.clone())),
                    changed: applied.changed,
                })
            }
            MessageType::Awareness => Ok(SyncOutcome::default()),
        }
    }
}
