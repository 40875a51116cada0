//! Messages carried inside encrypted link frames, bincode-encoded.

use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum Message {
    /// First message from the initiator after the handshake.
    Invite { display_name: String },
    InviteAccepted { display_name: String },
    ResourceStart {
        transfer_id: u64,
        name: String,
        size: u64,
    },
    ResourceChunk { transfer_id: u64, data: Vec<u8> },
    ResourceEnd { transfer_id: u64 },
    /// Sender gave up; the receiver drops whatever it has so far.
    ResourceCancel { transfer_id: u64 },
    /// Receiver's verdict once `ResourceEnd` arrived.
    ResourceReceipt {
        transfer_id: u64,
        ok: bool,
        reason: Option<String>,
    },
}

impl Message {
    pub fn encode(&self) -> Result<Vec<u8>, bincode::Error> {
        bincode::serialize(self)
    }

    pub fn decode(bytes: &[u8]) -> Result<Self, bincode::Error> {
        bincode::deserialize(bytes)
    }

    pub fn kind(&self) -> &'static str {
        match self {
            Message::Invite { .. } => "invite",
            Message::InviteAccepted { .. } => "invite-accepted",
            Message::ResourceStart { .. } => "resource-start",
            Message::ResourceChunk { .. } => "resource-chunk",
            Message::ResourceEnd { .. } => "resource-end",
            Message::ResourceCancel { .. } => "resource-cancel",
            Message::ResourceReceipt { .. } => "resource-receipt",
        }
    }
}
