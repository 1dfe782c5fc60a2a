use primitives_shared::{RegisteredSealProof, SectorNumber};
use tokio::sync::mpsc::{unbounded_channel, UnboundedReceiver, UnboundedSender};

use crate::types::Piece;

/// Events this pipeline feeds into the per-sector state machine.
#[derive(Debug, Clone, PartialEq)]
pub enum SectorEvent {
    /// A new deal sector was allocated and should start its lifecycle.
    Start {
        id: SectorNumber,
        sector_type: RegisteredSealProof,
    },
    /// Pieces were assigned to the sector and wait to be written.
    AddPiece,
    /// The assigned pieces (data and padding) were written.
    PieceAdded { new_pieces: Vec<Piece> },
    /// Writing an assigned piece failed; no recovery is attempted here.
    AddPieceFailed { error: String },
    /// Stop waiting for deals and seal what the sector holds.
    StartPacking,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
#[error("sector event bus is closed")]
pub struct EventsClosed;

/// Where the pipeline posts sector events. Dispatch must be queued — a sink
/// implementation may never call back into the pipeline synchronously.
pub trait SectorEventSink: Send + Sync {
    fn send(&self, sector: SectorNumber, event: SectorEvent) -> Result<(), EventsClosed>;
}

/// The shipped sink: an unbounded queue the embedding state machine drains,
/// demultiplexing by sector number.
pub struct EventQueue {
    sender: UnboundedSender<(SectorNumber, SectorEvent)>,
}

impl EventQueue {
    pub fn new() -> (Self, UnboundedReceiver<(SectorNumber, SectorEvent)>) {
        let (sender, receiver) = unbounded_channel();
        (Self { sender }, receiver)
    }
}

impl SectorEventSink for EventQueue {
    fn send(&self, sector: SectorNumber, event: SectorEvent) -> Result<(), EventsClosed> {
        self.sender.send((sector, event)).map_err(|_| EventsClosed)
    }
}
