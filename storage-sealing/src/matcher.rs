use std::{
    collections::{HashMap, HashSet},
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc, OnceLock,
    },
    time::{Duration, SystemTime, UNIX_EPOCH},
};

use cid::Cid;
use primitives_shared::{
    required_padding, ActorId, PaddedPieceSize, RegisteredSealProof, SectorId, SectorNumber,
    SectorSize, UnpaddedPieceSize, UnpaddedPieceSizeError,
};
use tokio::{sync::oneshot, sync::Mutex, task::AbortHandle};
use tokio_util::sync::CancellationToken;

use crate::{
    chain::{ApiError, PieceData, SealerApi, SealerError, SectorNumberCounter, ZeroReader},
    config::{ConfigError, GetSealingConfig},
    events::{EventsClosed, SectorEvent, SectorEventSink},
    stats::SectorStats,
    types::{ConversionError, DealInfo, Piece, SectorInfo, SectorRef, SectorState},
};

#[derive(Debug, thiserror::Error)]
pub enum MatcherError {
    #[error("cannot allocate unpadded piece: {0}")]
    InvalidPieceSize(#[from] UnpaddedPieceSizeError),
    #[error("piece cannot fit into a sector")]
    PieceTooLarge,
    #[error("getting proposal CID: {0}")]
    ProposalCid(#[from] ConversionError),
    #[error("piece for deal {0} already pending")]
    DuplicatePiece(Cid),
    #[error("too many deals assigned to sector {sector}, dropping deal")]
    TooManyDeals { sector: SectorNumber },
    #[error("piece {piece} assigned to sector {sector} with not enough space")]
    NotEnoughSpace { piece: Cid, sector: SectorNumber },
    #[error("piece {piece} assigned to sector {sector} not found")]
    AssignedPieceMissing { piece: Cid, sector: SectorNumber },
    #[error("writing padding piece: {0}")]
    WritePadding(#[source] SealerError),
    #[error("writing piece: {0}")]
    WritePiece(#[source] SealerError),
    #[error("initializing sector: {0}")]
    NewSector(#[source] SealerError),
    #[error(transparent)]
    Config(#[from] ConfigError),
    #[error(transparent)]
    Api(#[from] ApiError),
    #[error(transparent)]
    Events(#[from] EventsClosed),
    #[error("wait cancelled")]
    Cancelled,
    #[error("pipeline closed before the piece was handled")]
    PipelineClosed,
}

type PieceAccepted = Result<(SectorNumber, UnpaddedPieceSize), MatcherError>;

/// Hook invoked when a sector's piece writes failed; the embedding state
/// machine may attach a recovery policy here.
pub type AddPieceFailureHook = Box<dyn Fn(&SectorInfo) + Send + Sync>;

struct PendingPiece {
    size: UnpaddedPieceSize,
    deal: DealInfo,
    data: Option<PieceData>,
    assigned: bool,
    accepted: Option<oneshot::Sender<PieceAccepted>>,
}

impl PendingPiece {
    fn accept(mut self, sector_number: SectorNumber, offset: UnpaddedPieceSize) {
        if let Some(accepted) = self.accepted.take() {
            let _ = accepted.send(Ok((sector_number, offset)));
        }
    }

    fn fail(mut self, error: MatcherError) {
        if let Some(accepted) = self.accepted.take() {
            let _ = accepted.send(Err(error));
        }
    }
}

/// A sector in the deal-accepting state, still taking pieces.
struct OpenSector {
    used: UnpaddedPieceSize,
}

/// A scheduled "start packing" deadline. `stop` reports whether the timer
/// was still pending — `false` means it already fired and the packing event
/// was (or is being) dispatched.
struct PackingTimer {
    fired: Arc<AtomicBool>,
    handle: AbortHandle,
}

impl PackingTimer {
    fn stop(&self) -> bool {
        if self.fired.load(Ordering::SeqCst) {
            return false;
        }
        self.handle.abort();
        true
    }
}

#[derive(Default)]
struct MatcherState {
    pending_pieces: HashMap<Cid, PendingPiece>,
    open_sectors: HashMap<SectorId, OpenSector>,
    assigned_pieces: HashMap<SectorId, Vec<Cid>>,
    sector_timers: HashMap<SectorId, PackingTimer>,
    /// At most one new sector may be under creation at once; cleared by the
    /// first wait-deals callback of the created sector.
    creating: Option<SectorNumber>,
}

struct Inner {
    miner_id: ActorId,
    seal_proof: RegisteredSealProof,
    sealer: Arc<dyn SealerApi>,
    counter: Arc<dyn SectorNumberCounter>,
    events: Arc<dyn SectorEventSink>,
    get_config: GetSealingConfig,
    stats: Arc<SectorStats>,
    failure_hook: OnceLock<AddPieceFailureHook>,

    state: Mutex<MatcherState>,
}

/// Binds incoming deal pieces to open sectors with minimal padding waste,
/// allocates new sectors on demand under the configured caps, and decides
/// when a waiting sector starts packing.
#[derive(Clone)]
pub struct PieceMatcher {
    inner: Arc<Inner>,
}

impl PieceMatcher {
    pub fn new(
        miner_id: ActorId,
        seal_proof: RegisteredSealProof,
        sealer: Arc<dyn SealerApi>,
        counter: Arc<dyn SectorNumberCounter>,
        events: Arc<dyn SectorEventSink>,
        get_config: GetSealingConfig,
        stats: Arc<SectorStats>,
    ) -> Self {
        Self {
            inner: Arc::new(Inner {
                miner_id,
                seal_proof,
                sealer,
                counter,
                events,
                get_config,
                stats,
                failure_hook: OnceLock::new(),
                state: Mutex::new(MatcherState::default()),
            }),
        }
    }

    /// Attaches the piece-write failure policy. Only the first hook sticks.
    pub fn set_add_piece_failure_hook(&self, hook: AddPieceFailureHook) {
        let _ = self.inner.failure_hook.set(hook);
    }

    /// Takes a deal piece and parks until some sector accepted (or
    /// rejected) it. Returns the sector and the piece's padded offset in it.
    pub async fn add_piece_to_any_sector(
        &self,
        token: &CancellationToken,
        size: u64,
        data: PieceData,
        deal: DealInfo,
    ) -> Result<(SectorNumber, PaddedPieceSize), MatcherError> {
        tracing::info!(deal = deal.deal_id, publish = ?deal.publish_cid, "adding piece for deal");

        let size = UnpaddedPieceSize::new(size)?;

        if size > sector_capacity(self.inner.seal_proof.sector_size()) {
            return Err(MatcherError::PieceTooLarge);
        }

        let proposal_cid = deal.proposal_cid()?;

        let (accepted_tx, accepted_rx) = oneshot::channel();

        {
            let mut state = self.inner.state.lock().await;

            if state.pending_pieces.contains_key(&proposal_cid) {
                return Err(MatcherError::DuplicatePiece(proposal_cid));
            }

            state.pending_pieces.insert(
                proposal_cid,
                PendingPiece {
                    size,
                    deal,
                    data: Some(data),
                    assigned: false,
                    accepted: Some(accepted_tx),
                },
            );
        }

        let inner = self.inner.clone();
        tokio::spawn(async move {
            let mut state = inner.state.lock().await;
            inner.match_pending(&mut state).await;
        });

        let res = tokio::select! {
            res = accepted_rx => res.map_err(|_| MatcherError::PipelineClosed)?,
            _ = token.cancelled() => return Err(MatcherError::Cancelled),
        };

        res.map(|(sector_number, offset)| (sector_number, offset.padded()))
    }

    /// Manually forces a waiting sector into packing.
    pub fn start_packing(&self, sector_number: SectorNumber) -> Result<(), MatcherError> {
        tracing::info!(sector = %sector_number, trigger = "user", "starting to seal deal sector");
        self.inner
            .events
            .send(sector_number, SectorEvent::StartPacking)
            .map_err(Into::into)
    }

    /// State-machine callback: the sector entered the deal-accepting state.
    pub async fn handle_wait_deals(&self, sector: &SectorInfo) -> Result<(), MatcherError> {
        let inner = &self.inner;
        let used: UnpaddedPieceSize = sector
            .pieces
            .iter()
            .map(|piece| piece.info.size.unpadded())
            .sum();

        let mut state = inner.state.lock().await;

        if state.creating == Some(sector.sector_number) {
            state.creating = None;
        }

        let sid = inner.miner_sector_id(sector.sector_number);

        if state
            .assigned_pieces
            .get(&sid)
            .is_some_and(|assigned| !assigned.is_empty())
        {
            drop(state);
            // got assigned more pieces in the AddPiece state
            return inner
                .events
                .send(sector.sector_number, SectorEvent::AddPiece)
                .map_err(Into::into);
        }

        match Inner::maybe_start_sealing(inner, &mut state, sector, used) {
            Ok(true) => {
                state.open_sectors.remove(&sid);
                return Ok(());
            }
            Err(err) => {
                state.open_sectors.remove(&sid);
                return Err(err);
            }
            Ok(false) => {}
        }

        state.open_sectors.entry(sid).or_insert(OpenSector { used });

        inner.match_pending(&mut state).await;

        Ok(())
    }

    /// State-machine callback: write the sector's assigned pieces, data and
    /// padding interleaved, through the sealing layer.
    pub async fn handle_add_piece(&self, sector: &SectorInfo) -> Result<(), MatcherError> {
        let inner = &self.inner;
        let ssize = sector.sector_type.sector_size();
        let sid = inner.miner_sector_id(sector.sector_number);

        let pending = { inner.state.lock().await.assigned_pieces.remove(&sid) };
        let Some(pending) = pending else {
            // nothing to do here (may happen after a restart mid-AddPiece)
            return inner
                .events
                .send(
                    sector.sector_number,
                    SectorEvent::PieceAdded {
                        new_pieces: Vec::new(),
                    },
                )
                .map_err(Into::into);
        };

        let mut offset: UnpaddedPieceSize = sector
            .pieces
            .iter()
            .map(|piece| piece.info.size.unpadded())
            .sum();
        let mut piece_sizes = sector.existing_piece_sizes();

        let max_deals = ssize.max_deal_count();
        let existing_deals = sector.deal_ids().len();
        let mut new_pieces: Vec<Piece> = Vec::new();

        for (i, proposal_cid) in pending.iter().enumerate() {
            let taken = { inner.state.lock().await.pending_pieces.remove(proposal_cid) };
            let Some(mut deal) = taken else {
                return Err(MatcherError::AssignedPieceMissing {
                    piece: *proposal_cid,
                    sector: sector.sector_number,
                });
            };

            if existing_deals + i + 1 > max_deals {
                deal.fail(MatcherError::TooManyDeals {
                    sector: sector.sector_number,
                });
                continue;
            }

            let (pads, pad_length) = required_padding(offset.padded(), deal.size.padded());

            if *offset.padded() + *pad_length + *deal.size.padded() > ssize.bytes() {
                deal.fail(MatcherError::NotEnoughSpace {
                    piece: *proposal_cid,
                    sector: sector.sector_number,
                });
                continue;
            }

            offset += pad_length.unpadded();

            let sector_ref =
                SectorRef::new(inner.miner_id, sector.sector_number, sector.sector_type);

            let mut pad_failure = None;
            for pad in pads {
                let pad_size = pad.unpadded();
                match inner
                    .sealer
                    .add_piece(
                        sector_ref,
                        &piece_sizes,
                        pad_size,
                        Box::new(ZeroReader::new(pad_size)),
                    )
                    .await
                {
                    Ok(info) => {
                        piece_sizes.push(pad_size);
                        new_pieces.push(Piece { info, deal: None });
                    }
                    Err(err) => {
                        pad_failure = Some(err);
                        break;
                    }
                }
            }
            if let Some(err) = pad_failure {
                return self.fail_piece_write(sector, deal, MatcherError::WritePadding(err));
            }

            let size = deal.size;
            let data = deal
                .data
                .take()
                .expect("pending piece data is only taken once");

            match inner
                .sealer
                .add_piece(sector_ref, &piece_sizes, size, data)
                .await
            {
                Ok(info) => {
                    tracing::info!(
                        deal = deal.deal.deal_id,
                        sector = %sector.sector_number,
                        piece = %info.cid,
                        "deal added to a sector"
                    );

                    let deal_info = deal.deal.clone();
                    deal.accept(sector.sector_number, offset);

                    offset += size;
                    piece_sizes.push(size);
                    new_pieces.push(Piece {
                        info,
                        deal: Some(deal_info),
                    });
                }
                Err(err) => {
                    return self.fail_piece_write(sector, deal, MatcherError::WritePiece(err));
                }
            }
        }

        inner
            .events
            .send(sector.sector_number, SectorEvent::PieceAdded { new_pieces })
            .map_err(Into::into)
    }

    /// State-machine callback for the failed-write state. Defers to the
    /// attached policy; without one there is no recovery.
    pub fn handle_add_piece_failed(&self, sector: &SectorInfo) {
        if let Some(hook) = self.inner.failure_hook.get() {
            hook(sector);
            return;
        }
        tracing::error!(
            sector = %sector.sector_number,
            "no recovery plan for a failed piece write"
        );
    }

    fn fail_piece_write(
        &self,
        sector: &SectorInfo,
        deal: PendingPiece,
        error: MatcherError,
    ) -> Result<(), MatcherError> {
        let message = error.to_string();
        deal.fail(error);
        self.inner
            .events
            .send(
                sector.sector_number,
                SectorEvent::AddPieceFailed { error: message },
            )
            .map_err(Into::into)
    }
}

impl Inner {
    fn miner_sector_id(&self, sector_number: SectorNumber) -> SectorId {
        SectorId {
            miner: self.miner_id,
            number: sector_number,
        }
    }

    /// Decides whether a wait-deals sector seals now. When it stays open
    /// and has a creation time, (re)arms the packing timer.
    fn maybe_start_sealing(
        inner: &Arc<Inner>,
        state: &mut MatcherState,
        sector: &SectorInfo,
        used: UnpaddedPieceSize,
    ) -> Result<bool, MatcherError> {
        let sid = inner.miner_sector_id(sector.sector_number);

        if let Some(timer) = state.sector_timers.get(&sid) {
            if !timer.stop() {
                // The timer expired and StartPacking was (or is being)
                // dispatched; send another in case the first raced an
                // AddPiece round.
                tracing::info!(
                    sector = %sector.sector_number,
                    trigger = "wait-timeout",
                    "starting to seal deal sector"
                );
                inner
                    .events
                    .send(sector.sector_number, SectorEvent::StartPacking)?;
                return Ok(true);
            }
        }

        let ssize = sector.sector_type.sector_size();

        if sector.deal_ids().len() >= ssize.max_deal_count() {
            // can't accept more deals
            tracing::info!(
                sector = %sector.sector_number,
                trigger = "maxdeals",
                "starting to seal deal sector"
            );
            inner
                .events
                .send(sector.sector_number, SectorEvent::StartPacking)?;
            return Ok(true);
        }

        if used.padded() == sector_capacity_padded(ssize) {
            // sector full
            tracing::info!(
                sector = %sector.sector_number,
                trigger = "filled",
                "starting to seal deal sector"
            );
            inner
                .events
                .send(sector.sector_number, SectorEvent::StartPacking)?;
            return Ok(true);
        }

        if sector.creation_time != 0 {
            let cfg = (inner.get_config)()?;

            let seal_time =
                UNIX_EPOCH + Duration::from_secs(sector.creation_time) + cfg.wait_deals_delay;
            let now = SystemTime::now();

            if now >= seal_time {
                tracing::info!(
                    sector = %sector.sector_number,
                    trigger = "wait-timeout",
                    "starting to seal deal sector"
                );
                inner
                    .events
                    .send(sector.sector_number, SectorEvent::StartPacking)?;
                return Ok(true);
            }

            let delay = seal_time
                .duration_since(now)
                .unwrap_or(Duration::from_secs(0));
            let timer = Inner::arm_packing_timer(inner, sector.sector_number, delay);
            state.sector_timers.insert(sid, timer);
        }

        Ok(false)
    }

    fn arm_packing_timer(
        inner: &Arc<Inner>,
        sector_number: SectorNumber,
        delay: Duration,
    ) -> PackingTimer {
        let fired = Arc::new(AtomicBool::new(false));

        let task_fired = fired.clone();
        let task_inner = inner.clone();
        let handle = tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            task_fired.store(true, Ordering::SeqCst);

            tracing::info!(
                sector = %sector_number,
                trigger = "wait-timer",
                "starting to seal deal sector"
            );

            {
                let mut state = task_inner.state.lock().await;
                let sid = task_inner.miner_sector_id(sector_number);
                state.open_sectors.remove(&sid);
                state.sector_timers.remove(&sid);
            }

            if let Err(err) = task_inner
                .events
                .send(sector_number, SectorEvent::StartPacking)
            {
                tracing::error!(sector = %sector_number, %err, "sending packing event failed");
            }
        })
        .abort_handle();

        PackingTimer { fired, handle }
    }

    /// One matching pass over the pending pieces and open sectors: pair
    /// them up, preferring less padding waste, then bigger pieces, then
    /// older sectors. Unassignable pieces may get a fresh sector.
    async fn match_pending(&self, state: &mut MatcherState) {
        let capacity = sector_capacity(self.seal_proof.sector_size());

        struct Candidate {
            sector: SectorId,
            deal: Cid,
            size: UnpaddedPieceSize,
            padding: UnpaddedPieceSize,
        }

        // O(pending × open); both sides stay small in practice.
        let mut matches = Vec::new();
        let mut to_assign: HashSet<Cid> = HashSet::new();

        for (proposal_cid, piece) in &state.pending_pieces {
            if piece.assigned {
                continue;
            }

            to_assign.insert(*proposal_cid);

            for (id, sector) in &state.open_sectors {
                let avail = capacity - sector.used;

                // Room for the piece is also room for its inter-piece padding.
                if piece.size <= avail {
                    matches.push(Candidate {
                        sector: *id,
                        deal: *proposal_cid,
                        size: piece.size,
                        padding: avail % piece.size,
                    });
                }
            }
        }

        matches.sort_by(|a, b| {
            a.padding
                .cmp(&b.padding)
                .then_with(|| b.size.cmp(&a.size))
                .then_with(|| a.sector.number.cmp(&b.sector.number))
                .then_with(|| a.deal.cmp(&b.deal))
        });

        for candidate in matches {
            if state
                .pending_pieces
                .get(&candidate.deal)
                .map_or(true, |piece| piece.assigned)
            {
                continue;
            }

            let Some(open) = state.open_sectors.get(&candidate.sector) else {
                continue;
            };

            let avail = capacity - open.used;
            if candidate.size > avail {
                continue;
            }

            let accepted = self.accept_into(state, candidate.sector, candidate.deal);

            if let Some(open) = state.open_sectors.get_mut(&candidate.sector) {
                open.used += candidate.padding + candidate.size;
            }
            if let Some(piece) = state.pending_pieces.get_mut(&candidate.deal) {
                piece.assigned = true;
            }
            to_assign.remove(&candidate.deal);

            if let Err(err) = accepted {
                tracing::error!(
                    sector = %candidate.sector,
                    deal = %candidate.deal,
                    %err,
                    "sector rejected the deal"
                );
                if let Some(piece) = state.pending_pieces.remove(&candidate.deal) {
                    piece.fail(err.into());
                }
            }
        }

        if !to_assign.is_empty() {
            if let Err(err) = self.try_create_deal_sector(state).await {
                tracing::error!(%err, "failed to create a new sector for deals");
            }
        }
    }

    /// Moves the deal into the sector's worklist and pokes its state
    /// machine. The event bus is queued, so this never re-enters.
    fn accept_into(
        &self,
        state: &mut MatcherState,
        sector: SectorId,
        deal: Cid,
    ) -> Result<(), EventsClosed> {
        // TODO: reject deals whose start epoch is too close to be sealed in time
        state.assigned_pieces.entry(sector).or_default().push(deal);
        self.events.send(sector.number, SectorEvent::AddPiece)
    }

    async fn try_create_deal_sector(&self, state: &mut MatcherState) -> Result<(), MatcherError> {
        if state.creating.is_some() {
            return Ok(()); // new sector is being created right now
        }

        let cfg = (self.get_config)()?;

        if cfg.max_sealing_sectors_for_deals > 0
            && self.stats.cur_sealing() >= cfg.max_sealing_sectors_for_deals
        {
            return Ok(());
        }

        if cfg.max_wait_deals_sectors > 0 && self.stats.cur_staging() >= cfg.max_wait_deals_sectors
        {
            return Ok(());
        }

        let sector_number = self.create_sector().await?;
        state.creating = Some(sector_number);

        tracing::info!(
            number = %sector_number,
            kind = "deal",
            proof = ?self.seal_proof,
            "creating sector"
        );
        self.events.send(
            sector_number,
            SectorEvent::Start {
                id: sector_number,
                sector_type: self.seal_proof,
            },
        )?;

        Ok(())
    }

    async fn create_sector(&self) -> Result<SectorNumber, MatcherError> {
        let sector_number = self.counter.next().await?;

        self.sealer
            .new_sector(SectorRef::new(
                self.miner_id,
                sector_number,
                self.seal_proof,
            ))
            .await
            .map_err(MatcherError::NewSector)?;

        // Count the sector before its state machine reports in, so the
        // creation caps see it immediately.
        self.stats.update_sector(
            self.miner_sector_id(sector_number),
            SectorState::Undefined,
        );

        Ok(sector_number)
    }
}

fn sector_capacity_padded(size: SectorSize) -> PaddedPieceSize {
    PaddedPieceSize::new(size.bytes()).expect("sector sizes are valid padded sizes")
}

fn sector_capacity(size: SectorSize) -> UnpaddedPieceSize {
    sector_capacity_padded(size).unpadded()
}
