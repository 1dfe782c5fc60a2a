use std::{collections::HashMap, sync::Arc};

use primitives_shared::{ActorId, ChainEpoch, Currency, SectorId, SectorNumber};
use tokio::{
    sync::{mpsc, oneshot, Mutex},
    task::JoinHandle,
    time::{sleep_until, Duration, Instant},
};
use tokio_util::sync::CancellationToken;

use crate::{
    chain::{AddressSelector, AddressUse, MessageUid, PreCommitBatcherApi},
    config::{
        ConfigError, FeeConfig, GetSealingConfig, NetworkParams, SealingConfig,
        MAX_PRECOMMIT_RANDOMNESS_LOOKBACK,
    },
    params::{PreCommitSectorBatchParams, SectorPreCommitInfo, PRE_COMMIT_SECTOR_BATCH},
    types::{Address, SectorInfo},
};

#[derive(Debug, thiserror::Error)]
pub enum BatcherError {
    #[error(transparent)]
    Config(#[from] ConfigError),
    #[error(transparent)]
    Api(#[from] crate::chain::ApiError),
    #[error("serializing batch params: {0}")]
    Params(#[from] fvm_ipld_encoding::Error),
    #[error("wait cancelled")]
    Cancelled,
    #[error("batcher stopped")]
    Stopped,
}

/// Outcome of one batched pre-commit submission. Every caller whose sector
/// the batch contained receives a copy; `error` is set when the whole batch
/// failed to go out.
#[derive(Debug, Clone, Default)]
pub struct PreCommitBatchRes {
    pub sectors: Vec<SectorNumber>,
    pub msg: Option<MessageUid>,
    pub error: Option<String>,
}

struct PreCommitEntry {
    deposit: Currency,
    info: SectorPreCommitInfo,
}

#[derive(Default)]
struct BatcherState {
    todo: HashMap<SectorNumber, PreCommitEntry>,
    cutoffs: HashMap<SectorNumber, Instant>,
    waiting: HashMap<SectorNumber, Vec<oneshot::Sender<PreCommitBatchRes>>>,
}

struct Inner {
    api: Arc<dyn PreCommitBatcherApi>,
    maddr: Address,
    miner_id: ActorId,
    addr_sel: Arc<dyn AddressSelector>,
    fee_cfg: FeeConfig,
    get_config: GetSealingConfig,
    network: NetworkParams,

    state: Mutex<BatcherState>,
}

/// Coalesces per-sector pre-commits into one batched on-chain message,
/// trading gas against each sector's pre-commit cutoff.
pub struct PreCommitBatcher {
    inner: Arc<Inner>,

    notify: mpsc::Sender<()>,
    force: mpsc::Sender<oneshot::Sender<Vec<PreCommitBatchRes>>>,
    stop: CancellationToken,
    handle: std::sync::Mutex<Option<JoinHandle<()>>>,
}

impl PreCommitBatcher {
    /// Creates the batcher and spawns its background loop on the current
    /// runtime. Call [`PreCommitBatcher::stop`] to shut it down.
    pub fn new(
        api: Arc<dyn PreCommitBatcherApi>,
        maddr: Address,
        miner_id: ActorId,
        addr_sel: Arc<dyn AddressSelector>,
        fee_cfg: FeeConfig,
        get_config: GetSealingConfig,
        network: NetworkParams,
    ) -> Self {
        let (notify, notify_rx) = mpsc::channel(1);
        let (force, force_rx) = mpsc::channel(1);
        let stop = CancellationToken::new();

        let inner = Arc::new(Inner {
            api,
            maddr,
            miner_id,
            addr_sel,
            fee_cfg,
            get_config,
            network,
            state: Mutex::new(BatcherState::default()),
        });

        let handle = tokio::spawn(Inner::run(
            inner.clone(),
            notify_rx,
            force_rx,
            stop.clone(),
        ));

        Self {
            inner,
            notify,
            force,
            stop,
            handle: std::sync::Mutex::new(Some(handle)),
        }
    }

    /// Queues a pre-commit and parks until the batch carrying it was
    /// submitted (or failed to). Returns that batch's result.
    pub async fn add_pre_commit(
        &self,
        token: &CancellationToken,
        sector: &SectorInfo,
        deposit: Currency,
        info: SectorPreCommitInfo,
    ) -> Result<PreCommitBatchRes, BatcherError> {
        let cur_epoch = self.inner.api.chain_head().await.map_err(|err| {
            tracing::error!(%err, "getting chain head");
            err
        })?;

        let sector_number = sector.sector_number;
        let (sent_tx, sent_rx) = oneshot::channel();

        {
            let mut state = self.inner.state.lock().await;
            state.cutoffs.insert(
                sector_number,
                pre_commit_cutoff(cur_epoch, sector, self.inner.network.block_delay_secs),
            );
            state
                .todo
                .insert(sector_number, PreCommitEntry { deposit, info });
            state
                .waiting
                .entry(sector_number)
                .or_default()
                .push(sent_tx);
        }

        // A pending notification is already enough, don't need more.
        let _ = self.notify.try_send(());

        tokio::select! {
            res = sent_rx => res.map_err(|_| BatcherError::Stopped),
            _ = token.cancelled() => Err(BatcherError::Cancelled),
        }
    }

    /// Forces a batch pass now and returns its results (empty when the
    /// queue was empty).
    pub async fn flush(
        &self,
        token: &CancellationToken,
    ) -> Result<Vec<PreCommitBatchRes>, BatcherError> {
        let (res_tx, res_rx) = oneshot::channel();

        tokio::select! {
            sent = self.force.send(res_tx) => {
                sent.map_err(|_| BatcherError::Stopped)?;
                tokio::select! {
                    res = res_rx => res.map_err(|_| BatcherError::Stopped),
                    _ = token.cancelled() => Err(BatcherError::Cancelled),
                }
            }
            _ = token.cancelled() => Err(BatcherError::Cancelled),
        }
    }

    /// The sectors currently queued, sorted ascending.
    pub async fn pending(&self) -> Vec<SectorId> {
        let state = self.inner.state.lock().await;

        let mut pending: Vec<SectorId> = state
            .todo
            .values()
            .map(|entry| SectorId {
                miner: self.inner.miner_id,
                number: entry.info.sector_number,
            })
            .collect();
        pending.sort();

        pending
    }

    /// Shuts the background loop down and waits for it to finish.
    pub async fn stop(&self, token: &CancellationToken) -> Result<(), BatcherError> {
        self.stop.cancel();

        let handle = self
            .handle
            .lock()
            .expect("batcher handle lock poisoned")
            .take();
        let Some(handle) = handle else {
            return Ok(());
        };

        tokio::select! {
            _ = handle => Ok(()),
            _ = token.cancelled() => Err(BatcherError::Cancelled),
        }
    }
}

impl Inner {
    async fn run(
        inner: Arc<Inner>,
        mut notify_rx: mpsc::Receiver<()>,
        mut force_rx: mpsc::Receiver<oneshot::Sender<Vec<PreCommitBatchRes>>>,
        stop: CancellationToken,
    ) {
        // Without a config there is no batching behavior to run at all.
        let cfg = (inner.get_config)().expect("loading sealing config");

        loop {
            let deadline = Instant::now()
                + inner
                    .batch_wait(cfg.pre_commit_batch_wait, cfg.pre_commit_batch_slack)
                    .await;

            let mut send_above_max = false;
            let mut force_res = None;

            tokio::select! {
                _ = stop.cancelled() => return,
                Some(()) = notify_rx.recv() => send_above_max = true,
                _ = sleep_until(deadline) => {}
                Some(res_tx) = force_rx.recv() => force_res = Some(res_tx),
            }

            let res = match inner.maybe_start_batch(send_above_max).await {
                Ok(res) => res,
                Err(err) => {
                    tracing::warn!(%err, "processing pre-commit batch failed");
                    Vec::new()
                }
            };

            if let Some(res_tx) = force_res {
                let _ = res_tx.send(res);
            }
        }
    }

    /// How long the loop may sleep before the earliest queued cutoff (less
    /// slack) is at risk. Always positive, never above `max_wait`.
    async fn batch_wait(&self, max_wait: Duration, slack: Duration) -> Duration {
        let state = self.state.lock().await;

        if state.todo.is_empty() {
            return max_wait;
        }

        let mut cutoff: Option<Instant> = None;
        for sector_number in state.todo.keys().chain(state.waiting.keys()) {
            if let Some(sector_cutoff) = state.cutoffs.get(sector_number) {
                if cutoff.map_or(true, |current| *sector_cutoff < current) {
                    cutoff = Some(*sector_cutoff);
                }
            }
        }

        let Some(cutoff) = cutoff else {
            return max_wait;
        };

        let now = Instant::now();
        match cutoff.checked_sub(slack) {
            // Zero would disable the timer.
            None => Duration::from_nanos(1),
            Some(deadline) if deadline <= now => Duration::from_nanos(1),
            Some(deadline) => (deadline - now).min(max_wait),
        }
    }

    async fn maybe_start_batch(
        &self,
        notif: bool,
    ) -> Result<Vec<PreCommitBatchRes>, BatcherError> {
        let total = self.state.lock().await.todo.len();
        if total == 0 {
            return Ok(Vec::new());
        }

        let cfg = (self.get_config)()?;

        if notif && total < cfg.max_pre_commit_batch {
            return Ok(Vec::new());
        }

        // TODO(batching): support multiple batches per pass
        let (mut results, err) = self.process_batch(&cfg).await;
        if results.is_empty() {
            return match err {
                Some(err) => Err(err),
                None => Ok(Vec::new()),
            };
        }

        if let Some(err) = &err {
            tracing::warn!(%err, "pre-commit batch failed, notifying waiters");
            for res in &mut results {
                res.error = Some(err.to_string());
            }
        }

        let mut state = self.state.lock().await;
        for res in &results {
            for sector_number in &res.sectors {
                if let Some(waiters) = state.waiting.remove(sector_number) {
                    for waiter in waiters {
                        let _ = waiter.send(res.clone());
                    }
                }
                state.todo.remove(sector_number);
                state.cutoffs.remove(sector_number);
            }
        }

        Ok(results)
    }

    /// Builds and submits one batch of up to `max_pre_commit_batch` queued
    /// entries (whichever ones map iteration yields). Queue cleanup is the
    /// caller's — entries stay in `todo` until their results are delivered.
    async fn process_batch(
        &self,
        cfg: &SealingConfig,
    ) -> (Vec<PreCommitBatchRes>, Option<BatcherError>) {
        let mut res = PreCommitBatchRes::default();
        let mut params = PreCommitSectorBatchParams {
            sectors: Vec::new(),
        };
        let mut deposit: Currency = 0;

        {
            let state = self.state.lock().await;
            for entry in state.todo.values() {
                if params.sectors.len() >= cfg.max_pre_commit_batch {
                    tracing::info!("pre-commit batch full");
                    break;
                }

                res.sectors.push(entry.info.sector_number);
                params.sectors.push(entry.info.clone());
                deposit += entry.deposit;
            }
        }

        let enc = match fvm_ipld_encoding::to_vec(&params) {
            Ok(enc) => enc,
            Err(err) => return (vec![res], Some(err.into())),
        };

        let miner_info = match self.api.state_miner_info(&self.maddr).await {
            Ok(miner_info) => miner_info,
            Err(err) => return (vec![res], Some(err.into())),
        };

        let max_fee = self
            .fee_cfg
            .max_pre_commit_batch_gas_fee
            .fee_for_sectors(params.sectors.len());
        let good_funds = deposit + max_fee;

        let from = match self
            .addr_sel
            .address_for(AddressUse::PreCommit, &miner_info, good_funds, deposit)
            .await
        {
            Ok(from) => from,
            Err(err) => return (vec![res], Some(err.into())),
        };

        let uid = match self
            .api
            .send_msg(
                &from,
                &self.maddr,
                PRE_COMMIT_SECTOR_BATCH,
                deposit,
                max_fee,
                &enc,
            )
            .await
        {
            Ok(uid) => uid,
            Err(err) => return (vec![res], Some(err.into())),
        };

        tracing::info!(
            uid = %uid,
            from = %from,
            sectors = res.sectors.len(),
            "sent batched pre-commit message"
        );
        res.msg = Some(uid);

        (vec![res], None)
    }
}

/// When the pre-commit message must be on-chain: the ticket ages out after
/// [`MAX_PRECOMMIT_RANDOMNESS_LOOKBACK`] epochs, and no deal may start
/// before its sector is committed.
fn pre_commit_cutoff(cur_epoch: ChainEpoch, sector: &SectorInfo, block_delay_secs: u64) -> Instant {
    let mut cutoff_epoch = sector.ticket_epoch + MAX_PRECOMMIT_RANDOMNESS_LOOKBACK;

    for piece in &sector.pieces {
        let Some(deal) = &piece.deal else {
            continue;
        };

        if deal.schedule.start_epoch < cutoff_epoch {
            cutoff_epoch = deal.schedule.start_epoch;
        }
    }

    if cutoff_epoch <= cur_epoch {
        return Instant::now();
    }

    Instant::now() + Duration::from_secs((cutoff_epoch - cur_epoch) * block_delay_secs)
}
