//! The engine serializes every transition through one lock and runs mining
//! as cancellable tokio tasks that report back through the same entry point.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::config::EngineConfig;
use crate::error::{EngineError, MineError};
use crate::mine;
use crate::state::{Action, ChainState};
use crate::{Block, HexDigest, Payload};

#[derive(Clone)]
pub struct Engine {
    state: Arc<Mutex<ChainState>>,
    // cancellation tokens of spawned searches, by run id
    runs: Arc<Mutex<HashMap<u64, CancellationToken>>>,
    config: EngineConfig,
}

impl Default for Engine {
    fn default() -> Self {
        Self::new(EngineConfig::default())
    }
}

impl Engine {
    pub fn new(config: EngineConfig) -> Self {
        let state = ChainState::new(&config);
        Self::with_state(config, state)
    }

    /// Start from a prepared state instead of a fresh genesis.
    pub fn with_state(config: EngineConfig, state: ChainState) -> Self {
        Self {
            state: Arc::new(Mutex::new(state)),
            runs: Arc::new(Mutex::new(HashMap::new())),
            config,
        }
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    fn lock(&self) -> MutexGuard<'_, ChainState> {
        // transitions never leave the state half-written, so a poisoned lock is still usable
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Apply one action. On `Err` the state is unchanged.
    pub fn dispatch(&self, action: Action) -> Result<(), EngineError> {
        let mut state = self.lock();
        let result = state.apply(action);
        self.cancel_orphaned_runs(&state);
        result
    }

    /// Cancel every spawned search whose block the state no longer tracks
    /// as mining under that run (finished, edited, moved or reset away).
    fn cancel_orphaned_runs(&self, state: &ChainState) {
        let mut runs = self.runs.lock().unwrap_or_else(PoisonError::into_inner);
        runs.retain(|run, token| {
            let live = state.is_live_run(*run);
            if !live {
                token.cancel();
            }
            live
        });
    }

    fn dispatch_total(&self, action: Action) {
        if let Err(e) = self.dispatch(action) {
            debug!("action ignored: {e}");
        }
    }

    /// Read-only copy of the current state.
    pub fn snapshot(&self) -> ChainState {
        self.lock().clone()
    }

    pub fn append(&self, payload: impl Into<Payload>) {
        self.dispatch_total(Action::Append {
            payload: payload.into(),
        });
    }

    pub fn set_difficulty(&self, difficulty: u32) {
        self.dispatch_total(Action::SetDifficulty { difficulty });
    }

    pub fn select(&self, index: Option<usize>) {
        self.dispatch_total(Action::SelectBlock { index });
    }

    pub fn update_data(&self, index: usize, payload: impl Into<Payload>) -> Result<(), EngineError> {
        self.dispatch(Action::UpdateBlockData {
            index,
            payload: payload.into(),
        })
    }

    pub fn reorder(&self, from: usize, to: usize) -> Result<(), EngineError> {
        self.dispatch(Action::ReorderBlocks { from, to })
    }

    pub fn revalidate(&self) {
        self.dispatch_total(Action::Revalidate);
    }

    pub fn reset(&self) {
        self.dispatch_total(Action::Reset);
    }

    pub fn report_progress(&self, index: usize, run: u64, nonce: u64, hash: HexDigest) -> Result<(), EngineError> {
        self.dispatch(Action::ReportMiningProgress { index, run, nonce, hash })
    }

    pub fn complete_mining(&self, index: usize, run: u64, block: Block) -> Result<(), EngineError> {
        self.dispatch(Action::CompleteMining { index, run, block })
    }

    /// Mark block `index` as mining and spawn the search on the current tokio
    /// runtime. The task works on a snapshot of the block taken here; its
    /// progress and result are dispatched back into this engine under the
    /// run id assigned now. Editing, moving or resetting the block away
    /// cancels the task.
    pub fn start_mining(&self, index: usize) -> Result<MiningHandle, EngineError> {
        let runtime = tokio::runtime::Handle::try_current().map_err(|_| EngineError::NoRuntime)?;
        let cancel = CancellationToken::new();
        let (snapshot, run) = {
            let mut state = self.lock();
            state.apply(Action::StartMining { index })?;
            let run = state.mining_run(index).ok_or(EngineError::StaleMining(index))?;
            // registered under the state lock so no dispatch can miss it
            self.runs
                .lock()
                .unwrap_or_else(PoisonError::into_inner)
                .insert(run, cancel.clone());
            (state.blocks[index].clone(), run)
        };

        let block_id = snapshot.id;
        let batch_size = self.config.batch_size;
        let token = cancel.clone();
        let engine = self.clone();
        debug!("mining block {index} (run {run}) at difficulty {}", snapshot.difficulty);

        let join = runtime.spawn(async move {
            let result = mine::mine(snapshot, batch_size, &token, |nonce, hash| {
                engine.dispatch_total(Action::ReportMiningProgress {
                    index,
                    run,
                    nonce,
                    hash: hash.to_string(),
                });
            })
            .await;

            match &result {
                Ok(block) => {
                    if let Err(e) = engine.complete_mining(index, run, block.clone()) {
                        debug!("discarding mining result for block {index}: {e}");
                    }
                }
                Err(e) => {
                    warn!("mining block {index} stopped: {e}");
                    engine.dispatch_total(Action::CancelMining { index, run });
                }
            }
            result
        });

        Ok(MiningHandle {
            index,
            block_id,
            run,
            cancel,
            join,
        })
    }
}

/// Handle to an in-flight mining task. Dropping it lets the task run on.
#[derive(Debug)]
pub struct MiningHandle {
    index: usize,
    block_id: u64,
    run: u64,
    cancel: CancellationToken,
    join: JoinHandle<Result<Block, MineError>>,
}

impl MiningHandle {
    pub fn index(&self) -> usize {
        self.index
    }

    pub fn block_id(&self) -> u64 {
        self.block_id
    }

    /// Id of this search, unique across the engine's lifetime.
    pub fn run(&self) -> u64 {
        self.run
    }

    /// Request cancellation. Takes effect at the next batch boundary.
    pub fn cancel(&self) {
        self.cancel.cancel();
    }

    pub fn is_finished(&self) -> bool {
        self.join.is_finished()
    }

    /// Wait for the task. The mined block has already been dispatched (or
    /// discarded as stale) by the time this returns.
    pub async fn wait(self) -> Result<Block, EngineError> {
        match self.join.await {
            Ok(result) => result.map_err(EngineError::from),
            Err(_) => Err(EngineError::TaskFailed(self.index)),
        }
    }
}
