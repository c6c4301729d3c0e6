//! Chain state and its transitions.
//!
//! `ChainState` owns the ordered blocks plus the derived validity flags.
//! Every transition goes through [`ChainState::apply`]; [`reduce`] is the
//! total form that turns rejected actions into logged no-ops.

use std::collections::BTreeMap;

use serde::Serialize;
use tracing::{debug, info, warn};

use crate::config::EngineConfig;
use crate::constants::HASH_HEX_SIZE;
use crate::error::EngineError;
use crate::validate::{validate_block, validate_chain};
use crate::{Block, HexDigest, Payload};

#[derive(Clone, Debug, PartialEq)]
pub enum Action {
    Append { payload: Payload },
    StartMining { index: usize },
    ReportMiningProgress { index: usize, run: u64, nonce: u64, hash: HexDigest },
    CompleteMining { index: usize, run: u64, block: Block },
    CancelMining { index: usize, run: u64 },
    SetDifficulty { difficulty: u32 },
    SelectBlock { index: Option<usize> },
    UpdateBlockData { index: usize, payload: Payload },
    ReorderBlocks { from: usize, to: usize },
    Revalidate,
    Reset,
}

#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct ChainState {
    pub blocks: Vec<Block>,
    /// Difficulty for blocks appended from now on.
    pub difficulty: u32,
    pub is_valid_chain: bool,
    pub selected_block: Option<usize>,
    /// Latest reported nonce per block index while mining.
    pub mining_progress: BTreeMap<usize, u64>,
    /// Run id of the search each mining block belongs to. Present exactly
    /// while the block at that index is mining.
    #[serde(skip)]
    mining_runs: BTreeMap<usize, u64>,
    #[serde(skip)]
    genesis_data: String,
    #[serde(skip)]
    next_id: u64,
}

impl Default for ChainState {
    fn default() -> Self {
        Self::new(&EngineConfig::default())
    }
}

/// Apply `action`, returning the resulting state. Rejected actions leave the
/// state unchanged.
pub fn reduce(mut state: ChainState, action: Action) -> ChainState {
    if let Err(e) = state.apply(action) {
        debug!("action ignored: {e}");
    }
    state
}

impl ChainState {
    pub fn new(config: &EngineConfig) -> Self {
        Self {
            blocks: vec![Block::genesis(0, &config.genesis_data)],
            difficulty: config.initial_difficulty,
            is_valid_chain: true,
            selected_block: None,
            mining_progress: BTreeMap::new(),
            mining_runs: BTreeMap::new(),
            genesis_data: config.genesis_data.clone(),
            next_id: 1,
        }
    }

    pub fn len(&self) -> usize {
        self.blocks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.blocks.is_empty()
    }

    pub fn block(&self, index: usize) -> Option<&Block> {
        self.blocks.get(index)
    }

    /// Run id of the search currently mining block `index`.
    pub fn mining_run(&self, index: usize) -> Option<u64> {
        self.mining_runs.get(&index).copied()
    }

    /// True while some block is still being mined by search `run`.
    pub fn is_live_run(&self, run: u64) -> bool {
        self.mining_runs.values().any(|r| *r == run)
    }

    /// Single transition entry point. On `Err` nothing was changed.
    pub fn apply(&mut self, action: Action) -> Result<(), EngineError> {
        match action {
            Action::Append { payload } => {
                self.append(payload);
                Ok(())
            }
            Action::StartMining { index } => self.start_mining(index),
            Action::ReportMiningProgress { index, run, nonce, .. } => {
                self.report_progress(index, run, nonce)
            }
            Action::CompleteMining { index, run, block } => self.complete_mining(index, run, block),
            Action::CancelMining { index, run } => self.cancel_mining(index, run),
            Action::SetDifficulty { difficulty } => {
                if difficulty as usize > HASH_HEX_SIZE {
                    warn!("difficulty {difficulty} exceeds hash length; new blocks can never be mined");
                }
                self.difficulty = difficulty;
                Ok(())
            }
            Action::SelectBlock { index } => {
                self.selected_block = index;
                Ok(())
            }
            Action::UpdateBlockData { index, payload } => self.update_data(index, payload),
            Action::ReorderBlocks { from, to } => self.reorder(from, to),
            Action::Revalidate => {
                self.revalidate();
                Ok(())
            }
            Action::Reset => {
                self.reset();
                Ok(())
            }
        }
    }

    fn take_id(&mut self) -> u64 {
        let id = self.next_id;
        self.next_id += 1;
        id
    }

    fn append(&mut self, payload: Payload) {
        let index = self.blocks.len();
        let previous_hash = self
            .blocks
            .last()
            .map(|b| b.hash.clone())
            .unwrap_or_default();
        let id = self.take_id();
        let block = Block::new(id, index as u64, payload, previous_hash, self.difficulty);
        info!("appended block {index} (difficulty {})", block.difficulty);
        self.blocks.push(block);
        self.refresh_tolerant(None);
    }

    fn start_mining(&mut self, index: usize) -> Result<(), EngineError> {
        let block = self
            .blocks
            .get_mut(index)
            .ok_or(EngineError::BlockNotFound(index))?;
        if block.is_mining {
            return Err(EngineError::AlreadyMining(index));
        }
        if block.is_mined {
            return Err(EngineError::AlreadyMined(index));
        }
        block.is_mining = true;
        block.is_mined = false;
        let run = self.take_id();
        self.mining_runs.insert(index, run);
        self.mining_progress.insert(index, 0);
        Ok(())
    }

    /// Checks that `run` is the search currently mining block `index`.
    fn check_run(&self, index: usize, run: u64) -> Result<&Block, EngineError> {
        let block = self.blocks.get(index).ok_or(EngineError::BlockNotFound(index))?;
        if !block.is_mining || self.mining_run(index) != Some(run) {
            return Err(EngineError::StaleMining(index));
        }
        Ok(block)
    }

    fn stop_mining(&mut self, index: usize) {
        if let Some(block) = self.blocks.get_mut(index) {
            block.is_mining = false;
        }
        self.mining_runs.remove(&index);
        self.mining_progress.remove(&index);
    }

    fn report_progress(&mut self, index: usize, run: u64, nonce: u64) -> Result<(), EngineError> {
        self.check_run(index, run)?;
        self.mining_progress.insert(index, nonce);
        Ok(())
    }

    /// Accept a mined block only from the run currently mining `index`, and
    /// only if the hashed fields still match. Anything else is a late result
    /// for a block that has since been edited, moved or reset away.
    fn complete_mining(&mut self, index: usize, run: u64, mut mined: Block) -> Result<(), EngineError> {
        let current = self.check_run(index, run)?;
        let same_block = current.id == mined.id
            && current.index == mined.index
            && current.timestamp == mined.timestamp
            && current.previous_hash == mined.previous_hash
            && current.payload == mined.payload;
        if !same_block {
            return Err(EngineError::StaleMining(index));
        }

        mined.is_mining = false;
        self.blocks[index] = mined;
        self.stop_mining(index);
        self.refresh_strict();
        Ok(())
    }

    fn cancel_mining(&mut self, index: usize, run: u64) -> Result<(), EngineError> {
        self.check_run(index, run)?;
        self.stop_mining(index);
        Ok(())
    }

    fn update_data(&mut self, index: usize, payload: Payload) -> Result<(), EngineError> {
        if index == 0 {
            return Err(EngineError::GenesisImmutable);
        }
        let block = self
            .blocks
            .get_mut(index)
            .ok_or(EngineError::BlockNotFound(index))?;
        block.payload = payload;
        block.is_mined = false;
        block.nonce = 0;
        block.hash = block.compute_hash();
        self.stop_mining(index);
        info!("block {index} data edited; downstream blocks invalidated");
        self.refresh_tolerant(Some(index));
        Ok(())
    }

    /// Move a block and renumber every block to its new position. Hashes and
    /// `previous_hash` links are left exactly as they were.
    fn reorder(&mut self, from: usize, to: usize) -> Result<(), EngineError> {
        let len = self.blocks.len();
        if from == 0 || to == 0 {
            return Err(EngineError::GenesisImmutable);
        }
        for index in [from, to] {
            if index >= len {
                return Err(EngineError::IndexOutOfRange { index, len });
            }
        }
        if from == to {
            return Ok(());
        }

        let moved = self.blocks.remove(from);
        self.blocks.insert(to, moved);
        for (position, block) in self.blocks.iter_mut().enumerate() {
            if block.index != position as u64 {
                block.index = position as u64;
                // a running search was started for the old index
                block.is_mining = false;
            }
        }
        let blocks = &self.blocks;
        self.mining_runs
            .retain(|i, _| blocks.get(*i).is_some_and(|b| b.is_mining));
        self.mining_progress
            .retain(|i, _| blocks.get(*i).is_some_and(|b| b.is_mining));
        if self.selected_block == Some(from) {
            self.selected_block = Some(to);
        }

        info!("moved block {from} to {to}");
        self.refresh_tolerant(None);
        self.is_valid_chain = validate_chain(&self.blocks);
        Ok(())
    }

    fn revalidate(&mut self) {
        for i in 1..self.blocks.len() {
            let valid = validate_block(&self.blocks[i], Some(&self.blocks[i - 1]));
            self.blocks[i].is_valid = valid;
        }
        if let Some(genesis) = self.blocks.first_mut() {
            genesis.is_valid = true;
        }
        self.is_valid_chain = validate_chain(&self.blocks);
    }

    fn reset(&mut self) {
        let id = self.take_id();
        self.blocks = vec![Block::genesis(id, &self.genesis_data)];
        self.is_valid_chain = true;
        self.selected_block = None;
        self.mining_runs.clear();
        self.mining_progress.clear();
        info!("chain reset (difficulty {})", self.difficulty);
    }

    /// Validity while blocks may still be unmined. An unmined block is only
    /// held to `validate_block`; blocks after `invalidate_after` are forced
    /// invalid and unmined. Chain validity counts genesis and mined blocks only.
    fn refresh_tolerant(&mut self, invalidate_after: Option<usize>) {
        for i in 0..self.blocks.len() {
            if i == 0 {
                self.blocks[0].is_valid = true;
                continue;
            }
            if invalidate_after.is_some_and(|k| i > k) {
                let block = &mut self.blocks[i];
                block.is_valid = false;
                block.is_mined = false;
                continue;
            }
            let block = &self.blocks[i];
            let linked = validate_block(block, Some(&self.blocks[i - 1]));
            let mined_ok = block.difficulty == 0 || (block.is_mined && block.meets_difficulty());
            let valid = linked && (mined_ok || !block.is_mined);
            self.blocks[i].is_valid = valid;
        }

        let committed: Vec<Block> = self
            .blocks
            .iter()
            .filter(|b| b.is_mined || b.is_genesis())
            .cloned()
            .collect();
        self.is_valid_chain = validate_chain(&committed);
    }

    /// Validity after a mining result: every non-genesis block must be mined
    /// and satisfy its difficulty, and the whole sequence must validate.
    fn refresh_strict(&mut self) {
        for i in 0..self.blocks.len() {
            if i == 0 {
                self.blocks[0].is_valid = true;
                continue;
            }
            let block = &self.blocks[i];
            let linked = validate_block(block, Some(&self.blocks[i - 1]));
            let mined_ok = block.difficulty == 0 || (block.is_mined && block.meets_difficulty());
            let valid = linked && mined_ok;
            self.blocks[i].is_valid = valid;
        }
        self.is_valid_chain = validate_chain(&self.blocks);
    }
}
