use blockviz_core::{reduce, Action, ChainState, Payload};

pub const TS: u64 = 1_600_000_000_000;

/// Fresh state whose genesis timestamp is pinned so every hash is reproducible.
pub fn pinned_state() -> ChainState {
    let mut state = ChainState::default();
    state.blocks[0].timestamp = TS;
    state.blocks[0].hash = state.blocks[0].compute_hash();
    state
}

/// Append `data` and pin the new block's timestamp.
pub fn append_pinned(state: ChainState, data: &str) -> ChainState {
    let mut state = reduce(state, Action::Append { payload: Payload::from(data) });
    let last = state.blocks.last_mut().expect("chain always has a genesis block");
    last.timestamp = TS;
    last.hash = last.compute_hash();
    state
}

/// (index, previous_hash, hash) triples for comparing adjacency.
pub fn linkage(state: &ChainState) -> Vec<(u64, String, String)> {
    state
        .blocks
        .iter()
        .map(|b| (b.index, b.previous_hash.clone(), b.hash.clone()))
        .collect()
}
