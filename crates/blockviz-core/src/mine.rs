use crate::constants::HASH_HEX_SIZE;
use crate::{hash_prefix, pow::is_valid_hash, Block, HexDigest, MineError};
use rayon::prelude::*;
use sha2::{Digest, Sha256};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

/// Hashes one block's fields for many nonces. The digest state for everything
/// before the nonce is computed once and cloned per attempt.
#[derive(Clone)]
struct NonceHasher {
    base: Sha256,
}

impl NonceHasher {
    fn for_block(block: &Block) -> Self {
        let prefix = hash_prefix(block.index, block.timestamp, &block.payload, &block.previous_hash);
        Self {
            base: Sha256::new_with_prefix(prefix),
        }
    }

    fn hash(&self, nonce: u64) -> HexDigest {
        hex::encode(self.base.clone().chain_update(nonce.to_string()).finalize())
    }
}

fn check_satisfiable(block: &Block) -> Result<(), MineError> {
    if block.difficulty as usize > HASH_HEX_SIZE {
        return Err(MineError::Unsatisfiable {
            difficulty: block.difficulty,
        });
    }
    Ok(())
}

fn finish(mut block: Block, hash: HexDigest) -> Block {
    block.hash = hash;
    block.is_mined = true;
    block.is_mining = false;
    info!(
        "Mined block {} with nonce {} and hash {} (difficulty {})",
        block.index, block.nonce, block.hash, block.difficulty
    );
    block
}

/// Cooperative proof-of-work search starting at `block.nonce`.
///
/// Runs `batch_size` attempts at a time. After each unsuccessful batch it
/// reports `(next_nonce, last_hash)` to `on_progress`, yields to the tokio
/// scheduler and then checks `cancel`; the batch boundary is the only point
/// at which mining stops early. Difficulty 0 succeeds on the first attempt;
/// a difficulty longer than the hash fails before any attempt.
pub async fn mine<F>(
    mut block: Block,
    batch_size: u64,
    cancel: &CancellationToken,
    mut on_progress: F,
) -> Result<Block, MineError>
where
    F: FnMut(u64, &str),
{
    check_satisfiable(&block)?;
    let hasher = NonceHasher::for_block(&block);
    let batch_size = batch_size.max(1);
    let exhausted = MineError::Exhausted {
        difficulty: block.difficulty,
    };

    loop {
        let mut last = HexDigest::new();
        for _ in 0..batch_size {
            let hash = hasher.hash(block.nonce);
            if is_valid_hash(&hash, block.difficulty) {
                return Ok(finish(block, hash));
            }
            last = hash;
            block.nonce = block.nonce.checked_add(1).ok_or_else(|| exhausted.clone())?;
        }

        debug!("block {} mining batch done, next nonce {}", block.index, block.nonce);
        on_progress(block.nonce, &last);
        tokio::task::yield_now().await;

        if cancel.is_cancelled() {
            debug!("block {} mining cancelled at nonce {}", block.index, block.nonce);
            return Err(MineError::Cancelled { nonce: block.nonce });
        }
    }
}

/// Blocking search across all cores. Returns the same smallest satisfying
/// nonce the cooperative miner would find.
pub fn mine_parallel(block: Block) -> Result<Block, MineError> {
    check_satisfiable(&block)?;
    let hasher = NonceHasher::for_block(&block);
    let difficulty = block.difficulty;

    let found = (block.nonce..u64::MAX)
        .into_par_iter()
        .find_first(|nonce| is_valid_hash(&hasher.hash(*nonce), difficulty))
        .ok_or(MineError::Exhausted { difficulty })?;

    let mut block = block;
    block.nonce = found;
    let hash = hasher.hash(found);
    Ok(finish(block, hash))
}
