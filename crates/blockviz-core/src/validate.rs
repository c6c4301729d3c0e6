//! Pure validity predicates over blocks and block sequences.

use crate::constants::GENESIS_PREVIOUS_HASH;
use crate::error::ValidationError;
use crate::pow::is_valid_hash;
use crate::Block;

/// Check a block against its own fields and, for non-genesis blocks, against
/// its predecessor. Stops at the first failing rule.
pub fn check_block(block: &Block, previous: Option<&Block>) -> Result<(), ValidationError> {
    if block.is_genesis() {
        if block.previous_hash != GENESIS_PREVIOUS_HASH {
            return Err(ValidationError::GenesisLink {
                found: block.previous_hash.clone(),
            });
        }
        return check_self_hash(block);
    }

    let previous = previous.ok_or(ValidationError::MissingPredecessor { index: block.index })?;
    if block.previous_hash != previous.hash {
        return Err(ValidationError::BrokenLink {
            index: block.index,
            expected: previous.hash.clone(),
            found: block.previous_hash.clone(),
        });
    }
    check_self_hash(block)?;
    if !is_valid_hash(&block.hash, block.difficulty) {
        return Err(ValidationError::DifficultyNotMet {
            index: block.index,
            difficulty: block.difficulty,
        });
    }
    Ok(())
}

fn check_self_hash(block: &Block) -> Result<(), ValidationError> {
    let computed = block.compute_hash();
    if block.hash != computed {
        return Err(ValidationError::HashMismatch {
            index: block.index,
            stored: block.hash.clone(),
            computed,
        });
    }
    Ok(())
}

pub fn validate_block(block: &Block, previous: Option<&Block>) -> bool {
    check_block(block, previous).is_ok()
}

/// Every consecutive pair must validate. Empty and genesis-only chains are
/// valid; the first block itself is not checked.
pub fn validate_chain(blocks: &[Block]) -> bool {
    blocks
        .windows(2)
        .all(|pair| validate_block(&pair[1], Some(&pair[0])))
}

/// First failure in the chain, with the position it occurred at.
pub fn first_invalid(blocks: &[Block]) -> Option<(usize, ValidationError)> {
    blocks.windows(2).enumerate().find_map(|(i, pair)| {
        check_block(&pair[1], Some(&pair[0]))
            .err()
            .map(|e| (i + 1, e))
    })
}
