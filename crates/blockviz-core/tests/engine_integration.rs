mod helpers;

use blockviz_core::{
    pow, validate, Action, Engine, EngineConfig, EngineError, MineError, Payload, Transaction,
};
use helpers::{append_pinned, linkage, pinned_state};

#[tokio::test]
async fn test_end_to_end_mine_then_edit() -> anyhow::Result<()> {
    let state = pinned_state();
    assert_eq!(state.blocks[0].difficulty, 0);
    let engine = Engine::with_state(EngineConfig::default(), state);

    engine.set_difficulty(2);
    engine.dispatch(Action::Append { payload: Payload::from("hello") })?;
    let handle = engine.start_mining(1)?;
    let mined = handle.wait().await?;

    let state = engine.snapshot();
    let block = &state.blocks[1];
    assert!(block.hash.starts_with("00"));
    assert_eq!(block.hash, mined.hash);
    assert!(block.is_mined);
    assert!(block.is_valid);
    assert!(state.is_valid_chain);

    engine.update_data(1, "world")?;
    let state = engine.snapshot();
    let block = &state.blocks[1];
    assert!(!block.is_mined);
    assert_eq!(block.nonce, 0);
    assert_eq!(
        block.is_valid,
        pow::is_valid_hash(&block.hash, 2),
        "an edited block is only valid if its nonce-0 hash happens to meet the difficulty"
    );
    // the filtered chain (genesis + mined blocks) no longer contains block 1
    assert!(state.is_valid_chain);
    // strict revalidation over every block sees the edit
    engine.revalidate();
    let state = engine.snapshot();
    assert_eq!(state.is_valid_chain, pow::is_valid_hash(&state.blocks[1].hash, 2));
    Ok(())
}

#[tokio::test]
async fn test_sequential_mining_yields_valid_chain() -> anyhow::Result<()> {
    let engine = Engine::default();
    engine.set_difficulty(2);
    for i in 1..=5 {
        engine.append(format!("block {i}"));
        engine.start_mining(i)?.wait().await?;
    }
    let state = engine.snapshot();
    assert_eq!(state.len(), 6);
    assert!(validate::validate_chain(&state.blocks));
    assert!(state.is_valid_chain);
    for block in &state.blocks[1..] {
        assert!(block.is_mined && block.is_valid);
        assert!(pow::is_valid_hash(&block.hash, 2));
    }
    Ok(())
}

#[tokio::test]
async fn test_transaction_blocks_mine_and_validate() -> anyhow::Result<()> {
    let engine = Engine::default();
    engine.set_difficulty(1);
    let txs = vec![
        Transaction::new("Alice", "Bob", 10.0),
        Transaction::new("Bob", "Charlie", 5.0),
    ];
    engine.append(txs.clone());
    engine.start_mining(1)?.wait().await?;
    let state = engine.snapshot();
    assert_eq!(state.blocks[1].payload, Payload::Transactions(txs));
    assert!(state.is_valid_chain);
    Ok(())
}

#[tokio::test]
async fn test_edit_cascades_through_mined_chain() -> anyhow::Result<()> {
    let engine = Engine::default();
    engine.set_difficulty(1);
    for i in 1..=4 {
        engine.append(format!("block {i}"));
        engine.start_mining(i)?.wait().await?;
    }
    engine.update_data(2, "tampered")?;
    let state = engine.snapshot();
    assert!(state.blocks[0].is_valid);
    assert!(state.blocks[1].is_valid);
    for block in &state.blocks[3..] {
        assert!(!block.is_valid, "block {} should be invalidated", block.index);
        assert!(!block.is_mined);
    }

    // a fresh unmined tail does not flag the chain on its own
    engine.append("tail");
    let state = engine.snapshot();
    assert!(!state.blocks[5].is_mined);
    assert_eq!(state.blocks[5].previous_hash, state.blocks[4].hash);
    Ok(())
}

#[tokio::test]
async fn test_reorder_breaks_linkage_without_repair() -> anyhow::Result<()> {
    let engine = Engine::default();
    engine.set_difficulty(1);
    for i in 1..=3 {
        engine.append(format!("block {i}"));
        engine.start_mining(i)?.wait().await?;
    }
    assert!(engine.snapshot().is_valid_chain);
    let before = linkage(&engine.snapshot());

    engine.reorder(3, 1)?;
    let state = engine.snapshot();
    let after = linkage(&state);
    // hashes travel with their blocks, only indices are renumbered
    assert_eq!(after[1].2, before[3].2);
    assert_eq!(after[1].0, 1);
    let mismatches = state
        .blocks
        .windows(2)
        .filter(|pair| pair[1].previous_hash != pair[0].hash)
        .count();
    assert!(mismatches >= 1);
    assert!(!state.is_valid_chain);
    assert!(validate::first_invalid(&state.blocks).is_some());
    Ok(())
}

#[tokio::test]
async fn test_rejected_calls_leave_state_untouched() {
    let engine = Engine::default();
    engine.append("a");
    let before = engine.snapshot();

    assert_eq!(engine.start_mining(7).unwrap_err(), EngineError::BlockNotFound(7));
    assert_eq!(engine.start_mining(0).unwrap_err(), EngineError::AlreadyMined(0));
    assert_eq!(engine.reorder(1, 0), Err(EngineError::GenesisImmutable));
    assert_eq!(
        engine.reorder(1, 5),
        Err(EngineError::IndexOutOfRange { index: 5, len: 2 })
    );
    assert_eq!(engine.update_data(0, "x"), Err(EngineError::GenesisImmutable));
    assert_eq!(engine.update_data(3, "x"), Err(EngineError::BlockNotFound(3)));
    assert_eq!(engine.snapshot(), before);
}

#[tokio::test]
async fn test_progress_is_reported_while_mining() {
    let config = EngineConfig {
        batch_size: 10,
        ..EngineConfig::default()
    };
    let engine = Engine::with_state(config, append_pinned(pinned_state(), "hello"));
    // difficulty 2 on this pinned block needs nonce 243
    let handle = engine.start_mining(1).expect("block 1 exists");
    let mut observed = Vec::new();
    while !handle.is_finished() {
        if let Some(nonce) = engine.snapshot().mining_progress.get(&1) {
            observed.push(*nonce);
        }
        tokio::task::yield_now().await;
    }
    let mined = handle.wait().await.expect("mining completes");
    assert_eq!(mined.nonce, 243);
    assert!(observed.iter().any(|n| *n > 0));
    assert!(observed.windows(2).all(|w| w[0] <= w[1]));
    assert!(engine.snapshot().mining_progress.is_empty());
}

#[tokio::test]
async fn test_cancel_then_remine() {
    let engine = Engine::default();
    engine.set_difficulty(12);
    engine.append("slow");
    let handle = engine.start_mining(1).expect("block 1 exists");
    handle.cancel();
    assert!(matches!(
        handle.wait().await,
        Err(EngineError::Mine(MineError::Cancelled { .. }))
    ));

    // the block is released, so mining can start over
    let again = engine.start_mining(1).expect("block released after cancel");
    assert!(engine.snapshot().blocks[1].is_mining);
    again.cancel();
    let _ = again.wait().await;
    assert!(!engine.snapshot().blocks[1].is_mining);
}

#[tokio::test]
async fn test_reset_preserves_difficulty() {
    let engine = Engine::default();
    engine.set_difficulty(3);
    engine.append("a");
    engine.select(Some(1));
    engine.reset();
    let state = engine.snapshot();
    assert_eq!(state.len(), 1);
    assert_eq!(state.difficulty, 3);
    assert_eq!(state.selected_block, None);
    assert!(validate::validate_block(&state.blocks[0], None));
}
