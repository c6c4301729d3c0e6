pub const HASH_SIZE: usize = 32;
pub const HASH_HEX_SIZE: usize = HASH_SIZE * 2;
pub const MINING_BATCH_SIZE: u64 = 1000;
pub const DEFAULT_DIFFICULTY: u32 = 2;
pub const GENESIS_DATA: &str = "Genesis Block";
pub const GENESIS_PREVIOUS_HASH: &str = "0";
