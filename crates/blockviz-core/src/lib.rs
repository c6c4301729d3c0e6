//! Chain integrity engine for a single-node, in-memory teaching blockchain.
//!
//! Blocks are linked by SHA-256 digests, mined by a cooperative proof-of-work
//! search and re-validated after every state transition so that edits and
//! reorders are visibly flagged instead of silently repaired.
pub mod config;
pub mod constants;
pub mod engine;
pub mod error;
pub mod mine;
pub mod state;
pub mod validate;

pub use config::EngineConfig;
pub use engine::{Engine, MiningHandle};
pub use error::{EngineError, MineError, ValidationError};
pub use state::{reduce, Action, ChainState};

use rand::Rng;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::borrow::Cow;
use std::fmt;
use std::time::{SystemTime, UNIX_EPOCH};

use crate::constants::GENESIS_PREVIOUS_HASH;

/// Lowercase hex encoding of a SHA-256 digest.
pub type HexDigest = String;

/// Milliseconds since the Unix epoch.
pub fn now_millis() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or_default()
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Transaction {
    pub id: String,
    pub from: String,
    pub to: String,
    /// Non-negative, possibly fractional.
    #[serde(serialize_with = "amount::serialize")]
    pub amount: f64,
    pub timestamp: u64,
}

/// Amounts are plain JSON numbers. Whole values are written without a
/// fractional part, so `10.0` is encoded (and hashed) as `10`.
mod amount {
    use serde::Serializer;

    // 2^53, past which not every whole f64 fits an i64 exactly
    const EXACT_LIMIT: f64 = 9_007_199_254_740_992.0;

    pub fn serialize<S: Serializer>(value: &f64, serializer: S) -> Result<S::Ok, S::Error> {
        if value.fract() == 0.0 && value.abs() < EXACT_LIMIT {
            serializer.serialize_i64(*value as i64)
        } else {
            serializer.serialize_f64(*value)
        }
    }
}

impl Transaction {
    /// New transaction with a random 128-bit hex id. Ids are unique per process
    /// in practice, not by any cryptographic guarantee.
    pub fn new(from: impl Into<String>, to: impl Into<String>, amount: f64) -> Self {
        let id: [u8; 16] = rand::thread_rng().gen();
        Self {
            id: hex::encode(id),
            from: from.into(),
            to: to.into(),
            amount,
            timestamp: now_millis(),
        }
    }

    /// Parse a user-entered amount. Only finite values above zero are accepted.
    pub fn parse_amount(raw: &str) -> Option<f64> {
        raw.trim()
            .parse::<f64>()
            .ok()
            .filter(|amount| amount.is_finite() && *amount > 0.0)
    }
}

/// Block contents: free text or an ordered list of transactions.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum Payload {
    Text(String),
    Transactions(Vec<Transaction>),
}

impl Payload {
    /// The exact string fed to the hasher. Text is used verbatim; transactions
    /// are encoded as compact JSON with fields in declaration order.
    pub fn canonical(&self) -> Cow<'_, str> {
        match self {
            Payload::Text(text) => Cow::Borrowed(text),
            // Strings and numbers always serialize.
            Payload::Transactions(txs) => Cow::Owned(serde_json::to_string(txs).unwrap_or_default()),
        }
    }
}

impl fmt::Display for Payload {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.canonical())
    }
}

impl From<&str> for Payload {
    fn from(text: &str) -> Self {
        Payload::Text(text.to_string())
    }
}

impl From<String> for Payload {
    fn from(text: String) -> Self {
        Payload::Text(text)
    }
}

impl From<Vec<Transaction>> for Payload {
    fn from(txs: Vec<Transaction>) -> Self {
        Payload::Transactions(txs)
    }
}

/// Everything hashed except the nonce, concatenated in hashing order.
pub(crate) fn hash_prefix(index: u64, timestamp: u64, payload: &Payload, previous_hash: &str) -> String {
    format!("{index}{timestamp}{}{previous_hash}", payload.canonical())
}

/// SHA-256 over `index + timestamp + payload + previous_hash + nonce`, each in
/// its decimal or text form.
pub fn calculate_hash(
    index: u64,
    timestamp: u64,
    payload: &Payload,
    previous_hash: &str,
    nonce: u64,
) -> HexDigest {
    let mut hasher = Sha256::new();
    hasher.update(hash_prefix(index, timestamp, payload, previous_hash));
    hasher.update(nonce.to_string());
    hex::encode(hasher.finalize())
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Block {
    /// Process-local identity, never reused. Not part of the hash.
    pub id: u64,
    pub index: u64,
    pub timestamp: u64,
    pub payload: Payload,
    pub previous_hash: HexDigest,
    pub hash: HexDigest,
    pub nonce: u64,
    pub difficulty: u32,
    pub is_valid: bool,
    pub is_mining: bool,
    pub is_mined: bool,
}

impl Block {
    /// Unmined block with its placeholder hash computed at nonce 0.
    pub fn new(id: u64, index: u64, payload: Payload, previous_hash: HexDigest, difficulty: u32) -> Self {
        let mut block = Self {
            id,
            index,
            timestamp: now_millis(),
            payload,
            previous_hash,
            hash: String::new(),
            nonce: 0,
            difficulty,
            is_valid: false,
            is_mining: false,
            is_mined: false,
        };
        block.hash = block.compute_hash();
        block
    }

    pub fn genesis(id: u64, data: &str) -> Self {
        let mut block = Self::new(id, 0, Payload::from(data), GENESIS_PREVIOUS_HASH.to_string(), 0);
        block.is_valid = true;
        block.is_mined = true;
        block
    }

    pub fn compute_hash(&self) -> HexDigest {
        calculate_hash(self.index, self.timestamp, &self.payload, &self.previous_hash, self.nonce)
    }

    pub fn is_genesis(&self) -> bool {
        self.index == 0
    }

    /// True when the stored hash meets this block's own difficulty.
    pub fn meets_difficulty(&self) -> bool {
        pow::is_valid_hash(&self.hash, self.difficulty)
    }
}

pub mod pow {
    /// True iff the first `difficulty` characters of `hash` are all `'0'`.
    /// A difficulty longer than the hash can never be met.
    pub fn is_valid_hash(hash: &str, difficulty: u32) -> bool {
        let difficulty = difficulty as usize;
        difficulty <= hash.len() && hash.bytes().take(difficulty).all(|b| b == b'0')
    }

    /// Number of leading `'0'` hex digits.
    pub fn leading_zero_digits(hash: &str) -> u32 {
        hash.bytes().take_while(|b| *b == b'0').count() as u32
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::constants::GENESIS_DATA;

    const TS: u64 = 1_600_000_000_000;

    fn alice_to_bob() -> Transaction {
        Transaction {
            id: "ab".to_string(),
            from: "Alice".to_string(),
            to: "Bob".to_string(),
            amount: 10.0,
            timestamp: TS,
        }
    }

    #[test]
    fn calculate_hash_known_text_vector() {
        let hash = calculate_hash(1, TS, &Payload::from("hello"), "prev", 0);
        assert_eq!(
            hash,
            "4673bc0db9b383fb214ef5c066f110c0f1666b9e930c7c04c001b57e747eff8e"
        );
    }

    #[test]
    fn calculate_hash_known_transactions_vector() {
        let payload = Payload::from(vec![alice_to_bob()]);
        let hash = calculate_hash(2, TS, &payload, "prev", 7);
        assert_eq!(
            hash,
            "80166aab107d96ed21ee550b71e2105b1348edc1fbd5d3b05b5cbd88509361a8"
        );
    }

    #[test]
    fn calculate_hash_is_deterministic() {
        let payload = Payload::from("test data");
        let h1 = calculate_hash(1, TS, &payload, "prev_hash", 0);
        let h2 = calculate_hash(1, TS, &payload, "prev_hash", 0);
        assert_eq!(h1, h2);
        assert_eq!(h1.len(), constants::HASH_HEX_SIZE);
        assert!(h1.bytes().all(|b| b.is_ascii_digit() || (b'a'..=b'f').contains(&b)));
    }

    #[test]
    fn calculate_hash_changes_with_every_field() {
        let payload = Payload::from("test data");
        let base = calculate_hash(1, TS, &payload, "prev_hash", 0);
        assert_ne!(base, calculate_hash(2, TS, &payload, "prev_hash", 0));
        assert_ne!(base, calculate_hash(1, TS + 1, &payload, "prev_hash", 0));
        assert_ne!(base, calculate_hash(1, TS, &Payload::from("different data"), "prev_hash", 0));
        assert_ne!(base, calculate_hash(1, TS, &payload, "other_hash", 0));
        assert_ne!(base, calculate_hash(1, TS, &payload, "prev_hash", 1));
    }

    #[test]
    fn structurally_equal_payloads_hash_equal() {
        let a = Payload::from(vec![alice_to_bob()]);
        let b = Payload::from(vec![alice_to_bob()]);
        assert_eq!(calculate_hash(1, TS, &a, "p", 0), calculate_hash(1, TS, &b, "p", 0));
    }

    #[test]
    fn transaction_payload_canonical_json() {
        let payload = Payload::from(vec![alice_to_bob()]);
        assert_eq!(
            payload.canonical(),
            r#"[{"id":"ab","from":"Alice","to":"Bob","amount":10,"timestamp":1600000000000}]"#
        );
        assert_eq!(Payload::from("plain").canonical(), "plain");
    }

    #[test]
    fn payload_serde_untagged() {
        let text: Payload = serde_json::from_str(r#""hi""#).unwrap();
        assert_eq!(text, Payload::from("hi"));
        let json = serde_json::to_string(&Payload::from(vec![alice_to_bob()])).unwrap();
        let back: Payload = serde_json::from_str(&json).unwrap();
        assert_eq!(back, Payload::from(vec![alice_to_bob()]));
    }

    #[test]
    fn is_valid_hash_vectors() {
        assert!(pow::is_valid_hash("000abcd1234567890", 3));
        assert!(!pow::is_valid_hash("00abcd1234567890", 3));
        assert!(pow::is_valid_hash("abc", 0));
        assert!(pow::is_valid_hash("", 0));
        assert!(pow::is_valid_hash("000", 3));
        assert!(!pow::is_valid_hash("000", 4));
        assert!(!pow::is_valid_hash("", 1));
    }

    #[test]
    fn leading_zero_digits_vectors() {
        assert_eq!(pow::leading_zero_digits("000f"), 3);
        assert_eq!(pow::leading_zero_digits("f000"), 0);
        assert_eq!(pow::leading_zero_digits(""), 0);
    }

    #[test]
    fn genesis_block_vector() {
        let genesis = Block::genesis(0, GENESIS_DATA);
        assert_eq!(genesis.index, 0);
        assert_eq!(genesis.previous_hash, "0");
        assert_eq!(genesis.payload, Payload::from("Genesis Block"));
        assert_eq!(genesis.difficulty, 0);
        assert_eq!(genesis.nonce, 0);
        assert!(genesis.is_valid);
        assert!(genesis.is_mined);
        assert!(!genesis.is_mining);
        assert_eq!(genesis.hash, genesis.compute_hash());
    }

    #[test]
    fn genesis_hash_known_vector() {
        let mut genesis = Block::genesis(0, GENESIS_DATA);
        genesis.timestamp = TS;
        assert_eq!(
            genesis.compute_hash(),
            "6a9460801ada4bedb51df3b4be88b8aeafb1f44f33c6a8655bf78e59d1101456"
        );
    }

    #[test]
    fn new_block_is_unmined_with_placeholder_hash() {
        let block = Block::new(3, 1, Payload::from("test data"), "prev_hash".into(), 2);
        assert_eq!(block.index, 1);
        assert_eq!(block.previous_hash, "prev_hash");
        assert_eq!(block.difficulty, 2);
        assert_eq!(block.nonce, 0);
        assert!(!block.is_mined);
        assert!(!block.is_valid);
        assert_eq!(block.hash, block.compute_hash());
    }

    #[test]
    fn transaction_new_has_random_hex_id() {
        let t1 = Transaction::new("Alice", "Bob", 100.0);
        let t2 = Transaction::new("Alice", "Bob", 100.0);
        assert_eq!(t1.from, "Alice");
        assert_eq!(t1.to, "Bob");
        assert_eq!(t1.amount, 100.0);
        assert_eq!(t1.id.len(), 32);
        assert!(t1.timestamp > 0);
        assert_ne!(t1.id, t2.id);
    }

    #[test]
    fn fractional_amount_is_kept_in_canonical_json() {
        let mut half = alice_to_bob();
        half.amount = 0.5;
        let payload = Payload::from(vec![half]);
        assert_eq!(
            payload.canonical(),
            r#"[{"id":"ab","from":"Alice","to":"Bob","amount":0.5,"timestamp":1600000000000}]"#
        );
        let whole = Payload::from(vec![alice_to_bob()]);
        assert_ne!(
            calculate_hash(2, TS, &payload, "prev", 7),
            calculate_hash(2, TS, &whole, "prev", 7)
        );

        let json = serde_json::to_string(&payload).unwrap();
        let back: Payload = serde_json::from_str(&json).unwrap();
        assert_eq!(back, payload);
    }

    #[test]
    fn parse_amount_accepts_positive_decimals_only() {
        assert_eq!(Transaction::parse_amount("0.5"), Some(0.5));
        assert_eq!(Transaction::parse_amount(" 12 "), Some(12.0));
        assert_eq!(Transaction::parse_amount("0"), None);
        assert_eq!(Transaction::parse_amount("-3"), None);
        assert_eq!(Transaction::parse_amount("NaN"), None);
        assert_eq!(Transaction::parse_amount("inf"), None);
        assert_eq!(Transaction::parse_amount("ten"), None);
    }
}
