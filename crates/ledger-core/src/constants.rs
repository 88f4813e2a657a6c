pub const HASH_SIZE: usize = 32;
pub const HASH_HEX_SIZE: usize = HASH_SIZE * 2;
pub const DEFAULT_DIFFICULTY: usize = 2;
pub const GENESIS_PREVIOUS_HASH: &str = "0";
pub const TIMESTAMP_FIELD: &str = "timestamp";
