use clickhouse::Row;
use serde::{Deserialize, Serialize};

// Rows written to ClickHouse, one struct per pipe table

#[derive(Debug, Clone, PartialEq, Row, Serialize, Deserialize)]
pub struct BlockRow {
    pub number: u64,
    pub hash: String,
    pub parent_number: u64,
    pub parent_hash: String,
    pub height: u64,
    pub timestamp: i64,
}

#[derive(Debug, Clone, PartialEq, Row, Serialize, Deserialize)]
pub struct InstructionRow {
    pub block_number: u64,
    pub transaction_index: u32,
    pub instruction_address: Vec<u32>,
    pub program_id: String,
    pub accounts: Vec<String>,
    pub data: String,
    pub is_committed: bool,
}
