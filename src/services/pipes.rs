//! Pipes turn raw portal blocks into table rows.
//!
//! A pipe owns its portal query, its target table and the decoding step.
//! Records keep the portal order (block, transaction, instruction).

use serde_json::{json, Value};

use crate::models::{Batch, BlockBatch, BlockRow, InstructionRow, PortalInstruction};
use crate::utils::error::{IndexerError, Result};

pub trait Pipe: Send + Sync {
    type Row: Send + Sync + 'static;

    /// Checkpoint key.
    fn id(&self) -> &str;

    fn table(&self) -> &str;

    fn create_table_sql(&self) -> String;

    /// Field selection and filters merged into every portal request.
    fn query(&self) -> Value;

    fn decode(&self, batch: BlockBatch) -> Result<Batch<Self::Row>>;
}

pub struct BlocksPipe {
    id: String,
}

impl BlocksPipe {
    pub const TABLE: &'static str = "solana_blocks";

    pub fn new(id: impl Into<String>) -> Self {
        Self { id: id.into() }
    }
}

impl Pipe for BlocksPipe {
    type Row = BlockRow;

    fn id(&self) -> &str {
        &self.id
    }

    fn table(&self) -> &str {
        Self::TABLE
    }

    fn create_table_sql(&self) -> String {
        format!(
            r"
            CREATE TABLE IF NOT EXISTS {} (
                number UInt64,
                hash String,
                parent_number UInt64,
                parent_hash String,
                height UInt64,
                timestamp Int64
            )
            ENGINE = ReplacingMergeTree
            ORDER BY number
            ",
            Self::TABLE
        )
    }

    fn query(&self) -> Value {
        json!({
            "type": "solana",
            "includeAllBlocks": true,
            "fields": {
                "block": {
                    "number": true,
                    "hash": true,
                    "parentNumber": true,
                    "parentHash": true,
                    "height": true,
                    "timestamp": true
                }
            }
        })
    }

    fn decode(&self, batch: BlockBatch) -> Result<Batch<BlockRow>> {
        let rows = batch
            .blocks
            .into_iter()
            .map(|block| {
                let header = block.header;
                BlockRow {
                    number: header.number,
                    parent_number: header.parent_number.unwrap_or_default(),
                    parent_hash: header.parent_hash.unwrap_or_default(),
                    height: header.height.unwrap_or_default(),
                    timestamp: header.timestamp.unwrap_or_default(),
                    hash: header.hash,
                }
            })
            .collect();

        Ok(Batch {
            range: batch.range,
            rows,
        })
    }
}

/// Raw instructions of a set of programs, without program specific decoding.
pub struct InstructionsPipe {
    id: String,
    program_ids: Vec<String>,
}

impl InstructionsPipe {
    pub const TABLE: &'static str = "solana_instructions";

    pub fn new(id: impl Into<String>, program_ids: Vec<String>) -> Self {
        Self {
            id: id.into(),
            program_ids,
        }
    }

    fn to_row(&self, block_number: u64, ix: PortalInstruction) -> Result<Option<InstructionRow>> {
        let program_id = ix.program_id.ok_or_else(|| {
            IndexerError::Protocol(format!(
                "instruction {:?} of tx {} in block {block_number} has no programId",
                ix.instruction_address, ix.transaction_index
            ))
        })?;
        if !self.program_ids.contains(&program_id) {
            return Ok(None);
        }
        let data = ix.data.ok_or_else(|| {
            IndexerError::Protocol(format!(
                "instruction {:?} of tx {} in block {block_number} has no data",
                ix.instruction_address, ix.transaction_index
            ))
        })?;

        Ok(Some(InstructionRow {
            block_number,
            transaction_index: ix.transaction_index,
            instruction_address: ix.instruction_address,
            program_id,
            accounts: ix.accounts,
            data,
            is_committed: ix.is_committed.unwrap_or(true),
        }))
    }
}

impl Pipe for InstructionsPipe {
    type Row = InstructionRow;

    fn id(&self) -> &str {
        &self.id
    }

    fn table(&self) -> &str {
        Self::TABLE
    }

    fn create_table_sql(&self) -> String {
        format!(
            r"
            CREATE TABLE IF NOT EXISTS {} (
                block_number UInt64,
                transaction_index UInt32,
                instruction_address Array(UInt32),
                program_id String,
                accounts Array(String),
                data String,
                is_committed Bool
            )
            ENGINE = ReplacingMergeTree
            ORDER BY (block_number, transaction_index, instruction_address)
            ",
            Self::TABLE
        )
    }

    fn query(&self) -> Value {
        json!({
            "type": "solana",
            "fields": {
                "block": { "number": true, "hash": true },
                "instruction": {
                    "transactionIndex": true,
                    "instructionAddress": true,
                    "programId": true,
                    "accounts": true,
                    "data": true,
                    "isCommitted": true
                }
            },
            "instructions": [{ "programId": self.program_ids }]
        })
    }

    fn decode(&self, batch: BlockBatch) -> Result<Batch<InstructionRow>> {
        let mut rows = Vec::new();
        for block in batch.blocks {
            let number = block.number();
            for ix in block.instructions {
                if let Some(row) = self.to_row(number, ix)? {
                    rows.push(row);
                }
            }
        }

        Ok(Batch {
            range: batch.range,
            rows,
        })
    }
}
