use serde::{Deserialize, Serialize};

// Portal wire format (one JSON object per line of the /stream response)

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BlockHeader {
    pub number: u64,
    pub hash: String,
    #[serde(default)]
    pub parent_number: Option<u64>,
    #[serde(default)]
    pub parent_hash: Option<String>,
    #[serde(default)]
    pub height: Option<u64>,
    #[serde(default)]
    pub timestamp: Option<i64>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PortalInstruction {
    pub transaction_index: u32,
    pub instruction_address: Vec<u32>,
    #[serde(default)]
    pub program_id: Option<String>,
    #[serde(default)]
    pub accounts: Vec<String>,
    #[serde(default)]
    pub data: Option<String>,
    #[serde(default)]
    pub is_committed: Option<bool>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PortalBlock {
    pub header: BlockHeader,
    #[serde(default)]
    pub transactions: Vec<serde_json::Value>,
    #[serde(default)]
    pub instructions: Vec<PortalInstruction>,
}

impl PortalBlock {
    pub fn number(&self) -> u64 {
        self.header.number
    }
}

/// Response of `GET {portal}/head`.
#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct PortalHead {
    pub number: u64,
    pub hash: String,
}
