use std::fmt;

use crate::models::portal::PortalBlock;
use crate::utils::error::{IndexerError, Result};

/// Inclusive block range; `to == None` means the range is open ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BlockRange {
    pub from: u64,
    pub to: Option<u64>,
}

impl BlockRange {
    pub fn new(from: u64, to: Option<u64>) -> Result<Self> {
        match to {
            Some(to) if from > to => Err(IndexerError::Config(format!(
                "from block {from} is greater than to block {to}"
            ))),
            _ => Ok(Self { from, to }),
        }
    }

    pub fn bounded(from: u64, to: u64) -> Result<Self> {
        Self::new(from, Some(to))
    }

    pub fn is_bounded(&self) -> bool {
        self.to.is_some()
    }

    pub fn contains(&self, block: u64) -> bool {
        block >= self.from && self.to.map_or(true, |to| block <= to)
    }

    /// Number of block numbers covered, `None` for open ranges.
    pub fn len(&self) -> Option<u64> {
        self.to.map(|to| to - self.from + 1)
    }

    /// The same range starting at `from`, or `None` once `from` is past the end.
    pub fn starting_at(&self, from: u64) -> Option<Self> {
        match self.to {
            Some(to) if from > to => None,
            to => Some(Self { from, to }),
        }
    }
}

impl fmt::Display for BlockRange {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.to {
            Some(to) => write!(f, "[{}, {}]", self.from, to),
            None => write!(f, "[{}, ∞)", self.from),
        }
    }
}

/// Raw blocks received from the portal.
///
/// `range` is always bounded and covers every block number from `range.from`
/// to `range.to`, including slots the portal returned no block for.
#[derive(Debug, Clone)]
pub struct BlockBatch {
    pub range: BlockRange,
    pub blocks: Vec<PortalBlock>,
}

impl BlockBatch {
    pub fn first_block(&self) -> u64 {
        self.range.from
    }

    pub fn last_block(&self) -> u64 {
        self.range.to.unwrap_or(self.range.from)
    }
}

/// Decoded rows for one contiguous block range, committed atomically.
#[derive(Debug, Clone, PartialEq)]
pub struct Batch<R> {
    pub range: BlockRange,
    pub rows: Vec<R>,
}

impl<R> Batch<R> {
    pub fn is_empty(&self) -> bool {
        self.rows.is_empty()
    }
}
