pub mod block;
pub mod portal;
pub mod rows;

pub use block::{Batch, BlockBatch, BlockRange};
pub use portal::{BlockHeader, PortalBlock, PortalHead, PortalInstruction};
pub use rows::{BlockRow, InstructionRow};
