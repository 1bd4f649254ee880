pub mod cursor;
pub mod ingestion;
pub mod pipes;
pub mod portal;
