//! Ingestion: discover landed files, parse them and commit raw rows to bronze
//! under the file ledger's exactly-once guarantee.

pub mod coordinator;
pub mod parse;

pub use coordinator::{FileFailure, IngestionCoordinator, IngestionReport, fingerprint};
pub use parse::{ParsedFile, flatten, parse_file, type_cell};
