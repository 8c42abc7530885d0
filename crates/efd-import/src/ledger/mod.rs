//! Ledger file model: classification, decoding, and cross-line state
//!
//! Everything in this module is pure. The stream driver in
//! [`crate::framework`] owns I/O and feeds lines through here.

pub mod classifier;
pub mod context;
pub mod decoder;
pub mod models;
pub mod quota;

pub use classifier::{classify, line_tag, Classified, ImportScope, RecordKind};
pub use context::{FormatVariant, ProcessingContext};
pub use decoder::{decode, BranchDirective, BranchSpec, Decoded};
pub use models::{
    CounterpartyRow, Destination, Direction, Family, LedgerRecord, Row, FINAL_CONSUMER,
    UNIDENTIFIED_SUPPLIER,
};
pub use quota::BlockQuotas;
