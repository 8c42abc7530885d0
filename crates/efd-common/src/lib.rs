//! EFD Common Library
#![deny(clippy::unwrap_used, clippy::expect_used)]
//!
//! Shared helpers for the EFD ledger import workspace.
//!
//! # Overview
//!
//! - **Error Handling**: [`EfdError`] and the crate [`Result`] alias
//! - **Logging**: `tracing` subscriber bootstrap driven by environment variables
//! - **Text**: the primitive encodings used by EFD/SPED ledger files
//!   (single-byte text, comma decimals, `DDMMYYYY` dates, digit-only documents)
//! - **Checksum**: content hashing used for natural-key deduplication
//!
//! # Example
//!
//! ```
//! use bigdecimal::BigDecimal;
//! use efd_common::text::{parse_amount, parse_date};
//!
//! let amount = parse_amount("1.500,00").unwrap();
//! assert_eq!(amount, BigDecimal::from(1500));
//!
//! let date = parse_date("31012024").unwrap();
//! assert_eq!(date.to_string(), "2024-01-31");
//! ```

pub mod checksum;
pub mod error;
pub mod logging;
pub mod text;

// Re-export commonly used types
pub use error::{EfdError, Result};
