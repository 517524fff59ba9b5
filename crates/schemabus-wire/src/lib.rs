//! # schemabus wire format
//!
//! Framing shared by every schemabus producer and consumer.
//!
//! ## Frame layout
//!
//! ```text
//! +--------+----------------------+-----------------+
//! | 0x00   | schema id (u32, BE)  | payload ...     |
//! +--------+----------------------+-----------------+
//!   byte 0   bytes 1..5             bytes 5..
//! ```
//!
//! The payload is opaque here; the schema id tells the consumer which
//! registry schema to decode it with.
//!
//! ## Subjects
//!
//! Registry subjects are derived from topic names, `orders` maps to
//! `orders-value` for record values and `orders-key` for keys.

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod frame;
pub mod subject;

pub use frame::{decode, encode, is_framed, Frame, FrameError, HEADER_LEN, MAGIC_BYTE};
pub use subject::{SubjectKind, SubjectNameStrategy};
