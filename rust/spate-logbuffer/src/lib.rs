//! Log buffers and term operations.
//!
//! A log buffer is the unit of transfer between a publisher and the driver
//! (and, mirrored on the receiving side, between the driver and
//! subscribers): three equal power-of-two **term buffers** followed by a
//! metadata region. Terms cycle as the stream advances; the partition for a
//! given term id is `term_count mod 3`.
//!
//! The operations over terms are deliberately pure functions over
//! `(buffer, offsets)` so each is unit-testable in isolation:
//!
//! - [`appender`]: publisher-side claim/commit (also used by the driver for
//!   IPC streams and by tests)
//! - [`scanner`]: sender-side scan for committed bytes to transmit
//! - [`rebuilder`]: receiver-side placement of arriving frames
//! - [`gap_scanner`]: locate the first missing run for NAK generation
//! - [`unblocker`]: recover a stream whose publisher died mid-claim
//! - [`gap_filler`]: pad over a range that will never be repaired
//!
//! Every commit is a release store of `frame_length`; every observation is
//! an acquire load of the same field.

pub mod appender;
pub mod gap_filler;
pub mod gap_scanner;
pub mod layout;
pub mod position;
pub mod rebuilder;
pub mod scanner;
pub mod unblocker;

pub use appender::{AppendOutcome, TermAppender};
pub use gap_scanner::Gap;
pub use layout::{LogBuffers, LogMetaData, PARTITION_COUNT, TERM_MAX_LENGTH, TERM_MIN_LENGTH};
pub use scanner::ScanOutcome;
