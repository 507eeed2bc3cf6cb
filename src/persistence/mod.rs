//! # Persistence Module
//!
//! ## Why This Module Exists
//! A gateway on a flaky uplink must not lose readings while the broker is out
//! of reach. This module owns the on-disk store-and-forward queue that holds
//! every message produced while disconnected and hands them back, in order,
//! once the connection returns.
//!
//! ## Key Abstractions
//! - **Two-line records**: `topic\n` then `payload\n`, so the file stays
//!   greppable; a record torn by a crash is truncated away on open before
//!   anything new is appended
//! - **Drain then truncate**: the file is only emptied after the transport
//!   accepted every record; an interrupted drain rewrites just the unsent tail
//! - **Durable across restarts**: opening the queue never clears it
//!
//! ## Error Handling Strategy
//! Failures surface as [`StoreError`]. The connection manager logs them and
//! drops the affected record rather than buffering it in memory. A failed send
//! during a drain is always reported as [`StoreError::Interrupted`], even when
//! trimming the file afterwards failed too.

pub mod queue;

pub use queue::{QueueEntry, StoreAndForward, StoreError};
