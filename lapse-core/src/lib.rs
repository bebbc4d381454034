//! # Lapse Core
//!
//! An in-memory, thread-safe key-value store whose entries expire after a
//! per-entry timeout.
//!
//! ## Features
//!
//! - O(1) client operations: `put`/`get`/`remove` never sort or search;
//!   they append to an unsorted log and leave ordering to a background
//!   purger
//! - Eviction as accurate as the OS timer allows: the purger parks on the
//!   earliest deadline and is re-targeted whenever an earlier one arrives
//! - Bookkeeping proportional to the live entry count: per-key edits to
//!   the schedule coalesce, so hot-key churn cannot grow the log
//! - No idle cost: the purger thread is spawned on first use and exits
//!   after a configurable idle period
//!
//! ## Example
//!
//! ```rust
//! use lapse_core::Store;
//! use std::time::Duration;
//!
//! let store = Store::new();
//!
//! // Expires 50 ms from now.
//! store.put("greeting", "hello", 50);
//! assert_eq!(store.get(&"greeting"), Some("hello"));
//!
//! std::thread::sleep(Duration::from_millis(250));
//! assert_eq!(store.get(&"greeting"), None);
//!
//! store.close();
//! ```

mod config;
mod entry;
mod store;
mod timeout;

pub use config::StoreConfig;
pub use entry::Entry;
pub use store::Store;
