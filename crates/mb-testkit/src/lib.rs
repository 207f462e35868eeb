//! mb-testkit
//!
//! In-process doubles and fixtures for pipeline tests. Nothing here touches a
//! database or the network; scenario tests under `tests/` drive the real
//! directors against [`MemStore`] and [`mb_queue::MemoryQueue`].

mod fixtures;
mod mem_store;

pub use fixtures::{
    auth_record, identity, merchant_identifier, refund_record, scheme_record, settled_record,
    ts, RecordBuilder,
};
pub use mem_store::MemStore;
