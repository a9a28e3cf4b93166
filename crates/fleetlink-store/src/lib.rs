//! `fleetlink-store` – the system of record.
//!
//! Persists every dispatched order and direct command in a local SQLite
//! database so the bridge's view of what each robot was asked to do
//! survives restarts.
//!
//! # Modules
//!
//! - [`order_records`] – [`OrderRecordStore`]: order execution records,
//!   their lifecycle transitions and read-only query projections, plus the
//!   [`UnitOfWork`] used by the dispatch path.

pub mod order_records;

pub use order_records::{
    INTERRUPTED_DISPATCH, NewOrderRecord, OrderRecord, OrderRecordStore, StoreError, UNSPECIFIED_FAILURE,
    UnitOfWork,
};
