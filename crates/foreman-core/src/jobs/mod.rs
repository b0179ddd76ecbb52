//! Job store: lineage index, status transitions, tree stats, cancellation.

mod store;

pub use store::JobStore;
