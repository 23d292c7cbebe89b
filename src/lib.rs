pub mod compute;
pub mod config;
pub mod coordinator;
pub mod errors;
pub mod index;
pub mod prefetch;
pub mod reconcile;
pub mod replicate;
pub mod store;
pub mod workspace;
