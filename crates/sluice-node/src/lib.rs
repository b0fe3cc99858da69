//! SLUICE admission layer: announcement tracking, request scheduling,
//! delivery reconciliation, and abuse mitigation around an expensive
//! admission sink.
//!
//! [`fetcher::Fetcher`] is the deterministic core and can be driven
//! synchronously; [`service::FetcherService`] runs it as a tokio event loop
//! with sink calls on the blocking pool.

pub mod announce;
pub mod batch;
pub mod config;
pub mod deliver;
pub mod error;
pub mod fetcher;
pub mod policy;
pub mod runtime;
pub mod schedule;
pub mod service;
pub mod sink;
pub mod state;
pub mod stats;

pub use announce::AnnouncedItem;
pub use config::{FetcherConfig, UnsolicitedPolicy};
pub use error::FetcherError;
pub use fetcher::{DeliveryReport, Fetcher, ValidationJob};
pub use policy::{AbuseConfig, AbusePolicy, KindCost, WindowedAbusePolicy};
pub use service::{FetcherHandle, FetcherService};
pub use sink::{AdmissionOutcome, AdmissionSink, PoolItem, RejectClass, RejectClassifier};
pub use stats::FetcherStats;
