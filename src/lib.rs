//! Assessment statistics core
//!
//! Turns the volatile per-day counters written by the assessment pipeline into
//! durable daily and accumulated rollups, serves statistics views through a
//! snapshot cache with live-aggregation fallback, and periodically reconciles
//! rollups against the counters.

pub mod aggregator;
pub mod cache;
pub mod config;
pub mod db;
pub mod error;
pub mod jobs;
pub mod model;
pub mod query;

pub use cache::{build_counter_cache, CounterCache, MemoryCounterCache, RedisCounterCache};
pub use db::{Database, RawAggregator, RollupStore, SqliteRollupStore};
pub use error::{Result, StatsError};
pub use jobs::{BatchOptions, RunOutcome, Synchronizer, SyncReport, ValidationReport, Validator};
pub use query::QueryGateway;
