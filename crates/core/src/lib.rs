//! # Relaygate Core
//!
//! Resilient request execution for quota-limited, unreliable HTTP APIs.
//!
//! This crate contains:
//! - [`limiter`]: hierarchical (global + per-scope) reservoir rate limiting
//!   with priority queues, concurrency caps and minimum spacing
//! - [`retry`]: error-class-aware retry with exponential backoff and jitter
//! - [`cache`]: per-type TTL/size-bounded cache with five fetch strategies
//! - [`metrics`]: per-scope call counters and latency
//! - [`engine`]: the [`Engine`] orchestrator composing all of the above under
//!   an overall timeout
//! - [`config`]: TOML-backed [`EngineConfig`]
//!
//! ## Architecture Principles
//! - Every component is an explicit instance; there are no process globals
//! - Provider adapters own the network call and only see [`Engine`]
//! - Time flows through [`relaygate_common::Clock`] so schedules are testable
//!
//! ```no_run
//! use relaygate_core::{CallContext, Engine, EngineConfig, Scope, ScopeConfig};
//! use relaygate_common::EngineError;
//!
//! # async fn run() -> Result<(), Box<dyn std::error::Error>> {
//! let engine = Engine::from_config(EngineConfig::default())?;
//! engine.configure_scope(Scope::new("spotify"), ScopeConfig::builder().max_concurrent(2).build()?)?;
//!
//! let ctx = CallContext::new("spotify", "fetch_track");
//! let track: String = engine
//!     .execute_api_call(ctx, || async { Ok::<_, EngineError>("track".to_string()) })
//!     .await?;
//! # let _ = track;
//! # Ok(())
//! # }
//! ```

pub mod cache;
pub mod config;
pub mod engine;
pub mod limiter;
pub mod metrics;
pub mod retry;
pub mod scope;

pub use cache::{Cache, CacheStats, CacheStrategy, CacheTypeConfig, EvictionReason};
pub use config::EngineConfig;
pub use engine::{CallContext, CallError, Engine, EngineOptions, EngineStats};
pub use limiter::{AdmissionPermit, RateLimiter, RateLimiterConfig, ScopeConfig, WorkItem};
pub use metrics::{MetricsRegistry, ScopeMetricsSnapshot};
pub use retry::{RetryError, RetryManager, RetryPolicy, RetryPreset, RetryState, RetryStats};
pub use scope::Scope;
