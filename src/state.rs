//! Shared application state handed to every C11 HTTP handler.
//!
//! Grounded in the teacher's own `state.rs` (one `Clone` struct of `Arc`
//! service handles plus `Settings`) — the service list is swapped for this
//! crate's C3/C5/C6/C7/C9/C10 handles, and the teacher's bespoke
//! `IpWhitelist`/`CustomHeaderValidator` security layer is replaced by the
//! governor-backed per-IP rate limiter SPEC_FULL.md §4.11 calls for.

use std::net::IpAddr;
use std::num::NonZeroU32;
use std::sync::Arc;

use governor::clock::DefaultClock;
use governor::state::keyed::DefaultKeyedStateStore;
use governor::{Quota, RateLimiter};

use crate::config::Settings;
use crate::corpus::RetrieverCapabilities;
use crate::jobs::JobStore;
use crate::orchestrator::Orchestrator;
use crate::promptcache::PromptCache;
use crate::telemetry::Tracer;

type IpRateLimiter = RateLimiter<IpAddr, DefaultKeyedStateStore<IpAddr>, DefaultClock>;

/// Wraps the keyed limiter so a `rate_limit_per_minute` of 0 disables
/// limiting outright rather than constructing a zero-quota limiter, which
/// `governor` rejects.
pub struct RateLimit {
    limiter: Option<IpRateLimiter>,
}

impl RateLimit {
    pub fn per_minute(limit: u32) -> Self {
        let limiter = NonZeroU32::new(limit).map(|n| RateLimiter::keyed(Quota::per_minute(n)));
        Self { limiter }
    }

    pub fn check(&self, ip: IpAddr) -> bool {
        match &self.limiter {
            Some(limiter) => limiter.check_key(&ip).is_ok(),
            None => true,
        }
    }
}

#[derive(Clone)]
pub struct AppState {
    pub settings: Arc<Settings>,
    pub orchestrator: Arc<Orchestrator>,
    pub job_store: Arc<dyn JobStore>,
    pub prompt_cache: Arc<PromptCache>,
    pub tracer: Arc<Tracer>,
    pub retriever_capabilities: Arc<RetrieverCapabilities>,
    pub rate_limit: Arc<RateLimit>,
}
