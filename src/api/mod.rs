//! External identity-search API

pub mod client;
pub mod limiter;
pub mod types;

pub use client::{
    HttpTransport, IdentityClient, RateLimitedClient, ReqwestTransport, TransportError,
    TransportResponse, MAX_PER_PAGE,
};
pub use limiter::AdaptiveRateLimiter;
pub use types::{CompanyHit, SearchResponse};
