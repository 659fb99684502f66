pub mod client;
pub mod oauth;
pub mod web;

use bytes::Bytes;
use futures::Stream;
use std::pin::Pin;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DriverKind {
    OAuth,
    Web,
}

pub type ByteStream = Pin<Box<dyn Stream<Item = Result<Bytes, reqwest::Error>> + Send>>;

// Outcome of a minimal rate-limit probe (admin refresh, phase 2).
#[derive(Debug, Clone)]
pub enum ProbeOutcome {
    Valid,
    RateLimited(Option<chrono::DateTime<chrono::Utc>>),
    Inconclusive(String),
}
