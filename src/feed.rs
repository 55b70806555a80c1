//! Price and candle sources
//!
//! The engine never talks to the network. A `SampleFeed` yields live samples
//! and a `CandleFeed` answers the auto-anchor's 4h/1d candle requests; both
//! are implemented outside the core. In-memory feeds back the replay command
//! and the tests.

use std::collections::VecDeque;
use std::future::Future;
use thiserror::Error;

use crate::{Candle, Sample};

/// Failures reported by a feed
#[derive(Debug, Clone, Error)]
pub enum FeedError {
    #[error("feed disconnected: {0}")]
    Disconnected(String),

    #[error("candle fetch failed: {0}")]
    Fetch(String),

    #[error("candle fetch timed out after {0} ms")]
    Timeout(u64),

    #[error("no {interval} candles available")]
    Unavailable { interval: CandleInterval },
}

/// Candle granularities the auto-anchor asks for
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum CandleInterval {
    FourHours,
    OneDay,
}

impl CandleInterval {
    pub fn as_str(&self) -> &'static str {
        match self {
            CandleInterval::FourHours => "4h",
            CandleInterval::OneDay => "1d",
        }
    }
}

impl std::fmt::Display for CandleInterval {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Source of price samples; `Ok(None)` marks the end of the stream
pub trait SampleFeed {
    fn next_sample(&mut self) -> impl Future<Output = Result<Option<Sample>, FeedError>> + Send;
}

/// Source of historical candles, oldest first
pub trait CandleFeed: Send + Sync + 'static {
    fn fetch_candles(
        &self,
        interval: CandleInterval,
        count: usize,
    ) -> impl Future<Output = Result<Vec<Candle>, FeedError>> + Send;
}

/// Replays a fixed list of samples
#[derive(Debug, Clone, Default)]
pub struct VecSampleFeed {
    samples: VecDeque<Sample>,
}

impl VecSampleFeed {
    pub fn new(samples: impl IntoIterator<Item = Sample>) -> Self {
        Self {
            samples: samples.into_iter().collect(),
        }
    }

    pub fn remaining(&self) -> usize {
        self.samples.len()
    }
}

impl SampleFeed for VecSampleFeed {
    async fn next_sample(&mut self) -> Result<Option<Sample>, FeedError> {
        Ok(self.samples.pop_front())
    }
}

/// Serves fixed candle sets; an empty set reports `Unavailable`
#[derive(Debug, Clone, Default)]
pub struct StaticCandleFeed {
    four_hours: Vec<Candle>,
    one_day: Vec<Candle>,
}

impl StaticCandleFeed {
    pub fn new(four_hours: Vec<Candle>, one_day: Vec<Candle>) -> Self {
        Self {
            four_hours,
            one_day,
        }
    }

    /// A feed with nothing to serve
    pub fn empty() -> Self {
        Self::default()
    }
}

impl CandleFeed for StaticCandleFeed {
    async fn fetch_candles(&self, interval: CandleInterval, count: usize) -> Result<Vec<Candle>, FeedError> {
        let candles = match interval {
            CandleInterval::FourHours => &self.four_hours,
            CandleInterval::OneDay => &self.one_day,
        };
        if candles.is_empty() {
            return Err(FeedError::Unavailable { interval });
        }
        let start = candles.len().saturating_sub(count);
        Ok(candles[start..].to_vec())
    }
}
