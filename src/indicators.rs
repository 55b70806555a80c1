//! Numeric helpers powered by the `ta` and `statrs` crates
//!
//! - Percent change and range helpers used by every detector
//! - EMA over a series (auto-anchor) and a streaming EMA (volume baseline)
//! - Sample standard deviation (volatility scaling)

use statrs::statistics::Statistics;
use ta::indicators::ExponentialMovingAverage;
use ta::Next;

// =============================================================================
// Percentages
// =============================================================================

/// Signed percentage change from `from` to `to`
pub fn pct_change(from: f64, to: f64) -> Option<f64> {
    if !from.is_finite() || !to.is_finite() || from <= 0.0 {
        return None;
    }
    let pct = (to - from) / from * 100.0;
    pct.is_finite().then_some(pct)
}

/// High-low range as a percentage of the low
pub fn range_pct(high: f64, low: f64) -> Option<f64> {
    if low <= 0.0 || high < low {
        return None;
    }
    let pct = (high - low) / low * 100.0;
    pct.is_finite().then_some(pct)
}

/// Absolute distance of `price` from `reference`, in percent of the reference
pub fn distance_pct(price: f64, reference: f64) -> Option<f64> {
    pct_change(reference, price).map(f64::abs)
}

// =============================================================================
// Moving Averages
// =============================================================================

/// Calculate Exponential Moving Average
pub fn ema(values: &[f64], period: usize) -> Vec<Option<f64>> {
    if values.is_empty() || period == 0 {
        return vec![];
    }

    let mut indicator = match ExponentialMovingAverage::new(period) {
        Ok(i) => i,
        Err(_) => return vec![None; values.len()],
    };

    values
        .iter()
        .enumerate()
        .map(|(i, &value)| {
            let ema_val = indicator.next(value);
            (i + 1 >= period).then_some(ema_val)
        })
        .collect()
}

/// Most recent EMA value, once the series covers the period
pub fn last_ema(values: &[f64], period: usize) -> Option<f64> {
    ema(values, period)
        .last()
        .copied()
        .flatten()
        .filter(|v| v.is_finite())
}

/// Streaming EMA that reports a value only after `period` inputs
#[derive(Debug, Clone)]
pub struct StreamingEma {
    indicator: Option<ExponentialMovingAverage>,
    period: usize,
    count: usize,
    value: f64,
}

impl StreamingEma {
    pub fn new(period: usize) -> Self {
        Self {
            indicator: ExponentialMovingAverage::new(period).ok(),
            period,
            count: 0,
            value: 0.0,
        }
    }

    pub fn next(&mut self, input: f64) {
        if !input.is_finite() {
            return;
        }
        if let Some(indicator) = self.indicator.as_mut() {
            self.value = indicator.next(input);
            self.count += 1;
        }
    }

    pub fn value(&self) -> Option<f64> {
        (self.indicator.is_some() && self.count >= self.period).then_some(self.value)
    }

    pub fn period(&self) -> usize {
        self.period
    }
}

// =============================================================================
// Dispersion
// =============================================================================

/// Unbiased sample standard deviation; `None` below two finite values
pub fn sample_std_dev<'a>(values: impl IntoIterator<Item = &'a f64>) -> Option<f64> {
    let finite: Vec<f64> = values.into_iter().copied().filter(|v| v.is_finite()).collect();
    if finite.len() < 2 {
        return None;
    }
    let sd = finite.iter().std_dev();
    sd.is_finite().then_some(sd)
}
