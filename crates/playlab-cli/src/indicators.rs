//! Built-in indicator source for CLI runs.
//!
//! A small set of common indicators so bar files can drive a Play without an
//! external indicator service: `atr`, `sma`, `ema` (all over close, NaN
//! until warm). Key invariant: values at index `t` depend only on bars
//! `0..=t`.

use playlab_core::bar::Bar;
use playlab_core::error::{CoreError, Result};
use playlab_core::play::FeatureSpec;
use playlab_engine::features::IndicatorSource;

pub struct BuiltinIndicators;

impl BuiltinIndicators {
    fn period(feature: &FeatureSpec, default: i64) -> i64 {
        feature
            .params
            .get("period")
            .and_then(|v| v.as_i64())
            .unwrap_or(default)
            .max(1)
    }

    fn atr(bars: &[Bar], period: usize) -> Vec<f64> {
        let mut out = vec![f64::NAN; bars.len()];
        let mut trs = Vec::with_capacity(bars.len());
        for (i, bar) in bars.iter().enumerate() {
            let tr = if i == 0 {
                bar.high - bar.low
            } else {
                let prev_close = bars[i - 1].close;
                (bar.high - bar.low)
                    .max((bar.high - prev_close).abs())
                    .max((bar.low - prev_close).abs())
            };
            trs.push(tr);
            if i + 1 >= period {
                // Wilder smoothing seeded with a simple average.
                if i + 1 == period {
                    out[i] = trs[..=i].iter().sum::<f64>() / period as f64;
                } else {
                    out[i] = (out[i - 1] * (period as f64 - 1.0) + tr) / period as f64;
                }
            }
        }
        out
    }

    fn sma(bars: &[Bar], period: usize) -> Vec<f64> {
        let mut out = vec![f64::NAN; bars.len()];
        let mut sum = 0.0;
        for i in 0..bars.len() {
            sum += bars[i].close;
            if i >= period {
                sum -= bars[i - period].close;
            }
            if i + 1 >= period {
                out[i] = sum / period as f64;
            }
        }
        out
    }

    fn ema(bars: &[Bar], period: usize) -> Vec<f64> {
        let mut out = vec![f64::NAN; bars.len()];
        if bars.len() < period {
            return out;
        }
        let k = 2.0 / (period as f64 + 1.0);
        let seed: f64 = bars[..period].iter().map(|b| b.close).sum::<f64>() / period as f64;
        out[period - 1] = seed;
        for i in period..bars.len() {
            out[i] = bars[i].close * k + out[i - 1] * (1.0 - k);
        }
        out
    }
}

impl IndicatorSource for BuiltinIndicators {
    fn compute(&self, feature: &FeatureSpec, bars: &[Bar]) -> Result<Vec<f64>> {
        match feature.name.as_str() {
            "atr" => Ok(Self::atr(bars, Self::period(feature, 14) as usize)),
            "sma" => Ok(Self::sma(bars, Self::period(feature, 20) as usize)),
            "ema" => Ok(Self::ema(bars, Self::period(feature, 20) as usize)),
            other => Err(CoreError::Config(format!(
                "Unknown indicator '{}'. Available: atr, sma, ema",
                other
            ))),
        }
    }
}
