// =============================================================================
// Indicator snapshot — simple moving averages over closed bars
// =============================================================================
//
// The teacher computed a much richer indicator set (`indicators/{ema,rsi,
// adx,bollinger,atr,roc}.rs`); SPEC_FULL.md only names {MA5, MA10, MA20} plus
// 24h change, so only that subset survives, in the same free-function
// (state-in, number-out) shape the teacher used in `indicators/ema.rs`.
// =============================================================================

use serde::Serialize;

use crate::exchange::KlineBar;

#[derive(Debug, Clone, Copy, Default, Serialize, PartialEq)]
pub struct MovingAverages {
    pub ma5: Option<f64>,
    pub ma10: Option<f64>,
    pub ma20: Option<f64>,
}

#[derive(Debug, Clone, Copy, Serialize)]
pub struct IndicatorSnapshot {
    pub change24h: Option<f64>,
    pub ma: MovingAverages,
}

/// Equal-weight average of the last `n` *closed* bars' close prices. The most
/// recent bar in `bars` is assumed still open and is excluded, matching the
/// teacher's convention in `indicators/ema.rs` of never seeding off a
/// partial candle. Returns `None` if fewer than `n` closed bars are available.
fn simple_moving_average(bars: &[KlineBar], n: usize) -> Option<f64> {
    if bars.len() <= n {
        return None;
    }
    let closed = &bars[..bars.len() - 1];
    if closed.len() < n {
        return None;
    }
    let window = &closed[closed.len() - n..];
    let sum: f64 = window.iter().map(|b| b.close).sum();
    Some(sum / n as f64)
}

pub fn moving_averages(bars: &[KlineBar]) -> MovingAverages {
    MovingAverages {
        ma5: simple_moving_average(bars, 5),
        ma10: simple_moving_average(bars, 10),
        ma20: simple_moving_average(bars, 20),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn bar(close: f64) -> KlineBar {
        KlineBar {
            open_time_ms: 0,
            close_time_ms: 0,
            open: close,
            high: close,
            low: close,
            close,
            volume: 0.0,
        }
    }

    #[test]
    fn insufficient_bars_yield_none() {
        let bars: Vec<_> = (0..4).map(|i| bar(i as f64)).collect();
        let ma = moving_averages(&bars);
        assert_eq!(ma.ma5, None);
        assert_eq!(ma.ma10, None);
        assert_eq!(ma.ma20, None);
    }

    #[test]
    fn ma5_excludes_the_open_bar() {
        // closes: 1,2,3,4,5,6 (6 is the open bar) -> ma5 over 1..=5
        let bars: Vec<_> = (1..=6).map(|i| bar(i as f64)).collect();
        let ma = moving_averages(&bars);
        assert_eq!(ma.ma5, Some((1.0 + 2.0 + 3.0 + 4.0 + 5.0) / 5.0));
    }

    #[test]
    fn ma20_needs_21_bars_total() {
        let bars: Vec<_> = (1..=21).map(|i| bar(i as f64)).collect();
        let ma = moving_averages(&bars);
        assert!(ma.ma20.is_some());
        let bars_short: Vec<_> = (1..=20).map(|i| bar(i as f64)).collect();
        assert_eq!(moving_averages(&bars_short).ma20, None);
    }
}
