use std::time::Duration;

/// Aggregated metrics for one observation window, in milliseconds.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct WindowStats {
    pub avg_rtt_ms: f64,
    pub loss_pct: f64,
    pub jitter_ms: f64,
}

/// Fold a window's successful samples into average RTT, loss percentage,
/// and jitter (population standard deviation of the RTTs).
pub fn aggregate(samples: &[Duration], pings: u32) -> WindowStats {
    let successes = samples.len();
    if successes == 0 {
        return WindowStats {
            avg_rtt_ms: 0.0,
            loss_pct: 100.0,
            jitter_ms: 0.0,
        };
    }

    let ms: Vec<f64> = samples.iter().map(|d| d.as_secs_f64() * 1000.0).collect();
    let avg = ms.iter().sum::<f64>() / successes as f64;

    let loss = f64::from(pings - successes as u32) / f64::from(pings) * 100.0;

    let jitter = if successes > 1 {
        let variance = ms.iter().map(|x| (x - avg).powi(2)).sum::<f64>() / successes as f64;
        variance.sqrt()
    } else {
        0.0
    };

    WindowStats {
        avg_rtt_ms: avg,
        loss_pct: loss,
        jitter_ms: jitter,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ms(values: &[u64]) -> Vec<Duration> {
        values.iter().map(|&v| Duration::from_millis(v)).collect()
    }

    #[test]
    fn test_all_samples_equal() {
        let stats = aggregate(&ms(&[1, 1, 1, 1, 1]), 5);
        assert_eq!(stats.avg_rtt_ms, 1.0);
        assert_eq!(stats.loss_pct, 0.0);
        assert_eq!(stats.jitter_ms, 0.0);
    }

    #[test]
    fn test_partial_loss() {
        let stats = aggregate(&ms(&[10, 20, 30]), 5);
        assert_eq!(stats.avg_rtt_ms, 20.0);
        assert_eq!(stats.loss_pct, 40.0);
        // Population standard deviation of {10, 20, 30}.
        assert!((stats.jitter_ms - 8.164965809).abs() < 1e-6);
    }

    #[test]
    fn test_window_fully_lost() {
        let stats = aggregate(&[], 5);
        assert_eq!(stats.avg_rtt_ms, 0.0);
        assert_eq!(stats.loss_pct, 100.0);
        assert_eq!(stats.jitter_ms, 0.0);
    }

    #[test]
    fn test_single_ping_window() {
        let stats = aggregate(&ms(&[7]), 1);
        assert_eq!(stats.avg_rtt_ms, 7.0);
        assert_eq!(stats.loss_pct, 0.0);
        assert_eq!(stats.jitter_ms, 0.0);
    }

    #[test]
    fn test_single_success_has_zero_jitter() {
        let stats = aggregate(&ms(&[42]), 5);
        assert_eq!(stats.avg_rtt_ms, 42.0);
        assert_eq!(stats.loss_pct, 80.0);
        assert_eq!(stats.jitter_ms, 0.0);
    }

    #[test]
    fn test_loss_bounds() {
        for successes in 0..=5usize {
            let samples = ms(&vec![10; successes]);
            let stats = aggregate(&samples, 5);
            assert!((0.0..=100.0).contains(&stats.loss_pct));
            assert_eq!(stats.loss_pct, (5 - successes) as f64 / 5.0 * 100.0);
        }
    }

    #[test]
    fn test_submillisecond_precision() {
        let samples = vec![Duration::from_micros(500), Duration::from_micros(1500)];
        let stats = aggregate(&samples, 2);
        assert!((stats.avg_rtt_ms - 1.0).abs() < 1e-9);
        assert!((stats.jitter_ms - 0.5).abs() < 1e-9);
    }
}
