//! Utility functions.

use std::time::Duration;

/// Seed the torch generators used for initialization and sampling.
pub fn set_seed(seed: i64) {
    tch::manual_seed(seed);
}

/// Abbreviate parameter counts for display, e.g. `1.5M`.
pub fn abbreviate(count: i64) -> String {
    let n = count.max(0) as f64;
    match count {
        c if c < 1_000 => format!("{}", c.max(0)),
        c if c < 1_000_000 => format!("{:.1}K", n / 1e3),
        c if c < 1_000_000_000 => format!("{:.1}M", n / 1e6),
        _ => format!("{:.1}B", n / 1e9),
    }
}

/// Elapsed time as `850ms`, `12.3s` or `2m 5s`.
pub fn format_elapsed(elapsed: Duration) -> String {
    let millis = elapsed.as_millis();
    if millis < 1_000 {
        format!("{}ms", millis)
    } else if millis < 60_000 {
        format!("{:.1}s", elapsed.as_secs_f64())
    } else {
        let secs = elapsed.as_secs();
        format!("{}m {}s", secs / 60, secs % 60)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_abbreviate() {
        assert_eq!(abbreviate(512), "512");
        assert_eq!(abbreviate(4_096), "4.1K");
        assert_eq!(abbreviate(1_500_000), "1.5M");
        assert_eq!(abbreviate(7_000_000_000), "7.0B");
        assert_eq!(abbreviate(-3), "0");
    }

    #[test]
    fn test_format_elapsed() {
        assert_eq!(format_elapsed(Duration::from_millis(850)), "850ms");
        assert_eq!(format_elapsed(Duration::from_millis(12_300)), "12.3s");
        assert_eq!(format_elapsed(Duration::from_secs(125)), "2m 5s");
    }

    #[test]
    fn test_set_seed_is_deterministic() {
        set_seed(7);
        let a = tch::Tensor::randn([4], (tch::Kind::Float, tch::Device::Cpu));
        set_seed(7);
        let b = tch::Tensor::randn([4], (tch::Kind::Float, tch::Device::Cpu));
        assert!(a.equal(&b));
    }
}
