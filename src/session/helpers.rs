use crate::types::RetryConfig;
use rand::Rng;
use std::borrow::Cow;
use std::time::Duration;

/// Convert u128 milliseconds to u64, capping at `u64::MAX`
#[allow(clippy::cast_possible_truncation)]
pub(super) const fn millis_to_u64(millis: u128) -> u64 {
    if millis > u64::MAX as u128 {
        u64::MAX
    } else {
        millis as u64
    }
}

/// Exponential backoff with jitter: `base * multiplier^(attempt-1)`, spread
/// by `±jitter` and capped at `max_delay_ms`.
#[allow(
    clippy::cast_possible_truncation,
    clippy::cast_sign_loss,
    clippy::cast_precision_loss,
    clippy::cast_possible_wrap
)]
pub(super) fn calculate_backoff_delay(attempt: u32, config: &RetryConfig) -> Duration {
    let exponent = attempt.saturating_sub(1).min(64) as i32;
    let mut delay = config.base_delay_ms as f64 * config.multiplier.max(1.0).powi(exponent);

    let jitter = config.jitter.clamp(0.0, 1.0);
    if jitter > 0.0 {
        delay *= 1.0 + rand::thread_rng().gen_range(-jitter..=jitter);
    }

    let capped = delay.min(config.max_delay_ms as f64).max(0.0);
    Duration::from_millis(capped as u64)
}

/// Replace control characters other than `\n`, `\r` and `\t` with U+FFFD.
pub(super) fn sanitize_text(text: &str) -> Cow<'_, str> {
    let is_bad = |c: char| c.is_control() && !matches!(c, '\n' | '\r' | '\t');
    if !text.chars().any(is_bad) {
        return Cow::Borrowed(text);
    }
    Cow::Owned(
        text.chars()
            .map(|c| if is_bad(c) { char::REPLACEMENT_CHARACTER } else { c })
            .collect(),
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_millis_to_u64() {
        assert_eq!(millis_to_u64(0), 0);
        assert_eq!(millis_to_u64(1000), 1000);
        assert_eq!(millis_to_u64(u128::from(u64::MAX)), u64::MAX);
        assert_eq!(millis_to_u64(u128::from(u64::MAX) + 1), u64::MAX);
    }

    #[test]
    fn test_backoff_grows_and_caps() {
        let config = RetryConfig {
            jitter: 0.0,
            ..RetryConfig::default()
        };
        assert_eq!(calculate_backoff_delay(1, &config), Duration::from_millis(2000));
        assert_eq!(calculate_backoff_delay(2, &config), Duration::from_millis(4000));
        assert_eq!(calculate_backoff_delay(3, &config), Duration::from_millis(8000));
        assert_eq!(calculate_backoff_delay(10, &config), Duration::from_millis(30_000));
        assert_eq!(calculate_backoff_delay(u32::MAX, &config), Duration::from_millis(30_000));
    }

    #[test]
    fn test_backoff_jitter_stays_in_band() {
        let config = RetryConfig {
            base_delay_ms: 1000,
            jitter: 0.25,
            ..RetryConfig::default()
        };
        for _ in 0..100 {
            let delay = calculate_backoff_delay(1, &config).as_millis();
            assert!((750..=1250).contains(&delay), "delay out of band: {delay}");
        }
    }

    #[test]
    fn test_sanitize_text() {
        assert!(matches!(sanitize_text("plain\ttext\r\n"), Cow::Borrowed(_)));
        assert_eq!(sanitize_text("a\u{0}b\u{1b}[0m"), "a\u{FFFD}b\u{FFFD}[0m");
        assert_eq!(sanitize_text("héllo ✓"), "héllo ✓");
    }
}
