//! Recognition result filtering
//!
//! Drops fragments, rate-limits final results, and applies a best-effort echo
//! heuristic for short acknowledgements that are most likely the speaker
//! output leaking back into the microphone. The echo check is a guess, not a
//! guarantee.

use std::time::{Duration, Instant};

/// Default minimum transcript length (trimmed, in characters)
const DEFAULT_MIN_CHARS: usize = 2;

/// Default minimum interval between accepted final results
const DEFAULT_MIN_INTERVAL_MS: u64 = 500;

/// Maximum words for a result to be considered a possible echo
const ECHO_MAX_WORDS: usize = 2;

/// Acknowledgements that commonly leak from the coach's own voice
const DEFAULT_ECHO_WORDS: &[&str] = &[
    "ok", "okay", "vale", "sí", "si", "yes", "yeah", "bien", "claro", "mm", "mhm", "ajá", "aja",
    "uh", "eh",
];

/// Result filter settings
#[derive(Debug, Clone)]
pub struct FilterConfig {
    /// Minimum trimmed length in characters
    pub min_chars: usize,
    /// Minimum time between accepted final results
    pub min_interval: Duration,
    /// Discard short finals made only of denylisted words
    pub echo_suppression: bool,
    /// Denylisted acknowledgement words (lowercase)
    pub echo_words: Vec<String>,
}

impl Default for FilterConfig {
    fn default() -> Self {
        Self {
            min_chars: DEFAULT_MIN_CHARS,
            min_interval: Duration::from_millis(DEFAULT_MIN_INTERVAL_MS),
            echo_suppression: true,
            echo_words: DEFAULT_ECHO_WORDS.iter().map(ToString::to_string).collect(),
        }
    }
}

/// Why a result was rejected
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Rejection {
    TooShort,
    RateLimited,
    LikelyEcho,
}

/// Stateful recognition result filter
#[derive(Debug)]
pub struct ResultFilter {
    config: FilterConfig,
    last_accepted: Option<Instant>,
}

impl ResultFilter {
    /// Create a filter
    #[must_use]
    pub const fn new(config: FilterConfig) -> Self {
        Self {
            config,
            last_accepted: None,
        }
    }

    /// Check an interim result (length only)
    ///
    /// # Errors
    ///
    /// Returns the rejection reason when the result should be dropped
    pub fn check_interim(&self, text: &str) -> Result<(), Rejection> {
        if text.trim().chars().count() < self.config.min_chars {
            return Err(Rejection::TooShort);
        }
        Ok(())
    }

    /// Check a final result at `now`, recording it when accepted
    ///
    /// # Errors
    ///
    /// Returns the rejection reason when the result should be dropped
    pub fn check_final(&mut self, text: &str, now: Instant) -> Result<(), Rejection> {
        self.check_interim(text)?;

        if let Some(last) = self.last_accepted {
            if now.saturating_duration_since(last) < self.config.min_interval {
                return Err(Rejection::RateLimited);
            }
        }

        if self.config.echo_suppression && self.is_echo(text) {
            return Err(Rejection::LikelyEcho);
        }

        self.last_accepted = Some(now);
        Ok(())
    }

    fn is_echo(&self, text: &str) -> bool {
        let words: Vec<String> = text
            .split_whitespace()
            .map(|w| {
                w.trim_matches(|c: char| !c.is_alphanumeric())
                    .to_lowercase()
            })
            .filter(|w| !w.is_empty())
            .collect();

        !words.is_empty()
            && words.len() <= ECHO_MAX_WORDS
            && words.iter().all(|w| self.config.echo_words.contains(w))
    }
}

impl Default for ResultFilter {
    fn default() -> Self {
        Self::new(FilterConfig::default())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rejects_fragments() {
        let filter = ResultFilter::default();
        assert_eq!(filter.check_interim(" a "), Err(Rejection::TooShort));
        assert_eq!(filter.check_interim(""), Err(Rejection::TooShort));
        assert!(filter.check_interim("no").is_ok());
    }

    #[test]
    fn rate_limits_finals() {
        let mut filter = ResultFilter::default();
        let start = Instant::now();

        assert!(filter.check_final("Prefiero no hacerlo", start).is_ok());
        assert_eq!(
            filter.check_final("Prefiero no hacerlo", start + Duration::from_millis(200)),
            Err(Rejection::RateLimited)
        );
        assert!(
            filter
                .check_final("Otra frase distinta", start + Duration::from_millis(600))
                .is_ok()
        );
    }

    #[test]
    fn rejected_finals_do_not_reset_window() {
        let mut filter = ResultFilter::default();
        let start = Instant::now();

        assert!(filter.check_final("primera frase", start).is_ok());
        let _ = filter.check_final("segunda", start + Duration::from_millis(400));
        assert!(
            filter
                .check_final("tercera frase", start + Duration::from_millis(550))
                .is_ok()
        );
    }

    #[test]
    fn suppresses_short_acknowledgements() {
        let mut filter = ResultFilter::default();
        let now = Instant::now();
        assert_eq!(filter.check_final("Vale.", now), Err(Rejection::LikelyEcho));
        assert_eq!(filter.check_final("ok, sí", now), Err(Rejection::LikelyEcho));
        // Longer sentences containing the same words pass
        assert!(filter.check_final("vale, pero no estoy seguro", now).is_ok());
    }

    #[test]
    fn echo_suppression_can_be_disabled() {
        let mut filter = ResultFilter::new(FilterConfig {
            echo_suppression: false,
            ..FilterConfig::default()
        });
        assert!(filter.check_final("okay", Instant::now()).is_ok());
    }
}
