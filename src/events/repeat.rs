use regex::Regex;
use std::sync::LazyLock;
use std::time::Duration;

use crate::error::OrchestrationError;

static REPEAT_PATTERN: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^R(\d*)/P(?:(\d+)D)?(?:T(?:(\d+)H)?(?:(\d+)M)?(?:(\d+)S)?)?$")
        .expect("repeat rule pattern is valid")
});

/// ISO-8601 repeating interval such as `R3/PT10M` or `R/P1D`.
///
/// `R<n>` is the total number of firings, counting the first one at the
/// timer's due date. A bare `R` repeats until the timer is cancelled.
/// Occurrences are spaced by a fixed interval from the previous due time.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RepeatRule {
    pub total_firings: Option<u32>,
    pub interval: Duration,
}

impl RepeatRule {
    pub fn parse(rule: &str) -> Result<Self, OrchestrationError> {
        let invalid = || OrchestrationError::validation(format!("invalid repeat rule '{}'", rule));

        let caps = REPEAT_PATTERN.captures(rule.trim()).ok_or_else(invalid)?;

        let total_firings = match caps.get(1).map(|m| m.as_str()) {
            None | Some("") => None,
            Some(n) => {
                let n: u32 = n.parse().map_err(|_| invalid())?;
                if n == 0 {
                    return Err(invalid());
                }
                Some(n)
            }
        };

        let component = |idx: usize, unit_secs: u64| -> Result<u64, OrchestrationError> {
            match caps.get(idx) {
                Some(m) => m
                    .as_str()
                    .parse::<u64>()
                    .ok()
                    .and_then(|v| v.checked_mul(unit_secs))
                    .ok_or_else(invalid),
                None => Ok(0),
            }
        };

        let mut seconds: u64 = 0;
        for (idx, unit_secs) in [(2, 86_400), (3, 3_600), (4, 60), (5, 1)] {
            seconds = seconds
                .checked_add(component(idx, unit_secs)?)
                .ok_or_else(invalid)?;
        }
        if seconds == 0 {
            return Err(invalid());
        }

        let interval = Duration::from_secs(seconds);
        // Due dates advance in chrono time, so the interval must fit there.
        chrono::Duration::from_std(interval).map_err(|_| invalid())?;

        Ok(Self {
            total_firings,
            interval,
        })
    }

    /// Whether another firing follows the `fired`-th one.
    pub fn has_next(&self, fired: u32) -> bool {
        match self.total_firings {
            Some(total) => fired < total,
            None => true,
        }
    }
}
