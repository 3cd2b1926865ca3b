use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use chrono::{Days, NaiveDate};

use crate::agent::{command_from_argv, run_command};
use crate::types::Metrics;

/// Inclusive date range the metrics source aggregates over.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct DateWindow {
    pub start: NaiveDate,
    pub end: NaiveDate,
}

impl std::fmt::Display for DateWindow {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}..{}", self.start, self.end)
    }
}

/// Current and previous measurement windows ending `lag_days` before `today`.
///
/// Each window spans `window_days` days; the previous window ends the day
/// before the current one starts.
pub fn compute_windows(today: NaiveDate, window_days: u32, lag_days: u32) -> (DateWindow, DateWindow) {
    let span = u64::from(window_days.max(1));
    let current_end = today - Days::new(u64::from(lag_days));
    let current_start = current_end - Days::new(span - 1);
    let previous_end = current_start - Days::new(1);
    let previous_start = previous_end - Days::new(span - 1);
    (
        DateWindow {
            start: current_start,
            end: current_end,
        },
        DateWindow {
            start: previous_start,
            end: previous_end,
        },
    )
}

/// Cache key for one (key, window) fetch.
pub fn cache_key(key: &str, window: &DateWindow) -> String {
    format!("metrics:{}:{}:{}", key, window.start, window.end)
}

/// External analytics collaborator. "No data" is a zero-valued `Metrics`,
/// not an error.
pub trait MetricsSource: Send + Sync {
    /// Confirm the source is reachable and authorized.
    fn verify(&self) -> impl std::future::Future<Output = Result<(), String>> + Send;

    fn fetch_metrics(
        &self,
        key: &str,
        window: &DateWindow,
    ) -> impl std::future::Future<Output = Result<Metrics, String>> + Send;
}

/// Runs an external fetcher command.
///
/// `<command> --url KEY --start YYYY-MM-DD --end YYYY-MM-DD` prints a JSON
/// object `{clicks, impressions, ctr, position}`; empty output or `null`
/// means no data. `<command> --verify` exits zero when the source is usable.
#[derive(Debug, Clone)]
pub struct CommandMetricsSource {
    pub command: Vec<String>,
    pub timeout: Duration,
}

impl CommandMetricsSource {
    pub fn new(command: Vec<String>, timeout: Duration) -> Self {
        Self { command, timeout }
    }
}

/// Parse fetcher stdout into metrics.
pub fn parse_metrics(stdout: &str) -> Result<Metrics, String> {
    let trimmed = stdout.trim();
    if trimmed.is_empty() || trimmed == "null" {
        return Ok(Metrics::default());
    }
    serde_json::from_str(trimmed).map_err(|e| format!("Invalid metrics JSON: {}", e))
}

impl MetricsSource for CommandMetricsSource {
    async fn verify(&self) -> Result<(), String> {
        let mut cmd = command_from_argv(&self.command)?;
        cmd.arg("--verify");
        let output = run_command(cmd, None, self.timeout).await?;
        if output.success {
            Ok(())
        } else {
            Err(format!("Metrics source check failed ({})", output.failure_summary()))
        }
    }

    async fn fetch_metrics(&self, key: &str, window: &DateWindow) -> Result<Metrics, String> {
        let mut cmd = command_from_argv(&self.command)?;
        cmd.arg("--url")
            .arg(key)
            .arg("--start")
            .arg(window.start.to_string())
            .arg("--end")
            .arg(window.end.to_string());
        let output = run_command(cmd, None, self.timeout).await?;
        if !output.success {
            return Err(format!(
                "Metrics fetch for {} failed ({})",
                key,
                output.failure_summary()
            ));
        }
        parse_metrics(&output.stdout)
    }
}

/// Mock metrics source for processor and orchestrator tests.
///
/// Keys without configured metrics return zeros. Per-window overrides win
/// over per-key defaults.
#[derive(Debug, Default)]
pub struct MockMetricsSource {
    by_key: HashMap<String, Metrics>,
    by_window: HashMap<(String, DateWindow), Metrics>,
    failing: HashMap<String, String>,
    unavailable: Option<String>,
    calls: AtomicUsize,
}

impl MockMetricsSource {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_metrics(mut self, key: &str, metrics: Metrics) -> Self {
        self.by_key.insert(key.to_string(), metrics);
        self
    }

    pub fn with_window(mut self, key: &str, window: DateWindow, metrics: Metrics) -> Self {
        self.by_window.insert((key.to_string(), window), metrics);
        self
    }

    /// Every fetch for `key` fails with `message`.
    pub fn failing(mut self, key: &str, message: &str) -> Self {
        self.failing.insert(key.to_string(), message.to_string());
        self
    }

    /// `verify` fails with `message`.
    pub fn unavailable(mut self, message: &str) -> Self {
        self.unavailable = Some(message.to_string());
        self
    }

    /// Number of `fetch_metrics` calls made so far.
    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

impl MetricsSource for MockMetricsSource {
    async fn verify(&self) -> Result<(), String> {
        match &self.unavailable {
            Some(message) => Err(message.clone()),
            None => Ok(()),
        }
    }

    async fn fetch_metrics(&self, key: &str, window: &DateWindow) -> Result<Metrics, String> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        if let Some(message) = self.failing.get(key) {
            return Err(message.clone());
        }
        if let Some(metrics) = self.by_window.get(&(key.to_string(), *window)) {
            return Ok(metrics.clone());
        }
        Ok(self.by_key.get(key).cloned().unwrap_or_default())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn windows_are_adjacent_and_lagged() {
        let today = NaiveDate::from_ymd_opt(2026, 3, 31).unwrap();
        let (current, previous) = compute_windows(today, 28, 3);
        assert_eq!(current.end, NaiveDate::from_ymd_opt(2026, 3, 28).unwrap());
        assert_eq!(current.start, NaiveDate::from_ymd_opt(2026, 3, 1).unwrap());
        assert_eq!(previous.end, NaiveDate::from_ymd_opt(2026, 2, 28).unwrap());
        assert_eq!(previous.start, NaiveDate::from_ymd_opt(2026, 2, 1).unwrap());
    }

    #[test]
    fn cache_key_includes_window_bounds() {
        let window = DateWindow {
            start: NaiveDate::from_ymd_opt(2026, 1, 1).unwrap(),
            end: NaiveDate::from_ymd_opt(2026, 1, 28).unwrap(),
        };
        assert_eq!(
            cache_key("https://example.com/a", &window),
            "metrics:https://example.com/a:2026-01-01:2026-01-28"
        );
    }

    #[test]
    fn empty_output_means_no_data() {
        assert_eq!(parse_metrics("").unwrap(), Metrics::default());
        assert_eq!(parse_metrics(" null \n").unwrap(), Metrics::default());
        assert!(parse_metrics("{not json").is_err());
    }
}
