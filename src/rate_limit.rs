// src/rate_limit.rs
//
// Shared rate limiter: token bucket (per-minute) plus a daily cap whose
// counter is persisted to disk and survives restarts. One instance is
// constructed at startup and injected into every LLM call site.

use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Mutex;
use std::time::Duration;
use tempfile::NamedTempFile;
use time::OffsetDateTime;
use tokio::time::Instant;
use tracing::{error, info};

#[derive(Debug, Serialize, Deserialize)]
struct DailyCounter {
    day: String,
    count: u32,
}

struct LimiterState {
    tokens: f64,
    last_refill: Instant,
    today: String,
    daily_count: u32,
}

pub struct RateLimiter {
    rpm: u32,
    rpd: u32,
    counter_file: PathBuf,
    state: Mutex<LimiterState>,
}

fn today_utc() -> String {
    let date = OffsetDateTime::now_utc().date();
    format!("{:04}-{:02}-{:02}", date.year(), date.month() as u8, date.day())
}

impl RateLimiter {
    pub fn new(rpm: u32, rpd: u32, counter_file: impl AsRef<Path>) -> Self {
        let counter_file = counter_file.as_ref().to_path_buf();
        let today = today_utc();

        // Restore today's count if the persisted day matches.
        let daily_count = fs::read_to_string(&counter_file)
            .ok()
            .and_then(|text| serde_json::from_str::<DailyCounter>(&text).ok())
            .filter(|stored| stored.day == today)
            .map(|stored| stored.count)
            .unwrap_or(0);

        info!(rpm, rpd, daily_count, "Rate limiter initialised");
        Self {
            rpm,
            rpd,
            counter_file,
            state: Mutex::new(LimiterState {
                tokens: rpm as f64,
                last_refill: Instant::now(),
                today,
                daily_count,
            }),
        }
    }

    /// Wait until a minute-token is available or `timeout` elapses.
    ///
    /// Returns `false` immediately when the daily cap is already reached
    /// (no minute-token is consumed), and `false` on timeout.
    pub async fn acquire(&self, timeout: Duration) -> bool {
        {
            let mut state = self.state.lock().expect("limiter lock poisoned");
            self.rotate_day_if_needed(&mut state);
            if state.daily_count >= self.rpd {
                return false;
            }
        }

        let deadline = Instant::now() + timeout;
        loop {
            {
                let mut state = self.state.lock().expect("limiter lock poisoned");
                self.refill(&mut state);
                if state.tokens >= 1.0 {
                    state.tokens -= 1.0;
                    state.daily_count += 1;
                    self.persist(&state);
                    return true;
                }
            }
            let now = Instant::now();
            if now >= deadline {
                return false;
            }
            let remaining = deadline - now;
            tokio::time::sleep(remaining.min(Duration::from_secs(2))).await;
        }
    }

    pub fn daily_remaining(&self) -> u32 {
        let mut state = self.state.lock().expect("limiter lock poisoned");
        self.rotate_day_if_needed(&mut state);
        self.rpd.saturating_sub(state.daily_count)
    }

    fn refill(&self, state: &mut LimiterState) {
        let now = Instant::now();
        let elapsed = now.duration_since(state.last_refill).as_secs_f64();
        let max_tokens = self.rpm as f64;
        state.tokens = (state.tokens + elapsed * (self.rpm as f64 / 60.0)).min(max_tokens);
        state.last_refill = now;
    }

    fn rotate_day_if_needed(&self, state: &mut LimiterState) {
        let today = today_utc();
        if today != state.today {
            state.today = today;
            state.daily_count = 0;
            self.persist(state);
        }
    }

    /// Atomically persist `{day, count}` (write temp, then rename).
    fn persist(&self, state: &LimiterState) {
        let counter = DailyCounter {
            day: state.today.clone(),
            count: state.daily_count,
        };
        if let Err(e) = self.write_counter(&counter) {
            error!(error = %e, "Failed to persist daily LLM counter");
        }
    }

    fn write_counter(&self, counter: &DailyCounter) -> Result<(), Box<dyn std::error::Error>> {
        let parent = self
            .counter_file
            .parent()
            .filter(|p| !p.as_os_str().is_empty())
            .unwrap_or(Path::new("."));
        fs::create_dir_all(parent)?;
        let tmp = NamedTempFile::new_in(parent)?;
        fs::write(tmp.path(), serde_json::to_string(counter)?)?;
        tmp.persist(&self.counter_file)?;
        Ok(())
    }
}
