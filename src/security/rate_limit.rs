//! Per-client rate limiting with escalating bans.
//!
//! # State Machine
//! ```text
//! Allowed ──(count > limit in window)──▶ Banned(until = now + ladder[n])
//! Banned  ──(now >= until)────────────▶ Allowed (ban count retained)
//! ```
//!
//! # Design Decisions
//! - Fixed windows, not token buckets: counts reset when the window elapses
//! - Banned clients are rejected without touching their window
//! - Expiry is a timestamp checked on access; a periodic sweep bounds memory

use std::net::IpAddr;
use std::time::{Duration, Instant};

use dashmap::DashMap;

/// Fixed-duration counting window.
#[derive(Debug, Clone, Copy)]
pub struct RateWindow {
    count: u32,
    window_start: Instant,
}

impl RateWindow {
    /// A window opened by a first request at `now`.
    pub fn new(now: Instant) -> Self {
        Self {
            count: 0,
            window_start: now,
        }
    }

    /// An empty window opening at `start`, which may lie in the future.
    pub fn starting(start: Instant) -> Self {
        Self {
            count: 0,
            window_start: start,
        }
    }

    /// Count a request. A new window starts once `length` has elapsed.
    pub fn hit(&mut self, now: Instant, length: Duration) -> u32 {
        if now.saturating_duration_since(self.window_start) > length {
            self.window_start = now;
            self.count = 1;
        } else {
            self.count = self.count.saturating_add(1);
        }
        self.count
    }

    pub fn count(&self) -> u32 {
        self.count
    }

    pub fn window_start(&self) -> Instant {
        self.window_start
    }
}

/// Escalation record for one client.
#[derive(Debug, Clone, Copy)]
pub struct BanRecord {
    pub ban_count: u32,
    pub unban_time: Instant,
}

/// Outcome of a client check.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ClientVerdict {
    Allowed,
    /// This request crossed the threshold; a ban of `duration` now applies.
    Limited { duration: Duration },
    /// An earlier ban is still running.
    Banned { remaining: Duration },
}

/// Per-IP fixed-window limiter with an escalation ladder.
#[derive(Debug)]
pub struct ClientRateLimiter {
    windows: DashMap<IpAddr, RateWindow>,
    bans: DashMap<IpAddr, BanRecord>,
    window: Duration,
    limit: u32,
    ladder: Vec<Duration>,
}

impl ClientRateLimiter {
    /// `ladder` holds increasing ban durations; it must not be empty.
    pub fn new(limit: u32, window: Duration, ladder: Vec<Duration>) -> Self {
        Self {
            windows: DashMap::new(),
            bans: DashMap::new(),
            window,
            limit,
            ladder,
        }
    }

    pub fn check(&self, ip: IpAddr) -> ClientVerdict {
        self.check_at(ip, Instant::now())
    }

    pub fn check_at(&self, ip: IpAddr, now: Instant) -> ClientVerdict {
        if let Some(ban) = self.bans.get(&ip) {
            if now < ban.unban_time {
                return ClientVerdict::Banned {
                    remaining: ban.unban_time - now,
                };
            }
        }

        let count = {
            let mut window = self
                .windows
                .entry(ip)
                .or_insert_with(|| RateWindow::new(now));
            window.hit(now, self.window)
        };

        if count > self.limit {
            let duration = self.block_client_at(ip, now);
            return ClientVerdict::Limited { duration };
        }
        ClientVerdict::Allowed
    }

    /// Ban duration for the n-th ban (1-based), capped at the last rung.
    pub fn ban_duration(&self, ban_count: u32) -> Duration {
        let index = (ban_count.saturating_sub(1) as usize).min(self.ladder.len().saturating_sub(1));
        self.ladder.get(index).copied().unwrap_or_default()
    }

    /// Escalate the client's ban. Returns the ban duration applied.
    pub fn block_client(&self, ip: IpAddr) -> Duration {
        self.block_client_at(ip, Instant::now())
    }

    pub fn block_client_at(&self, ip: IpAddr, now: Instant) -> Duration {
        let mut record = self.bans.entry(ip).or_insert(BanRecord {
            ban_count: 0,
            unban_time: now,
        });
        record.ban_count = record.ban_count.saturating_add(1);
        let duration = self.ban_duration(record.ban_count);
        record.unban_time = now + duration;
        tracing::warn!(
            client = %ip,
            ban_count = record.ban_count,
            ban_secs = duration.as_secs(),
            "Blocking client"
        );
        duration
    }

    pub fn ban_record(&self, ip: IpAddr) -> Option<BanRecord> {
        self.bans.get(&ip).map(|r| *r)
    }

    /// Remove windows older than twice the window length and bans that have expired.
    /// Returns `(windows_removed, bans_removed)`.
    pub fn sweep_at(&self, now: Instant) -> (usize, usize) {
        let horizon = self.window * 2;
        let windows_before = self.windows.len();
        self.windows
            .retain(|_, w| now.saturating_duration_since(w.window_start()) <= horizon);
        let bans_before = self.bans.len();
        self.bans.retain(|_, ban| now < ban.unban_time);
        (
            windows_before - self.windows.len(),
            bans_before - self.bans.len(),
        )
    }

    pub fn tracked_clients(&self) -> usize {
        self.windows.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn limiter(limit: u32) -> ClientRateLimiter {
        ClientRateLimiter::new(
            limit,
            Duration::from_secs(60),
            vec![
                Duration::from_secs(300),
                Duration::from_secs(1800),
                Duration::from_secs(86_400),
            ],
        )
    }

    fn ip() -> IpAddr {
        "198.51.100.4".parse().unwrap()
    }

    #[test]
    fn rejects_on_the_request_that_crosses_the_threshold() {
        let limiter = limiter(3);
        let now = Instant::now();
        for _ in 0..3 {
            assert_eq!(limiter.check_at(ip(), now), ClientVerdict::Allowed);
        }
        assert_eq!(
            limiter.check_at(ip(), now),
            ClientVerdict::Limited {
                duration: Duration::from_secs(300)
            }
        );
    }

    #[test]
    fn banned_client_does_not_consume_window() {
        let limiter = limiter(1);
        let now = Instant::now();
        limiter.check_at(ip(), now);
        limiter.check_at(ip(), now);
        for _ in 0..5 {
            assert!(matches!(
                limiter.check_at(ip(), now + Duration::from_secs(1)),
                ClientVerdict::Banned { .. }
            ));
        }
        assert_eq!(limiter.windows.get(&ip()).unwrap().count(), 2);
    }

    #[test]
    fn repeat_offenders_get_longer_capped_bans() {
        let limiter = limiter(1);
        let now = Instant::now();
        let first = limiter.block_client_at(ip(), now);
        let second = limiter.block_client_at(ip(), now);
        let third = limiter.block_client_at(ip(), now);
        let fourth = limiter.block_client_at(ip(), now);
        assert!(second > first);
        assert!(third > second);
        assert_eq!(fourth, third);
        assert_eq!(limiter.ban_record(ip()).unwrap().ban_count, 4);
    }

    #[test]
    fn client_is_allowed_again_after_ban_expires() {
        let limiter = limiter(1);
        let now = Instant::now();
        limiter.check_at(ip(), now);
        limiter.check_at(ip(), now);
        let later = now + Duration::from_secs(301);
        assert_eq!(limiter.check_at(ip(), later), ClientVerdict::Allowed);
    }

    #[test]
    fn sweep_bounds_memory() {
        let limiter = limiter(1);
        let now = Instant::now();
        limiter.check_at(ip(), now);
        limiter.check_at(ip(), now);

        assert_eq!(limiter.sweep_at(now + Duration::from_secs(60)), (0, 0));
        assert_eq!(limiter.sweep_at(now + Duration::from_secs(301)), (1, 1));
        assert_eq!(limiter.tracked_clients(), 0);
    }
}
