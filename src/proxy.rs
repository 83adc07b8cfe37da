//! Egress proxy pool: loaded once at startup, rotated on a fixed request
//! interval, with permanent removal of banned or failing entries.
//!
//! The pool is only engaged when a rotation interval is configured; with
//! no interval all traffic goes direct even if a proxy list is present.
//!
//! Removal policy: an entry that triggers forced rotation (403 or a
//! transport failure) is marked dead and never reused for the rest of the
//! run. Entries are mutated in place, never recreated.

use std::fs;
use std::path::Path;

use log::{info, warn};

use crate::error::QueryError;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProxyScheme {
    Http,
    Https,
    Socks5,
}

impl ProxyScheme {
    fn from_address(address: &str) -> Option<Self> {
        if address.starts_with("http://") {
            Some(ProxyScheme::Http)
        } else if address.starts_with("https://") {
            Some(ProxyScheme::Https)
        } else if address.starts_with("socks5://") {
            Some(ProxyScheme::Socks5)
        } else {
            None
        }
    }
}

#[derive(Debug, Clone)]
pub struct ProxyEntry {
    /// Full proxy URI including the scheme prefix.
    pub address: String,
    pub scheme: ProxyScheme,
    /// Lifetime requests sent through this entry.
    pub usage_count: u32,
    pub alive: bool,
}

/// Owns the egress list and all rotation state. One pool instance is
/// shared by the primary query loop and the secondary detail lookups, so
/// rotation accounting is global across both.
#[derive(Debug)]
pub struct ProxyPool {
    entries: Vec<ProxyEntry>,
    active: usize,
    /// Requests per proxy before scheduled rotation; 0 disengages the
    /// pool entirely.
    rotate_every: u32,
    /// Uses of the active entry since it became active.
    active_uses: u32,
}

impl ProxyPool {
    pub fn new(addresses: Vec<String>, rotate_every: u32) -> Self {
        let mut entries = Vec::new();
        for address in addresses {
            match ProxyScheme::from_address(&address) {
                Some(scheme) => entries.push(ProxyEntry {
                    address,
                    scheme,
                    usage_count: 0,
                    alive: true,
                }),
                None => warn!("ignoring proxy with unrecognized scheme: {}", address),
            }
        }
        if rotate_every == 0 && !entries.is_empty() {
            warn!(
                "no rotation interval configured, ignoring {} proxies; traffic goes direct",
                entries.len()
            );
            entries.clear();
        }
        Self { entries, active: 0, rotate_every, active_uses: 0 }
    }

    /// Loads a newline-delimited proxy list. A missing file is not an
    /// error; it just means all traffic goes direct.
    pub fn load(path: impl AsRef<Path>, rotate_every: u32) -> std::io::Result<Self> {
        let path = path.as_ref();
        if !path.exists() {
            return Ok(Self::new(Vec::new(), rotate_every));
        }
        let content = fs::read_to_string(path)?;
        let addresses: Vec<String> = content
            .lines()
            .map(str::trim)
            .filter(|l| !l.is_empty())
            .map(str::to_string)
            .collect();
        let pool = Self::new(addresses, rotate_every);
        info!("loaded {} proxies from {}", pool.live_count(), path.display());
        Ok(pool)
    }

    pub fn is_empty(&self) -> bool {
        self.live_count() == 0
    }

    pub fn live_count(&self) -> usize {
        self.entries.iter().filter(|e| e.alive).count()
    }

    /// The entry the next request should use, or None for direct traffic.
    pub fn active(&self) -> Option<&ProxyEntry> {
        let entry = self.entries.get(self.active)?;
        if entry.alive {
            Some(entry)
        } else {
            // eviction always advances to a live entry or errors, so a
            // dead active index means the pool is exhausted
            debug_assert!(self.live_count() == 0, "active index points at a dead entry");
            None
        }
    }

    /// Records one request sent through the active entry and applies
    /// scheduled rotation once the interval is reached.
    pub fn record_use(&mut self) {
        if self.live_count() == 0 {
            return;
        }
        if let Some(entry) = self.entries.get_mut(self.active) {
            entry.usage_count += 1;
        }
        self.active_uses += 1;
        if self.rotate_every > 0 && self.active_uses >= self.rotate_every {
            self.advance();
        }
    }

    /// Permanently removes the active entry from service and advances to
    /// the next live one. Errors when the pool is exhausted.
    pub fn evict_active(&mut self) -> Result<(), QueryError> {
        if let Some(entry) = self.entries.get_mut(self.active) {
            entry.alive = false;
            warn!("removed failing proxy: {}", entry.address);
        }
        if self.live_count() == 0 {
            return Err(QueryError::PoolExhausted);
        }
        self.advance();
        Ok(())
    }

    fn advance(&mut self) {
        self.active_uses = 0;
        if self.entries.is_empty() {
            return;
        }
        let len = self.entries.len();
        for step in 1..=len {
            let idx = (self.active + step) % len;
            if self.entries[idx].alive {
                self.active = idx;
                return;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn pool3(rotate_every: u32) -> ProxyPool {
        ProxyPool::new(
            vec![
                "http://p1:8080".to_string(),
                "http://p2:8080".to_string(),
                "http://p3:8080".to_string(),
            ],
            rotate_every,
        )
    }

    fn active_addr(pool: &ProxyPool) -> String {
        pool.active().unwrap().address.clone()
    }

    #[test]
    fn test_invalid_scheme_dropped_nonfatal() {
        let pool = ProxyPool::new(
            vec![
                "http://ok:1".to_string(),
                "ftp://bad:1".to_string(),
                "noscheme:1".to_string(),
                "socks5://ok:2".to_string(),
            ],
            5,
        );
        assert_eq!(pool.live_count(), 2);
        assert_eq!(pool.active().unwrap().scheme, ProxyScheme::Http);
    }

    #[test]
    fn test_rotation_interval_sequence() {
        // pool [P1,P2,P3], interval 2: five sends use P1,P1,P2,P2,P3
        let mut pool = pool3(2);
        let mut seen = Vec::new();
        for _ in 0..5 {
            seen.push(active_addr(&pool));
            pool.record_use();
        }
        assert_eq!(
            seen,
            vec![
                "http://p1:8080",
                "http://p1:8080",
                "http://p2:8080",
                "http://p2:8080",
                "http://p3:8080"
            ]
        );
    }

    #[test]
    fn test_rotation_wraps_circularly() {
        let mut pool = pool3(1);
        let mut seen = Vec::new();
        for _ in 0..4 {
            seen.push(active_addr(&pool));
            pool.record_use();
        }
        assert_eq!(seen[3], "http://p1:8080");
    }

    #[test]
    fn test_zero_interval_ignores_proxies_and_goes_direct() {
        // a proxy list without a rotation interval is never engaged
        let pool = pool3(0);
        assert!(pool.is_empty());
        assert!(pool.active().is_none());
    }

    #[test]
    fn test_eviction_is_permanent() {
        let mut pool = pool3(10);
        pool.evict_active().unwrap();
        assert_eq!(active_addr(&pool), "http://p2:8080");
        assert_eq!(pool.live_count(), 2);
        // rotate through everything; p1 never comes back
        let mut pool = pool3(1);
        pool.evict_active().unwrap();
        for _ in 0..6 {
            assert_ne!(active_addr(&pool), "http://p1:8080");
            pool.record_use();
        }
    }

    #[test]
    fn test_exhaustion_is_an_error() {
        let mut pool = pool3(10);
        pool.evict_active().unwrap();
        pool.evict_active().unwrap();
        assert!(matches!(pool.evict_active(), Err(QueryError::PoolExhausted)));
        assert!(pool.active().is_none());
    }

    #[test]
    fn test_empty_pool_means_direct_traffic() {
        let mut pool = ProxyPool::new(Vec::new(), 5);
        assert!(pool.is_empty());
        assert!(pool.active().is_none());
        pool.record_use(); // no-op
    }

    #[test]
    fn test_single_proxy_interval_keeps_reusing_it() {
        let mut pool = ProxyPool::new(vec!["http://only:1".to_string()], 2);
        for _ in 0..6 {
            assert_eq!(active_addr(&pool), "http://only:1");
            pool.record_use();
        }
        assert_eq!(pool.active().unwrap().usage_count, 6);
    }
}
