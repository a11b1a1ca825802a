//! Health-scored proxy registry with sticky per-worker assignment.
//!
//! One [ProxyPool] is built per job (or per test) and shared by reference with every
//! worker. All state sits behind a single mutex; each public operation holds it only
//! for bookkeeping, never across network I/O.

use crate::config::ProxySettings;
use rand::distributions::WeightedIndex;
use rand::prelude::*;
use std::collections::HashMap;
use std::sync::{Mutex, MutexGuard, PoisonError};
use std::time::Instant;
use tracing::{debug, info, warn};

use super::error::ProxyExhausted;

/// Identifies a worker for sticky proxy bindings.
pub type WorkerId = usize;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProxyRecord {
    pub address: String,
    /// Bounded above by the configured ceiling; quarantine at or below the threshold.
    pub health: i32,
    pub quarantined_until: Option<Instant>,
    /// Retired for the lifetime of the pool.
    pub dead: bool,
    /// How many times this proxy has been quarantined.
    pub quarantines: u32,
}

impl ProxyRecord {
    fn new(address: String) -> Self {
        Self {
            address,
            health: 0,
            quarantined_until: None,
            dead: false,
            quarantines: 0,
        }
    }

    fn usable(&self, now: Instant) -> bool {
        !self.dead && self.quarantined_until.map_or(true, |until| until <= now)
    }
}

/// What one attempt told us about the proxy that carried it.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Outcome {
    Success,
    Blocked,
    NetworkError,
}

/// Route for one request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ProxyChoice {
    Proxy(String),
    Direct,
}

impl ProxyChoice {
    pub fn address(&self) -> Option<&str> {
        match self {
            ProxyChoice::Proxy(a) => Some(a),
            ProxyChoice::Direct => None,
        }
    }
}

#[derive(Debug, Default)]
struct PoolState {
    records: Vec<ProxyRecord>,
    index: HashMap<String, usize>,
    bindings: HashMap<WorkerId, String>,
}

impl PoolState {
    /// Lift expired quarantines; a returning proxy starts again from neutral health.
    fn refresh(&mut self, now: Instant) {
        for record in &mut self.records {
            if let Some(until) = record.quarantined_until {
                if until <= now && !record.dead {
                    record.quarantined_until = None;
                    record.health = 0;
                    debug!(proxy = %record.address, "quarantine expired");
                }
            }
        }
    }

    fn bound_usable(&self, worker: WorkerId, now: Instant) -> Option<String> {
        let address = self.bindings.get(&worker)?;
        let idx = *self.index.get(address)?;
        self.records[idx]
            .usable(now)
            .then(|| address.clone())
    }
}

#[derive(Debug)]
pub struct ProxyPool {
    settings: ProxySettings,
    state: Mutex<PoolState>,
}

impl ProxyPool {
    pub fn new(settings: ProxySettings) -> Self {
        let mut addresses = settings.proxies.clone();
        addresses.shuffle(&mut thread_rng());
        let mut state = PoolState::default();
        for address in addresses {
            if state.index.contains_key(&address) {
                continue;
            }
            state.index.insert(address.clone(), state.records.len());
            state.records.push(ProxyRecord::new(address));
        }
        info!(
            proxies = state.records.len(),
            override_proxy = settings.override_proxy.is_some(),
            "proxy pool ready"
        );
        Self {
            settings,
            state: Mutex::new(state),
        }
    }

    /// Pool with no proxies at all: every request goes direct (if allowed).
    pub fn direct_only(allow_direct: bool) -> Self {
        Self::new(ProxySettings {
            allow_direct,
            ..ProxySettings::default()
        })
    }

    fn lock(&self) -> MutexGuard<'_, PoolState> {
        // Records stay consistent even if a worker panicked mid-update.
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Return the worker's bound proxy if it is still healthy, otherwise pick a new one
    /// weighted by health, preferring proxies no other worker holds. Falls back to a
    /// direct connection, or fails when direct connections are disabled.
    pub fn acquire(&self, worker: WorkerId) -> Result<ProxyChoice, ProxyExhausted> {
        self.acquire_at(worker, Instant::now())
    }

    pub(crate) fn acquire_at(
        &self,
        worker: WorkerId,
        now: Instant,
    ) -> Result<ProxyChoice, ProxyExhausted> {
        if let Some(ref p) = self.settings.override_proxy {
            return Ok(ProxyChoice::Proxy(p.clone()));
        }
        let mut state = self.lock();
        state.refresh(now);

        if let Some(address) = state.bound_usable(worker, now) {
            return Ok(ProxyChoice::Proxy(address));
        }
        state.bindings.remove(&worker);

        let held_elsewhere: Vec<&String> = state.bindings.values().collect();
        let usable: Vec<usize> = (0..state.records.len())
            .filter(|&i| state.records[i].usable(now))
            .collect();
        let free: Vec<usize> = usable
            .iter()
            .copied()
            .filter(|&i| !held_elsewhere.contains(&&state.records[i].address))
            .collect();
        let candidates = if free.is_empty() { usable } else { free };

        if candidates.is_empty() {
            if self.settings.allow_direct {
                debug!(worker, "no healthy proxy, using direct connection");
                return Ok(ProxyChoice::Direct);
            }
            warn!(worker, "proxy pool exhausted and direct connections disabled");
            return Err(ProxyExhausted);
        }

        let threshold = self.settings.quarantine_threshold;
        let weights: Vec<u32> = candidates
            .iter()
            .map(|&i| {
                let margin = state.records[i].health.saturating_sub(threshold);
                margin.clamp(1, i32::from(u16::MAX)) as u32
            })
            .collect();
        let pick = match WeightedIndex::new(&weights) {
            Ok(dist) => candidates[dist.sample(&mut thread_rng())],
            Err(_) => candidates[0],
        };
        let address = state.records[pick].address.clone();
        state.bindings.insert(worker, address.clone());
        debug!(worker, proxy = %address, "bound proxy");
        Ok(ProxyChoice::Proxy(address))
    }

    /// Drop the worker's sticky binding.
    pub fn release(&self, worker: WorkerId) {
        self.lock().bindings.remove(&worker);
    }

    /// Adjust the proxy's health for one attempt; quarantine or retire it at the floor.
    /// Returns the updated record, or None for addresses the pool does not track
    /// (the override proxy).
    pub fn report_outcome(&self, address: &str, outcome: Outcome) -> Option<ProxyRecord> {
        self.report_outcome_at(address, outcome, Instant::now())
    }

    pub(crate) fn report_outcome_at(
        &self,
        address: &str,
        outcome: Outcome,
        now: Instant,
    ) -> Option<ProxyRecord> {
        let mut state = self.lock();
        let idx = *state.index.get(address)?;
        let ceiling = self.settings.health_ceiling;
        let threshold = self.settings.quarantine_threshold;

        let record = &mut state.records[idx];
        if record.dead {
            return Some(record.clone());
        }
        match outcome {
            Outcome::Success => {
                record.health = (record.health + 1).min(ceiling);
                return Some(record.clone());
            }
            Outcome::Blocked | Outcome::NetworkError => {
                record.health = (record.health - 1).min(ceiling);
            }
        }
        if record.health > threshold {
            return Some(record.clone());
        }

        record.quarantines += 1;
        if self.settings.never_reuse_failed || record.quarantines >= self.settings.max_quarantines
        {
            record.dead = true;
            record.quarantined_until = None;
            warn!(proxy = %record.address, health = record.health, "proxy retired");
        } else {
            record.quarantined_until = Some(now + self.settings.quarantine);
            info!(
                proxy = %record.address,
                health = record.health,
                quarantines = record.quarantines,
                "proxy quarantined"
            );
        }
        let snapshot = record.clone();
        state.bindings.retain(|_, bound| bound != address);
        Some(snapshot)
    }

    pub fn record(&self, address: &str) -> Option<ProxyRecord> {
        let state = self.lock();
        state.index.get(address).map(|&i| state.records[i].clone())
    }

    pub fn records(&self) -> Vec<ProxyRecord> {
        self.lock().records.clone()
    }

    pub fn bound_to(&self, worker: WorkerId) -> Option<String> {
        self.lock().bindings.get(&worker).cloned()
    }
}

/// Parse a proxy list: one `scheme://host:port`, `host:port`, or CSV `ip,port,protocols`
/// entry per line. Blank lines, `#` comments, CSV headers, and bare hosts are skipped.
pub fn parse_proxy_list(text: &str) -> Vec<String> {
    let mut out = Vec::new();
    for line in text.lines() {
        let line = line.trim();
        if line.is_empty() || line.starts_with('#') {
            continue;
        }
        let entry = if line.contains(',') {
            let cols: Vec<&str> = line.split(',').map(str::trim).collect();
            let (ip, port) = (cols[0], cols.get(1).copied().unwrap_or(""));
            if ip.eq_ignore_ascii_case("ip") || ip.is_empty() || port.is_empty() {
                continue;
            }
            let proto = cols.get(2).map(|p| p.to_ascii_lowercase()).unwrap_or_default();
            let scheme = if proto.starts_with("socks5") {
                "socks5"
            } else if proto.starts_with("socks4") {
                "socks4"
            } else {
                "http"
            };
            format!("{}://{}:{}", scheme, ip, port)
        } else if line.contains("://") {
            line.to_string()
        } else if line.contains(':') {
            format!("http://{}", line)
        } else {
            continue;
        };
        if !out.contains(&entry) {
            out.push(entry);
        }
    }
    out
}
