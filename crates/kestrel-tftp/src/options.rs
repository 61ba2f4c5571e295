//! RFC 2347/2348/2349 option negotiation
//!
//! The server recognises `blksize`, `timeout` and `tsize`. Numeric options
//! are clamped into the configured bounds rather than refused, and accepted
//! options are echoed back with the client's spelling and in the client's
//! order.

use serde::{Deserialize, Serialize};
use std::num::IntErrorKind;
use std::time::Duration;
use tracing::{debug, info};

use crate::packet::DEFAULT_BLOCK_SIZE;

const DEFAULT_TIMEOUT_SECS: u64 = 10;
const DEFAULT_RETRIES: u32 = 4;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OptionKind {
    BlockSize,    // RFC 2348 - Block Size Option
    Timeout,      // RFC 2349 - Timeout Interval Option
    TransferSize, // RFC 2349 - Transfer Size Option
}

const OPTION_TABLE: [(&str, OptionKind); 3] = [
    ("blksize", OptionKind::BlockSize),
    ("timeout", OptionKind::Timeout),
    ("tsize", OptionKind::TransferSize),
];

impl OptionKind {
    /// Case-insensitive lookup of a client-supplied option name.
    pub fn from_name(name: &str) -> Option<Self> {
        OPTION_TABLE
            .iter()
            .find(|(known, _)| known.eq_ignore_ascii_case(name))
            .map(|(_, kind)| *kind)
    }

    pub fn name(self) -> &'static str {
        match self {
            OptionKind::BlockSize => "blksize",
            OptionKind::Timeout => "timeout",
            OptionKind::TransferSize => "tsize",
        }
    }
}

/// Default value and inclusive `[min, max]` range of a numeric option.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Bound {
    pub default: u64,
    pub min: u64,
    pub max: u64,
}

impl Bound {
    /// `max(min, min(value, max))`, with negative requests mapped to `min`.
    pub fn clamp(&self, value: i64) -> u64 {
        let value = u64::try_from(value).unwrap_or(0);
        value.min(self.max).max(self.min)
    }
}

/// Server-wide option policy, built once from the configuration.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Policy {
    pub blksize: Bound,
    pub timeout: Bound,
    /// Accepted for compatibility; sessions never retransmit.
    pub retries: u32,
}

impl Default for Policy {
    fn default() -> Self {
        Self {
            blksize: Bound {
                default: DEFAULT_BLOCK_SIZE as u64,
                min: 512,
                max: 1428, // Ethernet MTU minus IP/UDP/TFTP overhead
            },
            timeout: Bound {
                default: DEFAULT_TIMEOUT_SECS,
                min: 1,
                max: 255,
            },
            retries: DEFAULT_RETRIES,
        }
    }
}

impl Policy {
    fn bound(&self, kind: OptionKind) -> Option<&Bound> {
        match kind {
            OptionKind::BlockSize => Some(&self.blksize),
            OptionKind::Timeout => Some(&self.timeout),
            OptionKind::TransferSize => None,
        }
    }

    /// Settings used when the client did not negotiate.
    pub fn defaults(&self) -> EffectiveSettings {
        EffectiveSettings {
            blksize: self.blksize.default as usize,
            timeout: Duration::from_secs(self.timeout.default),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct EffectiveSettings {
    pub blksize: usize,
    pub timeout: Duration,
}

impl EffectiveSettings {
    fn apply(&mut self, kind: OptionKind, value: u64) {
        match kind {
            OptionKind::BlockSize => self.blksize = value as usize,
            OptionKind::Timeout => self.timeout = Duration::from_secs(value),
            OptionKind::TransferSize => {}
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Negotiation {
    /// Options to echo in the OACK, client order and spelling.
    pub accepted: Vec<(String, String)>,
    pub settings: EffectiveSettings,
    /// Requested names that were dropped.
    pub ignored: Vec<String>,
}

pub fn negotiate(requested: &[(String, String)], policy: &Policy, file_size: u64) -> Negotiation {
    let mut settings = policy.defaults();
    let mut accepted = Vec::with_capacity(requested.len());
    let mut seen: Vec<OptionKind> = Vec::new();
    let mut ignored = Vec::new();

    for (name, value) in requested {
        let Some(kind) = OptionKind::from_name(name) else {
            info!("Unknown option requested: {}", name);
            ignored.push(name.clone());
            continue;
        };

        if seen.contains(&kind) {
            debug!("Ignoring repeated option {}", name);
            ignored.push(name.clone());
            continue;
        }

        match policy.bound(kind) {
            None => {
                // tsize: always echo the real size, whatever the client sent
                seen.push(kind);
                accepted.push((name.clone(), file_size.to_string()));
            }
            Some(bound) => {
                let Some(requested_value) = parse_integer(value) else {
                    info!("Option {} has non-numeric value {:?}", name, value);
                    ignored.push(name.clone());
                    continue;
                };
                let clamped = bound.clamp(requested_value);
                debug!(
                    "{}: req: {} ({} - {}) -> {}",
                    name, requested_value, bound.min, bound.max, clamped
                );
                settings.apply(kind, clamped);
                seen.push(kind);
                accepted.push((name.clone(), clamped.to_string()));
            }
        }
    }

    debug!("Using options: {:?}", settings);

    Negotiation {
        accepted,
        settings,
        ignored,
    }
}

// Out-of-range integers saturate so that they clamp like any other value
fn parse_integer(value: &str) -> Option<i64> {
    match value.trim().parse::<i64>() {
        Ok(v) => Some(v),
        Err(e) => match e.kind() {
            IntErrorKind::PosOverflow => Some(i64::MAX),
            IntErrorKind::NegOverflow => Some(i64::MIN),
            _ => None,
        },
    }
}
