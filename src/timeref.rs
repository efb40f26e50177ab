// Copyright (c) The Taipan Project Developers.
// SPDX-License-Identifier: MIT OR Apache-2.0

//! A fixed update-start time.
//!
//! All expiration checks during a single update cycle are evaluated against
//! one wall-clock sample so that a cycle cannot straddle an expiration
//! boundary.

use chrono::{DateTime, SecondsFormat, Utc};

/// The strict UTC timestamp format used throughout role metadata. The format
/// is total-order-preserving, so expiration checks compare the formatted
/// strings lexicographically.
pub const TIMESTAMP_FORMAT: &str = "%Y-%m-%dT%H:%M:%SZ";

/// A frozen wall clock, sampled once at the start of an update cycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TimeRef {
    time: DateTime<Utc>,
}

impl TimeRef {
    /// Samples the host clock.
    pub fn now() -> Self {
        Self { time: Utc::now() }
    }

    /// Pins the reference to the given instant. Intended for tests.
    pub fn set(time: DateTime<Utc>) -> Self {
        Self { time }
    }

    /// Returns the reference as a `YYYY-MM-DDTHH:MM:SSZ` string.
    pub fn timestamp(&self) -> String {
        self.time.to_rfc3339_opts(SecondsFormat::Secs, true)
    }
}

impl Default for TimeRef {
    fn default() -> Self {
        Self::now()
    }
}

/// Checks that a metadata timestamp matches the strict UTC ISO-8601 form
/// `YYYY-MM-DDTHH:MM:SSZ`; anything else (offsets, fractional seconds,
/// lowercase designators) is rejected.
pub fn valid_timestamp_format(ts: &str) -> bool {
    ts.len() == 20
        && ts.ends_with('Z')
        && chrono::NaiveDateTime::parse_from_str(ts, TIMESTAMP_FORMAT).is_ok()
}
