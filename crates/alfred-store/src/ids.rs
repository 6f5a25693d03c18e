// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: Apache-2.0
use chrono::{SecondsFormat, Utc};
use uuid::Uuid;

/// Mint an opaque typed id such as `trc_9f2c…`.
///
/// The prefix carries the entity kind (`trc` trace, `spn` span, `evt` event,
/// `thr` thread, `msg` message, `usr` user, `chn` channel, `sch` schedule,
/// `cap` failure capsule, `apv` approval, `kb` knowledge doc, `mem` memory
/// item).  Ids are opaque to every consumer; only the prefix is meaningful.
pub fn new_id(prefix: &str) -> String {
    format!("{}_{}", prefix, Uuid::new_v4().simple())
}

/// Current wall-clock time as an ISO-8601 UTC string.
///
/// All persisted timestamps use this format so lexicographic order equals
/// chronological order.
pub fn now_iso() -> String {
    Utc::now().to_rfc3339_opts(SecondsFormat::Micros, true)
}

// ─── Unit tests ──────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ids_carry_their_prefix() {
        assert!(new_id("trc").starts_with("trc_"));
        assert!(new_id("evt").starts_with("evt_"));
    }

    #[test]
    fn ids_are_unique() {
        assert_ne!(new_id("spn"), new_id("spn"));
    }

    #[test]
    fn now_iso_is_utc_and_sortable() {
        let a = now_iso();
        let b = now_iso();
        assert!(a.ends_with('Z'));
        assert!(a <= b);
    }
}
