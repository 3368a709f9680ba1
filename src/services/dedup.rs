//! Content-fingerprint duplicate suppression.
//!
//! An item's fingerprint is built from its first significant title tokens,
//! its price and its store, so the same deal reported by two sources (or by
//! one source on consecutive polls) maps to the same key.

use std::collections::{BTreeMap, HashMap, HashSet};
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};

use chrono::{DateTime, Duration, Utc};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use unicode_segmentation::UnicodeSegmentation;

use crate::models::{CandidateItem, DedupConfig};
use crate::utils::normalize_whitespace;

const SHARDS: usize = 16;

/// 128-bit item key, hex encoded.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Fingerprint(String);

impl Fingerprint {
    pub fn as_str(&self) -> &str {
        &self.0
    }

    fn shard(&self) -> usize {
        self.0
            .chars()
            .next()
            .and_then(|c| c.to_digit(16))
            .map_or(0, |d| d as usize % SHARDS)
    }
}

impl fmt::Display for Fingerprint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// What the index remembers about one fingerprint.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FingerprintRecord {
    pub first_seen: DateTime<Utc>,
    /// Last accepted sighting
    pub last_seen: DateTime<Utc>,
    /// Accepted sightings
    pub sightings: u64,
    /// Last acceptance per platform
    pub platforms: BTreeMap<String, DateTime<Utc>>,
}

impl FingerprintRecord {
    fn new(platform: &str, now: DateTime<Utc>) -> Self {
        Self {
            first_seen: now,
            last_seen: now,
            sightings: 1,
            platforms: BTreeMap::from([(platform.to_string(), now)]),
        }
    }
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct DedupStats {
    pub fingerprints: usize,
    pub accepted: u64,
    pub suppressed: u64,
}

/// Sharded fingerprint index.
pub struct DedupIndex {
    shards: Vec<Mutex<HashMap<Fingerprint, FingerprintRecord>>>,
    stop_words: HashSet<String>,
    title_tokens: usize,
    min_token_chars: usize,
    platform_window: Duration,
    cross_platform_window: Duration,
    accepted: AtomicU64,
    suppressed: AtomicU64,
}

impl DedupIndex {
    pub fn new(config: &DedupConfig) -> Self {
        Self {
            shards: (0..SHARDS).map(|_| Mutex::new(HashMap::new())).collect(),
            stop_words: config.stop_words.iter().map(|w| w.to_lowercase()).collect(),
            title_tokens: config.title_tokens,
            min_token_chars: config.min_token_chars,
            platform_window: config.platform_window(),
            cross_platform_window: config.cross_platform_window(),
            accepted: AtomicU64::new(0),
            suppressed: AtomicU64::new(0),
        }
    }

    /// Significant title tokens, in order.
    fn tokens(&self, title: &str) -> Vec<String> {
        let lowered = title.trim().to_lowercase();
        lowered
            .unicode_words()
            .filter(|w| w.chars().count() >= self.min_token_chars)
            .filter(|w| !self.stop_words.contains(*w))
            .take(self.title_tokens)
            .map(str::to_string)
            .collect()
    }

    /// Compute the key of an item.
    pub fn fingerprint(&self, item: &CandidateItem) -> Fingerprint {
        let store = normalize_whitespace(&item.store).to_lowercase();
        let material = format!(
            "{}|{:.2}|{}",
            self.tokens(&item.title).join(" "),
            item.price,
            store
        );
        let digest = Sha256::digest(material.as_bytes());
        Fingerprint(hex::encode(&digest[..16]))
    }

    /// Decide whether `item` seen on `platform` is a duplicate.
    ///
    /// Suppressed sightings leave the index unchanged; accepted ones update
    /// (or create) the record.
    pub fn is_duplicate(&self, item: &CandidateItem, platform: &str, now: DateTime<Utc>) -> bool {
        let fp = self.fingerprint(item);
        let mut shard = self.shards[fp.shard()].lock();

        if let Some(record) = shard.get_mut(&fp) {
            let same_platform = record
                .platforms
                .get(platform)
                .is_some_and(|&t| now - t < self.platform_window);
            let any_platform = now - record.last_seen < self.cross_platform_window;

            if same_platform || any_platform {
                self.suppressed.fetch_add(1, Ordering::Relaxed);
                log::debug!(
                    "Duplicate suppressed on {}: {} ({})",
                    platform,
                    item.title,
                    if same_platform { "same platform" } else { "cross platform" }
                );
                return true;
            }

            record.last_seen = record.last_seen.max(now);
            record.sightings += 1;
            record.platforms.insert(platform.to_string(), now);
        } else {
            shard.insert(fp, FingerprintRecord::new(platform, now));
        }

        self.accepted.fetch_add(1, Ordering::Relaxed);
        false
    }

    /// Keep the items that are not duplicates, preserving order.
    pub fn filter(
        &self,
        items: Vec<CandidateItem>,
        platform: &str,
        now: DateTime<Utc>,
    ) -> Vec<CandidateItem> {
        items
            .into_iter()
            .filter(|item| !self.is_duplicate(item, platform, now))
            .collect()
    }

    /// Drop fingerprints last seen before `now - retention`.
    pub fn gc(&self, now: DateTime<Utc>, retention: Duration) -> usize {
        let horizon = now - retention;
        let mut removed = 0;
        for shard in &self.shards {
            let mut shard = shard.lock();
            let before = shard.len();
            shard.retain(|_, record| record.last_seen >= horizon);
            removed += before - shard.len();
        }
        if removed > 0 {
            log::info!("Dedup gc removed {} fingerprint(s)", removed);
        }
        removed
    }

    pub fn len(&self) -> usize {
        self.shards.iter().map(|s| s.lock().len()).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn stats(&self) -> DedupStats {
        DedupStats {
            fingerprints: self.len(),
            accepted: self.accepted.load(Ordering::Relaxed),
            suppressed: self.suppressed.load(Ordering::Relaxed),
        }
    }

    pub fn snapshot(&self) -> BTreeMap<Fingerprint, FingerprintRecord> {
        let mut out = BTreeMap::new();
        for shard in &self.shards {
            out.extend(shard.lock().iter().map(|(k, v)| (k.clone(), v.clone())));
        }
        out
    }

    /// Replace the index contents with persisted records.
    pub fn restore(&self, records: BTreeMap<Fingerprint, FingerprintRecord>) -> usize {
        for shard in &self.shards {
            shard.lock().clear();
        }
        let count = records.len();
        for (fp, record) in records {
            self.shards[fp.shard()].lock().insert(fp, record);
        }
        count
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn t0() -> DateTime<Utc> {
        DateTime::parse_from_rfc3339("2026-03-01T12:00:00Z")
            .unwrap()
            .with_timezone(&Utc)
    }

    fn index() -> DedupIndex {
        DedupIndex::new(&DedupConfig::default())
    }

    fn phone(t: DateTime<Utc>) -> CandidateItem {
        CandidateItem::new(
            "Smartphone XYZ 128GB",
            999.90,
            "AmazonBR",
            "https://example.com/p/xyz",
            t,
        )
    }

    #[test]
    fn test_fingerprint_is_stable_and_normalized() {
        let idx = index();
        let t = t0();
        let a = phone(t);
        let mut b = phone(t);
        b.title = "  smartphone   XYZ 128GB ".into();
        b.store = "amazonbr".into();
        b.url = "https://other.example/xyz".into();

        let fp = idx.fingerprint(&a);
        assert_eq!(fp.as_str().len(), 32);
        assert_eq!(fp, idx.fingerprint(&b));

        let mut c = phone(t);
        c.price = 899.90;
        assert_ne!(fp, idx.fingerprint(&c));
    }

    #[test]
    fn test_stop_words_and_short_tokens_are_ignored() {
        let idx = index();
        assert_eq!(
            idx.tokens("Kit de 2 Cabos para o Carregador USB com Garantia Extra"),
            vec!["kit", "cabos", "carregador", "usb", "garantia"]
        );
    }

    #[test]
    fn test_same_platform_window_scenario() {
        let idx = index();
        let t = t0();

        assert!(!idx.is_duplicate(&phone(t), "amazon.com.br", t));
        assert!(idx.is_duplicate(
            &phone(t),
            "amazon.com.br",
            t + Duration::minutes(10)
        ));
        assert!(!idx.is_duplicate(
            &phone(t),
            "amazon.com.br",
            t + Duration::minutes(40)
        ));
    }

    #[test]
    fn test_cross_platform_window_is_shorter() {
        let idx = index();
        let t = t0();

        assert!(!idx.is_duplicate(&phone(t), "promobit.com.br", t));
        assert!(idx.is_duplicate(&phone(t), "pelando.com.br", t + Duration::minutes(5)));
        assert!(!idx.is_duplicate(&phone(t), "pelando.com.br", t + Duration::minutes(20)));
        // Still inside promobit's own window.
        assert!(idx.is_duplicate(&phone(t), "promobit.com.br", t + Duration::minutes(25)));
    }

    #[test]
    fn test_filter_keeps_first_of_batch_in_order() {
        let idx = index();
        let t = t0();
        let mouse = CandidateItem::new("Mouse Gamer RGB", 199.99, "Kabum", "https://k/1", t);
        let items = vec![phone(t), mouse.clone(), phone(t)];

        let kept = idx.filter(items, "amazon.com.br", t);
        assert_eq!(kept.len(), 2);
        assert_eq!(kept[0].title, "Smartphone XYZ 128GB");
        assert_eq!(kept[1], mouse);

        let stats = idx.stats();
        assert_eq!(stats.accepted, 2);
        assert_eq!(stats.suppressed, 1);
    }

    #[test]
    fn test_suppression_leaves_state_unchanged() {
        let idx = index();
        let t = t0();
        idx.is_duplicate(&phone(t), "amazon.com.br", t);
        let before = idx.snapshot();
        idx.is_duplicate(&phone(t), "amazon.com.br", t + Duration::minutes(1));
        assert_eq!(idx.snapshot(), before);
    }

    #[test]
    fn test_gc_removes_stale_fingerprints() {
        let idx = index();
        let t = t0();
        idx.is_duplicate(&phone(t), "amazon.com.br", t);
        let mouse = CandidateItem::new("Mouse Gamer RGB", 199.99, "Kabum", "https://k/1", t);
        idx.is_duplicate(&mouse, "kabum.com.br", t + Duration::days(20));

        assert_eq!(idx.gc(t + Duration::days(31), Duration::days(30)), 1);
        assert_eq!(idx.len(), 1);
    }

    #[test]
    fn test_snapshot_round_trip_preserves_windows() {
        let idx = index();
        let t = t0();
        idx.is_duplicate(&phone(t), "amazon.com.br", t);

        let json = serde_json::to_string(&idx.snapshot()).unwrap();
        let restored = index();
        assert_eq!(restored.restore(serde_json::from_str(&json).unwrap()), 1);
        assert!(restored.is_duplicate(&phone(t), "amazon.com.br", t + Duration::minutes(10)));
    }
}
