//! The storage/decode sink: turns `(did, raw bytes)` into published views and
//! keeps the per-session statistics block (`SPEC_FULL.md` §4.3).
//!
//! This crate never persists anything itself. [`PublishSink`] is the seam a
//! host implements over its own state-object store; this module only decides
//! *what* to publish and *how often*, the same split the teacher draws
//! between its session engine and the embedding app's persistence layer.

use std::collections::BTreeMap;
use std::time::{Duration, Instant};

use std::sync::Arc;

use crate::catalog::{plan_upgrade, CatalogUpgrade, DidCatalog};
use crate::codec::Value;
use crate::helpers::{sanitize_symbolic_id, to_hex};

/// The symbolic id used for a DID whose payload cannot be decoded: either
/// it's unknown to the catalog, or its actual length doesn't match what the
/// catalog declared.
pub const DEVICE_SPECIFIC_ID: &str = "DeviceSpecific";

/// How many children of a [`Value::Tree`] are published per level before the
/// recursion is capped (`SPEC_FULL.md` §4.3).
const TREE_CHILD_CAP: usize = 100;

/// Host seam for persisting published views and statistics.
///
/// A session calls these after every exchange; implementations forward into
/// whatever state-object store the embedding application uses. Calls are
/// made from the session's own worker thread, never concurrently for the
/// same DID.
pub trait PublishSink: Send {
    /// Publishes the raw hex view for `did`.
    fn publish_raw(&mut self, did: u16, symbolic_id: &str, hex: &str);
    /// Publishes the compact-JSON view for `did`.
    fn publish_json(&mut self, did: u16, symbolic_id: &str, json: &str);
    /// Publishes the hierarchical-tree view for `did`.
    fn publish_tree(&mut self, did: u16, symbolic_id: &str, value: &Value);
    /// Deletes a previously-published tree for `did` (used by a catalog
    /// upgrade that changes a DID's codec or declared length).
    fn delete_tree(&mut self, did: u16, symbolic_id: &str);
    /// Publishes a statistics snapshot.
    fn publish_statistics(&mut self, stats: &Statistics);
}

/// The outcome of one UDS exchange, as reported by the session engine.
///
/// Mirrors the taxonomy in `SPEC_FULL.md` §7; `Overlap` is tracked
/// separately via [`Statistics::record_overlap`] since it never represents
/// an exchange that actually ran.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Outcome {
    /// The exchange completed and the reply was decoded.
    Ok,
    /// No response arrived within the configured timeout.
    Timeout,
    /// The device replied with a `0x7F` negative response.
    NegativeResponse,
    /// The reply addressed a different DID than requested.
    DidMismatch,
    /// Malformed PCI, wrong sequence counter, or an unexpected frame.
    BadFrame,
    /// An inbound frame arrived in a state that doesn't expect one.
    BadState,
}

/// Running min/max/mean of exchange reply times, in milliseconds.
#[derive(Debug, Clone, Default)]
pub struct ReplyTimeStats {
    min_ms: Option<u64>,
    max_ms: Option<u64>,
    mean_ms: f64,
    count: u64,
}

impl ReplyTimeStats {
    fn record(&mut self, ms: u64) {
        self.min_ms = Some(self.min_ms.map_or(ms, |m| m.min(ms)));
        self.max_ms = Some(self.max_ms.map_or(ms, |m| m.max(ms)));
        self.count += 1;
        self.mean_ms += (ms as f64 - self.mean_ms) / self.count as f64;
    }

    /// The fastest recorded reply, if any.
    pub fn min_ms(&self) -> Option<u64> {
        self.min_ms
    }

    /// The slowest recorded reply, if any.
    pub fn max_ms(&self) -> Option<u64> {
        self.max_ms
    }

    /// The running mean reply time.
    pub fn mean_ms(&self) -> f64 {
        self.mean_ms
    }

    /// How many replies have been recorded.
    pub fn count(&self) -> u64 {
        self.count
    }
}

/// Per-session exchange counters, published through [`PublishSink::publish_statistics`].
#[derive(Debug, Clone)]
pub struct Statistics {
    cnt_total: u64,
    cnt_ok: u64,
    cnt_negative_resp: u64,
    cnt_timeout: u64,
    cnt_bad_protocol: u64,
    cnt_overlap: u64,
    per_did_failures: BTreeMap<u16, u32>,
    reply_time: ReplyTimeStats,
    next_publish_at: Option<Instant>,
    min_publish_interval: Duration,
}

impl Statistics {
    /// Creates a fresh, all-zero statistics block with the default 5000 ms
    /// publish throttle.
    pub fn new() -> Self {
        Self {
            cnt_total: 0,
            cnt_ok: 0,
            cnt_negative_resp: 0,
            cnt_timeout: 0,
            cnt_bad_protocol: 0,
            cnt_overlap: 0,
            per_did_failures: BTreeMap::new(),
            reply_time: ReplyTimeStats::default(),
            next_publish_at: None,
            min_publish_interval: Duration::from_millis(5000),
        }
    }

    /// Records the outcome of one exchange against `did`.
    ///
    /// `reply_time_ms` should be `Some` only for `Outcome::Ok`; other
    /// outcomes don't have a meaningful reply time.
    pub fn record_outcome(&mut self, did: u16, outcome: Outcome, reply_time_ms: Option<u64>) {
        self.cnt_total += 1;
        match outcome {
            Outcome::Ok => {
                self.cnt_ok += 1;
                if let Some(ms) = reply_time_ms {
                    self.reply_time.record(ms);
                }
            }
            Outcome::Timeout => {
                self.cnt_timeout += 1;
                *self.per_did_failures.entry(did).or_insert(0) += 1;
            }
            Outcome::NegativeResponse => {
                self.cnt_negative_resp += 1;
                *self.per_did_failures.entry(did).or_insert(0) += 1;
            }
            Outcome::DidMismatch | Outcome::BadFrame | Outcome::BadState => {
                self.cnt_bad_protocol += 1;
                *self.per_did_failures.entry(did).or_insert(0) += 1;
            }
        }
    }

    /// Records a dropped re-entrant inbound-frame call.
    ///
    /// Returns true on the first occurrence and every 100th occurrence
    /// thereafter, telling the caller when to log (`SPEC_FULL.md` §4.1).
    pub fn record_overlap(&mut self) -> bool {
        self.cnt_overlap += 1;
        self.cnt_overlap == 1 || self.cnt_overlap % 100 == 0
    }

    /// Whether a publish is due: `force`, or the throttle window has
    /// elapsed since the last publish.
    pub fn should_publish(&self, now: Instant, force: bool) -> bool {
        force || self.next_publish_at.map_or(true, |t| now >= t)
    }

    /// Records that a publish just happened at `now`, arming the throttle.
    pub fn mark_published(&mut self, now: Instant) {
        self.next_publish_at = Some(now + self.min_publish_interval);
    }

    /// Total exchanges attempted.
    pub fn cnt_total(&self) -> u64 {
        self.cnt_total
    }

    /// Exchanges that completed with `Ok`.
    pub fn cnt_ok(&self) -> u64 {
        self.cnt_ok
    }

    /// Exchanges that ended in a negative response.
    pub fn cnt_negative_resp(&self) -> u64 {
        self.cnt_negative_resp
    }

    /// Exchanges that timed out.
    pub fn cnt_timeout(&self) -> u64 {
        self.cnt_timeout
    }

    /// Exchanges that ended in `DidMismatch`, `BadFrame`, or `BadState`.
    pub fn cnt_bad_protocol(&self) -> u64 {
        self.cnt_bad_protocol
    }

    /// Dropped re-entrant inbound-frame calls.
    pub fn cnt_overlap(&self) -> u64 {
        self.cnt_overlap
    }

    /// Per-DID failure counts (any non-`Ok` outcome).
    pub fn per_did_failures(&self) -> &BTreeMap<u16, u32> {
        &self.per_did_failures
    }

    /// Reply-time statistics over successful exchanges.
    pub fn reply_time(&self) -> &ReplyTimeStats {
        &self.reply_time
    }
}

impl Default for Statistics {
    fn default() -> Self {
        Self::new()
    }
}

/// Caps a [`Value::Tree`]'s fan-out at [`TREE_CHILD_CAP`] entries per level,
/// recursively. Scalar values pass through unchanged.
fn cap_tree(value: &Value) -> Value {
    match value {
        Value::Tree(map) => {
            let mut out = BTreeMap::new();
            for (k, v) in map.iter().take(TREE_CHILD_CAP) {
                out.insert(k.clone(), cap_tree(v));
            }
            Value::Tree(out)
        }
        other => other.clone(),
    }
}

/// Decodes `bytes` for `did` against `catalog`, falling back to raw hex
/// under the `DeviceSpecific` symbolic id when the DID is unknown, its
/// actual length doesn't match the catalog's declared length, or the codec
/// itself rejects the bytes. Free of any particular [`DecodeSink`] instance
/// so a catalog upgrade can decode against the incoming catalog while the
/// sink itself still holds the outgoing one.
fn decode_against(catalog: &DidCatalog, did: u16, bytes: &[u8]) -> (String, Value) {
    let fallback = || (DEVICE_SPECIFIC_ID.to_string(), Value::Text(to_hex(bytes)));

    let Some(desc) = catalog.get(did) else {
        return fallback();
    };
    if desc.declared_len as usize != bytes.len() {
        return fallback();
    }
    let decoded = crate::codec::CodecKind::parse(&desc.codec_name).and_then(|kind| kind.decode(bytes, &desc.codec_args));
    match decoded {
        Ok(value) => (sanitize_symbolic_id(&desc.symbolic_id), value),
        Err(e) => {
            log::warn!("DID {did:#06X} failed to decode, falling back to raw hex: {e}");
            fallback()
        }
    }
}

/// The symbolic id `did` is currently published under in `catalog`, or the
/// `DeviceSpecific` fallback id if `catalog` has no entry for it.
fn symbolic_id_for(catalog: &DidCatalog, did: u16) -> String {
    catalog
        .get(did)
        .map(|d| sanitize_symbolic_id(&d.symbolic_id))
        .unwrap_or_else(|| DEVICE_SPECIFIC_ID.to_string())
}

/// Decodes DID payloads against the catalog and publishes the three views.
///
/// Owns no connection to the host store directly — every publish call takes
/// a `&mut dyn PublishSink` so the same `DecodeSink` can be driven by a
/// session engine that only borrows the sink for the duration of one
/// exchange.
#[derive(Debug)]
pub struct DecodeSink {
    catalog: Arc<DidCatalog>,
    stats: Statistics,
    /// The raw bytes last read for each DID, kept so a catalog upgrade can
    /// republish under a corrected codec without re-querying the device
    /// (`SPEC_FULL.md` §4.4).
    last_raw: BTreeMap<u16, Vec<u8>>,
}

impl DecodeSink {
    /// Creates a sink bound to `catalog`.
    pub fn new(catalog: Arc<DidCatalog>) -> Self {
        Self {
            catalog,
            stats: Statistics::new(),
            last_raw: BTreeMap::new(),
        }
    }

    /// Swaps in a freshly merged catalog.
    ///
    /// If `catalog`'s version is ahead of the one currently in use, computes
    /// the structural diff (`SPEC_FULL.md` §4.4) and applies it through
    /// `sink` before swapping: deletes and republishes the tree for any DID
    /// whose codec or declared length changed, or, if nothing changed but
    /// the stored version predates the type-correction threshold,
    /// pre-deletes the known variable-length DIDs and republishes every
    /// stored DID's tree leaves.
    ///
    /// The old catalog is never mutated in place — other clones of its
    /// `Arc` keep seeing it until they're dropped, per the concurrency
    /// model.
    pub fn set_catalog(&mut self, sink: &mut dyn PublishSink, catalog: Arc<DidCatalog>) {
        if let Some(upgrade) = plan_upgrade(&self.catalog, &catalog) {
            log::debug!(
                "catalog upgrade {} -> {}: {} changed DID(s), retype_leaves={}",
                self.catalog.version(),
                catalog.version(),
                upgrade.changed_dids.len(),
                upgrade.retype_leaves,
            );
            self.apply_upgrade(sink, &catalog, &upgrade);
        }
        self.catalog = catalog;
    }

    /// Applies a computed [`CatalogUpgrade`] against `new_catalog`, using
    /// `self.catalog` (the still-current, pre-swap catalog) to resolve the
    /// symbolic id under which each changed DID is currently published.
    fn apply_upgrade(&mut self, sink: &mut dyn PublishSink, new_catalog: &DidCatalog, upgrade: &CatalogUpgrade) {
        for &did in &upgrade.changed_dids {
            let old_symbolic = symbolic_id_for(&self.catalog, did);
            sink.delete_tree(did, &old_symbolic);
            if let Some(raw) = self.last_raw.get(&did).cloned() {
                self.republish_from(sink, new_catalog, did, &raw);
            }
        }

        if upgrade.retype_leaves {
            for &did in &upgrade.pre_delete_variable_length {
                let symbolic = symbolic_id_for(new_catalog, did);
                sink.delete_tree(did, &symbolic);
            }
            let stored: Vec<(u16, Vec<u8>)> = self.last_raw.iter().map(|(d, b)| (*d, b.clone())).collect();
            for (did, raw) in stored {
                self.republish_from(sink, new_catalog, did, &raw);
            }
        }
    }

    /// Re-decodes `raw` against `catalog` and republishes all three views.
    fn republish_from(&self, sink: &mut dyn PublishSink, catalog: &DidCatalog, did: u16, raw: &[u8]) {
        let (symbolic_id, value) = decode_against(catalog, did, raw);
        let hex = to_hex(raw);
        sink.publish_raw(did, &symbolic_id, &hex);
        sink.publish_json(did, &symbolic_id, &value.to_json_compact());
        sink.publish_tree(did, &symbolic_id, &cap_tree(&value));
    }

    /// The catalog currently in use.
    pub fn catalog(&self) -> &Arc<DidCatalog> {
        &self.catalog
    }

    /// This sink's statistics block.
    pub fn statistics(&self) -> &Statistics {
        &self.stats
    }

    /// Decodes a successful read and publishes its three views.
    ///
    /// Falls back to raw hex under the `DeviceSpecific` symbolic id when the
    /// DID is unknown, its actual length doesn't match the catalog's
    /// declared length, or the codec itself rejects the bytes. Remembers
    /// `bytes` as this DID's last-known raw payload, so a later catalog
    /// upgrade can republish it without a fresh read.
    pub fn publish_read(&mut self, sink: &mut dyn PublishSink, did: u16, bytes: &[u8]) {
        let (symbolic_id, value) = decode_against(&self.catalog, did, bytes);
        let hex = to_hex(bytes);
        sink.publish_raw(did, &symbolic_id, &hex);
        sink.publish_json(did, &symbolic_id, &value.to_json_compact());
        sink.publish_tree(did, &symbolic_id, &cap_tree(&value));
        self.last_raw.insert(did, bytes.to_vec());
    }

    /// Records an exchange outcome in this sink's statistics.
    pub fn record_outcome(&mut self, did: u16, outcome: Outcome, reply_time_ms: Option<u64>) {
        self.stats.record_outcome(did, outcome, reply_time_ms);
    }

    /// Records a dropped overlapping inbound-frame call. Returns true if
    /// the caller should log this occurrence.
    pub fn record_overlap(&mut self) -> bool {
        self.stats.record_overlap()
    }

    /// Publishes statistics if the throttle window has elapsed, or always
    /// if `force` is set.
    pub fn maybe_publish_statistics(&mut self, sink: &mut dyn PublishSink, now: Instant, force: bool) {
        if self.stats.should_publish(now, force) {
            sink.publish_statistics(&self.stats);
            self.stats.mark_published(now);
        }
    }
}
