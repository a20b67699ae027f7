//! Wire and storage model: flags, segments, and the data-sync frames
//! exchanged with the flag center.
use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use chrono::{DateTime, Utc};
use derive_more::From;
use serde::{Deserialize, Serialize};

/// Timestamps are carried as ISO-8601 on the wire and compared as
/// milliseconds since epoch internally.
pub type Timestamp = DateTime<Utc>;

pub const MESSAGE_TYPE_DATA_SYNC: &str = "data-sync";
pub const MESSAGE_TYPE_PING: &str = "ping";
pub const EVENT_TYPE_FULL: &str = "full";
pub const EVENT_TYPE_PATCH: &str = "patch";

/// Keepalive frame sent every ping interval.
pub const PING_FRAME: &str = r#"{"messageType":"ping","data":{"timestamp":0}}"#;

/// Data-sync request carrying the snapshot version (0 if uninitialized).
pub fn sync_request_frame(version: i64) -> String {
    format!(
        r#"{{"messageType":"data-sync","data":{{"timestamp":{}}}}}"#,
        version
    )
}

fn default_timestamp() -> Timestamp {
    DateTime::<Utc>::UNIX_EPOCH
}

/// Namespaces of the snapshot store.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Category {
    #[serde(rename = "featureFlags")]
    FeatureFlags,
    #[serde(rename = "segments")]
    Segments,
}

/// One full category-keyed batch of items, as handed to the store.
pub type DataSet = HashMap<Category, HashMap<String, Arc<DataItem>>>;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
#[allow(missing_docs)]
pub struct Variation {
    pub id: String,
    #[serde(default)]
    pub value: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
#[allow(missing_docs)]
pub struct TargetUser {
    #[serde(default)]
    pub key_ids: Vec<String>,
    pub variation_id: String,
}

/// A check that the user attribute named by `property` matches `value`
/// under `op`. Segment conditions leave `op` empty and carry the operator
/// name in `property` instead.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Condition {
    #[serde(default)]
    pub property: String,
    #[serde(default)]
    pub op: String,
    #[serde(default)]
    pub value: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
#[allow(missing_docs)]
pub struct RolloutVariation {
    pub id: String,
    /// `[lo, hi]` sub-interval of `[0, 1]`.
    #[serde(default)]
    pub rollout: Vec<f64>,
    #[serde(default)]
    pub expt_rollout: f64,
}

impl RolloutVariation {
    /// Width of the rollout interval, 0 when malformed.
    pub fn splitting_percentage(&self) -> f64 {
        if self.rollout.len() == 2 {
            self.rollout[1] - self.rollout[0]
        } else {
            0.0
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
#[serde(rename_all = "camelCase")]
#[allow(missing_docs)]
pub struct TargetRule {
    #[serde(default)]
    pub included_in_expt: bool,
    #[serde(default)]
    pub conditions: Vec<Condition>,
    #[serde(default)]
    pub variations: Vec<RolloutVariation>,
    #[serde(default)]
    pub dispatch_key: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
#[serde(rename_all = "camelCase")]
#[allow(missing_docs)]
pub struct Fallthrough {
    #[serde(default)]
    pub included_in_expt: bool,
    #[serde(default)]
    pub variations: Vec<RolloutVariation>,
    #[serde(default)]
    pub dispatch_key: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
#[allow(missing_docs)]
pub struct FeatureFlag {
    #[serde(default)]
    pub id: String,
    #[serde(rename = "isArchived", default)]
    pub archived: bool,
    #[serde(default)]
    pub expt_include_all_targets: bool,
    #[serde(rename = "isEnabled", default)]
    pub enabled: bool,
    #[serde(default)]
    pub name: String,
    pub key: String,
    #[serde(default)]
    pub variation_type: String,
    #[serde(default)]
    pub disabled_variation_id: String,
    #[serde(default)]
    pub variations: Vec<Variation>,
    #[serde(default)]
    pub target_users: Vec<TargetUser>,
    #[serde(default)]
    pub rules: Vec<TargetRule>,
    #[serde(default)]
    pub fallthrough: Fallthrough,
    #[serde(rename = "updatedAt", default = "default_timestamp")]
    pub updated_at: Timestamp,
}

impl FeatureFlag {
    pub fn timestamp(&self) -> i64 {
        self.updated_at.timestamp_millis()
    }

    /// Resolve a variation id to its stored string value. An unresolved id
    /// yields the empty string (non-fatal).
    pub fn variation_value(&self, variation_id: &str) -> &str {
        self.variations
            .iter()
            .find(|v| v.id == variation_id)
            .map(|v| v.value.as_str())
            .unwrap_or("")
    }
}

/// Outcome of matching a user key against a segment's explicit lists.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SegmentMatch {
    Excluded,
    Included,
    Fallthrough,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
#[allow(missing_docs)]
pub struct Segment {
    pub id: String,
    #[serde(rename = "isArchived", default)]
    pub archived: bool,
    #[serde(default)]
    pub included: HashSet<String>,
    #[serde(default)]
    pub excluded: HashSet<String>,
    #[serde(default)]
    pub rules: Vec<TargetRule>,
    #[serde(rename = "updatedAt", default = "default_timestamp")]
    pub updated_at: Timestamp,
}

impl Segment {
    pub fn timestamp(&self) -> i64 {
        self.updated_at.timestamp_millis()
    }

    /// Exclusion wins over inclusion; anything else falls through to the
    /// segment's own rules.
    pub fn match_user(&self, user_key: &str) -> SegmentMatch {
        if self.excluded.contains(user_key) {
            SegmentMatch::Excluded
        } else if self.included.contains(user_key) {
            SegmentMatch::Included
        } else {
            SegmentMatch::Fallthrough
        }
    }
}

/// Any record the snapshot store can hold. Archived records are retained
/// as tombstones so in-order patches stay idempotent.
#[derive(Debug, Clone, PartialEq, From)]
pub enum DataItem {
    Flag(FeatureFlag),
    Segment(Segment),
    #[from(ignore)]
    Tombstone { id: String, timestamp: i64 },
}

impl DataItem {
    /// The storage key of this item: a flag is keyed by its `key`, a
    /// segment by its `id`.
    pub fn item_key(&self) -> &str {
        match self {
            DataItem::Flag(flag) => &flag.key,
            DataItem::Segment(segment) => &segment.id,
            DataItem::Tombstone { id, .. } => id,
        }
    }

    pub fn timestamp(&self) -> i64 {
        match self {
            DataItem::Flag(flag) => flag.timestamp(),
            DataItem::Segment(segment) => segment.timestamp(),
            DataItem::Tombstone { timestamp, .. } => *timestamp,
        }
    }

    pub fn is_archived(&self) -> bool {
        match self {
            DataItem::Flag(flag) => flag.archived,
            DataItem::Segment(segment) => segment.archived,
            DataItem::Tombstone { .. } => true,
        }
    }

    /// The placeholder that replaces this item once archived.
    pub fn to_tombstone(&self) -> DataItem {
        DataItem::Tombstone {
            id: self.item_key().to_owned(),
            timestamp: self.timestamp(),
        }
    }
}

/// First-pass decode of an incoming frame, just enough to discriminate.
#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MessageEnvelope {
    #[serde(default)]
    pub message_type: String,
}

impl MessageEnvelope {
    pub fn is_ping(&self) -> bool {
        self.message_type == MESSAGE_TYPE_PING
    }
}

/// Server data frame: a full replacement or a patch set of flags and
/// segments.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SyncPayload {
    #[serde(default)]
    pub message_type: String,
    pub data: SyncData,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SyncData {
    #[serde(default)]
    pub event_type: String,
    #[serde(default)]
    pub feature_flags: Vec<FeatureFlag>,
    #[serde(default)]
    pub segments: Vec<Segment>,
}

impl SyncPayload {
    pub fn is_full(&self) -> bool {
        self.data.event_type == EVENT_TYPE_FULL
    }

    /// True when the frame is a data-sync message with a recognized event
    /// type.
    pub fn is_process_data(&self) -> bool {
        self.message_type == MESSAGE_TYPE_DATA_SYNC
            && (self.data.event_type == EVENT_TYPE_FULL
                || self.data.event_type == EVENT_TYPE_PATCH)
    }
}

impl SyncData {
    /// The snapshot version of this payload: the maximum timestamp across
    /// all carried items.
    pub fn max_timestamp(&self) -> i64 {
        let flags = self.feature_flags.iter().map(FeatureFlag::timestamp);
        let segments = self.segments.iter().map(Segment::timestamp);
        flags.chain(segments).max().unwrap_or(0)
    }

    /// Convert into category-keyed storage items, replacing archived
    /// records with tombstones.
    pub fn into_data_set(self) -> DataSet {
        fn put(container: &mut HashMap<String, Arc<DataItem>>, item: DataItem) {
            let item = if item.is_archived() {
                item.to_tombstone()
            } else {
                item
            };
            container.insert(item.item_key().to_owned(), Arc::new(item));
        }

        let mut flags = HashMap::with_capacity(self.feature_flags.len());
        for flag in self.feature_flags {
            put(&mut flags, DataItem::Flag(flag));
        }
        let mut segments = HashMap::with_capacity(self.segments.len());
        for segment in self.segments {
            put(&mut segments, DataItem::Segment(segment));
        }

        let mut data = HashMap::with_capacity(2);
        data.insert(Category::FeatureFlags, flags);
        data.insert(Category::Segments, segments);
        data
    }
}
