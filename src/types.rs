use chrono::DateTime;
use chrono::Utc;
use serde::Deserialize;
use serde::Serialize;
use std::collections::BTreeMap;
use std::collections::BTreeSet;
use std::fmt::Display;
use strum::AsRefStr;
use strum::Display as StrumDisplay;
use strum::EnumIter;

/// Which kind of datum a record is. Drives DAO dispatch and statistics.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, EnumIter, AsRefStr, StrumDisplay, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
#[strum(serialize_all = "lowercase")]
pub enum DatumKind {
    Stream,
    Node,
    Location,
}

/// The property bag carried by every datum.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct DatumSamples {
    #[serde(default)]
    pub instantaneous: BTreeMap<String, f64>,
    #[serde(default)]
    pub accumulating:  BTreeMap<String, f64>,
    #[serde(default)]
    pub status:        BTreeMap<String, String>,
    #[serde(default)]
    pub tags:          BTreeSet<String>,
}

impl DatumSamples {
    /// `false` if any numeric sample is NaN or infinite. JSON has no representation for those.
    pub fn is_finite(&self) -> bool {
        self.instantaneous
            .values()
            .chain(self.accumulating.values())
            .all(|v| v.is_finite())
    }

    // Unlike `==`, a NaN sample matches itself as long as the bits are the same.
    fn same_as(&self, other: &Self) -> bool {
        fn same_numbers(a: &BTreeMap<String, f64>, b: &BTreeMap<String, f64>) -> bool {
            a.len() == b.len()
                && a.iter()
                    .zip(b.iter())
                    .all(|((ka, va), (kb, vb))| ka == kb && va.to_bits() == vb.to_bits())
        }
        same_numbers(&self.instantaneous, &other.instantaneous)
            && same_numbers(&self.accumulating, &other.accumulating)
            && self.status == other.status
            && self.tags == other.tags
    }
}

/// A time-series point keyed by an opaque stream id.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StreamDatum {
    pub stream_id: String,
    pub timestamp: DateTime<Utc>,
    pub samples:   DatumSamples,
}

/// A datum reported by a node for one of its sources.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NodeDatum {
    pub node_id:   i64,
    pub source_id: String,
    pub timestamp: DateTime<Utc>,
    pub samples:   DatumSamples,
}

/// A datum reported for a location and one of its sources.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LocationDatum {
    pub location_id: i64,
    pub source_id:   String,
    pub timestamp:   DateTime<Utc>,
    pub samples:     DatumSamples,
}

/// A persistable telemetry record.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum Datum {
    Stream(StreamDatum),
    Node(NodeDatum),
    Location(LocationDatum),
}

impl Datum {
    pub fn kind(&self) -> DatumKind {
        match self {
            Datum::Stream(_) => DatumKind::Stream,
            Datum::Node(_) => DatumKind::Node,
            Datum::Location(_) => DatumKind::Location,
        }
    }

    pub fn key(&self) -> DatumKey {
        match self {
            Datum::Stream(d) => DatumKey::Stream {
                stream_id: d.stream_id.clone(),
                timestamp: d.timestamp,
            },
            Datum::Node(d) => DatumKey::Node {
                node_id:   d.node_id,
                source_id: d.source_id.clone(),
                timestamp: d.timestamp,
            },
            Datum::Location(d) => DatumKey::Location {
                location_id: d.location_id,
                source_id:   d.source_id.clone(),
                timestamp:   d.timestamp,
            },
        }
    }

    pub fn samples(&self) -> &DatumSamples {
        match self {
            Datum::Stream(d) => &d.samples,
            Datum::Node(d) => &d.samples,
            Datum::Location(d) => &d.samples,
        }
    }

    /// Whether `other` is this very version of the record: same key and bit-identical samples.
    pub fn same_version(&self, other: &Datum) -> bool {
        self.key() == other.key() && self.samples().same_as(other.samples())
    }
}

impl From<StreamDatum> for Datum {
    fn from(d: StreamDatum) -> Self {
        Datum::Stream(d)
    }
}

impl From<NodeDatum> for Datum {
    fn from(d: NodeDatum) -> Self {
        Datum::Node(d)
    }
}

impl From<LocationDatum> for Datum {
    fn from(d: LocationDatum) -> Self {
        Datum::Location(d)
    }
}

/// Composite identity of a datum. Two datum with the same key are the same logical record.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum DatumKey {
    Stream {
        stream_id: String,
        timestamp: DateTime<Utc>,
    },
    Node {
        node_id:   i64,
        source_id: String,
        timestamp: DateTime<Utc>,
    },
    Location {
        location_id: i64,
        source_id:   String,
        timestamp:   DateTime<Utc>,
    },
}

impl Display for DatumKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            DatumKey::Stream { stream_id, timestamp } => {
                write!(f, "stream:{stream_id}@{}", timestamp.to_rfc3339())
            }
            DatumKey::Node {
                node_id,
                source_id,
                timestamp,
            } => write!(f, "node:{node_id}/{source_id}@{}", timestamp.to_rfc3339()),
            DatumKey::Location {
                location_id,
                source_id,
                timestamp,
            } => write!(f, "location:{location_id}/{source_id}@{}", timestamp.to_rfc3339()),
        }
    }
}

/// Opaque handle identifying one delivery of a remote queue message.
pub type ReceiptHandle = String;

/// A message received from a remote durable queue.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct QueueMessage {
    pub message_id:     String,
    pub receipt_handle: ReceiptHandle,
    pub body:           String,
    /// How many times the message has been received, this delivery included.
    pub receive_count:  u32,
}

/// Outcome of a batch operation against a remote queue. Handles listed in `failed` were not processed.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct BatchOutcome {
    pub succeeded: Vec<ReceiptHandle>,
    pub failed:    Vec<ReceiptHandle>,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct QueueAttributes {
    /// Approximate number of messages available for receiving.
    pub visible:   u64,
    /// Approximate number of received but not yet deleted messages.
    pub in_flight: u64,
}

/// Diagnostics a cache may expose for health reporting.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CacheStats {
    pub size:            u64,
    pub capacity:        u64,
    pub high_water_mark: u64,
}

/// Identifies a cache listener registration.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ListenerId(pub(crate) u64);
