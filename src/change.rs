//! Change records and their decoding.

use crate::error::DecodeError;
use crate::types::{Revision, Sequence};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

/// A document snapshot attached to a change when `include_docs` is set.
///
/// The snapshot stays an untyped JSON object; decode it into your own type
/// with [`Document::decode`].
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Document(Map<String, Value>);

impl Document {
    /// The `_id` field.
    pub fn id(&self) -> Option<&str> {
        self.0.get("_id").and_then(Value::as_str)
    }

    /// The `_rev` field.
    pub fn rev(&self) -> Option<&str> {
        self.0.get("_rev").and_then(Value::as_str)
    }

    /// Whether the snapshot is a deletion stub (`"_deleted": true`).
    pub fn is_deleted(&self) -> bool {
        self.0
            .get("_deleted")
            .and_then(Value::as_bool)
            .unwrap_or(false)
    }

    /// Look up a top-level field, including `_`-prefixed metadata.
    pub fn get(&self, field: &str) -> Option<&Value> {
        self.0.get(field)
    }

    /// The raw JSON object.
    pub fn as_map(&self) -> &Map<String, Value> {
        &self.0
    }

    /// Take the raw JSON object.
    pub fn into_map(self) -> Map<String, Value> {
        self.0
    }

    /// Decode the snapshot into a caller-defined document type.
    pub fn decode<T: DeserializeOwned>(&self) -> Result<T, serde_json::Error> {
        serde_json::from_value(Value::Object(self.0.clone()))
    }
}

impl From<Map<String, Value>> for Document {
    fn from(map: Map<String, Value>) -> Self {
        Document(map)
    }
}

/// One entry of a database's change feed.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ChangeEvent {
    /// Id of the document that changed.
    pub id: String,
    /// Position of this change in the change log.
    pub seq: Sequence,
    /// Revision markers for the change, by default only the winning one.
    #[serde(default)]
    pub changes: Vec<Revision>,
    /// Set when the change is a deletion.
    #[serde(default, skip_serializing_if = "std::ops::Not::not")]
    pub deleted: bool,
    /// The document at this revision, present with `include_docs`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub doc: Option<Document>,
}

impl ChangeEvent {
    /// The first listed revision, which is the winning one.
    pub fn rev(&self) -> Option<&str> {
        self.changes.first().map(Revision::as_str)
    }
}

/// The result of a one-shot (normal or long-poll) changes request.
#[derive(Clone, Debug, PartialEq, Deserialize)]
pub struct Changes {
    /// Changes in sequence order.
    pub results: Vec<ChangeEvent>,
    /// Sequence of the last change returned; pass it as `since` to resume.
    pub last_seq: Sequence,
}

/// What a single framed line turned out to be.
#[derive(Debug, PartialEq)]
pub(crate) enum Record {
    /// Blank keep-alive line
    Heartbeat,
    Change(ChangeEvent),
    /// `{"last_seq": N}`, sent when the server ends a continuous response
    LastSeq(Sequence),
}

/// `{"last_seq": N}`, the final line of a continuous response.
#[derive(Deserialize)]
struct Trailer {
    last_seq: Sequence,
}

/// Decode one framed line.
///
/// Returns `Ok(None)` for a blank heartbeat line (and for the trailer a
/// server sends when it ends a continuous response), the decoded event for
/// a change line, and a [`DecodeError`] for anything else.
pub fn parse_line(line: &str) -> Result<Option<ChangeEvent>, DecodeError> {
    match parse_record(line)? {
        Record::Change(event) => Ok(Some(event)),
        Record::Heartbeat | Record::LastSeq(_) => Ok(None),
    }
}

pub(crate) fn parse_record(line: &str) -> Result<Record, DecodeError> {
    let line = line.trim();
    if line.is_empty() {
        return Ok(Record::Heartbeat);
    }

    // Lines that are not changes are only tried as the trailer; a malformed
    // line reports why it is not a change.
    serde_json::from_str::<ChangeEvent>(line)
        .map(Record::Change)
        .or_else(|err| {
            serde_json::from_str::<Trailer>(line)
                .map(|trailer| Record::LastSeq(trailer.last_seq))
                .map_err(|_| DecodeError {
                    line: line.to_string(),
                    message: err.to_string(),
                })
        })
}
