//! Optimistic concurrency contract between stream readers and writers.

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Position of the last event in a stream (1-based, gap-free).
pub type StreamVersion = u64;

/// Precondition on a stream's current version, checked on read and on append.
///
/// A closed set of modes: there is no way to ask for "must not exist" and an
/// exact version at the same time.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case", tag = "mode", content = "version")]
pub enum ExpectedStreamVersion {
    /// Skip version checking.
    #[default]
    NoCheck,
    /// The stream must have no events yet.
    StreamDoesNotExist,
    /// The stream's last position must equal this value.
    Exact(StreamVersion),
}

impl ExpectedStreamVersion {
    /// Evaluate the precondition against the stream's current version
    /// (`None` when the stream has never been appended to).
    pub fn matches(self, current: Option<StreamVersion>) -> bool {
        match self {
            ExpectedStreamVersion::NoCheck => true,
            ExpectedStreamVersion::StreamDoesNotExist => current.is_none(),
            ExpectedStreamVersion::Exact(expected) => current == Some(expected),
        }
    }

    pub fn check(
        self,
        stream_name: &str,
        current: Option<StreamVersion>,
    ) -> Result<(), ConcurrencyConflict> {
        if self.matches(current) {
            Ok(())
        } else {
            Err(ConcurrencyConflict {
                stream_name: stream_name.to_string(),
                expected: self,
                actual: current,
            })
        }
    }
}

impl From<StreamVersion> for ExpectedStreamVersion {
    fn from(value: StreamVersion) -> Self {
        ExpectedStreamVersion::Exact(value)
    }
}

/// The expected-version precondition failed.
///
/// Always surfaced to the caller: retrying means reloading state and deciding
/// again, which only the caller can do.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("{}", format_conflict(&self.stream_name, self.expected, self.actual))]
pub struct ConcurrencyConflict {
    pub stream_name: String,
    pub expected: ExpectedStreamVersion,
    /// `None` when the stream has no events.
    pub actual: Option<StreamVersion>,
}

fn format_conflict(
    stream_name: &str,
    expected: ExpectedStreamVersion,
    actual: Option<StreamVersion>,
) -> String {
    match (expected, actual) {
        (ExpectedStreamVersion::StreamDoesNotExist, Some(actual)) => format!(
            "concurrency conflict on '{stream_name}': expected new stream, found version \
             {actual} (hint: another writer created this stream; reload and retry)"
        ),
        (ExpectedStreamVersion::Exact(expected), None) => format!(
            "concurrency conflict on '{stream_name}': expected version {expected}, stream \
             does not exist"
        ),
        (ExpectedStreamVersion::Exact(expected), Some(actual)) => format!(
            "concurrency conflict on '{stream_name}': expected version {expected}, found \
             {actual} (hint: stream was modified; reload and retry)"
        ),
        (expected, actual) => format!(
            "concurrency conflict on '{stream_name}': expected {expected:?}, found {actual:?}"
        ),
    }
}
