//! Strongly-typed identifiers.
//!
//! ULID-based IDs behind a phantom-typed wrapper: `Id<T>` shares one
//! implementation, while the marker type `T` keeps `JobId`, `MessageId` and
//! `StepId` distinct at compile time. ULIDs sort by creation time, which the
//! queue relies on for best-effort FIFO recovery scans.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::marker::PhantomData;
use ulid::Ulid;

/// Marker trait for ID types. Provides the `Display` prefix.
pub trait IdMarker: Send + Sync + 'static {
    fn prefix() -> &'static str;
}

/// Generic ID type. `T` is phantom: zero-sized, compile-time only.
#[repr(transparent)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct Id<T: IdMarker> {
    ulid: Ulid,
    #[serde(skip)]
    _marker: PhantomData<T>,
}

impl<T: IdMarker> Id<T> {
    pub fn from_ulid(ulid: Ulid) -> Self {
        Self {
            ulid,
            _marker: PhantomData,
        }
    }

    pub fn as_ulid(&self) -> Ulid {
        self.ulid
    }
}

impl<T: IdMarker> From<Ulid> for Id<T> {
    fn from(ulid: Ulid) -> Self {
        Self::from_ulid(ulid)
    }
}

impl<T: IdMarker> fmt::Display for Id<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}{}", T::prefix(), self.ulid)
    }
}

/// Marker for jobs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum Job {}

impl IdMarker for Job {
    fn prefix() -> &'static str {
        "job-"
    }
}

/// Marker for queue messages.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum Message {}

impl IdMarker for Message {
    fn prefix() -> &'static str {
        "msg-"
    }
}

/// Marker for steps (the shared log-numbering scope).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum Step {}

impl IdMarker for Step {
    fn prefix() -> &'static str {
        "step-"
    }
}

/// Identifier of a Job (one node in a spawn tree).
pub type JobId = Id<Job>;

/// Identifier of a queued message (one deliverable unit of work).
pub type MessageId = Id<Message>;

/// Identifier of a Step (shared by every job spawned under it).
pub type StepId = Id<Step>;
