//! Watch envelopes, the resumable cursor and the event-source seam.

use std::collections::VecDeque;
use std::sync::{Mutex, PoisonError};

use futures::stream::{self, BoxStream, StreamExt};
use serde::{Deserialize, Serialize};
use serde_json::Value as Json;
use thiserror::Error;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum EventType {
    Added,
    Modified,
    Deleted,
    Bookmark,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EventMeta {
    #[serde(default)]
    pub name: Option<String>,
    #[serde(default)]
    pub namespace: Option<String>,
    #[serde(default)]
    pub resource_version: Option<String>,
}

/// The custom resource carried by an event. `spec` stays raw until a job is built from it.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct JobObject {
    #[serde(default)]
    pub metadata: EventMeta,
    #[serde(default)]
    pub kind: String,
    #[serde(default)]
    pub spec: Option<Json>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WatchEnvelope {
    #[serde(rename = "type")]
    pub event_type: EventType,
    pub object: JobObject,
}

impl WatchEnvelope {
    pub fn parse(raw: &Json) -> Result<Self, WatchStreamError> {
        Self::deserialize(raw).map_err(|e| WatchStreamError::Decode(e.to_string()))
    }

    pub fn from_slice(bytes: &[u8]) -> Result<Self, WatchStreamError> {
        serde_json::from_slice(bytes).map_err(|e| WatchStreamError::Decode(e.to_string()))
    }

    pub fn bookmark(resource_version: impl Into<String>) -> Self {
        Self {
            event_type: EventType::Bookmark,
            object: JobObject {
                metadata: EventMeta { resource_version: Some(resource_version.into()), ..Default::default() },
                ..Default::default()
            },
        }
    }

    pub fn name(&self) -> Option<&str> { self.object.metadata.name.as_deref() }
    pub fn namespace(&self) -> Option<&str> { self.object.metadata.namespace.as_deref() }
    pub fn resource_version(&self) -> Option<&str> { self.object.metadata.resource_version.as_deref() }
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum WatchStreamError {
    /// The source no longer serves events after our cursor; restart from the beginning.
    #[error("watch cursor expired")]
    Expired,
    #[error("watch disconnected: {0}")]
    Disconnected(String),
    /// A single event could not be decoded; the stream itself is still usable.
    #[error("undecodable watch event: {0}")]
    Decode(String),
}

/// Resume token for the watch. `None` means "from the beginning".
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct WatchCursor {
    resource_version: Option<String>,
}

impl WatchCursor {
    pub fn beginning() -> Self { Self::default() }

    pub fn resource_version(&self) -> Option<&str> { self.resource_version.as_deref() }

    /// Move to `rv`. Numeric tokens never move backwards; returns whether the cursor changed.
    pub fn advance(&mut self, rv: &str) -> bool {
        if rv.is_empty() || self.resource_version.as_deref() == Some(rv) {
            return false;
        }
        if let Some(cur) = self.resource_version.as_deref() {
            if let (Ok(cur), Ok(next)) = (cur.parse::<u64>(), rv.parse::<u64>()) {
                if next < cur {
                    return false;
                }
            }
        }
        self.resource_version = Some(rv.to_string());
        true
    }

    pub fn reset(&mut self) { self.resource_version = None; }
}

pub type EventStream = BoxStream<'static, Result<WatchEnvelope, WatchStreamError>>;

/// A resumable stream of custom-resource events.
#[async_trait::async_trait]
pub trait EventSource: Send + Sync {
    async fn watch(&self, cursor: &WatchCursor) -> Result<EventStream, WatchStreamError>;
}

/// One `watch` call's worth of scripted behaviour.
pub type ScriptedSession = Result<Vec<Result<WatchEnvelope, WatchStreamError>>, WatchStreamError>;

/// Event source that replays scripted sessions, then idles forever.
#[derive(Default)]
pub struct ScriptedSource {
    sessions: Mutex<VecDeque<ScriptedSession>>,
    cursors: Mutex<Vec<WatchCursor>>,
}

impl ScriptedSource {
    pub fn new<I: IntoIterator<Item = ScriptedSession>>(sessions: I) -> Self {
        Self { sessions: Mutex::new(sessions.into_iter().collect()), cursors: Mutex::new(Vec::new()) }
    }

    /// Cursors passed to each `watch` call, in order.
    pub fn cursors(&self) -> Vec<WatchCursor> { self.cursors.lock().unwrap_or_else(PoisonError::into_inner).clone() }
}

#[async_trait::async_trait]
impl EventSource for ScriptedSource {
    async fn watch(&self, cursor: &WatchCursor) -> Result<EventStream, WatchStreamError> {
        self.cursors.lock().unwrap_or_else(PoisonError::into_inner).push(cursor.clone());
        let next = self.sessions.lock().unwrap_or_else(PoisonError::into_inner).pop_front();
        match next {
            Some(Ok(events)) => Ok(stream::iter(events).boxed()),
            Some(Err(e)) => Err(e),
            None => Ok(stream::pending::<Result<WatchEnvelope, WatchStreamError>>().boxed()),
        }
    }
}
