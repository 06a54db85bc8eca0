use futures::stream::{BoxStream, Stream, StreamExt};
use std::borrow::Cow;
use std::fmt;
use std::pin::Pin;
use std::task::{Context, Poll};
use tokio::sync::broadcast;
use tokio_stream::wrappers::{errors::BroadcastStreamRecvError, BroadcastStream};

use crate::errors::{MetadataError, Result};

/// One change observed under a watched prefix.
///
/// `mod_revision` is the store-wide revision of the write, `version` counts the
/// writes of this key since it was created. Backends that cannot report them
/// leave them `None`.
#[derive(Debug, Clone, PartialEq)]
pub enum WatchEvent {
    Put {
        key: Vec<u8>,
        value: Vec<u8>,
        mod_revision: Option<i64>,
        version: Option<i64>,
    },
    Delete {
        key: Vec<u8>,
        mod_revision: Option<i64>,
        version: Option<i64>,
    },
}

impl WatchEvent {
    pub fn key(&self) -> &[u8] {
        match self {
            WatchEvent::Put { key, .. } | WatchEvent::Delete { key, .. } => key,
        }
    }

    pub fn path(&self) -> Cow<'_, str> {
        String::from_utf8_lossy(self.key())
    }

    pub fn mod_revision(&self) -> Option<i64> {
        match self {
            WatchEvent::Put { mod_revision, .. } | WatchEvent::Delete { mod_revision, .. } => {
                *mod_revision
            }
        }
    }

    pub fn is_delete(&self) -> bool {
        matches!(self, WatchEvent::Delete { .. })
    }
}

impl fmt::Display for WatchEvent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let op = if self.is_delete() { "delete" } else { "put" };
        match self.mod_revision() {
            Some(revision) => write!(f, "{} {}@{}", op, self.path(), revision),
            None => write!(f, "{} {}", op, self.path()),
        }
    }
}

/// Feed of [`WatchEvent`]s. It ends when the backend drops the watch.
pub struct WatchStream(BoxStream<'static, Result<WatchEvent>>);

impl WatchStream {
    pub fn new(stream: impl Stream<Item = Result<WatchEvent>> + Send + 'static) -> Self {
        WatchStream(stream.boxed())
    }

    /// Adapts a broadcast receiver; a slow consumer sees `MetadataError::WatchLagged`.
    pub fn from_broadcast(rx: broadcast::Receiver<WatchEvent>) -> Self {
        WatchStream::new(BroadcastStream::new(rx).map(|received| {
            received.map_err(|err| match err {
                BroadcastStreamRecvError::Lagged(missed) => MetadataError::WatchLagged(missed),
            })
        }))
    }
}

impl Stream for WatchStream {
    type Item = Result<WatchEvent>;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        self.0.poll_next_unpin(cx)
    }
}
