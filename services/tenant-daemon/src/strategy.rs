//! Local strategy file watched for changes
//!
//! The fingerprint is the file length plus its modification time, so an
//! untouched file is never re-read. A missing file unsets the strategy.

use std::io;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::UNIX_EPOCH;

use resilience::{RefreshListener, Refreshable};

use crate::events::{Event, EventRegistry};

pub type StrategySource = Refreshable<String, io::Error>;

/// Strategy contents of the file at `path`.
pub fn watch_file(path: PathBuf) -> StrategySource {
    let probed = path.clone();
    Refreshable::new(
        format!("strategy:{}", path.display()),
        move || {
            let path = probed.clone();
            async move {
                let metadata = match tokio::fs::metadata(&path).await {
                    Ok(metadata) => metadata,
                    Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(None),
                    Err(e) => return Err(e),
                };
                let modified = metadata
                    .modified()?
                    .duration_since(UNIX_EPOCH)
                    .unwrap_or_default()
                    .as_nanos();
                Ok(Some(format!("{}:{modified}", metadata.len())))
            }
        },
        move |_fingerprint| {
            let path = path.clone();
            async move { tokio::fs::read_to_string(&path).await }
        },
    )
}

/// Republishes strategy transitions on the event registry.
pub struct StrategyEvents {
    events: Arc<EventRegistry>,
}

impl StrategyEvents {
    pub fn new(events: Arc<EventRegistry>) -> Self {
        Self { events }
    }
}

impl RefreshListener<String> for StrategyEvents {
    fn value_set(&self, value: &String) {
        self.events.fire(&Event::StrategyChanged { len: value.len() });
    }

    fn value_changed(&self, _old: &String, new: &String) {
        self.events.fire(&Event::StrategyChanged { len: new.len() });
    }

    fn value_unset(&self, _old: &String) {
        self.events.fire(&Event::StrategyRemoved);
    }
}
