use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::types::TrackId;

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
pub enum EventLevel {
    Debug,
    Info,
    Warn,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ContextEvent {
    pub at: DateTime<Utc>,
    pub level: EventLevel,
    pub component: &'static str,
    pub track: Option<TrackId>,
    pub message: String,
}

/// Caller-owned decode context passed by reference through the pipeline
///
/// Every recorded event is mirrored to the `log` facade. Parallel workers get
/// their own context through [`DecodeContext::child`] and the caller folds
/// them back with [`DecodeContext::merge`].
#[derive(Debug, Clone, Default)]
pub struct DecodeContext {
    track: Option<TrackId>,
    track_sources: bool,
    events: Vec<ContextEvent>,
}

impl DecodeContext {
    pub fn new(track_sources: bool) -> Self {
        Self {
            track: None,
            track_sources,
            events: Vec::new(),
        }
    }

    pub fn for_track(track: TrackId, track_sources: bool) -> Self {
        Self {
            track: Some(track),
            track_sources,
            events: Vec::new(),
        }
    }

    /// Empty context with the same settings, for a worker thread
    pub fn child(&self) -> Self {
        Self {
            track: self.track,
            track_sources: self.track_sources,
            events: Vec::new(),
        }
    }

    pub fn track(&self) -> Option<TrackId> {
        self.track
    }

    pub fn tracks_sources(&self) -> bool {
        self.track_sources
    }

    pub fn debug(&mut self, component: &'static str, message: impl Into<String>) {
        self.record(EventLevel::Debug, component, message.into());
    }

    pub fn info(&mut self, component: &'static str, message: impl Into<String>) {
        self.record(EventLevel::Info, component, message.into());
    }

    pub fn warn(&mut self, component: &'static str, message: impl Into<String>) {
        self.record(EventLevel::Warn, component, message.into());
    }

    fn record(&mut self, level: EventLevel, component: &'static str, message: String) {
        let track = self
            .track
            .map(|t| t.to_string())
            .unwrap_or_else(|| "-".to_string());
        match level {
            EventLevel::Debug => log::debug!("[{}] track {}: {}", component, track, message),
            EventLevel::Info => log::info!("[{}] track {}: {}", component, track, message),
            EventLevel::Warn => log::warn!("[{}] track {}: {}", component, track, message),
        }
        self.events.push(ContextEvent {
            at: Utc::now(),
            level,
            component,
            track: self.track,
            message,
        });
    }

    pub fn events(&self) -> &[ContextEvent] {
        &self.events
    }

    pub fn warnings(&self) -> impl Iterator<Item = &ContextEvent> {
        self.events.iter().filter(|e| e.level == EventLevel::Warn)
    }

    /// Fold a worker context back in, keeping events in time order
    pub fn merge(&mut self, other: DecodeContext) {
        self.events.extend(other.events);
        self.events.sort_by_key(|event| event.at);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_events_recorded_with_track() {
        let mut ctx = DecodeContext::for_track(TrackId::new(3, 1), true);
        ctx.info("pll", "locked after 16 intervals");
        ctx.warn("voter", "split at bit 10");

        assert_eq!(ctx.events().len(), 2);
        assert_eq!(ctx.events()[0].track, Some(TrackId::new(3, 1)));
        assert_eq!(ctx.warnings().count(), 1);
    }

    #[test]
    fn test_merge_children() {
        let mut parent = DecodeContext::new(false);
        let mut left = parent.child();
        let mut right = parent.child();
        left.debug("engine", "mfm");
        right.debug("engine", "fm");

        parent.merge(left);
        parent.merge(right);
        assert_eq!(parent.events().len(), 2);
        assert!(!parent.tracks_sources());
    }
}
