//! Trigger watcher.
//!
//! Polls a region for any of the trigger templates. The first hit latches
//! the watcher so the trigger fires once per handoff; the engine re-arms
//! it when the sequence ends or the engine stops.

use std::sync::Arc;
use std::time::Duration;

use crate::platform::{ClickType, Frame};
use crate::vision::{MatchResult, Region, TemplateAsset, TemplateMatcher};

/// Result of one trigger poll.
#[derive(Debug, Clone, PartialEq)]
pub enum TriggerResult {
    /// A template matched; the watcher is now latched.
    Fired(MatchResult),
    /// Nothing matched.
    NotMet,
    /// Already fired and not yet re-armed; nothing was searched.
    Latched,
}

/// Watches a region for trigger templates.
#[derive(Debug)]
pub struct TriggerWatcher {
    templates: Vec<Arc<TemplateAsset>>,
    region: Region,
    interval: Duration,
    click: ClickType,
    triggered: bool,
}

impl TriggerWatcher {
    /// Creates an armed watcher. Templates are tried in the given order.
    #[must_use]
    pub const fn new(
        templates: Vec<Arc<TemplateAsset>>,
        region: Region,
        interval: Duration,
        click: ClickType,
    ) -> Self {
        Self {
            templates,
            region,
            interval,
            click,
            triggered: false,
        }
    }

    /// Region searched on every poll.
    #[must_use]
    pub const fn region(&self) -> &Region {
        &self.region
    }

    /// Time between polls.
    #[must_use]
    pub const fn interval(&self) -> Duration {
        self.interval
    }

    /// Click issued on the matched trigger.
    #[must_use]
    pub const fn click(&self) -> ClickType {
        self.click
    }

    /// `true` once fired and until [`rearm`](Self::rearm).
    #[must_use]
    pub const fn is_latched(&self) -> bool {
        self.triggered
    }

    /// Searches `frame` for the first matching trigger template.
    pub fn poll(&mut self, frame: &Frame, matcher: &TemplateMatcher) -> TriggerResult {
        if self.triggered {
            return TriggerResult::Latched;
        }
        match matcher.locate_any(&self.templates, frame) {
            Some(m) => {
                self.triggered = true;
                TriggerResult::Fired(m)
            }
            None => TriggerResult::NotMet,
        }
    }

    /// Clears the latch so the next poll may fire again.
    pub const fn rearm(&mut self) {
        self.triggered = false;
    }
}
