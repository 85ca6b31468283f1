use std::time::{Duration, Instant};

use tracing::trace;

const DEFAULT_MIN_SCROLL_INTERVAL_MS: u64 = 300;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ScrollCommand {
    ScrollToLatest { animated: bool },
    DismissKeyboard,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ScrollConfig {
    pub auto_scroll: bool,
    pub min_interval: Duration,
}

impl Default for ScrollConfig {
    fn default() -> Self {
        Self {
            auto_scroll: true,
            min_interval: Duration::from_millis(DEFAULT_MIN_SCROLL_INTERVAL_MS),
        }
    }
}

/// Decides when the transcript view follows new content. Callers pass the
/// current instant so throttling stays deterministic under test.
#[derive(Debug)]
pub struct ScrollFocusCoordinator {
    config: ScrollConfig,
    pinned: bool,
    keyboard_visible: bool,
    last_animation: Option<Instant>,
    pending: bool,
}

impl Default for ScrollFocusCoordinator {
    fn default() -> Self {
        Self::new(ScrollConfig::default())
    }
}

impl ScrollFocusCoordinator {
    pub fn new(config: ScrollConfig) -> Self {
        Self {
            config,
            pinned: true,
            keyboard_visible: false,
            last_animation: None,
            pending: false,
        }
    }

    pub fn set_config(&mut self, config: ScrollConfig) {
        self.config = config;
        if !config.auto_scroll {
            self.pending = false;
        }
    }

    pub fn is_pinned(&self) -> bool {
        self.pinned
    }

    pub fn has_pending_scroll(&self) -> bool {
        self.pending
    }

    /// Scrolling away unpins; landing back on the bottom edge re-pins.
    pub fn user_scrolled(&mut self, at_bottom: bool) {
        if self.pinned != at_bottom {
            trace!(pinned = at_bottom, "scroll pin changed");
        }
        self.pinned = at_bottom;
        if !at_bottom {
            self.pending = false;
        }
    }

    pub fn user_sent(&mut self, now: Instant) -> ScrollCommand {
        self.pinned = true;
        self.pending = false;
        self.last_animation = Some(now);
        ScrollCommand::ScrollToLatest { animated: true }
    }

    /// Called for every streamed chunk. Requests inside the throttle window are
    /// coalesced until the next allowed animation or the end of the stream.
    pub fn content_changed(&mut self, now: Instant) -> Option<ScrollCommand> {
        if !self.config.auto_scroll || !self.pinned {
            return None;
        }

        let throttled = self
            .last_animation
            .is_some_and(|last| now.saturating_duration_since(last) < self.config.min_interval);
        if throttled {
            self.pending = true;
            return None;
        }

        self.last_animation = Some(now);
        self.pending = false;
        Some(ScrollCommand::ScrollToLatest { animated: true })
    }

    pub fn stream_resolved(&mut self) -> Option<ScrollCommand> {
        let pending = std::mem::take(&mut self.pending);
        (pending && self.pinned).then_some(ScrollCommand::ScrollToLatest { animated: false })
    }

    /// Drops a coalesced request without scrolling, for a reply that was
    /// rolled back.
    pub fn clear_pending(&mut self) {
        self.pending = false;
    }

    pub fn keyboard_visibility_changed(&mut self, visible: bool) -> Option<ScrollCommand> {
        self.keyboard_visible = visible;
        (visible && self.pinned).then_some(ScrollCommand::ScrollToLatest { animated: true })
    }

    /// `keyboard_visible` is the composer's own view of the keyboard, which may
    /// be ahead of the last platform notification.
    pub fn recording_started(&mut self, keyboard_visible: bool) -> Option<ScrollCommand> {
        let visible = std::mem::take(&mut self.keyboard_visible) || keyboard_visible;
        visible.then_some(ScrollCommand::DismissKeyboard)
    }
}
