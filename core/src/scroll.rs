/// Auto-scroll and history-position rules for the message view.
/// Offsets are measured in px from the top of the content.

/// Small delta used to ignore floating-point scroll jitter.
const SCROLL_DELTA_EPSILON: f32 = 1.0;

#[derive(Debug, Clone, Copy)]
struct PrependAnchor {
    content_height: f32,
    offset: f32,
}

#[derive(Debug, Clone)]
pub struct ScrollCoordinator {
    near_bottom_threshold: f32,
    offset: f32,
    content_height: f32,
    viewport_height: f32,
    follow_bottom: bool,
    pending_scroll_to_bottom: bool,
    anchor: Option<PrependAnchor>,
}

impl ScrollCoordinator {
    pub fn new(near_bottom_threshold: f32) -> Self {
        Self {
            near_bottom_threshold,
            offset: 0.0,
            content_height: 0.0,
            viewport_height: 0.0,
            follow_bottom: true,
            pending_scroll_to_bottom: false,
            anchor: None,
        }
    }

    /// New conversation: land on the newest message
    pub fn reset(&mut self) {
        self.offset = 0.0;
        self.content_height = 0.0;
        self.follow_bottom = true;
        self.pending_scroll_to_bottom = true;
        self.anchor = None;
    }

    pub fn is_following_bottom(&self) -> bool {
        self.follow_bottom
    }

    pub fn offset(&self) -> f32 {
        self.offset
    }

    /// Record the current viewport geometry after a user scroll or a re-layout
    pub fn observe(&mut self, offset: f32, content_height: f32, viewport_height: f32) {
        let offset_delta = offset - self.offset;
        let content_size_changed =
            (content_height - self.content_height).abs() > SCROLL_DELTA_EPSILON;
        let user_scrolled_up = offset_delta < -SCROLL_DELTA_EPSILON && !content_size_changed;
        let user_scrolled_down = offset_delta > SCROLL_DELTA_EPSILON && !content_size_changed;
        let was_near_bottom = self.is_near_bottom();

        self.offset = offset;
        self.content_height = content_height;
        self.viewport_height = viewport_height;

        if self.pending_scroll_to_bottom || (content_size_changed && was_near_bottom) {
            self.follow_bottom = true;
        } else if self.follow_bottom {
            // Viewing history pauses follow mode
            if user_scrolled_up && !self.is_near_bottom() {
                self.follow_bottom = false;
            }
        } else if user_scrolled_down && self.is_near_bottom() {
            self.follow_bottom = true;
        }
    }

    /// The viewer's own message was confirmed: always jump to it
    pub fn on_own_message_confirmed(&mut self) {
        self.pending_scroll_to_bottom = true;
        self.follow_bottom = true;
    }

    /// Someone else's message arrived: follow only if not reading history
    pub fn on_live_message(&mut self) {
        if self.anchor.is_none() && (self.follow_bottom || self.is_near_bottom()) {
            self.pending_scroll_to_bottom = true;
        }
    }

    /// Remember geometry right before an older page is inserted
    pub fn capture_before_prepend(&mut self) {
        self.anchor = Some(PrependAnchor {
            content_height: self.content_height,
            offset: self.offset,
        });
    }

    /// Offset that keeps the previously visible message in place after a prepend
    pub fn restore_after_prepend(&mut self, new_content_height: f32) -> f32 {
        let Some(anchor) = self.anchor.take() else {
            self.content_height = new_content_height;
            return self.offset;
        };
        let grown = (new_content_height - anchor.content_height).max(0.0);
        self.offset = anchor.offset + grown;
        self.content_height = new_content_height;
        self.offset
    }

    /// The older page did not arrive; drop the captured geometry
    pub fn cancel_prepend(&mut self) {
        self.anchor = None;
    }

    /// Target offset if a scroll to the newest message is due
    pub fn apply_pending_scroll(&mut self) -> Option<f32> {
        if !self.pending_scroll_to_bottom || self.anchor.is_some() {
            return None;
        }
        self.pending_scroll_to_bottom = false;
        self.offset = self.bottom_offset();
        Some(self.offset)
    }

    fn bottom_offset(&self) -> f32 {
        (self.content_height - self.viewport_height).max(0.0)
    }

    fn is_near_bottom(&self) -> bool {
        if self.content_height <= self.viewport_height {
            return true;
        }
        self.bottom_offset() - self.offset <= self.near_bottom_threshold
    }
}

impl Default for ScrollCoordinator {
    fn default() -> Self {
        Self::new(80.0)
    }
}
