//! Debounce and press classification for the two active-low channel switches.
//!
//! A raw level must hold still for the debounce window before it is trusted. Once a press
//! is accepted, holding it past the long-press threshold fires [`SwitchEvent::LongPress`]
//! exactly once; releasing before that fires [`SwitchEvent::ShortPress`] instead.

use crate::config::RelayTimingConfig;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SwitchEvent {
    ShortPress,
    LongPress,
}

/// Electrical level of a released switch (pulled up).
pub const RELEASED_LEVEL: bool = true;

#[derive(Debug, Clone)]
pub struct SwitchTracker {
    debounce_ms: u64,
    long_press_ms: u64,

    raw_last: bool,
    debounced_level: bool,
    debounce_since_ms: u64,
    press_start_ms: Option<u64>,
    long_press_fired: bool,
}

impl SwitchTracker {
    pub fn new(debounce_ms: u64, long_press_ms: u64) -> Self {
        Self {
            debounce_ms,
            long_press_ms,
            raw_last: RELEASED_LEVEL,
            debounced_level: RELEASED_LEVEL,
            debounce_since_ms: 0,
            press_start_ms: None,
            long_press_fired: false,
        }
    }

    pub fn from_timing(timing: &RelayTimingConfig) -> Self {
        Self::new(timing.debounce_ms, timing.long_press_ms)
    }

    pub fn is_pressed(&self) -> bool {
        self.debounced_level != RELEASED_LEVEL
    }

    /// Feeds one raw sample (`true` = pin high) and returns at most one event.
    pub fn sample(&mut self, raw_level: bool, now_ms: u64) -> Option<SwitchEvent> {
        if raw_level != self.raw_last {
            self.raw_last = raw_level;
            self.debounce_since_ms = now_ms;
            return None;
        }

        let settled = now_ms.saturating_sub(self.debounce_since_ms) >= self.debounce_ms;
        if settled && raw_level != self.debounced_level {
            self.debounced_level = raw_level;
            return if self.is_pressed() {
                self.press_start_ms = Some(now_ms);
                self.long_press_fired = false;
                None
            } else {
                self.press_start_ms = None;
                let fired = core::mem::replace(&mut self.long_press_fired, false);
                (!fired).then_some(SwitchEvent::ShortPress)
            };
        }

        match self.press_start_ms {
            Some(start)
                if !self.long_press_fired
                    && now_ms.saturating_sub(start) >= self.long_press_ms =>
            {
                self.long_press_fired = true;
                Some(SwitchEvent::LongPress)
            }
            _ => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use pretty_assertions::assert_eq;

    use super::*;

    const PRESSED: bool = false;
    const RELEASED: bool = true;

    fn tracker() -> SwitchTracker {
        SwitchTracker::from_timing(&RelayTimingConfig::default())
    }

    /// Samples `level` every `step_ms` over `[from_ms, to_ms)` and collects events.
    fn hold(
        switch: &mut SwitchTracker,
        level: bool,
        from_ms: u64,
        to_ms: u64,
        step_ms: u64,
    ) -> Vec<SwitchEvent> {
        (from_ms..to_ms)
            .step_by(step_ms as usize)
            .filter_map(|now| switch.sample(level, now))
            .collect()
    }

    #[test]
    fn idle_released_switch_is_silent() {
        let mut switch = tracker();
        assert!(hold(&mut switch, RELEASED, 0, 10_000, 10).is_empty());
        assert!(!switch.is_pressed());
    }

    #[test]
    fn chatter_faster_than_debounce_produces_nothing() {
        let mut switch = tracker();
        let mut events = Vec::new();

        for (i, now) in (0..5_000_u64).step_by(20).enumerate() {
            let level = i % 2 == 0;
            events.extend(switch.sample(level, now));
        }

        assert!(events.is_empty());
        assert!(!switch.is_pressed());
    }

    #[test]
    fn clean_short_press_emits_one_short_press() {
        let mut switch = tracker();

        let mut events = hold(&mut switch, PRESSED, 0, 1_000, 10);
        assert!(switch.is_pressed());
        events.extend(hold(&mut switch, RELEASED, 1_000, 2_000, 10));

        assert_eq!(events, vec![SwitchEvent::ShortPress]);
        assert!(!switch.is_pressed());
    }

    #[test]
    fn press_is_accepted_only_after_debounce_window() {
        let mut switch = tracker();

        assert_eq!(switch.sample(PRESSED, 100), None);
        assert_eq!(switch.sample(PRESSED, 149), None);
        assert!(!switch.is_pressed());
        assert_eq!(switch.sample(PRESSED, 150), None);
        assert!(switch.is_pressed());
    }

    #[test]
    fn bounce_during_press_restarts_debounce() {
        let mut switch = tracker();

        switch.sample(PRESSED, 0);
        switch.sample(RELEASED, 30);
        switch.sample(PRESSED, 40);
        switch.sample(PRESSED, 80);
        assert!(!switch.is_pressed());
        switch.sample(PRESSED, 90);
        assert!(switch.is_pressed());
    }

    #[test]
    fn long_hold_emits_single_long_press_and_no_short_press() {
        let mut switch = tracker();

        let mut events = hold(&mut switch, PRESSED, 0, 8_000, 10);
        events.extend(hold(&mut switch, RELEASED, 8_000, 9_000, 10));

        assert_eq!(events, vec![SwitchEvent::LongPress]);
    }

    #[test]
    fn long_press_fires_at_threshold_after_acceptance() {
        let mut switch = tracker();

        switch.sample(PRESSED, 0);
        switch.sample(PRESSED, 50);
        assert!(switch.is_pressed());

        assert_eq!(switch.sample(PRESSED, 2_549), None);
        assert_eq!(switch.sample(PRESSED, 2_550), Some(SwitchEvent::LongPress));
        assert_eq!(switch.sample(PRESSED, 2_560), None);
    }

    #[test]
    fn release_before_threshold_is_short() {
        let mut switch = tracker();

        // Release is accepted at 2_450, before the 2_550 long-press mark.
        let mut events = hold(&mut switch, PRESSED, 0, 2_400, 10);
        events.extend(hold(&mut switch, RELEASED, 2_400, 3_000, 10));

        assert_eq!(events, vec![SwitchEvent::ShortPress]);
    }

    #[test]
    fn consecutive_presses_are_independent() {
        let mut switch = tracker();

        let mut events = hold(&mut switch, PRESSED, 0, 3_000, 10);
        events.extend(hold(&mut switch, RELEASED, 3_000, 3_500, 10));
        events.extend(hold(&mut switch, PRESSED, 3_500, 3_800, 10));
        events.extend(hold(&mut switch, RELEASED, 3_800, 4_200, 10));

        assert_eq!(
            events,
            vec![SwitchEvent::LongPress, SwitchEvent::ShortPress]
        );
    }
}
