use std::sync::{Mutex, MutexGuard, PoisonError};

use embedded_hal::digital::OutputPin;
use log::{info, warn};

use crate::{
    config::RelayTimingConfig,
    switch::SwitchEvent,
    types::{ChannelId, ChannelStatus, StatusSnapshot, Urgency, CHANNEL_COUNT},
};

/// What a single engine call did to a channel.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RelayTransition {
    Activated,
    Rearmed,
    Deactivated,
    Expired,
    Unchanged,
}

impl RelayTransition {
    pub fn is_change(self) -> bool {
        !matches!(self, Self::Unchanged)
    }
}

/// One relay output and its countdown. `deadline_ms` doubles as the on/off flag, so an
/// energized channel without a deadline cannot be represented.
#[derive(Debug)]
struct RelayChannel<P> {
    id: ChannelId,
    deadline_ms: Option<u64>,
    pin: P,
}

impl<P: OutputPin> RelayChannel<P> {
    fn new(id: ChannelId, mut pin: P) -> Self {
        if let Err(err) = pin.set_low() {
            warn!("failed to initialise {id} output low: {err:?}");
        }
        Self {
            id,
            deadline_ms: None,
            pin,
        }
    }

    fn is_active(&self) -> bool {
        self.deadline_ms.is_some()
    }

    fn remaining_ms(&self, now_ms: u64) -> u64 {
        self.deadline_ms
            .map(|deadline| deadline.saturating_sub(now_ms))
            .unwrap_or(0)
    }

    fn status(&self, now_ms: u64) -> ChannelStatus {
        if self.is_active() {
            ChannelStatus::active(self.remaining_ms(now_ms) / 1000)
        } else {
            ChannelStatus::inactive()
        }
    }

    fn arm(&mut self, now_ms: u64, countdown_ms: u64) -> RelayTransition {
        let was_active = self.is_active();
        self.deadline_ms = Some(now_ms.saturating_add(countdown_ms));
        self.drive(true);

        if was_active {
            RelayTransition::Rearmed
        } else {
            RelayTransition::Activated
        }
    }

    fn rearm(&mut self, now_ms: u64, countdown_ms: u64) -> RelayTransition {
        if !self.is_active() {
            return self.arm(now_ms, countdown_ms);
        }
        self.deadline_ms = Some(now_ms.saturating_add(countdown_ms));
        RelayTransition::Rearmed
    }

    fn release(&mut self) -> RelayTransition {
        if self.deadline_ms.take().is_none() {
            return RelayTransition::Unchanged;
        }
        self.drive(false);
        RelayTransition::Deactivated
    }

    fn expire_if_due(&mut self, now_ms: u64) -> RelayTransition {
        match self.deadline_ms {
            Some(deadline) if now_ms >= deadline => {
                self.release();
                RelayTransition::Expired
            }
            _ => RelayTransition::Unchanged,
        }
    }

    fn drive(&mut self, high: bool) {
        let result = if high {
            self.pin.set_high()
        } else {
            self.pin.set_low()
        };

        if let Err(err) = result {
            warn!("failed to drive {} output {}: {err:?}", self.id, level_name(high));
        }
    }
}

/// Per-channel countdown state for both relays.
///
/// Every operation takes the lock of exactly one channel for the duration of a single
/// state update plus the matching pin write, so the engine can be shared behind an `Arc`
/// between the poll loop, the HTTP handlers and the MQTT receiver.
#[derive(Debug)]
pub struct RelayEngine<P> {
    timing: RelayTimingConfig,
    channels: [Mutex<RelayChannel<P>>; CHANNEL_COUNT],
}

impl<P: OutputPin> RelayEngine<P> {
    pub fn new(timing: RelayTimingConfig, pins: [P; CHANNEL_COUNT]) -> Self {
        let [relay1, relay2] = pins;
        Self {
            timing,
            channels: [
                Mutex::new(RelayChannel::new(ChannelId::ONE, relay1)),
                Mutex::new(RelayChannel::new(ChannelId::TWO, relay2)),
            ],
        }
    }

    pub fn activate(&self, channel: ChannelId, now_ms: u64) -> RelayTransition {
        let transition = self.lock(channel).arm(now_ms, self.timing.countdown_ms);
        info!(
            "{channel} {} for {}s",
            if transition == RelayTransition::Activated {
                "activated"
            } else {
                "re-activated"
            },
            self.timing.countdown_ms / 1000
        );
        transition
    }

    pub fn deactivate(&self, channel: ChannelId, _now_ms: u64) -> RelayTransition {
        let transition = self.lock(channel).release();
        if transition.is_change() {
            info!("{channel} deactivated");
        }
        transition
    }

    /// Re-arms the countdown of an active channel; an idle channel is activated instead.
    pub fn reset(&self, channel: ChannelId, now_ms: u64) -> RelayTransition {
        let transition = self.lock(channel).rearm(now_ms, self.timing.countdown_ms);
        info!("{channel} timer reset ({transition:?})");
        transition
    }

    pub fn tick(&self, channel: ChannelId, now_ms: u64) -> RelayTransition {
        let transition = self.lock(channel).expire_if_due(now_ms);
        if transition == RelayTransition::Expired {
            info!("{channel} countdown elapsed, relay off");
        }
        transition
    }

    pub fn tick_all(&self, now_ms: u64) -> [RelayTransition; CHANNEL_COUNT] {
        ChannelId::ALL.map(|channel| self.tick(channel, now_ms))
    }

    /// Toggle on a short press, unconditional reset on a long press.
    pub fn handle_switch_event(
        &self,
        channel: ChannelId,
        event: SwitchEvent,
        now_ms: u64,
    ) -> RelayTransition {
        match event {
            SwitchEvent::ShortPress => {
                let mut relay = self.lock(channel);
                let transition = if relay.is_active() {
                    relay.release()
                } else {
                    relay.arm(now_ms, self.timing.countdown_ms)
                };
                drop(relay);
                info!("{channel} switch toggled ({transition:?})");
                transition
            }
            SwitchEvent::LongPress => self.reset(channel, now_ms),
        }
    }

    pub fn is_active(&self, channel: ChannelId) -> bool {
        self.lock(channel).is_active()
    }

    pub fn remaining_ms(&self, channel: ChannelId, now_ms: u64) -> u64 {
        self.lock(channel).remaining_ms(now_ms)
    }

    pub fn urgency(&self, channel: ChannelId, now_ms: u64) -> Urgency {
        let relay = self.lock(channel);
        if !relay.is_active() {
            return Urgency::Off;
        }
        classify_remaining(relay.remaining_ms(now_ms), &self.timing)
    }

    pub fn urgencies(&self, now_ms: u64) -> [Urgency; CHANNEL_COUNT] {
        ChannelId::ALL.map(|channel| self.urgency(channel, now_ms))
    }

    /// Reads one channel, switching it off first if its deadline has already passed.
    pub fn channel_status(&self, channel: ChannelId, now_ms: u64) -> ChannelStatus {
        let mut relay = self.lock(channel);
        if relay.expire_if_due(now_ms) == RelayTransition::Expired {
            info!("{channel} countdown elapsed, relay off");
        }
        relay.status(now_ms)
    }

    pub fn snapshot(&self, now_ms: u64) -> StatusSnapshot {
        StatusSnapshot {
            relay1: self.channel_status(ChannelId::ONE, now_ms),
            relay2: self.channel_status(ChannelId::TWO, now_ms),
        }
    }

    fn lock(&self, channel: ChannelId) -> MutexGuard<'_, RelayChannel<P>> {
        // Every critical section is a single assignment, so a poisoned guard is still coherent.
        self.channels[channel.index()]
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
    }
}

pub fn classify_remaining(remaining_ms: u64, timing: &RelayTimingConfig) -> Urgency {
    if remaining_ms <= timing.urgent_ms {
        Urgency::Urgent
    } else if remaining_ms <= timing.warning_ms {
        Urgency::Warning
    } else {
        Urgency::Normal
    }
}

fn level_name(high: bool) -> &'static str {
    if high {
        "high"
    } else {
        "low"
    }
}

#[cfg(test)]
mod tests {
    use std::{
        convert::Infallible,
        sync::{
            atomic::{AtomicBool, AtomicUsize, Ordering},
            Arc,
        },
    };

    use embedded_hal::digital::ErrorType;
    use pretty_assertions::assert_eq;

    use super::*;

    const MINUTE: u64 = 60_000;

    #[derive(Clone, Default)]
    struct MockPin {
        high: Arc<AtomicBool>,
        writes: Arc<AtomicUsize>,
    }

    impl MockPin {
        fn is_high(&self) -> bool {
            self.high.load(Ordering::SeqCst)
        }

        fn writes(&self) -> usize {
            self.writes.load(Ordering::SeqCst)
        }
    }

    impl ErrorType for MockPin {
        type Error = Infallible;
    }

    impl OutputPin for MockPin {
        fn set_low(&mut self) -> Result<(), Self::Error> {
            self.high.store(false, Ordering::SeqCst);
            self.writes.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }

        fn set_high(&mut self) -> Result<(), Self::Error> {
            self.high.store(true, Ordering::SeqCst);
            self.writes.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }
    }

    fn engine() -> (RelayEngine<MockPin>, [MockPin; 2]) {
        let pins = [MockPin::default(), MockPin::default()];
        let engine = RelayEngine::new(RelayTimingConfig::default(), pins.clone());
        (engine, pins)
    }

    #[test]
    fn starts_inactive_with_outputs_low() {
        let (engine, pins) = engine();

        for channel in ChannelId::ALL {
            assert!(!engine.is_active(channel));
            assert_eq!(engine.urgency(channel, 0), Urgency::Off);
        }
        assert!(!pins[0].is_high());
        assert_eq!(pins[0].writes(), 1);
    }

    #[test]
    fn activate_drives_output_and_sets_deadline() {
        let (engine, pins) = engine();

        let transition = engine.activate(ChannelId::ONE, 1_000);

        assert_eq!(transition, RelayTransition::Activated);
        assert!(pins[0].is_high());
        assert!(!pins[1].is_high());
        assert_eq!(engine.remaining_ms(ChannelId::ONE, 1_000), 40 * MINUTE);
        assert!(!engine.is_active(ChannelId::TWO));
    }

    #[test]
    fn urgency_tiers_follow_remaining_time() {
        let (engine, _) = engine();
        engine.activate(ChannelId::ONE, 0);

        assert_eq!(engine.urgency(ChannelId::ONE, 36 * MINUTE), Urgency::Normal);
        assert_eq!(engine.urgency(ChannelId::ONE, 37 * MINUTE - 1), Urgency::Normal);
        assert_eq!(engine.urgency(ChannelId::ONE, 37 * MINUTE), Urgency::Warning);
        assert_eq!(
            engine.urgency(ChannelId::ONE, 39 * MINUTE + 29_999),
            Urgency::Warning
        );
        assert_eq!(
            engine.urgency(ChannelId::ONE, 39 * MINUTE + 30_000),
            Urgency::Urgent
        );
    }

    #[test]
    fn tick_expires_exactly_at_deadline() {
        let (engine, pins) = engine();
        engine.activate(ChannelId::TWO, 500);

        assert_eq!(
            engine.tick(ChannelId::TWO, 500 + 40 * MINUTE - 1),
            RelayTransition::Unchanged
        );
        assert!(engine.is_active(ChannelId::TWO));

        assert_eq!(
            engine.tick(ChannelId::TWO, 500 + 40 * MINUTE),
            RelayTransition::Expired
        );
        assert!(!engine.is_active(ChannelId::TWO));
        assert!(!pins[1].is_high());
        assert_eq!(engine.urgency(ChannelId::TWO, 500 + 40 * MINUTE), Urgency::Off);
    }

    #[test]
    fn late_tick_still_expires() {
        let (engine, _) = engine();
        engine.activate(ChannelId::ONE, 0);

        assert_eq!(engine.tick(ChannelId::ONE, 90 * MINUTE), RelayTransition::Expired);
        assert!(!engine.is_active(ChannelId::ONE));
    }

    #[test]
    fn deactivate_twice_matches_once() {
        let (engine, pins) = engine();
        engine.activate(ChannelId::ONE, 0);

        assert_eq!(
            engine.deactivate(ChannelId::ONE, 10),
            RelayTransition::Deactivated
        );
        let after_first = (engine.snapshot(10), pins[0].is_high(), pins[0].writes());

        assert_eq!(engine.deactivate(ChannelId::ONE, 10), RelayTransition::Unchanged);
        let after_second = (engine.snapshot(10), pins[0].is_high(), pins[0].writes());

        assert_eq!(after_first, after_second);
    }

    #[test]
    fn reset_extends_without_touching_output() {
        let (engine, pins) = engine();
        engine.activate(ChannelId::ONE, 0);
        let writes = pins[0].writes();

        assert_eq!(
            engine.reset(ChannelId::ONE, 20 * MINUTE),
            RelayTransition::Rearmed
        );

        assert!(engine.is_active(ChannelId::ONE));
        assert_eq!(pins[0].writes(), writes);
        assert_eq!(
            engine.remaining_ms(ChannelId::ONE, 20 * MINUTE),
            40 * MINUTE
        );
    }

    #[test]
    fn reset_on_idle_channel_activates() {
        let (engine, pins) = engine();

        assert_eq!(engine.reset(ChannelId::TWO, 0), RelayTransition::Activated);
        assert!(pins[1].is_high());
        assert!(engine.is_active(ChannelId::TWO));
    }

    #[test]
    fn short_press_toggles_and_long_press_resets() {
        let (engine, _) = engine();

        assert_eq!(
            engine.handle_switch_event(ChannelId::ONE, SwitchEvent::ShortPress, 0),
            RelayTransition::Activated
        );
        assert_eq!(
            engine.handle_switch_event(ChannelId::ONE, SwitchEvent::ShortPress, 100),
            RelayTransition::Deactivated
        );
        assert_eq!(
            engine.handle_switch_event(ChannelId::ONE, SwitchEvent::LongPress, 200),
            RelayTransition::Activated
        );
        assert_eq!(
            engine.handle_switch_event(ChannelId::ONE, SwitchEvent::LongPress, 10 * MINUTE),
            RelayTransition::Rearmed
        );
        assert_eq!(
            engine.remaining_ms(ChannelId::ONE, 10 * MINUTE),
            40 * MINUTE
        );
    }

    #[test]
    fn snapshot_reports_and_expires() {
        let (engine, pins) = engine();
        engine.activate(ChannelId::ONE, 0);

        let before = engine.snapshot(39 * MINUTE + 30_000);
        assert_eq!(before.relay1, ChannelStatus::active(30));
        assert_eq!(before.relay2, ChannelStatus::inactive());

        let at_deadline = engine.snapshot(40 * MINUTE);
        assert_eq!(at_deadline.relay1, ChannelStatus::inactive());
        assert!(!pins[0].is_high());
    }

    #[test]
    fn classify_uses_inclusive_thresholds() {
        let timing = RelayTimingConfig::default();

        assert_eq!(classify_remaining(0, &timing), Urgency::Urgent);
        assert_eq!(classify_remaining(30_000, &timing), Urgency::Urgent);
        assert_eq!(classify_remaining(30_001, &timing), Urgency::Warning);
        assert_eq!(classify_remaining(180_000, &timing), Urgency::Warning);
        assert_eq!(classify_remaining(180_001, &timing), Urgency::Normal);
    }

    #[test]
    fn concurrent_callers_never_observe_torn_state() {
        let (engine, pins) = engine();
        let engine = Arc::new(engine);

        let writers: Vec<_> = (0..4_u64)
            .map(|worker| {
                let engine = Arc::clone(&engine);
                std::thread::spawn(move || {
                    for step in 0..500_u64 {
                        let now = worker * 1_000 + step;
                        match (worker + step) % 3 {
                            0 => engine.activate(ChannelId::ONE, now),
                            1 => engine.deactivate(ChannelId::ONE, now),
                            _ => engine.reset(ChannelId::ONE, now),
                        };
                    }
                })
            })
            .collect();

        for _ in 0..2_000 {
            let status = engine.channel_status(ChannelId::ONE, 0);
            assert_eq!(status.active, status.remaining_seconds.is_some());
        }

        for writer in writers {
            writer.join().unwrap();
        }

        assert_eq!(engine.is_active(ChannelId::ONE), pins[0].is_high());
        assert!(!engine.is_active(ChannelId::TWO));
    }
}
