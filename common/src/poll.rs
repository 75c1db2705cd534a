use embedded_hal::digital::{InputPin, OutputPin};
use log::{debug, warn};

use crate::{
    config::RelayTimingConfig,
    led::{LedOutputState, LedPattern},
    relay::{RelayEngine, RelayTransition},
    switch::{SwitchEvent, SwitchTracker, RELEASED_LEVEL},
    types::{ChannelId, CHANNEL_COUNT},
};

/// Everything one poll step observed, for the caller to log or publish.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PollReport {
    pub switch_events: [Option<SwitchEvent>; CHANNEL_COUNT],
    pub transitions: [RelayTransition; CHANNEL_COUNT],
    pub pattern: LedPattern,
    pub led_level: bool,
}

impl PollReport {
    pub fn relay_changed(&self) -> bool {
        self.transitions.iter().any(|transition| transition.is_change())
    }
}

struct SwitchInput<S> {
    pin: S,
    tracker: SwitchTracker,
}

/// Cooperative poll step: switches in, relay expiry, LED out. Never sleeps.
pub struct PollStep<S, L> {
    switches: [SwitchInput<S>; CHANNEL_COUNT],
    led_pin: L,
    led: LedOutputState,
    written_level: Option<bool>,
}

impl<S: InputPin, L: OutputPin> PollStep<S, L> {
    pub fn new(timing: &RelayTimingConfig, switch_pins: [S; CHANNEL_COUNT], led_pin: L) -> Self {
        Self {
            switches: switch_pins.map(|pin| SwitchInput {
                pin,
                tracker: SwitchTracker::from_timing(timing),
            }),
            led_pin,
            led: LedOutputState::default(),
            written_level: None,
        }
    }

    pub fn poll<P: OutputPin>(
        &mut self,
        engine: &RelayEngine<P>,
        wifi_connected: bool,
        now_ms: u64,
    ) -> PollReport {
        let mut switch_events = [None; CHANNEL_COUNT];
        let mut transitions = [RelayTransition::Unchanged; CHANNEL_COUNT];

        for channel in ChannelId::ALL {
            let input = &mut self.switches[channel.index()];
            let raw_level = match input.pin.is_high() {
                Ok(level) => level,
                Err(err) => {
                    warn!("failed to read {channel} switch: {err:?}");
                    RELEASED_LEVEL
                }
            };

            if let Some(event) = input.tracker.sample(raw_level, now_ms) {
                debug!("{channel} switch {event:?}");
                switch_events[channel.index()] = Some(event);
                transitions[channel.index()] = engine.handle_switch_event(channel, event, now_ms);
            }

            let expiry = engine.tick(channel, now_ms);
            if expiry.is_change() {
                transitions[channel.index()] = expiry;
            }
        }

        let pattern = LedPattern::select(&engine.urgencies(now_ms), wifi_connected);
        let led_level = self.led.drive(pattern, now_ms);
        self.write_led(led_level);

        PollReport {
            switch_events,
            transitions,
            pattern,
            led_level,
        }
    }

    fn write_led(&mut self, level: bool) {
        if self.written_level == Some(level) {
            return;
        }

        let result = if level {
            self.led_pin.set_high()
        } else {
            self.led_pin.set_low()
        };

        match result {
            Ok(()) => self.written_level = Some(level),
            Err(err) => warn!("failed to drive status LED: {err:?}"),
        }
    }
}
