//! Simulated GPIO for the host build. Relay and LED writes are logged, switch levels are
//! set through the `/api/sim/switch` endpoint.

use std::{
    convert::Infallible,
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc,
    },
};

use embedded_hal::digital::{ErrorType, InputPin, OutputPin};
use tracing::{info, trace};

use timer_relay_common::ChannelId;

#[derive(Debug, Clone)]
pub struct SimRelayPin {
    channel: ChannelId,
    energized: Arc<AtomicBool>,
}

impl SimRelayPin {
    pub fn new(channel: ChannelId) -> Self {
        Self {
            channel,
            energized: Arc::new(AtomicBool::new(false)),
        }
    }

    fn set(&self, energized: bool) {
        let previous = self.energized.swap(energized, Ordering::Relaxed);
        if previous != energized {
            info!(
                "{} output {}",
                self.channel,
                if energized { "HIGH" } else { "LOW" }
            );
        }
    }
}

impl ErrorType for SimRelayPin {
    type Error = Infallible;
}

impl OutputPin for SimRelayPin {
    fn set_low(&mut self) -> Result<(), Self::Error> {
        self.set(false);
        Ok(())
    }

    fn set_high(&mut self) -> Result<(), Self::Error> {
        self.set(true);
        Ok(())
    }
}

/// Both simulated switches; `true` means held down.
#[derive(Debug, Clone, Default)]
pub struct SimSwitchBank {
    pressed: [Arc<AtomicBool>; 2],
}

impl SimSwitchBank {
    pub fn set_pressed(&self, channel: ChannelId, pressed: bool) {
        self.pressed[channel.index()].store(pressed, Ordering::Relaxed);
    }

    pub fn pins(&self) -> [SimSwitchPin; 2] {
        ChannelId::ALL.map(|channel| SimSwitchPin {
            pressed: Arc::clone(&self.pressed[channel.index()]),
        })
    }
}

/// Active-low like the real wiring: reads high while released.
#[derive(Debug, Clone)]
pub struct SimSwitchPin {
    pressed: Arc<AtomicBool>,
}

impl ErrorType for SimSwitchPin {
    type Error = Infallible;
}

impl InputPin for SimSwitchPin {
    fn is_high(&mut self) -> Result<bool, Self::Error> {
        Ok(!self.pressed.load(Ordering::Relaxed))
    }

    fn is_low(&mut self) -> Result<bool, Self::Error> {
        Ok(self.pressed.load(Ordering::Relaxed))
    }
}

#[derive(Debug, Default)]
pub struct SimLedPin;

impl ErrorType for SimLedPin {
    type Error = Infallible;
}

impl OutputPin for SimLedPin {
    fn set_low(&mut self) -> Result<(), Self::Error> {
        trace!("status LED off");
        Ok(())
    }

    fn set_high(&mut self) -> Result<(), Self::Error> {
        trace!("status LED on");
        Ok(())
    }
}
