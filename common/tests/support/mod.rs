use std::{
    convert::Infallible,
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc,
    },
};

use embedded_hal::digital::{ErrorType, OutputPin};
use timer_relay_common::{RelayEngine, RelayTimingConfig};

#[derive(Clone, Default)]
pub struct FakeRelay(Arc<AtomicBool>);

impl FakeRelay {
    pub fn is_energized(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }
}

impl ErrorType for FakeRelay {
    type Error = Infallible;
}

impl OutputPin for FakeRelay {
    fn set_low(&mut self) -> Result<(), Self::Error> {
        self.0.store(false, Ordering::SeqCst);
        Ok(())
    }

    fn set_high(&mut self) -> Result<(), Self::Error> {
        self.0.store(true, Ordering::SeqCst);
        Ok(())
    }
}

pub fn engine() -> (RelayEngine<FakeRelay>, [FakeRelay; 2]) {
    let pins = [FakeRelay::default(), FakeRelay::default()];
    (
        RelayEngine::new(RelayTimingConfig::default(), pins.clone()),
        pins,
    )
}
