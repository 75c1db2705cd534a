use crate::types::Urgency;

/// Status LED cadence, most urgent first.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LedPattern {
    UrgentBlink,
    WarningBlink,
    WifiDisconnectedBlink,
    WifiConnectedBlink,
}

impl LedPattern {
    pub fn half_period_ms(self) -> u64 {
        match self {
            Self::UrgentBlink => 100,
            Self::WarningBlink => 500,
            Self::WifiDisconnectedBlink => 1_000,
            Self::WifiConnectedBlink => 3_000,
        }
    }

    pub fn select(urgencies: &[Urgency], wifi_connected: bool) -> Self {
        match urgencies.iter().copied().max().unwrap_or(Urgency::Off) {
            Urgency::Urgent => Self::UrgentBlink,
            Urgency::Warning => Self::WarningBlink,
            Urgency::Normal | Urgency::Off if wifi_connected => Self::WifiConnectedBlink,
            Urgency::Normal | Urgency::Off => Self::WifiDisconnectedBlink,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct LedOutputState {
    pub level: bool,
    pub last_toggle_ms: u64,
}

impl LedOutputState {
    /// Toggles once the pattern's half-period has elapsed and returns the level to write.
    pub fn drive(&mut self, pattern: LedPattern, now_ms: u64) -> bool {
        if now_ms.saturating_sub(self.last_toggle_ms) >= pattern.half_period_ms() {
            self.level = !self.level;
            self.last_toggle_ms = now_ms;
        }
        self.level
    }
}
