use std::time::Duration;

use log::debug;

use crate::ports::Indicator;

/// What the status light should convey.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IndicatorState {
    Discovering,
    Waiting,
    Active,
}

impl IndicatorState {
    pub fn rgb(self) -> (u8, u8, u8) {
        match self {
            IndicatorState::Discovering => (255, 0, 0),
            IndicatorState::Waiting => (255, 128, 0),
            IndicatorState::Active => (0, 255, 0),
        }
    }

    pub fn colour_name(self) -> &'static str {
        match self {
            IndicatorState::Discovering => "red",
            IndicatorState::Waiting => "orange",
            IndicatorState::Active => "green",
        }
    }
}

/// Host stand-in for a status LED: logs each blink and holds for the blink
/// duration like the hardware would.
#[derive(Debug)]
pub struct LogIndicator {
    blink: Duration,
}

impl LogIndicator {
    pub fn new(blink: Duration) -> Self {
        LogIndicator { blink }
    }
}

impl Indicator for LogIndicator {
    async fn show(&mut self, state: IndicatorState) {
        let (r, g, b) = state.rgb();
        debug!(
            "Blinking {} ({r}, {g}, {b}) for {:?}",
            state.colour_name(),
            self.blink
        );
        tokio::time::sleep(self.blink).await;
    }
}
