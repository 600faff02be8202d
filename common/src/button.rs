use crate::config::ButtonConfig;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ButtonIntent {
    Tap,
    DoubleTap,
    LongPress,
}

impl ButtonIntent {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Tap => "TAP",
            Self::DoubleTap => "DOUBLE_TAP",
            Self::LongPress => "LONG_PRESS",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ButtonEdge {
    Released,
    LongPress,
}

#[derive(Debug, Clone)]
pub struct ButtonDebouncer {
    double_tap_ms: u64,
    tap_count: u32,
    // The single retriggerable inter-tap timer.
    deadline_ms: Option<u64>,
}

impl ButtonDebouncer {
    pub fn new(double_tap_ms: u64) -> Self {
        Self {
            double_tap_ms,
            tap_count: 0,
            deadline_ms: None,
        }
    }

    pub fn from_config(config: &ButtonConfig) -> Self {
        Self::new(config.double_tap_ms)
    }

    pub fn tap_count(&self) -> u32 {
        self.tap_count
    }

    pub fn is_awaiting_second_tap(&self) -> bool {
        self.deadline_ms.is_some()
    }

    pub fn deadline_ms(&self) -> Option<u64> {
        self.deadline_ms
    }

    pub fn handle_edge(&mut self, edge: ButtonEdge, now_ms: u64) -> Vec<ButtonIntent> {
        match edge {
            ButtonEdge::Released => self.tap(now_ms),
            ButtonEdge::LongPress => vec![self.long_press()],
        }
    }

    pub fn tap(&mut self, now_ms: u64) -> Vec<ButtonIntent> {
        // A deadline that passed without a tick still resolves as a single tap first.
        let mut intents = self.tick(now_ms);

        if self.deadline_ms.is_some() {
            self.reset();
            intents.push(ButtonIntent::DoubleTap);
        } else {
            self.tap_count = 1;
            self.deadline_ms = Some(now_ms.saturating_add(self.double_tap_ms));
        }

        intents
    }

    pub fn tick(&mut self, now_ms: u64) -> Vec<ButtonIntent> {
        match self.deadline_ms {
            Some(deadline) if now_ms >= deadline => {
                self.reset();
                vec![ButtonIntent::Tap]
            }
            _ => Vec::new(),
        }
    }

    pub fn long_press(&self) -> ButtonIntent {
        ButtonIntent::LongPress
    }

    fn reset(&mut self) {
        self.tap_count = 0;
        self.deadline_ms = None;
    }
}

impl Default for ButtonDebouncer {
    fn default() -> Self {
        Self::from_config(&ButtonConfig::default())
    }
}

#[derive(Debug, Clone)]
pub struct PressTracker {
    debounce_ms: u64,
    long_press_ms: u64,

    raw: bool,
    raw_since_ms: u64,
    stable: bool,
    pressed_since_ms: Option<u64>,
    long_fired: bool,
}

impl PressTracker {
    pub fn new(config: &ButtonConfig) -> Self {
        Self {
            debounce_ms: config.debounce_ms,
            long_press_ms: config.long_press_ms,
            raw: false,
            raw_since_ms: 0,
            stable: false,
            pressed_since_ms: None,
            long_fired: false,
        }
    }

    pub fn is_pressed(&self) -> bool {
        self.stable
    }

    pub fn sample(&mut self, pressed: bool, now_ms: u64) -> Option<ButtonEdge> {
        if pressed != self.raw {
            self.raw = pressed;
            self.raw_since_ms = now_ms;
        }

        if self.raw != self.stable
            && now_ms.saturating_sub(self.raw_since_ms) >= self.debounce_ms
        {
            self.stable = self.raw;
            if self.stable {
                self.pressed_since_ms = Some(self.raw_since_ms);
                self.long_fired = false;
                return None;
            }

            let was_long = self.long_fired;
            self.pressed_since_ms = None;
            self.long_fired = false;
            // The release that ends a long press is not a tap.
            return (!was_long).then_some(ButtonEdge::Released);
        }

        if self.stable && !self.long_fired {
            if let Some(since) = self.pressed_since_ms {
                if now_ms.saturating_sub(since) >= self.long_press_ms {
                    self.long_fired = true;
                    return Some(ButtonEdge::LongPress);
                }
            }
        }

        None
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn drain(debouncer: &mut ButtonDebouncer, from_ms: u64, to_ms: u64) -> Vec<ButtonIntent> {
        let mut intents = Vec::new();
        let mut now = from_ms;
        while now <= to_ms {
            intents.extend(debouncer.tick(now));
            now += 10;
        }
        intents
    }

    #[test]
    fn single_tap_resolves_after_window() {
        let mut debouncer = ButtonDebouncer::default();
        assert!(debouncer.tap(1_000).is_empty());
        assert_eq!(debouncer.tap_count(), 1);
        assert_eq!(debouncer.deadline_ms(), Some(1_500));

        assert!(debouncer.tick(1_499).is_empty());
        assert_eq!(drain(&mut debouncer, 1_500, 5_000), vec![ButtonIntent::Tap]);
        assert_eq!(debouncer.tap_count(), 0);
        assert!(!debouncer.is_awaiting_second_tap());
    }

    #[test]
    fn two_taps_inside_window_are_one_double_tap() {
        let mut debouncer = ButtonDebouncer::default();
        assert!(debouncer.tap(1_000).is_empty());
        assert_eq!(debouncer.tap(1_350), vec![ButtonIntent::DoubleTap]);

        assert_eq!(debouncer.deadline_ms(), None);
        assert!(drain(&mut debouncer, 1_350, 5_000).is_empty());
    }

    #[test]
    fn third_tap_starts_a_new_session() {
        let mut debouncer = ButtonDebouncer::default();
        debouncer.tap(0);
        assert_eq!(debouncer.tap(100), vec![ButtonIntent::DoubleTap]);
        assert!(debouncer.tap(200).is_empty());
        assert_eq!(drain(&mut debouncer, 200, 1_000), vec![ButtonIntent::Tap]);
    }

    #[test]
    fn late_tap_resolves_pending_tap_before_rearming() {
        let mut debouncer = ButtonDebouncer::default();
        debouncer.tap(0);
        // No tick ran between the two taps.
        assert_eq!(debouncer.tap(600), vec![ButtonIntent::Tap]);
        assert_eq!(debouncer.deadline_ms(), Some(1_100));
    }

    #[test]
    fn long_press_is_independent_of_taps() {
        let mut debouncer = ButtonDebouncer::default();
        debouncer.tap(0);
        assert_eq!(
            debouncer.handle_edge(ButtonEdge::LongPress, 100),
            vec![ButtonIntent::LongPress]
        );
        assert!(debouncer.is_awaiting_second_tap());
        assert_eq!(drain(&mut debouncer, 100, 1_000), vec![ButtonIntent::Tap]);
    }

    fn feed(tracker: &mut PressTracker, samples: &[(bool, u64)]) -> Vec<ButtonEdge> {
        samples
            .iter()
            .filter_map(|&(pressed, now)| tracker.sample(pressed, now))
            .collect()
    }

    #[test]
    fn short_press_yields_release_edge() {
        let mut tracker = PressTracker::new(&ButtonConfig::default());
        let edges = feed(
            &mut tracker,
            &[(true, 0), (true, 40), (true, 200), (false, 210), (false, 250)],
        );
        assert_eq!(edges, vec![ButtonEdge::Released]);
    }

    #[test]
    fn contact_bounce_is_ignored() {
        let mut tracker = PressTracker::new(&ButtonConfig::default());
        let edges = feed(
            &mut tracker,
            &[(true, 0), (false, 5), (true, 10), (false, 15), (false, 100)],
        );
        assert!(edges.is_empty());
        assert!(!tracker.is_pressed());
    }

    #[test]
    fn long_hold_fires_once_and_swallows_release() {
        let mut tracker = PressTracker::new(&ButtonConfig::default());
        let mut samples = vec![(true, 0)];
        samples.extend((1..=400).map(|step| (true, step * 10)));
        samples.push((false, 4_010));
        samples.push((false, 4_050));

        let edges = feed(&mut tracker, &samples);
        assert_eq!(edges, vec![ButtonEdge::LongPress]);
    }
}
