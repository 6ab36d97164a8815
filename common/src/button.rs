use log::{info, warn};

use crate::{
    clock::{Clock, Delay},
    config::ButtonConfig,
    device::DeviceState,
    io::{ButtonInput, Indicators, Light},
    storage::{Flash, PersistentStore, StoreError},
};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Gesture {
    /// Released before the wake threshold.
    Tap,
    /// Released after the wake threshold; sleep stays disabled for this boot.
    HoldAwake,
    /// Held past the reset threshold. Not cancelable.
    FactoryReset,
}

/// Blink period while the button is held. Stays slow for most of the hold and
/// speeds up sharply just before the reset threshold.
pub fn flash_interval_ms(elapsed_ms: u64, cfg: &ButtonConfig) -> u64 {
    let threshold = cfg.reset_threshold_ms.max(1) as f32;
    let progress = (elapsed_ms as f32 / threshold).clamp(0.0, 1.0);
    let factor = 1.0 - progress.powf(cfg.flash_exponent);
    let span = cfg
        .max_flash_interval_ms
        .saturating_sub(cfg.min_flash_interval_ms) as f32;
    cfg.min_flash_interval_ms + (factor * span) as u64
}

/// Samples the button until release or until the reset threshold.
///
/// Elapsed time is the larger of the clock reading and the sample count times
/// the sample period, so a stalled clock still reaches a decision.
pub fn watch_button(
    button: &mut dyn ButtonInput,
    clock: &dyn Clock,
    delay: &mut dyn Delay,
    lights: &mut dyn Indicators,
    state: &mut DeviceState,
    cfg: &ButtonConfig,
) -> Gesture {
    let period = cfg.sample_period_ms.max(1);
    let max_samples = cfg.reset_threshold_ms.div_ceil(period) + 1;
    let start = clock.now_ms();
    let mut last_flash = start;
    let mut fault_lit = false;

    for sample in 0..max_samples {
        if !button.is_pressed() {
            lights.set(Light::Fault, false);
            lights.set(Light::Awake, false);
            return if state.is_awake_held() {
                Gesture::HoldAwake
            } else {
                Gesture::Tap
            };
        }

        let now = clock.now_ms();
        let elapsed = now.saturating_sub(start).max(sample * period);

        if elapsed >= cfg.wake_threshold_ms && !state.is_awake_held() {
            info!("button held {elapsed}ms; sleep disabled for this boot");
            lights.set(Light::Awake, true);
            state.hold_awake();
        }

        if elapsed >= cfg.reset_threshold_ms {
            warn!("button held {elapsed}ms; factory reset");
            return Gesture::FactoryReset;
        }

        // Below the wake threshold a press has no visible effect.
        if elapsed >= cfg.wake_threshold_ms
            && now.saturating_sub(last_flash) >= flash_interval_ms(elapsed, cfg)
        {
            fault_lit = !fault_lit;
            lights.set(Light::Fault, fault_lit);
            last_flash = now;
        }

        delay.delay_ms(period);
    }

    warn!("button sampling exhausted; treating as factory reset");
    Gesture::FactoryReset
}

/// Clears the store and shows the fault light. The caller restarts afterwards.
pub fn perform_factory_reset<F: Flash>(
    store: &mut PersistentStore<F>,
    lights: &mut dyn Indicators,
    delay: &mut dyn Delay,
    cfg: &ButtonConfig,
) -> Result<(), StoreError> {
    warn!("hard reset requested; erasing configuration");
    store.clear_all()?;
    lights.set(Light::Fault, true);
    delay.delay_ms(cfg.fault_hold_ms);
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        clock::ManualClock,
        config::IdentityConfig,
        sim::{RecordingLights, ScriptedButton},
        storage::MemoryFlash,
    };

    fn boot_state() -> (PersistentStore<MemoryFlash>, DeviceState) {
        let mut store = PersistentStore::new(MemoryFlash::default()).unwrap();
        let state =
            DeviceState::boot(&mut store, "AA", &IdentityConfig::default(), || 42).unwrap();
        (store, state)
    }

    #[test]
    fn flash_interval_endpoints() {
        let cfg = ButtonConfig::default();
        assert_eq!(flash_interval_ms(0, &cfg), 500);
        assert_eq!(flash_interval_ms(10_000, &cfg), 25);
        assert_eq!(flash_interval_ms(60_000, &cfg), 25);
    }

    #[test]
    fn flash_interval_never_increases() {
        let cfg = ButtonConfig::default();
        let mut previous = flash_interval_ms(0, &cfg);
        for elapsed in (0..=12_000).step_by(5) {
            let interval = flash_interval_ms(elapsed, &cfg);
            assert!(interval <= previous, "{elapsed}ms: {interval} > {previous}");
            previous = interval;
        }
    }

    #[test]
    fn flash_interval_stays_slow_for_most_of_hold() {
        let cfg = ButtonConfig::default();
        assert!(flash_interval_ms(5_000, &cfg) > 400);
        assert!(flash_interval_ms(9_500, &cfg) < 100);
    }

    #[test]
    fn short_press_has_no_effect() {
        let (_store, mut state) = boot_state();
        let clock = ManualClock::new(0);
        let mut delay = &clock;
        let mut button = ScriptedButton::held_for_samples(50);
        let mut lights = RecordingLights::default();

        let gesture = watch_button(
            &mut button,
            &clock,
            &mut delay,
            &mut lights,
            &mut state,
            &ButtonConfig::default(),
        );

        assert_eq!(gesture, Gesture::Tap);
        assert!(!state.should_stay_awake());
        assert!(!lights.ever_lit(Light::Awake));
    }

    #[test]
    fn press_just_under_wake_threshold_keeps_fault_light_dark() {
        let (_store, mut state) = boot_state();
        let clock = ManualClock::new(0);
        let mut delay = &clock;
        let mut button = ScriptedButton::held_for_samples(90);
        let mut lights = RecordingLights::default();

        let gesture = watch_button(
            &mut button,
            &clock,
            &mut delay,
            &mut lights,
            &mut state,
            &ButtonConfig::default(),
        );

        assert_eq!(gesture, Gesture::Tap);
        assert_eq!(clock.now_ms(), 900);
        assert!(!lights.ever_lit(Light::Fault));
        assert!(!lights.ever_lit(Light::Awake));
    }

    #[test]
    fn medium_press_holds_awake() {
        let (_store, mut state) = boot_state();
        let clock = ManualClock::new(0);
        let mut delay = &clock;
        let mut button = ScriptedButton::held_for_samples(300);
        let mut lights = RecordingLights::default();

        let gesture = watch_button(
            &mut button,
            &clock,
            &mut delay,
            &mut lights,
            &mut state,
            &ButtonConfig::default(),
        );

        assert_eq!(gesture, Gesture::HoldAwake);
        assert!(state.should_stay_awake());
        assert!(lights.ever_lit(Light::Awake));
        assert!(lights.ever_lit(Light::Fault));
        assert!(!lights.is_on(Light::Awake));
    }

    #[test]
    fn long_press_resets_and_keeps_identity() {
        let (mut store, mut state) = boot_state();
        store.save_wifi_credentials("garden", "hunter22").unwrap();
        let id = store.device_id();
        let clock = ManualClock::new(0);
        let mut delay = &clock;
        let mut button = ScriptedButton::held_forever();
        let mut lights = RecordingLights::default();
        let cfg = ButtonConfig::default();

        let gesture = watch_button(
            &mut button,
            &clock,
            &mut delay,
            &mut lights,
            &mut state,
            &cfg,
        );
        assert_eq!(gesture, Gesture::FactoryReset);
        assert_eq!(clock.now_ms(), 10_000);

        perform_factory_reset(&mut store, &mut lights, &mut delay, &cfg).unwrap();
        assert!(!store.has_wifi_credentials());
        assert_eq!(store.device_id(), id);
        assert!(lights.is_on(Light::Fault));
    }

    #[test]
    fn stalled_clock_still_reaches_reset() {
        let (_store, mut state) = boot_state();
        let clock = ManualClock::new(0);
        let mut stalled = crate::sim::NoDelay;
        let mut button = ScriptedButton::held_forever();
        let mut lights = RecordingLights::default();

        let gesture = watch_button(
            &mut button,
            &clock,
            &mut stalled,
            &mut lights,
            &mut state,
            &ButtonConfig::default(),
        );

        assert_eq!(gesture, Gesture::FactoryReset);
        assert_eq!(button.samples_taken(), 1_001);
    }
}
