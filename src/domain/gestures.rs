//! Gesture classification
//!
//! Turns the stream of decoded frames into debounced gesture state that
//! block-facing code polls synchronously.

use crate::domain::models::{
    GestureKind, GestureTimer, LightLevel, SensorFrame, SensorProfile, SensorSnapshot, SensorState,
    TiltDirection,
};
use crate::domain::settings::GestureSettings;
use crate::domain::timers::Timers;
use crate::domain::layout::scale_brightness;
use std::time::Duration;
use tracing::trace;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum GestureTimeout {
    /// First half of the window elapsed: gesture no longer observable
    Deactivate(GestureKind),
    /// Full window elapsed: gesture may fire again
    Unlock(GestureKind),
}

pub struct GestureClassifier {
    settings: GestureSettings,
    profile: SensorProfile,
    state: SensorState,
    moving: bool,
    gestures: [GestureTimer; 3],
    timeouts: Timers<GestureTimeout>,
}

fn slot(kind: GestureKind) -> usize {
    match kind {
        GestureKind::Move => 0,
        GestureKind::Shake => 1,
        GestureKind::Jump => 2,
    }
}

impl GestureClassifier {
    pub fn new(settings: GestureSettings, profile: SensorProfile) -> Self {
        Self {
            settings,
            profile,
            state: SensorState::default(),
            moving: false,
            gestures: [GestureTimer::default(); 3],
            timeouts: Timers::new(),
        }
    }

    /// Forget everything learned from a previous connection
    pub fn reset(&mut self) {
        self.state = SensorState::default();
        self.moving = false;
        self.gestures = [GestureTimer::default(); 3];
        self.timeouts.clear();
    }

    /// Fold one frame into the sensor state and advance every gesture
    pub fn ingest(&mut self, frame: &SensorFrame, now: Duration) {
        self.advance(now);
        self.update_state(frame);
        self.classify(now);
    }

    /// Fire every gesture timeout due at or before `now`
    pub fn advance(&mut self, now: Duration) {
        while let Some((_, timeout)) = self.timeouts.pop_due(now) {
            match timeout {
                GestureTimeout::Deactivate(kind) => self.gestures[slot(kind)].active = false,
                GestureTimeout::Unlock(kind) => self.gestures[slot(kind)].locked = false,
            }
        }
    }

    pub fn next_deadline(&self) -> Option<Duration> {
        self.timeouts.next_deadline()
    }

    fn update_state(&mut self, frame: &SensorFrame) {
        let state = &mut self.state;

        if state.frames == 0 {
            state.accel_delta = 0.0;
            state.gyro_delta = 0.0;
        } else {
            state.accel_delta = state.accel_magnitude - frame.accel_magnitude;
            state.gyro_delta = state.gyro_magnitude - frame.gyro_magnitude;
        }
        state.accel_magnitude = frame.accel_magnitude;
        state.gyro_magnitude = frame.gyro_magnitude;

        state.green_flag = frame.green_flag;
        state.brightness = frame.brightness;
        state.tilt_x = frame.tilt_x;
        state.tilt_y = frame.tilt_y;

        if let Some(pressed) = frame.button_pressed {
            state.button_pressed = pressed;
        }
        if frame.spin.is_some() {
            state.spin = frame.spin;
        }
        if frame.speed.is_some() {
            state.speed = frame.speed;
        }

        state.frames += 1;
    }

    fn classify(&mut self, now: Duration) {
        let accel_delta = self.state.accel_delta.abs();
        let motion = if self.profile.gyro_drives_motion {
            accel_delta.max(self.state.gyro_delta.abs())
        } else {
            accel_delta
        };

        if motion > self.settings.motion_threshold {
            self.moving = true;
            self.arm(GestureKind::Move, self.settings.move_window_ms, now);
        } else if motion < self.settings.settle_threshold {
            self.moving = false;
        }

        if accel_delta > self.settings.shake_threshold {
            self.arm(GestureKind::Shake, self.settings.shake_window_ms, now);
        }

        // Free-fall / landing Schmitt trigger
        let accel = self.state.accel_magnitude;
        let jump = &mut self.gestures[slot(GestureKind::Jump)];
        if jump.active && accel > self.settings.jump_exit_threshold {
            jump.active = false;
        } else if accel < self.settings.jump_enter_threshold {
            jump.active = true;
        }
    }

    /// Two-phase debounce: observable for half the window, locked for all of it
    fn arm(&mut self, kind: GestureKind, window_ms: u64, now: Duration) {
        let gesture = &mut self.gestures[slot(kind)];
        if gesture.locked {
            return;
        }
        gesture.active = true;
        gesture.locked = true;
        trace!("Gesture {} armed for {} ms", kind.name(), window_ms);

        let window = Duration::from_millis(window_ms);
        self.timeouts
            .arm(now + window / 2, GestureTimeout::Deactivate(kind));
        self.timeouts.arm(now + window, GestureTimeout::Unlock(kind));
    }

    pub fn is_gesture(&self, kind: GestureKind) -> bool {
        self.gestures[slot(kind)].active
    }

    pub fn gesture_timer(&self, kind: GestureKind) -> GestureTimer {
        self.gestures[slot(kind)]
    }

    pub fn is_moving(&self) -> bool {
        self.moving
    }

    /// Signed tilt towards `direction`.
    ///
    /// front = +tiltY, back = -tiltY, left = -tiltX, right = +tiltX.
    /// `Any` reports the steepest of the four.
    pub fn tilt_angle(&self, direction: TiltDirection) -> i16 {
        let (x, y) = (self.state.tilt_x, self.state.tilt_y);
        match direction {
            TiltDirection::Front => y,
            TiltDirection::Back => -y,
            TiltDirection::Left => -x,
            TiltDirection::Right => x,
            TiltDirection::Any => x.abs().max(y.abs()),
        }
    }

    pub fn is_tilted(&self, direction: TiltDirection) -> bool {
        let threshold = self.settings.tilt_threshold;
        match direction {
            TiltDirection::Any => {
                self.state.tilt_x.abs() >= threshold || self.state.tilt_y.abs() >= threshold
            }
            _ => self.tilt_angle(direction) >= threshold,
        }
    }

    /// Brightness scaled to 0-100 over the variant's raw range
    pub fn brightness(&self) -> u8 {
        scale_brightness(
            self.state.brightness,
            self.profile.brightness_min,
            self.profile.brightness_max,
        )
    }

    pub fn is_light(&self, level: LightLevel) -> bool {
        let threshold = self.settings.dark_threshold;
        match level {
            LightLevel::Dark => self.brightness() < threshold,
            LightLevel::Light => self.brightness() > threshold,
        }
    }

    pub fn button_pressed(&self) -> bool {
        self.state.button_pressed
    }

    pub fn spin(&self) -> Option<i32> {
        self.state.spin
    }

    pub fn speed(&self) -> Option<i32> {
        self.state.speed
    }

    pub fn state(&self) -> &SensorState {
        &self.state
    }

    pub fn snapshot(&self, connected: bool) -> SensorSnapshot {
        SensorSnapshot {
            connected,
            green_flag: self.state.green_flag,
            button_pressed: self.state.button_pressed,
            brightness: self.brightness(),
            tilt_x: self.state.tilt_x,
            tilt_y: self.state.tilt_y,
            accel_magnitude: self.state.accel_magnitude,
            moving: self.moving,
            moved: self.is_gesture(GestureKind::Move),
            shaken: self.is_gesture(GestureKind::Shake),
            jumping: self.is_gesture(GestureKind::Jump),
            spin: self.state.spin,
            speed: self.state.speed,
            frames: self.state.frames,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ms(v: u64) -> Duration {
        Duration::from_millis(v)
    }

    fn classifier() -> GestureClassifier {
        GestureClassifier::new(GestureSettings::default(), SensorProfile::default())
    }

    fn accel(value: f64) -> SensorFrame {
        SensorFrame {
            accel_magnitude: value,
            ..Default::default()
        }
    }

    #[test]
    fn test_first_frame_has_no_delta() {
        let mut c = classifier();
        c.ingest(&accel(1.0), ms(0));

        assert_eq!(c.state().accel_delta, 0.0);
        assert!(!c.is_moving());
        assert!(!c.is_gesture(GestureKind::Move));
    }

    #[test]
    fn test_move_two_phase_window() {
        let mut c = classifier();
        c.ingest(&accel(1.0), ms(0));
        c.ingest(&accel(1.3), ms(10));

        assert!(c.is_moving());
        assert!(c.is_gesture(GestureKind::Move));

        c.advance(ms(134));
        assert!(c.is_gesture(GestureKind::Move));
        c.advance(ms(135));
        assert!(!c.is_gesture(GestureKind::Move));
        assert!(c.gesture_timer(GestureKind::Move).locked);

        // Re-trigger mid-window is swallowed
        c.ingest(&accel(1.0), ms(200));
        assert!(!c.is_gesture(GestureKind::Move));

        c.advance(ms(260));
        assert!(!c.gesture_timer(GestureKind::Move).locked);
        c.ingest(&accel(1.3), ms(270));
        assert!(c.is_gesture(GestureKind::Move));
    }

    #[test]
    fn test_moving_hysteresis() {
        let mut c = classifier();
        c.ingest(&accel(1.0), ms(0));

        // Deltas of 0.05 sit inside the band: no change from "still"
        for (i, v) in [1.05, 1.0, 1.05, 1.0].iter().enumerate() {
            c.ingest(&accel(*v), ms(10 + i as u64 * 10));
            assert!(!c.is_moving());
        }

        c.ingest(&accel(1.3), ms(100));
        assert!(c.is_moving());

        // Same in-band oscillation now keeps it moving
        for (i, v) in [1.25, 1.3, 1.25].iter().enumerate() {
            c.ingest(&accel(*v), ms(110 + i as u64 * 10));
            assert!(c.is_moving());
        }

        c.ingest(&accel(1.251), ms(200));
        assert!(!c.is_moving());
    }

    #[test]
    fn test_gyro_drives_motion_on_gen2_profile() {
        let profile = SensorProfile {
            gyro_drives_motion: true,
            ..Default::default()
        };
        let mut c = GestureClassifier::new(GestureSettings::default(), profile);
        let still = SensorFrame {
            accel_magnitude: 1.0,
            gyro_magnitude: 0.0,
            ..Default::default()
        };
        let spun = SensorFrame {
            gyro_magnitude: 0.5,
            ..still.clone()
        };

        c.ingest(&still, ms(0));
        c.ingest(&spun, ms(10));
        assert!(c.is_moving());

        let mut gen1 = classifier();
        gen1.ingest(&still, ms(0));
        gen1.ingest(&spun, ms(10));
        assert!(!gen1.is_moving());
    }

    #[test]
    fn test_single_shake_arming_over_spike() {
        let mut c = classifier();
        c.ingest(&accel(1.0), ms(0));
        c.ingest(&accel(1.9), ms(20));
        assert!(c.is_gesture(GestureKind::Shake));
        c.ingest(&accel(1.0), ms(40));
        assert!(c.is_gesture(GestureKind::Shake));

        c.advance(ms(170));
        assert!(!c.is_gesture(GestureKind::Shake));

        // Armed once at 20 ms, so the lock lifts at 320 ms rather than 340 ms
        c.advance(ms(320));
        assert!(!c.gesture_timer(GestureKind::Shake).locked);

        assert!(!c.is_gesture(GestureKind::Jump));
    }

    #[test]
    fn test_jump_schmitt_trigger() {
        let mut c = classifier();
        c.ingest(&accel(1.0), ms(0));
        assert!(!c.is_gesture(GestureKind::Jump));

        c.ingest(&accel(0.1), ms(10));
        assert!(c.is_gesture(GestureKind::Jump));

        // Between thresholds: stays active
        c.ingest(&accel(0.4), ms(20));
        assert!(c.is_gesture(GestureKind::Jump));

        c.ingest(&accel(0.9), ms(30));
        assert!(!c.is_gesture(GestureKind::Jump));

        c.ingest(&accel(0.3), ms(40));
        assert!(!c.is_gesture(GestureKind::Jump));
    }

    #[test]
    fn test_tilt_queries() {
        let mut c = classifier();
        c.ingest(
            &SensorFrame {
                tilt_x: -20,
                tilt_y: 5,
                accel_magnitude: 1.0,
                ..Default::default()
            },
            ms(0),
        );

        assert_eq!(c.tilt_angle(TiltDirection::Front), 5);
        assert_eq!(c.tilt_angle(TiltDirection::Back), -5);
        assert_eq!(c.tilt_angle(TiltDirection::Left), 20);
        assert_eq!(c.tilt_angle(TiltDirection::Right), -20);
        assert_eq!(c.tilt_angle(TiltDirection::Any), 20);

        assert!(c.is_tilted(TiltDirection::Left));
        assert!(!c.is_tilted(TiltDirection::Right));
        assert!(!c.is_tilted(TiltDirection::Front));
        assert!(c.is_tilted(TiltDirection::Any));
    }

    #[test]
    fn test_brightness_and_light_level() {
        let profile = SensorProfile {
            brightness_min: 80,
            brightness_max: 600,
            gyro_drives_motion: true,
        };
        let mut c = GestureClassifier::new(GestureSettings::default(), profile);

        c.ingest(&SensorFrame { brightness: 50, ..Default::default() }, ms(0));
        assert_eq!(c.brightness(), 0);
        assert!(c.is_light(LightLevel::Dark));
        assert!(!c.is_light(LightLevel::Light));

        c.ingest(&SensorFrame { brightness: 1000, ..Default::default() }, ms(10));
        assert_eq!(c.brightness(), 100);
        assert!(c.is_light(LightLevel::Light));
    }

    #[test]
    fn test_reset_clears_state_and_pending_timeouts() {
        let mut c = classifier();
        c.ingest(&accel(1.0), ms(0));
        c.ingest(&accel(1.9), ms(10));
        assert!(c.is_gesture(GestureKind::Shake));

        c.reset();
        assert_eq!(c.state(), &SensorState::default());
        assert!(!c.is_moving());
        assert_eq!(c.gesture_timer(GestureKind::Shake), GestureTimer::default());
        assert_eq!(c.next_deadline(), None);

        // First frame after a reset has no delta again
        c.ingest(&accel(1.9), ms(20));
        assert_eq!(c.state().accel_delta, 0.0);
        assert!(!c.is_gesture(GestureKind::Shake));
    }

    #[test]
    fn test_unreported_fields_keep_previous_value() {
        let mut c = classifier();
        c.ingest(
            &SensorFrame {
                button_pressed: Some(true),
                spin: Some(4),
                speed: Some(12),
                ..Default::default()
            },
            ms(0),
        );
        c.ingest(&SensorFrame::default(), ms(10));

        assert!(c.button_pressed());
        assert_eq!(c.spin(), Some(4));
        assert_eq!(c.speed(), Some(12));
    }
}
