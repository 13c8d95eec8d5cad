//! USB HID gadget injection
//!
//! Report layouts (consumed by the external gadget's descriptors):
//! - Keyboard, 8 bytes: `[modifiers, 0, key0..key5]`, six-key rollover.
//! - Mouse, 6 bytes: `[buttons, x_lo, x_hi, y_lo, y_hi, wheel]`, absolute
//!   coordinates in [0, 32767] little-endian, wheel as a signed byte.
//!
//! Writes go to the gadget character devices. Failures there mean the host
//! is off or the gadget is unbound; they are logged and never propagate to
//! the client connection. Concurrent clients race on the shared report
//! state; last write wins, which is accepted behavior.

use std::fs::{File, OpenOptions};
use std::io::Write;
use std::path::Path;
use std::sync::Mutex;

use tracing::{debug, info, warn};

use super::event::{ControlEvent, KeyAction, KeyboardEvent, Modifiers, MouseAction, MouseEvent};
use super::keymap;

pub const DEFAULT_KEYBOARD_DEV: &str = "/dev/hidg0";
pub const DEFAULT_MOUSE_DEV: &str = "/dev/hidg1";

const MAX_ABS: i32 = 32767;

fn modifier_byte(modifiers: Modifiers) -> u8 {
    let mut byte = 0;
    if modifiers.ctrl {
        byte |= 0x01;
    }
    if modifiers.shift {
        byte |= 0x02;
    }
    if modifiers.alt {
        byte |= 0x04;
    }
    if modifiers.meta {
        byte |= 0x08;
    }
    byte
}

/// Keyboard report state machine.
#[derive(Debug, Default)]
pub struct KeyboardState {
    /// Bits held by modifier keycodes themselves.
    held_modifiers: u8,
    /// Active non-modifier keys, at most six.
    keys: [u8; 6],
}

impl KeyboardState {
    pub fn new() -> Self {
        Self::default()
    }

    /// Apply one event; returns the report to write, or `None` when the code
    /// is unmapped and nothing changed.
    pub fn apply(&mut self, event: &KeyboardEvent) -> Option<[u8; 8]> {
        let down = event.event == KeyAction::Keydown;

        if let Some(bit) = keymap::modifier_bit(&event.code) {
            if down {
                self.held_modifiers |= bit;
            } else {
                self.held_modifiers &= !bit;
            }
        } else if let Some(usage) = keymap::hid_usage(&event.code) {
            if down {
                self.press(usage);
            } else {
                self.release(usage);
            }
        } else {
            debug!(code = %event.code, "unmapped key code");
            return None;
        }

        Some(self.report(event.modifiers))
    }

    fn press(&mut self, usage: u8) {
        if self.keys.contains(&usage) {
            return;
        }
        if let Some(slot) = self.keys.iter_mut().find(|k| **k == 0) {
            *slot = usage;
        }
        // All six slots taken: the extra key is dropped, not queued.
    }

    fn release(&mut self, usage: u8) {
        for key in self.keys.iter_mut() {
            if *key == usage {
                *key = 0;
            }
        }
    }

    fn report(&self, modifiers: Modifiers) -> [u8; 8] {
        let mut report = [0u8; 8];
        report[0] = modifier_byte(modifiers) | self.held_modifiers;
        report[2..8].copy_from_slice(&self.keys);
        report
    }

    /// The all-released report.
    pub fn release_all(&mut self) -> [u8; 8] {
        self.held_modifiers = 0;
        self.keys = [0; 6];
        [0u8; 8]
    }
}

/// Mouse report state machine.
#[derive(Debug, Default)]
pub struct MouseState {
    buttons: u8,
    x: u16,
    y: u16,
}

impl MouseState {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn apply(&mut self, event: &MouseEvent) -> [u8; 6] {
        let mut wheel: i8 = 0;

        match event.event {
            MouseAction::Move => {
                self.x = event.x.clamp(0, MAX_ABS) as u16;
                self.y = event.y.clamp(0, MAX_ABS) as u16;
            }
            MouseAction::Down => {
                self.x = event.x.clamp(0, MAX_ABS) as u16;
                self.y = event.y.clamp(0, MAX_ABS) as u16;
                self.buttons |= button_bit(event.button);
            }
            MouseAction::Up => {
                self.buttons &= !button_bit(event.button);
            }
            MouseAction::Wheel => {
                wheel = event.delta.clamp(-127, 127) as i8;
            }
        }

        [
            self.buttons,
            (self.x & 0xFF) as u8,
            (self.x >> 8) as u8,
            (self.y & 0xFF) as u8,
            (self.y >> 8) as u8,
            wheel as u8,
        ]
    }

    pub fn release_all(&mut self) -> [u8; 6] {
        self.buttons = 0;
        [0, (self.x & 0xFF) as u8, (self.x >> 8) as u8, (self.y & 0xFF) as u8, (self.y >> 8) as u8, 0]
    }
}

fn button_bit(button: u8) -> u8 {
    match button {
        0 => 0x01, // left
        1 => 0x04, // middle
        2 => 0x02, // right
        _ => 0,
    }
}

struct GadgetPort<S> {
    state: S,
    device: Option<File>,
}

/// Routes decoded control events into the HID gadget devices.
pub struct InputInjector {
    keyboard: Mutex<GadgetPort<KeyboardState>>,
    mouse: Mutex<GadgetPort<MouseState>>,
}

impl InputInjector {
    /// Open the gadget devices. A missing device is tolerated (logged once):
    /// the stream keeps working without input injection.
    pub fn open(keyboard_dev: impl AsRef<Path>, mouse_dev: impl AsRef<Path>) -> Self {
        Self {
            keyboard: Mutex::new(GadgetPort {
                state: KeyboardState::new(),
                device: open_gadget(keyboard_dev.as_ref()),
            }),
            mouse: Mutex::new(GadgetPort {
                state: MouseState::new(),
                device: open_gadget(mouse_dev.as_ref()),
            }),
        }
    }

    /// Injector with no backing devices; state machines still run.
    pub fn detached() -> Self {
        Self {
            keyboard: Mutex::new(GadgetPort {
                state: KeyboardState::new(),
                device: None,
            }),
            mouse: Mutex::new(GadgetPort {
                state: MouseState::new(),
                device: None,
            }),
        }
    }

    /// Handle one decoded event, emitting exactly one report when it maps.
    pub fn inject(&self, event: &ControlEvent) {
        match event {
            ControlEvent::Keyboard(k) => {
                let mut port = self.keyboard.lock().unwrap();
                if let Some(report) = port.state.apply(k) {
                    write_report(&mut port.device, &report, "keyboard");
                }
            }
            ControlEvent::Mouse(m) => {
                let mut port = self.mouse.lock().unwrap();
                let report = port.state.apply(m);
                write_report(&mut port.device, &report, "mouse");
            }
        }
    }

    /// Handle one raw text frame; bad frames are logged and dropped.
    pub fn handle_text(&self, text: &str) {
        match super::event::parse_event(text) {
            Ok(event) => self.inject(&event),
            Err(err) => debug!(%err, "ignoring bad control frame"),
        }
    }

    /// Release every key and button. Idempotent; used by the shutdown hook
    /// so the host is not left with stuck input.
    pub fn release_all(&self) {
        let mut keyboard = self.keyboard.lock().unwrap();
        let report = keyboard.state.release_all();
        write_report(&mut keyboard.device, &report, "keyboard");

        let mut mouse = self.mouse.lock().unwrap();
        let report = mouse.state.release_all();
        write_report(&mut mouse.device, &report, "mouse");
    }
}

fn open_gadget(path: &Path) -> Option<File> {
    match OpenOptions::new().write(true).open(path) {
        Ok(file) => {
            info!(device = %path.display(), "hid gadget attached");
            Some(file)
        }
        Err(err) => {
            warn!(device = %path.display(), %err, "hid gadget unavailable, input disabled");
            None
        }
    }
}

fn write_report(device: &mut Option<File>, report: &[u8], kind: &str) {
    if let Some(file) = device {
        // The host being powered down is normal here.
        if let Err(err) = file.write_all(report) {
            debug!(kind, %err, "hid report write failed");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::input::event::parse_event;

    fn keydown(code: &str, modifiers: Modifiers) -> KeyboardEvent {
        KeyboardEvent {
            event: KeyAction::Keydown,
            key: String::new(),
            code: code.to_string(),
            modifiers,
        }
    }

    fn keyup(code: &str) -> KeyboardEvent {
        KeyboardEvent {
            event: KeyAction::Keyup,
            key: String::new(),
            code: code.to_string(),
            modifiers: Modifiers::default(),
        }
    }

    #[test]
    fn test_shift_a_report() {
        let mut state = KeyboardState::new();
        let modifiers = Modifiers {
            shift: true,
            ..Default::default()
        };
        let report = state.apply(&keydown("KeyA", modifiers)).unwrap();
        assert_eq!(report, [0x02, 0, 0x04, 0, 0, 0, 0, 0]);
    }

    #[test]
    fn test_keyup_clears_slot() {
        let mut state = KeyboardState::new();
        state.apply(&keydown("KeyA", Modifiers::default()));
        let report = state.apply(&keyup("KeyA")).unwrap();
        assert_eq!(report, [0; 8]);
    }

    #[test]
    fn test_six_key_rollover() {
        let mut state = KeyboardState::new();
        for code in ["KeyA", "KeyB", "KeyC", "KeyD", "KeyE", "KeyF"] {
            state.apply(&keydown(code, Modifiers::default()));
        }
        // Seventh key is dropped.
        let report = state
            .apply(&keydown("KeyG", Modifiers::default()))
            .unwrap();
        assert_eq!(&report[2..], &[0x04, 0x05, 0x06, 0x07, 0x08, 0x09]);

        // Releasing one frees a slot.
        state.apply(&keyup("KeyA"));
        let report = state
            .apply(&keydown("KeyG", Modifiers::default()))
            .unwrap();
        assert!(report[2..].contains(&0x0A));
    }

    #[test]
    fn test_repeat_keydown_not_duplicated() {
        let mut state = KeyboardState::new();
        state.apply(&keydown("KeyA", Modifiers::default()));
        let report = state.apply(&keydown("KeyA", Modifiers::default())).unwrap();
        assert_eq!(report[2..].iter().filter(|k| **k == 0x04).count(), 1);
    }

    #[test]
    fn test_modifier_keycode_sets_bit_without_slot() {
        let mut state = KeyboardState::new();
        let report = state
            .apply(&keydown("ShiftLeft", Modifiers::default()))
            .unwrap();
        assert_eq!(report[0], 0x02);
        assert_eq!(&report[2..], &[0; 6]);

        let report = state.apply(&keyup("ShiftLeft")).unwrap();
        assert_eq!(report, [0; 8]);
    }

    #[test]
    fn test_unmapped_code_produces_no_report() {
        let mut state = KeyboardState::new();
        assert!(state.apply(&keydown("Fn", Modifiers::default())).is_none());
    }

    #[test]
    fn test_mouse_move_little_endian() {
        let mut state = MouseState::new();
        let report = state.apply(&MouseEvent {
            event: MouseAction::Move,
            x: 0x1234,
            y: 0x0567,
            button: 0,
            delta: 0,
        });
        assert_eq!(report, [0x00, 0x34, 0x12, 0x67, 0x05, 0x00]);
    }

    #[test]
    fn test_mouse_buttons() {
        let mut state = MouseState::new();
        let down = |button| MouseEvent {
            event: MouseAction::Down,
            x: 0,
            y: 0,
            button,
            delta: 0,
        };

        assert_eq!(state.apply(&down(0))[0], 0x01);
        assert_eq!(state.apply(&down(2))[0], 0x03);
        assert_eq!(state.apply(&down(1))[0], 0x07);

        let report = state.apply(&MouseEvent {
            event: MouseAction::Up,
            x: 0,
            y: 0,
            button: 0,
            delta: 0,
        });
        assert_eq!(report[0], 0x06);
    }

    #[test]
    fn test_mouse_coordinates_clamped() {
        let mut state = MouseState::new();
        let report = state.apply(&MouseEvent {
            event: MouseAction::Move,
            x: 1_000_000,
            y: -50,
            button: 0,
            delta: 0,
        });
        assert_eq!(u16::from_le_bytes([report[1], report[2]]), 32767);
        assert_eq!(u16::from_le_bytes([report[3], report[4]]), 0);
    }

    #[test]
    fn test_wheel_clamped_and_transient() {
        let mut state = MouseState::new();
        let wheel = |delta| MouseEvent {
            event: MouseAction::Wheel,
            x: 0,
            y: 0,
            button: 0,
            delta,
        };
        assert_eq!(state.apply(&wheel(-500))[5], (-127i8) as u8);
        assert_eq!(state.apply(&wheel(3))[5], 3);

        // Wheel does not persist into the next report.
        let report = state.apply(&MouseEvent {
            event: MouseAction::Move,
            x: 0,
            y: 0,
            button: 0,
            delta: 0,
        });
        assert_eq!(report[5], 0);
    }

    #[test]
    fn test_detached_injector_accepts_events() {
        let injector = InputInjector::detached();
        let event = parse_event(
            r#"{"type":"keyboard","event":"keydown","code":"KeyA","modifiers":{"shift":true}}"#,
        )
        .unwrap();
        injector.inject(&event);
        injector.handle_text(r#"{"type":"mouse","event":"move","x":5,"y":5}"#);
        injector.handle_text("garbage");
        injector.release_all();
    }
}
