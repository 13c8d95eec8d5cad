//! Browser control-frame schema
//!
//! One JSON object per WebSocket text message. Decoding is tolerant:
//! unknown fields are ignored for forward compatibility, while unknown
//! `type`/`event` strings are rejected (the caller logs and drops them).

use serde::Deserialize;

use crate::error::ProtocolError;

/// Modifier key state sent with every keyboard event.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq, Deserialize)]
pub struct Modifiers {
    #[serde(default)]
    pub ctrl: bool,
    #[serde(default)]
    pub alt: bool,
    #[serde(default)]
    pub shift: bool,
    #[serde(default)]
    pub meta: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum KeyAction {
    Keydown,
    Keyup,
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct KeyboardEvent {
    pub event: KeyAction,
    /// DOM `key` value; informational only.
    #[serde(default)]
    pub key: String,
    /// DOM `code` value; drives the HID usage lookup.
    pub code: String,
    #[serde(default)]
    pub modifiers: Modifiers,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MouseAction {
    Move,
    Down,
    Up,
    Wheel,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
pub struct MouseEvent {
    pub event: MouseAction,
    /// Absolute position in [0, 32767]; out-of-range values are clamped.
    #[serde(default)]
    pub x: i32,
    #[serde(default)]
    pub y: i32,
    /// 0 = left, 1 = middle, 2 = right
    #[serde(default)]
    pub button: u8,
    /// Wheel travel; clamped to a signed byte in the report.
    #[serde(default)]
    pub delta: i32,
}

/// One decoded control frame.
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum ControlEvent {
    Keyboard(KeyboardEvent),
    Mouse(MouseEvent),
}

/// Decode one text frame.
pub fn parse_event(text: &str) -> Result<ControlEvent, ProtocolError> {
    Ok(serde_json::from_str(text)?)
}
