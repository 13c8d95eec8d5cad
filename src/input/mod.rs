//! Browser input to USB HID gadget injection

pub mod event;
pub mod hid;
pub mod keymap;

pub use event::{parse_event, ControlEvent, KeyboardEvent, Modifiers, MouseEvent};
pub use hid::{InputInjector, KeyboardState, MouseState};
