//! Synthetic mouse input from viewer pointer messages.
//!
//! Normalized (u, v) coordinates are mapped to absolute pixels on the
//! primary display, the OS cursor is warped there, and button edges
//! (`down` / `up`) become press / release events. The `pressed` field
//! only conveys steady state for move-while-held; it never synthesizes
//! an event by itself.
//!
//! # Platform
//!
//! Windows-only (`SendInput` / `SetCursorPos`). Elsewhere the injector
//! exists but every call returns an error.

use crate::control::ControlMessage;
use crate::error::MiraError;

// ── Button ───────────────────────────────────────────────────────

/// Wire button codes: 0 = primary (left), 1 = secondary (right).
/// Anything else is ignored without error.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Button {
    Left,
    Right,
}

impl Button {
    pub fn from_wire(code: u8) -> Option<Self> {
        match code {
            0 => Some(Button::Left),
            1 => Some(Button::Right),
            _ => None,
        }
    }
}

/// Map normalized coordinates to pixels on a `width`×`height` screen.
pub fn to_pixels(u: f32, v: f32, width: i32, height: i32) -> (i32, i32) {
    let x = (u.clamp(0.0, 1.0) * width as f32) as i32;
    let y = (v.clamp(0.0, 1.0) * height as f32) as i32;
    (x.min(width - 1).max(0), y.min(height - 1).max(0))
}

// ── PointerInjector ──────────────────────────────────────────────

/// Injects pointer events into the OS input stream.
pub struct PointerInjector;

impl PointerInjector {
    pub fn new() -> Self {
        Self
    }

    /// Apply one `pointer` control message.
    pub fn apply(&self, msg: &ControlMessage) -> Result<(), MiraError> {
        let ControlMessage::Pointer {
            u,
            v,
            down,
            up,
            button,
            ..
        } = *msg
        else {
            return Ok(());
        };

        self.warp(u, v)?;

        if let Some(button) = Button::from_wire(button) {
            if down {
                self.press(button)?;
            }
            if up {
                self.release(button)?;
            }
        }
        Ok(())
    }
}

impl Default for PointerInjector {
    fn default() -> Self {
        Self::new()
    }
}

// ── Windows implementation ───────────────────────────────────────

#[cfg(target_os = "windows")]
mod platform {
    use super::*;
    use windows::Win32::UI::Input::KeyboardAndMouse::{
        SendInput, INPUT, INPUT_0, INPUT_MOUSE, MOUSEEVENTF_LEFTDOWN, MOUSEEVENTF_LEFTUP,
        MOUSEEVENTF_RIGHTDOWN, MOUSEEVENTF_RIGHTUP, MOUSEINPUT, MOUSE_EVENT_FLAGS,
    };
    use windows::Win32::UI::WindowsAndMessaging::{
        GetSystemMetrics, SetCursorPos, SM_CXSCREEN, SM_CYSCREEN,
    };

    impl PointerInjector {
        /// Move the OS cursor to the pixel position for (u, v).
        pub(super) fn warp(&self, u: f32, v: f32) -> Result<(), MiraError> {
            let (w, h) = unsafe { (GetSystemMetrics(SM_CXSCREEN), GetSystemMetrics(SM_CYSCREEN)) };
            if w <= 0 || h <= 0 {
                return Err(MiraError::Other("GetSystemMetrics returned 0".into()));
            }

            let (x, y) = to_pixels(u, v, w, h);
            unsafe {
                SetCursorPos(x, y)
                    .map_err(|e| MiraError::Other(format!("SetCursorPos: {e}")))?;
            }
            Ok(())
        }

        pub(super) fn press(&self, button: Button) -> Result<(), MiraError> {
            self.send_button(match button {
                Button::Left => MOUSEEVENTF_LEFTDOWN,
                Button::Right => MOUSEEVENTF_RIGHTDOWN,
            })
        }

        pub(super) fn release(&self, button: Button) -> Result<(), MiraError> {
            self.send_button(match button {
                Button::Left => MOUSEEVENTF_LEFTUP,
                Button::Right => MOUSEEVENTF_RIGHTUP,
            })
        }

        fn send_button(&self, flags: MOUSE_EVENT_FLAGS) -> Result<(), MiraError> {
            let input = INPUT {
                r#type: INPUT_MOUSE,
                Anonymous: INPUT_0 {
                    mi: MOUSEINPUT {
                        dx: 0,
                        dy: 0,
                        mouseData: 0,
                        dwFlags: flags,
                        time: 0,
                        dwExtraInfo: 0,
                    },
                },
            };

            let sent = unsafe { SendInput(&[input], std::mem::size_of::<INPUT>() as i32) };
            if sent == 0 {
                return Err(MiraError::Other("SendInput returned 0".into()));
            }
            Ok(())
        }
    }
}

// ── Non-Windows stub ─────────────────────────────────────────────

#[cfg(not(target_os = "windows"))]
impl PointerInjector {
    fn warp(&self, _u: f32, _v: f32) -> Result<(), MiraError> {
        Err(MiraError::Other(
            "pointer injection is only available on Windows".into(),
        ))
    }

    fn press(&self, _button: Button) -> Result<(), MiraError> {
        Err(MiraError::Other(
            "pointer injection is only available on Windows".into(),
        ))
    }

    fn release(&self, _button: Button) -> Result<(), MiraError> {
        Err(MiraError::Other(
            "pointer injection is only available on Windows".into(),
        ))
    }
}

// ── Tests ────────────────────────────────────────────────────────
