//! Keyboard and pointer relay rules of one connection.

use crate::desktop::Desktop;
use crate::region::Point;
use std::collections::BTreeMap;
use tracing::*;

pub mod keysym {
    pub const XK_TAB: u32 = 0xff09;
    pub const XK_ISO_LEFT_TAB: u32 = 0xfe20;
    pub const XK_SHIFT_L: u32 = 0xffe1;
    pub const XK_SHIFT_R: u32 = 0xffe2;
    pub const XK_CAPS_LOCK: u32 = 0xffe5;
    pub const XK_NUM_LOCK: u32 = 0xff7f;
    pub const XK_SCROLL_LOCK: u32 = 0xff14;
    pub const XK_UPPER_A: u32 = 0x0041;
    pub const XK_UPPER_Z: u32 = 0x005a;
    pub const XK_LOWER_A: u32 = 0x0061;
    pub const XK_LOWER_Z: u32 = 0x007a;
    pub const XK_KP_HOME: u32 = 0xff95;
    pub const XK_KP_DELETE: u32 = 0xff9f;
    pub const XK_KP_SEPARATOR: u32 = 0xffac;
    pub const XK_KP_DECIMAL: u32 = 0xffae;
    pub const XK_KP_0: u32 = 0xffb0;
    pub const XK_KP_9: u32 = 0xffb9;
}

pub const LED_SCROLL_LOCK: u8 = 1 << 0;
pub const LED_NUM_LOCK: u8 = 1 << 1;
pub const LED_CAPS_LOCK: u8 = 1 << 2;

use keysym::*;

/// Keys held down by one client
///
/// Keys are indexed by keycode, or by `0x80000000 | keysym` when the client
/// sent no keycode.
#[derive(Debug, Default)]
pub struct KeyTracker {
    pressed: BTreeMap<u32, u32>,
}

impl KeyTracker {
    pub fn new() -> Self {
        Self::default()
    }

    fn shift_pressed(&self) -> bool {
        self.pressed
            .values()
            .any(|sym| *sym == XK_SHIFT_L || *sym == XK_SHIFT_R)
    }

    pub fn num_pressed(&self) -> usize {
        self.pressed.len()
    }

    /// Apply the relay rules and forward the event
    ///
    /// `led_state` is the server's lock key state, `client_leds` whether the
    /// client gets told about it.
    pub fn key_event(
        &mut self,
        desktop: &dyn Desktop,
        mut keysym: u32,
        keycode: u32,
        down: bool,
        led_state: Option<u8>,
        client_leds: bool,
    ) {
        let is_lock = matches!(keysym, XK_CAPS_LOCK | XK_NUM_LOCK | XK_SCROLL_LOCK);
        if led_state.is_none() && is_lock {
            debug!("Ignoring lock key (e.g. caps lock)");
            return;
        }

        if !client_leds {
            // no heuristic for scroll lock
            if keysym == XK_SCROLL_LOCK {
                debug!("Ignoring lock key (e.g. caps lock)");
                return;
            }
            if let (true, Some(leds)) = (down, led_state) {
                self.sync_locks(desktop, keysym, leds);
            }
        }

        let mut fake_shift = false;
        if keysym == XK_ISO_LEFT_TAB {
            if !self.shift_pressed() {
                debug!("Pressing fake Shift_L");
                desktop.key_event(XK_SHIFT_L, 0, true);
                fake_shift = true;
            }
            keysym = XK_TAB;
        }

        let lookup = if keycode == 0 {
            0x8000_0000 | keysym
        } else {
            keycode
        };

        // a key that is already down keeps its keysym
        if let Some(first) = self.pressed.get(&lookup) {
            keysym = *first;
        }

        let forward = if down {
            self.pressed.insert(lookup, keysym);
            true
        } else {
            self.pressed.remove(&lookup).is_some()
        };
        if forward {
            desktop.key_event(keysym, keycode, down);
        }

        if fake_shift {
            debug!("Releasing fake Shift_L");
            desktop.key_event(XK_SHIFT_L, 0, false);
        }
    }

    fn sync_locks(&self, desktop: &dyn Desktop, keysym: u32, leds: u8) {
        let upper = (XK_UPPER_A..=XK_UPPER_Z).contains(&keysym);
        let lower = (XK_LOWER_A..=XK_LOWER_Z).contains(&keysym);
        if upper || lower {
            let shift = self.shift_pressed();
            let lock = leds & LED_CAPS_LOCK != 0;
            if lock == (upper == shift) {
                debug!("Inserting fake CapsLock to get in sync with client");
                desktop.key_event(XK_CAPS_LOCK, 0, true);
                desktop.key_event(XK_CAPS_LOCK, 0, false);
            }
        }

        let number = (XK_KP_0..=XK_KP_9).contains(&keysym)
            || keysym == XK_KP_SEPARATOR
            || keysym == XK_KP_DECIMAL;
        if number || (XK_KP_HOME..=XK_KP_DELETE).contains(&keysym) {
            let lock = leds & LED_NUM_LOCK != 0;
            // with shift held the wanted state depends on the client OS
            if !self.shift_pressed() && lock != number {
                debug!("Inserting fake NumLock to get in sync with client");
                desktop.key_event(XK_NUM_LOCK, 0, true);
                desktop.key_event(XK_NUM_LOCK, 0, false);
            }
        }
    }

    /// Release everything still held, the client is going away
    pub fn release_all(&mut self, desktop: &dyn Desktop) {
        for (lookup, keysym) in std::mem::take(&mut self.pressed) {
            let keycode = if lookup & 0x8000_0000 != 0 { 0 } else { lookup };
            debug!("Releasing key 0x{:x} / 0x{:x} on client disconnect", keysym, keycode);
            desktop.key_event(keysym, keycode, false);
        }
    }
}

/// Bit set on x for relative pointer motion
pub const POINTER_RELATIVE: u16 = 0x4000;
/// Marks a negative delta in relative mode
pub const POINTER_NEGATIVE: u16 = 0x8000;

/// Absolute pointer position of one client
#[derive(Debug, Default, Clone, Copy)]
pub struct PointerTracker {
    pos: Point,
}

impl PointerTracker {
    pub fn pos(&self) -> Point {
        self.pos
    }

    /// Turn a wire position into an absolute one on a `width` x `height`
    /// framebuffer
    pub fn resolve(&mut self, x: u16, y: u16, width: i32, height: i32) -> Point {
        if x & POINTER_RELATIVE == 0 {
            self.pos = Point::new(x as i32, y as i32);
            return self.pos;
        }

        let delta = |v: u16| {
            let v = v & !POINTER_RELATIVE;
            if v & POINTER_NEGATIVE != 0 {
                -((v & !POINTER_NEGATIVE) as i32)
            } else {
                v as i32
            }
        };
        let max_x = (width - 1).max(0);
        let max_y = (height - 1).max(0);
        self.pos = Point::new(
            (self.pos.x + delta(x)).clamp(0, max_x),
            (self.pos.y + delta(y)).clamp(0, max_y),
        );
        self.pos
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;

    #[derive(Default)]
    struct Recorder {
        keys: Mutex<Vec<(u32, u32, bool)>>,
    }

    impl Desktop for Recorder {
        fn pointer_event(&self, _pos: Point, _button_mask: u16) {}

        fn key_event(&self, keysym: u32, keycode: u32, down: bool) {
            self.keys.lock().unwrap().push((keysym, keycode, down));
        }
    }

    impl Recorder {
        fn take(&self) -> Vec<(u32, u32, bool)> {
            std::mem::take(&mut *self.keys.lock().unwrap())
        }
    }

    #[test]
    fn repeated_down_keeps_first_keysym() {
        let desktop = Recorder::default();
        let mut keys = KeyTracker::new();
        keys.key_event(&desktop, 0x61, 38, true, Some(0), true);
        keys.key_event(&desktop, 0x41, 38, true, Some(0), true);
        keys.key_event(&desktop, 0x41, 38, false, Some(0), true);
        // nothing down any more
        keys.key_event(&desktop, 0x41, 38, false, Some(0), true);
        assert_eq!(
            desktop.take(),
            vec![(0x61, 38, true), (0x61, 38, true), (0x61, 38, false)]
        );
    }

    #[test]
    fn lock_keys_need_a_known_state() {
        let desktop = Recorder::default();
        let mut keys = KeyTracker::new();
        keys.key_event(&desktop, XK_CAPS_LOCK, 0, true, None, true);
        keys.key_event(&desktop, XK_SCROLL_LOCK, 0, true, Some(0), false);
        assert!(desktop.take().is_empty());
        keys.key_event(&desktop, XK_CAPS_LOCK, 0, true, Some(0), true);
        assert_eq!(desktop.take().len(), 1);
    }

    #[test]
    fn caps_lock_is_resynchronised() {
        let desktop = Recorder::default();
        let mut keys = KeyTracker::new();
        // client types 'A' without shift while the server has caps lock off
        keys.key_event(&desktop, 0x41, 0, true, Some(0), false);
        assert_eq!(
            desktop.take(),
            vec![
                (XK_CAPS_LOCK, 0, true),
                (XK_CAPS_LOCK, 0, false),
                (0x41, 0, true)
            ]
        );
        // 'a' with caps lock off is consistent
        keys.key_event(&desktop, 0x61, 0, true, Some(0), false);
        assert_eq!(desktop.take(), vec![(0x61, 0, true)]);
        // keypad digit with num lock off
        keys.key_event(&desktop, XK_KP_0 + 1, 0, true, Some(LED_CAPS_LOCK), false);
        assert_eq!(desktop.take()[0], (XK_NUM_LOCK, 0, true));
    }

    #[test]
    fn iso_left_tab_is_shifted_tab() {
        let desktop = Recorder::default();
        let mut keys = KeyTracker::new();
        keys.key_event(&desktop, XK_ISO_LEFT_TAB, 0, true, Some(0), true);
        assert_eq!(
            desktop.take(),
            vec![(XK_SHIFT_L, 0, true), (XK_TAB, 0, true), (XK_SHIFT_L, 0, false)]
        );
        keys.key_event(&desktop, XK_SHIFT_R, 0, true, Some(0), true);
        desktop.take();
        keys.key_event(&desktop, XK_ISO_LEFT_TAB, 0, false, Some(0), true);
        assert_eq!(desktop.take(), vec![(XK_TAB, 0, false)]);
    }

    #[test]
    fn held_keys_released_on_close() {
        let desktop = Recorder::default();
        let mut keys = KeyTracker::new();
        keys.key_event(&desktop, 0x62, 0, true, Some(0), true);
        keys.key_event(&desktop, 0x63, 54, true, Some(0), true);
        desktop.take();
        keys.release_all(&desktop);
        let mut released = desktop.take();
        released.sort();
        assert_eq!(released, vec![(0x62, 0, false), (0x63, 54, false)]);
        assert_eq!(keys.num_pressed(), 0);
    }

    #[test]
    fn relative_pointer_is_clamped() {
        let mut ptr = PointerTracker::default();
        assert_eq!(ptr.resolve(100, 50, 800, 600), Point::new(100, 50));
        let rel = |v: i32| {
            if v < 0 {
                POINTER_RELATIVE | POINTER_NEGATIVE | (-v) as u16
            } else {
                POINTER_RELATIVE | v as u16
            }
        };
        assert_eq!(ptr.resolve(rel(-20), 10, 800, 600), Point::new(80, 60));
        assert_eq!(ptr.resolve(rel(-200), rel(-200), 800, 600), Point::new(0, 0));
        assert_eq!(ptr.resolve(rel(1000), rel(1000), 800, 600), Point::new(799, 599));
    }
}
