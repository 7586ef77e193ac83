use crate::region::Rect;

/// Highest screen id that can be multiplexed in a video update
pub const MAX_SCREEN_ID: u32 = 255;
pub const MAX_SCREENS: usize = 255;

/// Who caused a layout change, sent as the x field of ExtendedDesktopSize
pub const REASON_SERVER: u16 = 0;
pub const REASON_CLIENT: u16 = 1;
pub const REASON_OTHER_CLIENT: u16 = 2;

/// Outcome of a SetDesktopSize request, sent as the y field
pub const RESULT_SUCCESS: u16 = 0;
pub const RESULT_PROHIBITED: u16 = 1;
pub const RESULT_OUT_OF_RESOURCES: u16 = 2;
pub const RESULT_INVALID: u16 = 3;

/// One virtual monitor of the desktop
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Screen {
    pub id: u32,
    pub dimensions: Rect,
    pub flags: u32,
}

impl Screen {
    pub fn new(id: u32, x: i32, y: i32, width: i32, height: i32, flags: u32) -> Self {
        Self {
            id,
            dimensions: Rect::from_xywh(x, y, width, height),
            flags,
        }
    }
}

/// A complete screen configuration, kept ordered by screen id
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ScreenSet {
    screens: Vec<Screen>,
}

impl From<Vec<Screen>> for ScreenSet {
    fn from(mut screens: Vec<Screen>) -> Self {
        screens.sort_by_key(|s| s.id);
        Self { screens }
    }
}

impl ScreenSet {
    pub fn new() -> Self {
        Self::default()
    }

    /// A layout with one screen covering the whole framebuffer
    pub fn single(width: i32, height: i32) -> Self {
        vec![Screen::new(0, 0, 0, width, height, 0)].into()
    }

    pub fn num_screens(&self) -> usize {
        self.screens.len()
    }

    pub fn iter(&self) -> std::slice::Iter<'_, Screen> {
        self.screens.iter()
    }

    pub fn add_screen(&mut self, screen: Screen) {
        let pos = self.screens.partition_point(|s| s.id <= screen.id);
        self.screens.insert(pos, screen);
    }

    pub fn remove_screen(&mut self, id: u32) {
        self.screens.retain(|s| s.id != id);
    }

    pub fn get(&self, id: u32) -> Option<&Screen> {
        self.screens.iter().find(|s| s.id == id)
    }

    /// Check the layout against a framebuffer of the given size
    pub fn validate(&self, fb_width: i32, fb_height: i32) -> bool {
        if self.screens.is_empty() || self.screens.len() > MAX_SCREENS {
            return false;
        }

        let fb_rect = Rect::from_xywh(0, 0, fb_width, fb_height);
        let mut last_id = None;
        for screen in &self.screens {
            if screen.id > MAX_SCREEN_ID {
                return false;
            }
            if screen.dimensions.is_empty() || !screen.dimensions.enclosed_by(&fb_rect) {
                return false;
            }
            // sorted, so a duplicate is always the direct predecessor
            if last_id == Some(screen.id) {
                return false;
            }
            last_id = Some(screen.id);
        }
        true
    }
}

impl<'a> IntoIterator for &'a ScreenSet {
    type Item = &'a Screen;
    type IntoIter = std::slice::Iter<'a, Screen>;

    fn into_iter(self) -> Self::IntoIter {
        self.screens.iter()
    }
}
