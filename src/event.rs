use crate::region::{Point, Rect, Region};
use crate::VncError;
use std::sync::Arc;

/// A cursor image in 8 bit RGBA, alpha not premultiplied
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Cursor {
    pub width: i32,
    pub height: i32,
    pub hotspot: Point,
    pub data: Vec<u8>,
}

impl Cursor {
    pub fn new(width: i32, height: i32, hotspot: Point, data: Vec<u8>) -> Result<Self, VncError> {
        if width < 0 || height < 0 || data.len() != (width * height * 4) as usize {
            return Err(VncError::Custom(format!(
                "cursor data does not match {}x{}",
                width, height
            )));
        }
        Ok(Self {
            width,
            height,
            hotspot,
            data,
        })
    }

    /// A zero sized cursor, hides the client side pointer
    pub fn empty() -> Self {
        Self::default()
    }

    pub fn is_empty(&self) -> bool {
        self.width == 0 || self.height == 0
    }

    fn bit_rows<F>(&self, mut set: F) -> Vec<u8>
    where
        F: FnMut(&[u8]) -> bool,
    {
        let row_bytes = (self.width as usize + 7) / 8;
        let mut out = vec![0_u8; row_bytes * self.height as usize];
        for y in 0..self.height as usize {
            for x in 0..self.width as usize {
                let idx = (y * self.width as usize + x) * 4;
                if set(&self.data[idx..idx + 4]) {
                    out[y * row_bytes + x / 8] |= 0x80 >> (x % 8);
                }
            }
        }
        out
    }

    /// One bit per pixel, set where the cursor is opaque enough to be drawn
    pub fn mask(&self) -> Vec<u8> {
        self.bit_rows(|px| px[3] >= 0x80)
    }

    /// One bit per pixel, set for light pixels (foreground of an X cursor)
    pub fn bitmap(&self) -> Vec<u8> {
        self.bit_rows(|px| {
            let lum = (px[0] as u32 * 299 + px[1] as u32 * 587 + px[2] as u32 * 114) / 1000;
            lum >= 0x80
        })
    }

    /// The framebuffer area covered when the pointer is at `pos`
    pub fn rect_at(&self, pos: Point) -> Rect {
        let tl = pos.translate(self.hotspot.negate());
        Rect::from_xywh(tl.x, tl.y, self.width, self.height)
    }
}

/// One entry of the binary clipboard
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ClipboardEntry {
    pub id: u32,
    pub mime: String,
    pub data: Vec<u8>,
}

/// Everything the desktop tells its connected clients
///
/// Values are cheap to clone, they go out to every connection
#[non_exhaustive]
#[derive(Debug, Clone)]
pub enum DesktopEvent {
    Damage(Region),
    Copy { dest: Region, delta: Point },
    /// The pixel buffer was replaced, possibly with a different size
    FramebufferResized,
    /// `origin` is the connection that asked for the change, if any
    LayoutChanged { origin: Option<u64> },
    CursorChanged,
    /// `warped` when the server moved the pointer itself
    CursorMoved { warped: bool },
    NameChanged,
    LedStateChanged,
    Bell,
    CutText(Arc<str>),
    BinaryClipboard(Arc<Vec<ClipboardEntry>>),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn cursor_masks() {
        // 9 pixels wide to spill into a second mask byte
        let mut data = Vec::new();
        for x in 0..9 {
            if x % 2 == 0 {
                data.extend_from_slice(&[255, 255, 255, 255]);
            } else {
                data.extend_from_slice(&[0, 0, 0, 10]);
            }
        }
        let cursor = Cursor::new(9, 1, Point::new(4, 0), data).unwrap();
        assert_eq!(cursor.mask(), vec![0b1010_1010, 0b1000_0000]);
        assert_eq!(cursor.bitmap(), vec![0b1010_1010, 0b1000_0000]);
        assert_eq!(cursor.rect_at(Point::new(10, 10)), Rect::new(6, 10, 15, 11));
        assert!(Cursor::new(2, 2, Point::default(), vec![0; 3]).is_err());
    }
}
