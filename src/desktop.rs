use crate::region::{Point, Rect};
use crate::screen::{ScreenSet, RESULT_PROHIBITED};
use crate::{PixelFormat, VncError};
use bytes::Bytes;
use std::collections::HashMap;
use std::time::Duration;
use tokio::sync::mpsc;

/// Answer of [`Desktop::query_connection`]
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum QueryResult {
    Accept,
    Reject(String),
    /// Decided later through [`VncServer::approve_connection`](crate::VncServer::approve_connection)
    Pending,
}

/// The desktop being shared
///
/// All methods are called from connection tasks and must not block for long.
pub trait Desktop: Send + Sync {
    fn pointer_event(&self, pos: Point, button_mask: u16);

    /// `keycode` is zero when the client only sent a keysym
    fn key_event(&self, keysym: u32, keycode: u32, down: bool);

    fn client_cut_text(&self, _text: &str) {}

    /// Returns one of the `RESULT_*` codes from [`crate::screen`]
    fn set_screen_layout(&self, _width: i32, _height: i32, _layout: &ScreenSet) -> u16 {
        RESULT_PROHIBITED
    }

    fn query_connection(&self, _peer: &str, _user: Option<&str>) -> QueryResult {
        QueryResult::Accept
    }

    /// Frame timings reported by a client, with the last measured round trip
    fn frame_stats(&self, _all: u32, _render: u32, _ping: Option<Duration>) {}
}

/// Read access to pixels
pub trait PixelBuffer: Send + Sync {
    fn rect(&self) -> Rect;

    fn format(&self) -> &PixelFormat;

    /// Pixels starting at the top left of `r`, with the row stride in pixels
    fn buffer(&self, r: Rect) -> Option<(&[u8], usize)>;

    fn width(&self) -> i32 {
        self.rect().width()
    }

    fn height(&self) -> i32 {
        self.rect().height()
    }
}

/// A pixel buffer owning its memory
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ManagedPixelBuffer {
    width: i32,
    height: i32,
    format: PixelFormat,
    data: Vec<u8>,
}

impl ManagedPixelBuffer {
    pub fn new(width: i32, height: i32, format: PixelFormat) -> Self {
        let width = width.max(0);
        let height = height.max(0);
        Self {
            width,
            height,
            format,
            data: vec![0; width as usize * height as usize * format.bytes_per_pixel()],
        }
    }

    pub fn from_data(
        width: i32,
        height: i32,
        format: PixelFormat,
        data: Vec<u8>,
    ) -> Result<Self, VncError> {
        if width < 0
            || height < 0
            || data.len() != width as usize * height as usize * format.bytes_per_pixel()
        {
            return Err(VncError::Custom(format!(
                "pixel data does not match {}x{}",
                width, height
            )));
        }
        Ok(Self {
            width,
            height,
            format,
            data,
        })
    }

    /// Copy `rect` of `pb` into a new buffer whose origin is the top left of `rect`
    pub fn snapshot(pb: &dyn PixelBuffer, rect: Rect) -> Self {
        let rect = rect.intersect(&pb.rect());
        let mut out = Self::new(rect.width(), rect.height(), *pb.format());
        if let Some((src, stride)) = pb.buffer(rect) {
            out.image_rect(out.rect(), src, stride);
        }
        out
    }

    pub fn data(&self) -> &[u8] {
        &self.data
    }

    fn offset(&self, p: Point) -> usize {
        (p.y as usize * self.width as usize + p.x as usize) * self.format.bytes_per_pixel()
    }

    pub fn get_pixel(&self, p: Point) -> Option<u32> {
        if !self.rect().contains(p) {
            return None;
        }
        let off = self.offset(p);
        Some(self.format.read_pixel(&self.data[off..]))
    }

    pub fn fill_rect(&mut self, r: Rect, pixel: u32) {
        let r = r.intersect(&self.rect());
        if r.is_empty() {
            return;
        }
        let mut encoded = Vec::with_capacity(4);
        self.format.put_pixel(&mut encoded, pixel);
        let bpp = encoded.len();
        for y in r.tl.y..r.br.y {
            let start = self.offset(Point::new(r.tl.x, y));
            let row = &mut self.data[start..start + r.width() as usize * bpp];
            for px in row.chunks_exact_mut(bpp) {
                px.copy_from_slice(&encoded);
            }
        }
    }

    /// Copy pixels of this buffer's format into `r`; `stride` is in pixels
    pub fn image_rect(&mut self, r: Rect, src: &[u8], stride: usize) {
        let clipped = r.intersect(&self.rect());
        if clipped.is_empty() {
            return;
        }
        let bpp = self.format.bytes_per_pixel();
        let row_len = clipped.width() as usize * bpp;
        for y in clipped.tl.y..clipped.br.y {
            let src_off = ((y - r.tl.y) as usize * stride + (clipped.tl.x - r.tl.x) as usize) * bpp;
            if src_off + row_len > src.len() {
                break;
            }
            let dst_off = self.offset(Point::new(clipped.tl.x, y));
            self.data[dst_off..dst_off + row_len].copy_from_slice(&src[src_off..src_off + row_len]);
        }
    }

    /// `dest` receives the pixels found at `dest - delta`
    pub fn copy_rect(&mut self, dest: Rect, delta: Point) {
        let fb = self.rect();
        let dest = dest.intersect(&fb).intersect(&fb.translate(delta));
        if dest.is_empty() {
            return;
        }
        let bpp = self.format.bytes_per_pixel();
        let row_len = dest.width() as usize * bpp;
        let rows: Vec<i32> = if delta.y > 0 {
            (dest.tl.y..dest.br.y).rev().collect()
        } else {
            (dest.tl.y..dest.br.y).collect()
        };
        for y in rows {
            let src = self.offset(Point::new(dest.tl.x - delta.x, y - delta.y));
            let dst = self.offset(Point::new(dest.tl.x, y));
            self.data.copy_within(src..src + row_len, dst);
        }
    }
}

impl PixelBuffer for ManagedPixelBuffer {
    fn rect(&self) -> Rect {
        Rect::from_xywh(0, 0, self.width, self.height)
    }

    fn format(&self) -> &PixelFormat {
        &self.format
    }

    fn buffer(&self, r: Rect) -> Option<(&[u8], usize)> {
        if r.is_empty() || !r.enclosed_by(&self.rect()) {
            return None;
        }
        Some((&self.data[self.offset(r.tl)..], self.width as usize))
    }
}

/// Rights of one user as stored by the application
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Permissions {
    pub read: bool,
    pub write: bool,
    pub owner: bool,
}

impl Permissions {
    pub const FULL: Permissions = Permissions {
        read: true,
        write: true,
        owner: false,
    };
}

pub trait PermissionStore: Send + Sync {
    /// `None` means the user does not exist (any more)
    fn lookup(&self, user: &str) -> Option<Permissions>;
}

impl PermissionStore for HashMap<String, Permissions> {
    fn lookup(&self, user: &str) -> Option<Permissions> {
        self.get(user).copied()
    }
}

/// Every user gets read and write access
#[derive(Debug, Default, Clone, Copy)]
pub struct AllowAll;

impl PermissionStore for AllowAll {
    fn lookup(&self, _user: &str) -> Option<Permissions> {
        Some(Permissions::FULL)
    }
}

/// Per connection capabilities
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AccessRights(u16);

impl AccessRights {
    pub const NONE: AccessRights = AccessRights(0);
    pub const VIEW: AccessRights = AccessRights(0x0001);
    pub const KEY_EVENTS: AccessRights = AccessRights(0x0002);
    pub const PTR_EVENTS: AccessRights = AccessRights(0x0004);
    pub const CUT_TEXT: AccessRights = AccessRights(0x0008);
    pub const SET_DESKTOP_SIZE: AccessRights = AccessRights(0x0010);
    pub const NON_SHARED: AccessRights = AccessRights(0x0020);
    pub const NO_QUERY: AccessRights = AccessRights(0x0400);
    /// Everything needed to control the desktop
    pub const WRITER: AccessRights = AccessRights(0x0002 | 0x0004 | 0x0008 | 0x0010);
    pub const DEFAULT: AccessRights = AccessRights(0x03ff);
    pub const FULL: AccessRights = AccessRights(0xffff);

    pub fn bits(self) -> u16 {
        self.0
    }

    pub fn contains(self, other: AccessRights) -> bool {
        self.0 & other.0 == other.0
    }

    pub fn insert(&mut self, other: AccessRights) {
        self.0 |= other.0;
    }

    pub fn remove(&mut self, other: AccessRights) {
        self.0 &= !other.0;
    }
}

impl std::ops::BitOr for AccessRights {
    type Output = AccessRights;

    fn bitor(self, rhs: AccessRights) -> AccessRights {
        AccessRights(self.0 | rhs.0)
    }
}

/// Unreliable channel for pixel data, one call per datagram
pub trait DatagramSink: Send + Sync {
    fn send(&mut self, datagram: Bytes) -> std::io::Result<()>;
}

impl DatagramSink for mpsc::UnboundedSender<Bytes> {
    fn send(&mut self, datagram: Bytes) -> std::io::Result<()> {
        mpsc::UnboundedSender::send(self, datagram).map_err(|_| {
            std::io::Error::new(std::io::ErrorKind::BrokenPipe, "datagram receiver dropped")
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn buffer(w: i32, h: i32) -> ManagedPixelBuffer {
        let pf = PixelFormat::bgra();
        let mut pb = ManagedPixelBuffer::new(w, h, pf);
        for y in 0..h {
            for x in 0..w {
                pb.fill_rect(Rect::from_xywh(x, y, 1, 1), (y * w + x) as u32);
            }
        }
        pb
    }

    #[test]
    fn snapshot_moves_origin() {
        let pb = buffer(8, 8);
        let snap = ManagedPixelBuffer::snapshot(&pb, Rect::from_xywh(2, 3, 4, 2));
        assert_eq!(snap.rect(), Rect::new(0, 0, 4, 2));
        assert_eq!(snap.get_pixel(Point::new(0, 0)), Some(3 * 8 + 2));
        assert_eq!(snap.get_pixel(Point::new(3, 1)), Some(4 * 8 + 5));
        assert_eq!(snap.get_pixel(Point::new(4, 0)), None);
    }

    #[test]
    fn overlapping_copy_scrolls() {
        let mut pb = buffer(4, 4);
        // scroll everything down by one row
        pb.copy_rect(Rect::new(0, 1, 4, 4), Point::new(0, 1));
        assert_eq!(pb.get_pixel(Point::new(1, 1)), Some(1));
        assert_eq!(pb.get_pixel(Point::new(1, 3)), Some(9));
        let mut pb = buffer(4, 4);
        pb.copy_rect(Rect::new(0, 0, 3, 4), Point::new(-1, 0));
        assert_eq!(pb.get_pixel(Point::new(0, 2)), Some(9));
        assert_eq!(pb.get_pixel(Point::new(2, 2)), Some(11));
    }

    #[test]
    fn buffer_rejects_outside_rects() {
        let pb = buffer(4, 4);
        assert!(pb.buffer(Rect::new(2, 2, 5, 3)).is_none());
        let (data, stride) = pb.buffer(Rect::new(1, 1, 2, 2)).unwrap();
        assert_eq!(stride, 4);
        assert_eq!(pb.format().read_pixel(data), 5);
    }

    #[test]
    fn access_rights() {
        let mut rights = AccessRights::DEFAULT;
        assert!(rights.contains(AccessRights::WRITER | AccessRights::VIEW));
        assert!(!rights.contains(AccessRights::NO_QUERY));
        rights.remove(AccessRights::WRITER);
        assert!(!rights.contains(AccessRights::KEY_EVENTS));
        assert!(rights.contains(AccessRights::VIEW));
    }
}
