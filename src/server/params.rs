use crate::codec::Codec;
use crate::config::{COMPRESS_LEVEL_RANGE, QUALITY_LEVEL_RANGE};
use crate::event::Cursor;
use crate::region::{Point, Rect};
use crate::screen::ScreenSet;
use crate::{PixelFormat, VncEncoding};
use tracing::*;

/// Capabilities that were switched on by the latest SetEncodings
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct NewCapabilities {
    pub fence: bool,
    pub continuous_updates: bool,
    pub led_state: bool,
    pub qemu_key_event: bool,
}

/// What the server knows about one client
#[derive(Debug, Clone, Default)]
pub struct ClientParams {
    pub width: i32,
    pub height: i32,
    pub layout: ScreenSet,
    pf: PixelFormat,
    name: String,
    cursor: Cursor,
    cursor_pos: Point,
    led_state: Option<u8>,

    pub compress_level: Option<u8>,
    pub quality_level: Option<u8>,
    video_modes: Vec<Codec>,

    pub supports_local_cursor: bool,
    pub supports_local_xcursor: bool,
    pub supports_local_cursor_with_alpha: bool,
    pub supports_vmware_cursor: bool,
    pub supports_cursor_position: bool,
    pub supports_desktop_resize: bool,
    pub supports_extended_desktop_size: bool,
    pub supports_desktop_rename: bool,
    pub supports_last_rect: bool,
    pub supports_fence: bool,
    pub supports_continuous_updates: bool,
    pub supports_led_state: bool,
    pub supports_qemu_key_event: bool,
    pub supports_copyrect: bool,
    pub supports_video: bool,
    pub supports_udp: bool,
}

impl ClientParams {
    pub fn new(width: i32, height: i32, layout: ScreenSet, pf: PixelFormat, name: &str) -> Self {
        Self {
            width,
            height,
            layout,
            pf,
            name: name.to_string(),
            ..Default::default()
        }
    }

    pub fn pf(&self) -> &PixelFormat {
        &self.pf
    }

    pub fn set_pf(&mut self, pf: PixelFormat) {
        self.pf = pf;
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn set_name(&mut self, name: &str) {
        self.name = name.to_string();
    }

    pub fn cursor(&self) -> &Cursor {
        &self.cursor
    }

    pub fn set_cursor(&mut self, cursor: Cursor) {
        self.cursor = cursor;
    }

    pub fn cursor_pos(&self) -> Point {
        self.cursor_pos
    }

    pub fn set_cursor_pos(&mut self, pos: Point) {
        self.cursor_pos = pos;
    }

    /// `None` while the server does not know the lock key state
    pub fn led_state(&self) -> Option<u8> {
        self.led_state
    }

    pub fn set_led_state(&mut self, state: Option<u8>) {
        self.led_state = state;
    }

    pub fn fb_rect(&self) -> Rect {
        Rect::from_xywh(0, 0, self.width, self.height)
    }

    /// Copies are pointless on the datagram channel
    pub fn use_copyrect(&self) -> bool {
        self.supports_copyrect && !self.supports_udp
    }

    pub fn supports_any_cursor(&self) -> bool {
        self.supports_local_cursor
            || self.supports_local_xcursor
            || self.supports_local_cursor_with_alpha
            || self.supports_vmware_cursor
    }

    /// The codec to stream with, walking the server preference list
    pub fn video_codec(&self, preference: &[Codec]) -> Option<Codec> {
        if !self.supports_video {
            return None;
        }
        preference
            .iter()
            .copied()
            .find(|codec| self.video_modes.contains(&codec.family()))
    }

    pub fn set_encodings(&mut self, encodings: &[i32]) -> NewCapabilities {
        let first_fence = !self.supports_fence;
        let first_cu = !self.supports_continuous_updates;
        let first_led = !self.supports_led_state;
        let first_qemu = !self.supports_qemu_key_event;

        self.supports_local_cursor = false;
        self.supports_local_xcursor = false;
        self.supports_local_cursor_with_alpha = false;
        self.supports_vmware_cursor = false;
        self.supports_cursor_position = false;
        self.supports_desktop_resize = false;
        self.supports_extended_desktop_size = false;
        self.supports_desktop_rename = false;
        self.supports_last_rect = false;
        self.supports_led_state = false;
        self.supports_qemu_key_event = false;
        self.supports_copyrect = false;
        self.supports_video = false;
        self.supports_udp = false;
        self.compress_level = None;
        self.quality_level = None;
        self.video_modes.clear();

        for &num in encodings {
            if COMPRESS_LEVEL_RANGE.contains(&num) {
                self.compress_level = Some((num - COMPRESS_LEVEL_RANGE.start()) as u8);
                continue;
            }
            if QUALITY_LEVEL_RANGE.contains(&num) {
                self.quality_level = Some((num - QUALITY_LEVEL_RANGE.start()) as u8);
                continue;
            }
            let Ok(encoding) = VncEncoding::try_from(num) else {
                trace!("Ignoring unknown encoding {}", num);
                continue;
            };
            match encoding {
                VncEncoding::Raw => {}
                VncEncoding::CopyRect => self.supports_copyrect = true,
                VncEncoding::Video => self.supports_video = true,
                VncEncoding::CursorPseudo => self.supports_local_cursor = true,
                VncEncoding::XCursorPseudo => self.supports_local_xcursor = true,
                VncEncoding::CursorWithAlphaPseudo => self.supports_local_cursor_with_alpha = true,
                VncEncoding::VMwareCursorPseudo => self.supports_vmware_cursor = true,
                VncEncoding::VMwareCursorPositionPseudo => self.supports_cursor_position = true,
                VncEncoding::DesktopSizePseudo => self.supports_desktop_resize = true,
                VncEncoding::ExtendedDesktopSizePseudo => {
                    self.supports_extended_desktop_size = true
                }
                VncEncoding::DesktopNamePseudo => self.supports_desktop_rename = true,
                VncEncoding::LastRectPseudo => self.supports_last_rect = true,
                VncEncoding::FencePseudo => self.supports_fence = true,
                VncEncoding::ContinuousUpdatesPseudo => self.supports_continuous_updates = true,
                VncEncoding::LedStatePseudo => self.supports_led_state = true,
                VncEncoding::QemuKeyEventPseudo => self.supports_qemu_key_event = true,
                VncEncoding::UdpPseudo => self.supports_udp = true,
                VncEncoding::StreamingModeAvcPseudo
                | VncEncoding::StreamingModeHevcPseudo
                | VncEncoding::StreamingModeAv1Pseudo
                | VncEncoding::StreamingModeZlibPseudo => {
                    if let Some(codec) = Codec::from_streaming_mode(encoding) {
                        if !self.video_modes.contains(&codec) {
                            self.video_modes.push(codec);
                        }
                    }
                }
            }
        }

        NewCapabilities {
            fence: self.supports_fence && first_fence,
            continuous_updates: self.supports_continuous_updates && first_cu,
            led_state: self.supports_led_state && first_led,
            qemu_key_event: self.supports_qemu_key_event && first_qemu,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn encodings_set_capabilities() {
        let mut cp = ClientParams::new(800, 600, ScreenSet::single(800, 600), PixelFormat::bgra(), "x");
        let new = cp.set_encodings(&[
            VncEncoding::CopyRect.into(),
            VncEncoding::FencePseudo.into(),
            VncEncoding::CursorPseudo.into(),
            -250,
            -25,
            12345,
        ]);
        assert!(new.fence);
        assert!(!new.continuous_updates);
        assert!(cp.supports_local_cursor);
        assert!(cp.use_copyrect());
        assert_eq!(cp.compress_level, Some(6));
        assert_eq!(cp.quality_level, Some(7));

        // fence support is only new the first time
        let new = cp.set_encodings(&[VncEncoding::FencePseudo.into(), VncEncoding::UdpPseudo.into(), 1]);
        assert!(!new.fence);
        assert!(!cp.supports_local_cursor);
        assert!(!cp.use_copyrect());
    }

    #[test]
    fn video_codec_selection() {
        let mut cp = ClientParams::default();
        assert_eq!(cp.video_codec(&Codec::parse_list("auto")), None);

        cp.set_encodings(&[
            VncEncoding::Video.into(),
            VncEncoding::StreamingModeAvcPseudo.into(),
        ]);
        assert_eq!(
            cp.video_codec(&Codec::parse_list("av1,h264_nvenc,h264")),
            Some(Codec::H264Nvenc)
        );
        // nothing in common means no video at all
        assert_eq!(cp.video_codec(&Codec::parse_list("hevc")), None);
        assert_eq!(cp.video_codec(&Codec::parse_list("zlib")), None);

        cp.set_encodings(&[
            VncEncoding::Video.into(),
            VncEncoding::StreamingModeZlibPseudo.into(),
        ]);
        assert_eq!(cp.video_codec(&Codec::parse_list("auto,zlib")), Some(Codec::Zlib));
    }
}
