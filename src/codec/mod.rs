mod cursor;
mod raw;
mod zlib;
pub use cursor::{render_cursor, write_alpha_cursor, write_rich_cursor, write_vmware_cursor, write_x_cursor};
pub(crate) use raw::Encoder as RawEncoder;
pub use zlib::SoftwareEncoder;

use crate::config::EncoderParams;
use crate::desktop::{ManagedPixelBuffer, PixelBuffer};
use crate::region::Rect;
use crate::screen::Screen;
use crate::{PixelFormat, VncEncoding, VncError};
use bytes::{BufMut, BytesMut};
use tracing::*;

/// Codec id of a rect whose screen did not change
pub const MSG_SKIP: u8 = 0x00;

/// Video codecs a screen can be streamed with
///
/// The hardware variants only differ from their family in how the
/// [`EncoderBackend`] builds them.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Codec {
    Av1Nvenc,
    Av1Vaapi,
    Av1,
    HevcNvenc,
    HevcVaapi,
    Hevc,
    H264Nvenc,
    H264Vaapi,
    H264,
    /// Built in lossless codec, always available
    Zlib,
}

impl Codec {
    /// What `auto` expands to, best first
    pub const AUTO: [Codec; 9] = [
        Codec::Av1Nvenc,
        Codec::Av1Vaapi,
        Codec::Av1,
        Codec::HevcNvenc,
        Codec::HevcVaapi,
        Codec::Hevc,
        Codec::H264Nvenc,
        Codec::H264Vaapi,
        Codec::H264,
    ];

    pub fn name(self) -> &'static str {
        match self {
            Codec::Av1Nvenc => "av1_nvenc",
            Codec::Av1Vaapi => "av1_vaapi",
            Codec::Av1 => "av1",
            Codec::HevcNvenc => "h265_nvenc",
            Codec::HevcVaapi => "h265_vaapi",
            Codec::Hevc => "h265",
            Codec::H264Nvenc => "h264_nvenc",
            Codec::H264Vaapi => "h264_vaapi",
            Codec::H264 => "h264",
            Codec::Zlib => "zlib",
        }
    }

    pub fn from_name(name: &str) -> Option<Codec> {
        let name = name.trim().to_ascii_lowercase();
        let name = name.replace("hevc", "h265");
        [Codec::Zlib]
            .into_iter()
            .chain(Codec::AUTO)
            .find(|codec| codec.name() == name)
    }

    /// Parse a comma separated preference list, unknown names are skipped
    pub fn parse_list(list: &str) -> Vec<Codec> {
        let mut out = Vec::new();
        for item in list.split(',').map(str::trim).filter(|s| !s.is_empty()) {
            let candidates = if item.eq_ignore_ascii_case("auto") {
                Codec::AUTO.to_vec()
            } else if let Some(codec) = Codec::from_name(item) {
                vec![codec]
            } else {
                warn!("Unknown video codec {}", item);
                continue;
            };
            for codec in candidates {
                if !out.contains(&codec) {
                    out.push(codec);
                }
            }
        }
        out
    }

    /// The software member of the family, which is what clients negotiate
    pub fn family(self) -> Codec {
        match self {
            Codec::Av1Nvenc | Codec::Av1Vaapi | Codec::Av1 => Codec::Av1,
            Codec::HevcNvenc | Codec::HevcVaapi | Codec::Hevc => Codec::Hevc,
            Codec::H264Nvenc | Codec::H264Vaapi | Codec::H264 => Codec::H264,
            Codec::Zlib => Codec::Zlib,
        }
    }

    pub fn streaming_mode(self) -> VncEncoding {
        match self.family() {
            Codec::Av1 => VncEncoding::StreamingModeAv1Pseudo,
            Codec::Hevc => VncEncoding::StreamingModeHevcPseudo,
            Codec::H264 => VncEncoding::StreamingModeAvcPseudo,
            _ => VncEncoding::StreamingModeZlibPseudo,
        }
    }

    pub fn from_streaming_mode(encoding: VncEncoding) -> Option<Codec> {
        match encoding {
            VncEncoding::StreamingModeAvcPseudo => Some(Codec::H264),
            VncEncoding::StreamingModeHevcPseudo => Some(Codec::Hevc),
            VncEncoding::StreamingModeAv1Pseudo => Some(Codec::Av1),
            VncEncoding::StreamingModeZlibPseudo => Some(Codec::Zlib),
            _ => None,
        }
    }

    /// Codec id written in front of every encoded frame
    pub fn msg_id(self) -> u8 {
        match self.family() {
            Codec::H264 => 0x10,
            Codec::Hevc => 0x20,
            Codec::Av1 => 0x30,
            _ => 0x40,
        }
    }

    pub fn is_lossy(self) -> bool {
        self != Codec::Zlib
    }

    pub fn is_hardware(self) -> bool {
        matches!(
            self,
            Codec::Av1Nvenc
                | Codec::Av1Vaapi
                | Codec::HevcNvenc
                | Codec::HevcVaapi
                | Codec::H264Nvenc
                | Codec::H264Vaapi
        )
    }
}

impl std::fmt::Display for Codec {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.name())
    }
}

/// One encoder per screen
///
/// ```text
/// +--------------+--------------+-----------------------------+
/// | No. of bytes | Type [Value] | Description                 |
/// +--------------+--------------+-----------------------------+
/// | 1            | U8           | screen-id                   |
/// | 1            | U8           | codec-id (0 = skip)         |
/// | 1            | U8           | key-frame (not for skip)    |
/// | 1-3          | COMPACT      | length (not for skip)       |
/// | length       | U8 array     | encoded frame               |
/// +--------------+--------------+-----------------------------+
/// ```
pub trait VideoEncoder: Send {
    fn codec(&self) -> Codec;

    fn screen_id(&self) -> u8;

    /// The screen area in framebuffer coordinates
    fn rect(&self) -> Rect;

    /// Encode the pixels of the screen, `pb` has its origin at the top left
    /// of [`rect`](Self::rect). Returns false if there is nothing to send.
    fn render(&mut self, pb: &dyn PixelBuffer) -> Result<bool, VncError>;

    /// Append the frame produced by the last successful render
    fn write_rect(&mut self, out: &mut BytesMut);

    fn write_skip_rect(&self, out: &mut BytesMut) {
        out.put_u8(self.screen_id());
        out.put_u8(MSG_SKIP);
    }

    /// The whole screen is `colour` (a pixel value in `pf`)
    fn write_solid_rect(
        &mut self,
        out: &mut BytesMut,
        pf: &PixelFormat,
        colour: u32,
    ) -> Result<(), VncError> {
        let rect = self.rect();
        let mut pb = ManagedPixelBuffer::new(rect.width(), rect.height(), *pf);
        pb.fill_rect(pb.rect(), colour);
        if self.render(&pb)? {
            self.write_rect(out);
        } else {
            self.write_skip_rect(out);
        }
        Ok(())
    }

    /// The next render produces a frame that decodes on its own
    fn request_key_frame(&mut self);
}

/// Builds encoders for codecs this crate has no implementation of
pub trait EncoderBackend: Send + Sync {
    fn create(
        &self,
        codec: Codec,
        screen: &Screen,
        params: &EncoderParams,
    ) -> Result<Box<dyn VideoEncoder>, VncError>;
}

/// Build an encoder for `screen` speaking `codec`
///
/// A hardware codec the backend cannot provide falls back to the software
/// member of the same family. The wire codec never changes, the client may
/// not decode any other. Zlib is built in and needs no backend.
pub fn create_encoder(
    backend: Option<&dyn EncoderBackend>,
    codec: Codec,
    screen: &Screen,
    params: &EncoderParams,
) -> Result<Box<dyn VideoEncoder>, VncError> {
    if codec == Codec::Zlib {
        let encoder = SoftwareEncoder::new(screen, params)?;
        return Ok(Box::new(encoder));
    }
    let Some(backend) = backend else {
        return Err(VncError::EncoderUnavailable(format!(
            "no encoder backend for {}",
            codec
        )));
    };
    match backend.create(codec, screen, params) {
        Ok(encoder) => Ok(encoder),
        Err(e) if codec.is_hardware() => {
            error!(
                "Failed to create {} encoder for screen {}: {}, falling back to {}",
                codec,
                screen.id,
                e,
                codec.family()
            );
            backend.create(codec.family(), screen, params)
        }
        Err(e) => Err(e),
    }
}

/// Variable length size as used by the tight family of encodings
pub fn write_compact<B: BufMut>(out: &mut B, len: usize) {
    if len < 0x80 {
        out.put_u8(len as u8);
    } else if len < 0x4000 {
        out.put_u8((len & 0x7f) as u8 | 0x80);
        out.put_u8((len >> 7) as u8);
    } else {
        out.put_u8((len & 0x7f) as u8 | 0x80);
        out.put_u8(((len >> 7) & 0x7f) as u8 | 0x80);
        out.put_u8((len >> 14) as u8);
    }
}

/// The pixel value of `pb` if every pixel has it
pub fn solid_colour(pb: &dyn PixelBuffer) -> Option<u32> {
    let rect = pb.rect();
    let (data, stride) = pb.buffer(rect)?;
    let bpp = pb.format().bytes_per_pixel();
    let first = data.get(..bpp)?;
    let row_len = rect.width() as usize * bpp;
    for y in 0..rect.height() as usize {
        let start = y * stride * bpp;
        let row = data.get(start..start + row_len)?;
        if row.chunks_exact(bpp).any(|px| px != first) {
            return None;
        }
    }
    Some(pb.format().read_pixel(first))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn auto_expands_best_first() {
        let list = Codec::parse_list("zlib, auto,h264,bogus");
        assert_eq!(list[0], Codec::Zlib);
        assert_eq!(list[1], Codec::Av1Nvenc);
        assert_eq!(list.len(), 10);
        assert_eq!(Codec::parse_list("hevc_vaapi"), vec![Codec::HevcVaapi]);
        assert!(Codec::parse_list("").is_empty());
    }

    #[test]
    fn codec_ids() {
        assert_eq!(Codec::H264Nvenc.msg_id(), 0x10);
        assert_eq!(Codec::Hevc.msg_id(), 0x20);
        assert_eq!(Codec::Av1Vaapi.msg_id(), 0x30);
        assert_eq!(Codec::Zlib.msg_id(), 0x40);
        assert_eq!(
            Codec::HevcNvenc.streaming_mode(),
            VncEncoding::StreamingModeHevcPseudo
        );
        assert!(!Codec::Zlib.is_lossy());
        assert!(Codec::Av1Nvenc.is_hardware() && !Codec::Av1.is_hardware());
    }

    #[test]
    fn compact_lengths() {
        let mut out = Vec::new();
        write_compact(&mut out, 0x7f);
        assert_eq!(out, vec![0x7f]);
        out.clear();
        write_compact(&mut out, 0x80);
        assert_eq!(out, vec![0x80, 0x01]);
        out.clear();
        write_compact(&mut out, 0x4000);
        assert_eq!(out, vec![0x80, 0x80, 0x01]);
    }

    struct Broken;

    impl EncoderBackend for Broken {
        fn create(
            &self,
            codec: Codec,
            _screen: &Screen,
            _params: &EncoderParams,
        ) -> Result<Box<dyn VideoEncoder>, VncError> {
            Err(VncError::EncoderUnavailable(codec.name().to_string()))
        }
    }

    /// No hardware, software codecs only
    struct CpuOnly;

    struct Stub {
        codec: Codec,
        screen: Screen,
    }

    impl VideoEncoder for Stub {
        fn codec(&self) -> Codec {
            self.codec
        }

        fn screen_id(&self) -> u8 {
            self.screen.id as u8
        }

        fn rect(&self) -> Rect {
            self.screen.dimensions
        }

        fn render(&mut self, _pb: &dyn PixelBuffer) -> Result<bool, VncError> {
            Ok(false)
        }

        fn write_rect(&mut self, _out: &mut BytesMut) {}

        fn request_key_frame(&mut self) {}
    }

    impl EncoderBackend for CpuOnly {
        fn create(
            &self,
            codec: Codec,
            screen: &Screen,
            _params: &EncoderParams,
        ) -> Result<Box<dyn VideoEncoder>, VncError> {
            if codec.is_hardware() {
                return Err(VncError::EncoderUnavailable(codec.name().to_string()));
            }
            Ok(Box::new(Stub {
                codec,
                screen: *screen,
            }))
        }
    }

    #[test]
    fn factory_falls_back_within_the_family() {
        let screen = Screen::new(3, 0, 0, 64, 32, 0);
        let params = EncoderParams::default();
        let encoder = create_encoder(Some(&CpuOnly as &dyn EncoderBackend), Codec::H264Nvenc, &screen, &params).unwrap();
        assert_eq!(encoder.codec(), Codec::H264);
        assert_eq!(encoder.screen_id(), 3);

        // never another codec than the negotiated one
        assert!(create_encoder(Some(&Broken as &dyn EncoderBackend), Codec::H264Vaapi, &screen, &params).is_err());
        assert!(create_encoder(None, Codec::Av1, &screen, &params).is_err());

        let encoder = create_encoder(None, Codec::Zlib, &screen, &params).unwrap();
        assert_eq!(encoder.codec(), Codec::Zlib);
        assert_eq!(encoder.rect(), Rect::new(0, 0, 64, 32));
        let empty = Screen::new(1, 0, 0, 0, 0, 0);
        assert!(create_encoder(None, Codec::Zlib, &empty, &params).is_err());
    }

    #[test]
    fn solid_detection() {
        let mut pb = ManagedPixelBuffer::new(5, 3, PixelFormat::bgra());
        pb.fill_rect(pb.rect(), 0x00ff_0000);
        assert_eq!(solid_colour(&pb), Some(0x00ff_0000));
        pb.fill_rect(Rect::new(4, 2, 5, 3), 1);
        assert_eq!(solid_colour(&pb), None);
    }
}
