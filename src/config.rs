use crate::codec::Codec;
use crate::VncError;
use bytes::BufMut;
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

/// All vnc encodings and pseudo encodings the server knows about
///
/// Compression and quality levels are ranges and handled separately,
/// see [`COMPRESS_LEVEL_RANGE`] and [`QUALITY_LEVEL_RANGE`]
#[allow(dead_code)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(i32)]
pub enum VncEncoding {
    Raw = 0,
    CopyRect = 1,
    /// Multi-screen video stream, one rectangle per screen
    Video = 0x4b56_5631,
    CursorPseudo = -239,
    XCursorPseudo = -240,
    CursorWithAlphaPseudo = -314,
    VMwareCursorPseudo = 0x574d_5664,
    VMwareCursorPositionPseudo = 0x574d_5666,
    DesktopSizePseudo = -223,
    ExtendedDesktopSizePseudo = -308,
    DesktopNamePseudo = -307,
    LastRectPseudo = -224,
    FencePseudo = -312,
    ContinuousUpdatesPseudo = -313,
    LedStatePseudo = -261,
    QemuKeyEventPseudo = -258,
    UdpPseudo = -1100,
    StreamingModeAvcPseudo = -1101,
    StreamingModeHevcPseudo = -1102,
    StreamingModeAv1Pseudo = -1103,
    StreamingModeZlibPseudo = -1104,
}

pub const COMPRESS_LEVEL_RANGE: std::ops::RangeInclusive<i32> = -256..=-247;
pub const QUALITY_LEVEL_RANGE: std::ops::RangeInclusive<i32> = -32..=-23;

impl TryFrom<i32> for VncEncoding {
    type Error = i32;

    fn try_from(num: i32) -> Result<Self, Self::Error> {
        use VncEncoding::*;
        let e = match num {
            0 => Raw,
            1 => CopyRect,
            0x4b56_5631 => Video,
            -239 => CursorPseudo,
            -240 => XCursorPseudo,
            -314 => CursorWithAlphaPseudo,
            0x574d_5664 => VMwareCursorPseudo,
            0x574d_5666 => VMwareCursorPositionPseudo,
            -223 => DesktopSizePseudo,
            -308 => ExtendedDesktopSizePseudo,
            -307 => DesktopNamePseudo,
            -224 => LastRectPseudo,
            -312 => FencePseudo,
            -313 => ContinuousUpdatesPseudo,
            -261 => LedStatePseudo,
            -258 => QemuKeyEventPseudo,
            -1100 => UdpPseudo,
            -1101 => StreamingModeAvcPseudo,
            -1102 => StreamingModeHevcPseudo,
            -1103 => StreamingModeAv1Pseudo,
            -1104 => StreamingModeZlibPseudo,
            other => return Err(other),
        };
        Ok(e)
    }
}

impl From<VncEncoding> for i32 {
    fn from(e: VncEncoding) -> Self {
        e as i32
    }
}

/// All supported vnc versions
#[allow(dead_code)]
#[derive(Debug, Clone, Copy, PartialEq, PartialOrd, Eq)]
#[repr(u8)]
pub enum VncVersion {
    RFB33,
    RFB37,
    RFB38,
}

impl From<[u8; 12]> for VncVersion {
    fn from(version: [u8; 12]) -> Self {
        match &version {
            b"RFB 003.003\n" => VncVersion::RFB33,
            b"RFB 003.007\n" => VncVersion::RFB37,
            b"RFB 003.008\n" => VncVersion::RFB38,
            // https://www.rfc-editor.org/rfc/rfc6143#section-7.1.1
            //  Other version numbers are reported by some servers and clients,
            //  but should be interpreted as 3.3 since they do not implement the
            //  different handshake in 3.7 or 3.8.
            _ => VncVersion::RFB33,
        }
    }
}

impl From<VncVersion> for &[u8; 12] {
    fn from(version: VncVersion) -> Self {
        match version {
            VncVersion::RFB33 => b"RFB 003.003\n",
            VncVersion::RFB37 => b"RFB 003.007\n",
            VncVersion::RFB38 => b"RFB 003.008\n",
        }
    }
}

impl VncVersion {
    pub(crate) async fn read<S>(reader: &mut S) -> Result<Self, VncError>
    where
        S: AsyncRead + Unpin,
    {
        let mut buffer = [0_u8; 12];
        reader.read_exact(&mut buffer).await?;
        Ok(buffer.into())
    }

    pub(crate) async fn write<S>(self, writer: &mut S) -> Result<(), VncError>
    where
        S: AsyncWrite + Unpin,
    {
        writer
            .write_all(&<VncVersion as Into<&[u8; 12]>>::into(self)[..])
            .await?;
        Ok(())
    }
}

///  Pixel Format Data Structure according to [RFC6143](https://www.rfc-editor.org/rfc/rfc6143.html#section-7.4)
///
/// ```text
/// +--------------+--------------+-----------------+
/// | No. of bytes | Type [Value] | Description     |
/// +--------------+--------------+-----------------+
/// | 1            | U8           | bits-per-pixel  |
/// | 1            | U8           | depth           |
/// | 1            | U8           | big-endian-flag |
/// | 1            | U8           | true-color-flag |
/// | 2            | U16          | red-max         |
/// | 2            | U16          | green-max       |
/// | 2            | U16          | blue-max        |
/// | 1            | U8           | red-shift       |
/// | 1            | U8           | green-shift     |
/// | 1            | U8           | blue-shift      |
/// | 3            |              | padding         |
/// +--------------+--------------+-----------------+
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PixelFormat {
    /// the number of bits used for each pixel value on the wire
    ///
    /// 8, 16, 32(usually) only
    ///
    pub bits_per_pixel: u8,
    pub depth: u8,
    /// true if multi-byte pixels are interpreted as big endian
    ///
    pub big_endian_flag: u8,
    pub true_color_flag: u8,
    pub red_max: u16,
    pub green_max: u16,
    pub blue_max: u16,
    /// the number of shifts needed to get the red value in a pixel to the least significant bit
    ///
    pub red_shift: u8,
    pub green_shift: u8,
    pub blue_shift: u8,
}

impl TryFrom<[u8; 16]> for PixelFormat {
    type Error = VncError;

    fn try_from(pf: [u8; 16]) -> Result<Self, Self::Error> {
        let format = PixelFormat {
            bits_per_pixel: pf[0],
            depth: pf[1],
            big_endian_flag: pf[2],
            true_color_flag: pf[3],
            red_max: u16::from_be_bytes([pf[4], pf[5]]),
            green_max: u16::from_be_bytes([pf[6], pf[7]]),
            blue_max: u16::from_be_bytes([pf[8], pf[9]]),
            red_shift: pf[10],
            green_shift: pf[11],
            blue_shift: pf[12],
        };
        if !format.is_valid() {
            return Err(VncError::WrongPixelFormat);
        }
        Ok(format)
    }
}

impl Default for PixelFormat {
    // by default the pixel transformed is (a << 24 | r << 16 || g << 8 | b) in le
    // which is [b, g, r, a] in network
    fn default() -> Self {
        Self {
            bits_per_pixel: 32,
            depth: 24,
            big_endian_flag: 0,
            true_color_flag: 1,
            red_max: 255,
            green_max: 255,
            blue_max: 255,
            red_shift: 16,
            green_shift: 8,
            blue_shift: 0,
        }
    }
}

impl PixelFormat {
    // (a << 24 | r << 16 || g << 8 | b) in le
    // [b, g, r, a] in network
    pub fn bgra() -> PixelFormat {
        PixelFormat::default()
    }

    // (a << 24 | b << 16 | g << 8 | r) in le
    // which is [r, g, b, a] in network
    pub fn rgba() -> PixelFormat {
        Self {
            red_shift: 0,
            blue_shift: 16,
            ..Default::default()
        }
    }

    /// 16 bit 5-6-5
    pub fn rgb565() -> PixelFormat {
        Self {
            bits_per_pixel: 16,
            depth: 16,
            red_max: 31,
            green_max: 63,
            blue_max: 31,
            red_shift: 11,
            green_shift: 5,
            blue_shift: 0,
            ..Default::default()
        }
    }

    pub fn bytes_per_pixel(&self) -> usize {
        self.bits_per_pixel as usize / 8
    }

    /// Only true colour formats with 8, 16 or 32 bits per pixel are served
    pub fn is_valid(&self) -> bool {
        if !matches!(self.bits_per_pixel, 8 | 16 | 32) {
            return false;
        }
        if self.true_color_flag == 0 {
            return false;
        }
        let bits = |max: u16| 16 - max.leading_zeros();
        let fits = |max: u16, shift: u8| {
            max != 0 && (bits(max) + shift as u32) <= self.bits_per_pixel as u32
        };
        fits(self.red_max, self.red_shift)
            && fits(self.green_max, self.green_shift)
            && fits(self.blue_max, self.blue_shift)
    }

    /// Pack 8 bit channels into a pixel value of this format
    pub fn pixel_from_rgb(&self, r: u8, g: u8, b: u8) -> u32 {
        let scale = |v: u8, max: u16| (v as u32 * max as u32 + 127) / 255;
        (scale(r, self.red_max) << self.red_shift)
            | (scale(g, self.green_max) << self.green_shift)
            | (scale(b, self.blue_max) << self.blue_shift)
    }

    /// Unpack a pixel value of this format into 8 bit channels
    pub fn rgb_from_pixel(&self, pixel: u32) -> (u8, u8, u8) {
        let expand = |shift: u8, max: u16| {
            if max == 0 {
                return 0;
            }
            let v = (pixel >> shift) & max as u32;
            ((v * 255 + max as u32 / 2) / max as u32) as u8
        };
        (
            expand(self.red_shift, self.red_max),
            expand(self.green_shift, self.green_max),
            expand(self.blue_shift, self.blue_max),
        )
    }

    /// Read one pixel value stored in this format
    pub fn read_pixel(&self, bytes: &[u8]) -> u32 {
        match (self.bits_per_pixel, self.big_endian_flag != 0) {
            (8, _) => bytes[0] as u32,
            (16, false) => u16::from_le_bytes([bytes[0], bytes[1]]) as u32,
            (16, true) => u16::from_be_bytes([bytes[0], bytes[1]]) as u32,
            (_, false) => u32::from_le_bytes([bytes[0], bytes[1], bytes[2], bytes[3]]),
            (_, true) => u32::from_be_bytes([bytes[0], bytes[1], bytes[2], bytes[3]]),
        }
    }

    /// Append one pixel value in this format
    pub fn put_pixel<B: BufMut>(&self, out: &mut B, pixel: u32) {
        match (self.bits_per_pixel, self.big_endian_flag != 0) {
            (8, _) => out.put_u8(pixel as u8),
            (16, false) => out.put_u16_le(pixel as u16),
            (16, true) => out.put_u16(pixel as u16),
            (_, false) => out.put_u32_le(pixel),
            (_, true) => out.put_u32(pixel),
        }
    }

    pub(crate) fn write<B: BufMut>(&self, out: &mut B) {
        out.put_u8(self.bits_per_pixel);
        out.put_u8(self.depth);
        out.put_u8(self.big_endian_flag);
        out.put_u8(self.true_color_flag);
        out.put_u16(self.red_max);
        out.put_u16(self.green_max);
        out.put_u16(self.blue_max);
        out.put_u8(self.red_shift);
        out.put_u8(self.green_shift);
        out.put_u8(self.blue_shift);
        out.put_bytes(0, 3);
    }

    pub(crate) async fn read<S>(reader: &mut S) -> Result<Self, VncError>
    where
        S: AsyncRead + Unpin,
    {
        let mut pixel_buffer = [0_u8; 16];
        reader.read_exact(&mut pixel_buffer).await?;
        pixel_buffer.try_into()
    }
}

/// Tunables of the delay based congestion window
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CongestionPolicy {
    pub initial_window: usize,
    pub minimum_window: usize,
    pub maximum_window: usize,
    /// rtt and delay samples are smoothed by `1 / 2^smoothing_shift`
    pub smoothing_shift: u32,
    /// pongs closer together than this do not adjust the window
    pub minimum_sample: Duration,
    /// used for bandwidth estimates until the first pong arrives
    pub initial_rtt: Duration,
}

impl Default for CongestionPolicy {
    fn default() -> Self {
        Self {
            initial_window: 16384,
            minimum_window: 4096,
            maximum_window: 4 * 1024 * 1024,
            smoothing_shift: 3,
            minimum_sample: Duration::from_millis(10),
            initial_rtt: Duration::from_millis(100),
        }
    }
}

/// Parameters handed to every video encoder
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct EncoderParams {
    pub frame_rate: u32,
    /// distance between two key frames
    pub group_of_pictures: u32,
    /// 0 (smallest) to 9 (best)
    pub quality: u8,
}

impl Default for EncoderParams {
    fn default() -> Self {
        Self {
            frame_rate: 60,
            group_of_pictures: 120,
            quality: 6,
        }
    }
}

/// Server wide settings shared by every connection
///
/// ```no_run
/// use vncserver::ServerConfig;
/// use std::time::Duration;
///
/// let config = ServerConfig::default()
///     .set_name("office")
///     .set_frame_rate(30)
///     .set_idle_timeout(Duration::from_secs(3600))
///     .set_video_codecs("auto");
/// ```
#[derive(Debug, Clone)]
pub struct ServerConfig {
    pub name: String,
    /// zero disables the idle timeout
    pub idle_timeout: Duration,
    pub client_wait_time: Duration,
    pub frame_rate: u32,
    pub always_shared: bool,
    pub never_shared: bool,
    pub disconnect_clients: bool,
    pub query_connect: bool,
    pub accept_pointer_events: bool,
    pub accept_key_events: bool,
    pub accept_cut_text: bool,
    pub send_cut_text: bool,
    pub max_cut_text: usize,
    pub accept_set_desktop_size: bool,
    pub video_codecs: Vec<Codec>,
    pub encoder: EncoderParams,
    pub max_encode_threads: usize,
    /// force a full frame every that many datagram frames, zero disables
    pub udp_full_frame_frequency: u32,
    pub clipboard_delay: Duration,
    pub congestion: CongestionPolicy,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            name: "vnc-server-rs".to_string(),
            idle_timeout: Duration::ZERO,
            client_wait_time: Duration::from_secs(20),
            frame_rate: 60,
            always_shared: false,
            never_shared: false,
            disconnect_clients: true,
            query_connect: false,
            accept_pointer_events: true,
            accept_key_events: true,
            accept_cut_text: true,
            send_cut_text: true,
            max_cut_text: 256 * 1024,
            accept_set_desktop_size: true,
            video_codecs: Codec::parse_list("auto,zlib"),
            encoder: EncoderParams::default(),
            max_encode_threads: 4,
            udp_full_frame_frequency: 0,
            clipboard_delay: Duration::from_millis(100),
            congestion: CongestionPolicy::default(),
        }
    }
}

impl ServerConfig {
    /// Desktop name announced in ServerInit
    pub fn set_name(mut self, name: &str) -> Self {
        self.name = name.to_string();
        self
    }

    pub fn set_idle_timeout(mut self, timeout: Duration) -> Self {
        self.idle_timeout = timeout;
        self
    }

    /// How long a closing connection may take to flush what is queued
    pub fn set_client_wait_time(mut self, wait: Duration) -> Self {
        self.client_wait_time = wait;
        self
    }

    /// Clamped to at least one frame per second
    pub fn set_frame_rate(mut self, frame_rate: u32) -> Self {
        self.frame_rate = frame_rate.max(1);
        self.encoder.frame_rate = self.frame_rate;
        self
    }

    pub fn set_always_shared(mut self, always_shared: bool) -> Self {
        self.always_shared = always_shared;
        self
    }

    pub fn set_never_shared(mut self, never_shared: bool) -> Self {
        self.never_shared = never_shared;
        self
    }

    /// Whether an exclusive client kicks the others out or is refused
    pub fn set_disconnect_clients(mut self, disconnect: bool) -> Self {
        self.disconnect_clients = disconnect;
        self
    }

    pub fn set_query_connect(mut self, query: bool) -> Self {
        self.query_connect = query;
        self
    }

    pub fn set_accept_pointer_events(mut self, accept: bool) -> Self {
        self.accept_pointer_events = accept;
        self
    }

    pub fn set_accept_key_events(mut self, accept: bool) -> Self {
        self.accept_key_events = accept;
        self
    }

    pub fn set_accept_cut_text(mut self, accept: bool) -> Self {
        self.accept_cut_text = accept;
        self
    }

    pub fn set_send_cut_text(mut self, send: bool) -> Self {
        self.send_cut_text = send;
        self
    }

    pub fn set_max_cut_text(mut self, max: usize) -> Self {
        self.max_cut_text = max;
        self
    }

    pub fn set_accept_set_desktop_size(mut self, accept: bool) -> Self {
        self.accept_set_desktop_size = accept;
        self
    }

    /// A comma separated preference list such as `"h264,av1"` or `"auto"`
    ///
    /// Unknown names are skipped
    ///
    pub fn set_video_codecs(mut self, codecs: &str) -> Self {
        self.video_codecs = Codec::parse_list(codecs);
        self
    }

    pub fn set_encoder_params(mut self, params: EncoderParams) -> Self {
        self.encoder = params;
        self
    }

    pub fn set_max_encode_threads(mut self, threads: usize) -> Self {
        self.max_encode_threads = threads.max(1);
        self
    }

    pub fn set_udp_full_frame_frequency(mut self, frames: u32) -> Self {
        self.udp_full_frame_frequency = frames;
        self
    }

    pub fn set_clipboard_delay(mut self, delay: Duration) -> Self {
        self.clipboard_delay = delay;
        self
    }

    pub fn set_congestion_policy(mut self, policy: CongestionPolicy) -> Self {
        self.congestion = policy;
        self
    }

    /// Length of one frame slot
    pub fn frame_interval(&self) -> Duration {
        Duration::from_millis(1000 / self.frame_rate.max(1) as u64)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn encodings_round_trip() {
        for e in [
            VncEncoding::Raw,
            VncEncoding::LastRectPseudo,
            VncEncoding::VMwareCursorPositionPseudo,
            VncEncoding::StreamingModeZlibPseudo,
        ] {
            assert_eq!(VncEncoding::try_from(i32::from(e)), Ok(e));
        }
        assert_eq!(VncEncoding::try_from(16), Err(16));
    }

    #[test]
    fn pixel_format_wire_layout() {
        let mut out = Vec::new();
        PixelFormat::bgra().write(&mut out);
        assert_eq!(
            out,
            vec![32, 24, 0, 1, 0, 255, 0, 255, 0, 255, 16, 8, 0, 0, 0, 0]
        );
        let bytes: [u8; 16] = out.try_into().unwrap();
        assert_eq!(PixelFormat::try_from(bytes).unwrap(), PixelFormat::bgra());
    }

    #[test]
    fn rejects_palette_formats() {
        let mut bytes = [0_u8; 16];
        PixelFormat::rgb565().write(&mut &mut bytes[..]);
        assert!(PixelFormat::try_from(bytes).is_ok());
        bytes[3] = 0;
        assert!(PixelFormat::try_from(bytes).is_err());
        bytes[3] = 1;
        bytes[0] = 24;
        assert!(PixelFormat::try_from(bytes).is_err());
    }

    #[test]
    fn pixel_conversion() {
        let pf = PixelFormat::rgb565();
        let p = pf.pixel_from_rgb(255, 0, 255);
        assert_eq!(p, 0xf81f);
        assert_eq!(pf.rgb_from_pixel(p), (255, 0, 255));
        let mut out = Vec::new();
        pf.put_pixel(&mut out, p);
        assert_eq!(out, vec![0x1f, 0xf8]);
        assert_eq!(pf.read_pixel(&out), p);
    }

    #[test]
    fn builder_clamps() {
        let config = ServerConfig::default()
            .set_frame_rate(0)
            .set_max_encode_threads(0);
        assert_eq!(config.frame_rate, 1);
        assert_eq!(config.max_encode_threads, 1);
        assert_eq!(config.frame_interval(), Duration::from_millis(1000));
    }
}
