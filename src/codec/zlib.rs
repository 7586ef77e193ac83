use super::{write_compact, Codec, VideoEncoder};
use crate::config::EncoderParams;
use crate::desktop::PixelBuffer;
use crate::region::Rect;
use crate::screen::{Screen, MAX_SCREEN_ID};
use crate::VncError;
use bytes::{BufMut, BytesMut};
use flate2::{Compress, Compression, FlushCompress, Status};
use tracing::*;

/// Lossless software encoder shipped with the crate
///
/// Key frames carry the screen pixels in the server's native format, other
/// frames the byte wise XOR against the previous frame. Every frame is a
/// complete zlib stream.
pub struct SoftwareEncoder {
    id: u8,
    rect: Rect,
    params: EncoderParams,
    compressor: Compress,
    previous: Option<Vec<u8>>,
    frames: u64,
    force_key: bool,
    packet: Vec<u8>,
    key_frame: bool,
}

impl SoftwareEncoder {
    pub fn new(screen: &Screen, params: &EncoderParams) -> Result<Self, VncError> {
        if screen.id > MAX_SCREEN_ID {
            return Err(VncError::EncoderUnavailable(format!(
                "screen id {} out of range",
                screen.id
            )));
        }
        if screen.dimensions.is_empty() {
            return Err(VncError::EncoderUnavailable(format!(
                "screen {} has no area",
                screen.id
            )));
        }
        let level = Compression::new(params.quality.min(9) as u32);
        debug!(
            "Software encoder for screen {} ({}x{}), gop {}",
            screen.id,
            screen.dimensions.width(),
            screen.dimensions.height(),
            params.group_of_pictures
        );
        Ok(Self {
            id: screen.id as u8,
            rect: screen.dimensions,
            params: *params,
            compressor: Compress::new(level, true),
            previous: None,
            frames: 0,
            force_key: true,
            packet: Vec::new(),
            key_frame: false,
        })
    }

    fn compress(&mut self, input: &[u8]) -> Result<Vec<u8>, VncError> {
        let mut out = Vec::with_capacity(input.len() / 4 + 64);
        self.compressor.reset();
        let start = self.compressor.total_in();
        loop {
            let consumed = (self.compressor.total_in() - start) as usize;
            let status = self
                .compressor
                .compress_vec(&input[consumed..], &mut out, FlushCompress::Finish)
                .map_err(|e| VncError::Custom(format!("zlib: {}", e)))?;
            match status {
                Status::StreamEnd => return Ok(out),
                Status::Ok | Status::BufError => out.reserve(out.capacity().max(64)),
            }
        }
    }
}

impl VideoEncoder for SoftwareEncoder {
    fn codec(&self) -> Codec {
        Codec::Zlib
    }

    fn screen_id(&self) -> u8 {
        self.id
    }

    fn rect(&self) -> Rect {
        self.rect
    }

    fn render(&mut self, pb: &dyn PixelBuffer) -> Result<bool, VncError> {
        let area = Rect::from_xywh(0, 0, self.rect.width(), self.rect.height());
        let Some((data, stride)) = pb.buffer(area) else {
            return Err(VncError::Custom(format!(
                "screen {} does not fit the pixel buffer",
                self.id
            )));
        };
        let bpp = pb.format().bytes_per_pixel();
        let row_len = area.width() as usize * bpp;
        let mut frame = Vec::with_capacity(row_len * area.height() as usize);
        for y in 0..area.height() as usize {
            let start = y * stride * bpp;
            let row = data
                .get(start..start + row_len)
                .ok_or_else(|| VncError::Custom("short pixel buffer".to_string()))?;
            frame.extend_from_slice(row);
        }

        let gop = self.params.group_of_pictures.max(1) as u64;
        let key_frame = self.force_key
            || self.frames % gop == 0
            || self.previous.as_ref().map(Vec::len) != Some(frame.len());

        let payload = if key_frame {
            self.compress(&frame)?
        } else {
            let previous = self.previous.as_deref().unwrap_or_default();
            if previous == frame.as_slice() {
                return Ok(false);
            }
            let delta: Vec<u8> = frame.iter().zip(previous).map(|(a, b)| a ^ b).collect();
            self.compress(&delta)?
        };

        if key_frame {
            trace!("Key frame {} on screen {}", self.frames, self.id);
        }
        self.packet = payload;
        self.key_frame = key_frame;
        self.force_key = false;
        self.frames += 1;
        self.previous = Some(frame);
        Ok(true)
    }

    fn write_rect(&mut self, out: &mut BytesMut) {
        out.put_u8(self.id);
        out.put_u8(Codec::Zlib.msg_id());
        out.put_u8(self.key_frame as u8);
        write_compact(out, self.packet.len());
        out.put_slice(&self.packet);
        trace!(
            "Screen id {}, codec {}, frame size: {}",
            self.id,
            Codec::Zlib.msg_id(),
            self.packet.len()
        );
        self.packet.clear();
    }

    fn request_key_frame(&mut self) {
        self.force_key = true;
    }
}
