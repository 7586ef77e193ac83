use crate::desktop::PixelBuffer;
use crate::region::Rect;
use crate::PixelFormat;
use bytes::BufMut;

/// Raw encoding, pixels translated into the client's format
pub struct Encoder {
    pf: PixelFormat,
}

impl Encoder {
    pub fn new(pf: PixelFormat) -> Self {
        Self { pf }
    }

    /// Bytes the rect takes on the wire
    pub fn encoded_len(&self, rect: &Rect) -> usize {
        rect.area().max(0) as usize * self.pf.bytes_per_pixel()
    }

    /// `rect` is in the coordinates of `pb`; rows outside it are not written
    pub fn write_rect<B: BufMut>(&self, pb: &dyn PixelBuffer, rect: &Rect, out: &mut B) {
        // +----------------------------+--------------+-------------+
        // | No. of bytes               | Type [Value] | Description |
        // +----------------------------+--------------+-------------+
        // | width*height*bytesPerPixel | PIXEL array  | pixels      |
        // +----------------------------+--------------+-------------+
        let Some((data, stride)) = pb.buffer(*rect) else {
            return;
        };
        let src_pf = pb.format();
        let src_bpp = src_pf.bytes_per_pixel();
        let row_len = rect.width() as usize * src_bpp;

        for y in 0..rect.height() as usize {
            let start = y * stride * src_bpp;
            let Some(row) = data.get(start..start + row_len) else {
                return;
            };
            if *src_pf == self.pf {
                out.put_slice(row);
                continue;
            }
            for px in row.chunks_exact(src_bpp) {
                let (r, g, b) = src_pf.rgb_from_pixel(src_pf.read_pixel(px));
                self.pf.put_pixel(out, self.pf.pixel_from_rgb(r, g, b));
            }
        }
    }
}
