use crate::desktop::{ManagedPixelBuffer, PixelBuffer};
use crate::event::Cursor;
use crate::region::{Point, Rect};
use crate::PixelFormat;
use bytes::BufMut;

/// Rich cursor, pixels in the client format followed by the mask
pub fn write_rich_cursor<B: BufMut>(out: &mut B, cursor: &Cursor, pf: &PixelFormat) {
    // +----------------------------+--------------+---------------+
    // | No. of bytes               | Type [Value] | Description   |
    // +----------------------------+--------------+---------------+
    // | width*height*bytesPerPixel | PIXEL array  | cursor-pixels |
    // | div(width+7,8)*height      | U8 array     | bitmask       |
    // +----------------------------+--------------+---------------+
    for px in cursor.data.chunks_exact(4) {
        pf.put_pixel(out, pf.pixel_from_rgb(px[0], px[1], px[2]));
    }
    out.put_slice(&cursor.mask());
}

/// Two colour X cursor, white on black
pub fn write_x_cursor<B: BufMut>(out: &mut B, cursor: &Cursor) {
    if cursor.is_empty() {
        return;
    }
    out.put_slice(&[255, 255, 255]);
    out.put_slice(&[0, 0, 0]);
    out.put_slice(&cursor.bitmap());
    out.put_slice(&cursor.mask());
}

/// Cursor with alpha, sent as a raw encoded RGBA image with premultiplied alpha
pub fn write_alpha_cursor<B: BufMut>(out: &mut B, cursor: &Cursor) {
    out.put_i32(crate::VncEncoding::Raw.into());
    for px in cursor.data.chunks_exact(4) {
        let a = px[3] as u32;
        let pre = |c: u8| (c as u32 * a / 255) as u8;
        out.put_slice(&[pre(px[0]), pre(px[1]), pre(px[2]), px[3]]);
    }
}

/// VMware alpha cursor
pub fn write_vmware_cursor<B: BufMut>(out: &mut B, cursor: &Cursor) {
    out.put_u8(1);
    out.put_u8(0);
    out.put_slice(&cursor.data);
}

/// Blend `cursor` with its hotspot at `pos` into `pb`, whose top left
/// sits at `origin` in framebuffer coordinates
///
/// Returns the framebuffer area that was touched.
pub fn render_cursor(
    pb: &mut ManagedPixelBuffer,
    origin: Point,
    cursor: &Cursor,
    pos: Point,
) -> Rect {
    let target = cursor.rect_at(pos);
    let local = target.translate(origin.negate()).intersect(&pb.rect());
    if local.is_empty() {
        return Rect::default();
    }
    let pf = *pb.format();
    let cursor_tl = target.tl.translate(origin.negate());

    for y in local.tl.y..local.br.y {
        for x in local.tl.x..local.br.x {
            let cx = (x - cursor_tl.x) as usize;
            let cy = (y - cursor_tl.y) as usize;
            let idx = (cy * cursor.width as usize + cx) * 4;
            let px = &cursor.data[idx..idx + 4];
            let a = px[3] as u32;
            if a == 0 {
                continue;
            }
            let p = Point::new(x, y);
            let Some(bg) = pb.get_pixel(p) else {
                continue;
            };
            let (br, bgc, bb) = pf.rgb_from_pixel(bg);
            let mix = |c: u8, b: u8| ((c as u32 * a + b as u32 * (255 - a) + 127) / 255) as u8;
            let colour = pf.pixel_from_rgb(mix(px[0], br), mix(px[1], bgc), mix(px[2], bb));
            pb.fill_rect(Rect::from_xywh(x, y, 1, 1), colour);
        }
    }
    local.translate(origin)
}
