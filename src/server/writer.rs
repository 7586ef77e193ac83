use super::params::ClientParams;
use crate::codec::{write_alpha_cursor, write_rich_cursor, write_vmware_cursor, write_x_cursor};
use crate::desktop::DatagramSink;
use crate::event::ClipboardEntry;
use crate::region::{Point, Rect};
use crate::screen::ScreenSet;
use crate::server::fence::{FENCE_FLAGS_SUPPORTED, MAX_FENCE_PAYLOAD};
use crate::{VncEncoding, VncError};
use bytes::{Buf, BufMut, BytesMut};
use tracing::*;

/// Header value of an update whose length is announced by a LastRect marker
pub const UNKNOWN_RECT_COUNT: u16 = 0xffff;

#[allow(dead_code)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub(crate) enum ServerMsgType {
    FramebufferUpdate = 0,
    Bell = 2,
    ServerCutText = 3,
    EndOfContinuousUpdates = 150,
    Stats = 178,
    RequestFrameStats = 179,
    BinaryClipboard = 180,
    UserJoinedSession = 185,
    UserLeftSession = 186,
    ServerFence = 248,
}

/// Bytes queued for the reliable stream
///
/// The connection loop hands [`unsent`](Self::unsent) to the socket and
/// reports progress with [`consume`](Self::consume).
#[derive(Debug, Default)]
pub struct OutStream {
    buf: BytesMut,
    sent: u64,
}

impl OutStream {
    pub fn new() -> Self {
        Self::default()
    }

    /// Everything ever queued, sent or not
    pub fn length(&self) -> u64 {
        self.sent + self.buf.len() as u64
    }

    /// Bytes queued but not yet accepted by the socket
    pub fn buffer_usage(&self) -> usize {
        self.buf.len()
    }

    pub fn unsent(&self) -> &[u8] {
        &self.buf
    }

    pub fn consume(&mut self, n: usize) {
        let n = n.min(self.buf.len());
        self.buf.advance(n);
        self.sent += n as u64;
    }

    pub fn mark(&self) -> usize {
        self.buf.len()
    }

    /// Drop everything written since `mark`
    pub fn rollback(&mut self, mark: usize) {
        self.buf.truncate(mark);
    }

    fn put_string(&mut self, s: &str) {
        self.buf.put_u32(s.len() as u32);
        self.buf.put_slice(s.as_bytes());
    }
}

/// The unreliable side channel, one datagram per flush
pub struct DatagramStream {
    buf: BytesMut,
    sink: Box<dyn DatagramSink>,
    sent: u64,
}

impl DatagramStream {
    pub fn new(sink: Box<dyn DatagramSink>) -> Self {
        Self {
            buf: BytesMut::new(),
            sink,
            sent: 0,
        }
    }

    pub fn flush(&mut self) -> Result<(), VncError> {
        if self.buf.is_empty() {
            return Ok(());
        }
        let datagram = self.buf.split().freeze();
        self.sent += datagram.len() as u64;
        self.sink.send(datagram)?;
        Ok(())
    }

    pub fn sent(&self) -> u64 {
        self.sent
    }
}

#[derive(Debug, Clone)]
struct ExtendedDesktopSizeMsg {
    reason: u16,
    result: u16,
    fb_width: i32,
    fb_height: i32,
    layout: ScreenSet,
}

/// Frames server messages
///
/// Pseudo rects are requested with the `write_*` helpers returning `bool`
/// (false when the client never asked for them) and emitted at the start of
/// the next framebuffer update.
#[derive(Default)]
pub struct UpdateWriter {
    os: OutStream,
    udp: Option<DatagramStream>,
    n_rects_in_update: usize,
    data_rects_in_update: usize,
    n_rects_in_header: usize,
    unknown_count: bool,
    in_update: bool,

    need_set_desktop_size: bool,
    need_extended_desktop_size: bool,
    extended_desktop_size_msgs: Vec<ExtendedDesktopSizeMsg>,
    need_set_desktop_name: bool,
    need_set_cursor: bool,
    need_set_xcursor: bool,
    need_set_cursor_with_alpha: bool,
    need_set_vmware_cursor: bool,
    need_cursor_pos: bool,
    need_led_state: bool,
    need_qemu_key_event: bool,
}

impl UpdateWriter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn os(&self) -> &OutStream {
        &self.os
    }

    pub fn os_mut(&mut self) -> &mut OutStream {
        &mut self.os
    }

    pub fn set_datagram(&mut self, sink: Option<Box<dyn DatagramSink>>) {
        self.udp = sink.map(DatagramStream::new);
    }

    pub fn has_datagram(&self) -> bool {
        self.udp.is_some()
    }

    pub fn datagram(&self) -> Option<&DatagramStream> {
        self.udp.as_ref()
    }

    pub fn in_update(&self) -> bool {
        self.in_update
    }

    fn udp_active(&self, cp: &ClientParams) -> bool {
        cp.supports_udp && self.udp.is_some()
    }

    /// Where data rect headers and payloads go
    pub fn data_out(&mut self, cp: &ClientParams) -> &mut BytesMut {
        match self.udp.as_mut() {
            Some(udp) if cp.supports_udp => &mut udp.buf,
            _ => &mut self.os.buf,
        }
    }

    fn count_rect(&mut self, what: &str) -> Result<(), VncError> {
        self.n_rects_in_update += 1;
        if !self.unknown_count && self.n_rects_in_update > self.n_rects_in_header {
            return Err(VncError::Protocol(format!("{}: nRects out of sync", what)));
        }
        Ok(())
    }

    pub fn write_server_init(&mut self, cp: &ClientParams) {
        // +--------------+--------------+------------------------------+
        // | No. of bytes | Type [Value] | Description                  |
        // +--------------+--------------+------------------------------+
        // | 2            | U16          | framebuffer-width in pixels  |
        // | 2            | U16          | framebuffer-height in pixels |
        // | 16           | PIXEL_FORMAT | server-pixel-format          |
        // | 4            | U32          | name-length                  |
        // | name-length  | U8 array     | name-string                  |
        // +--------------+--------------+------------------------------+
        self.os.buf.put_u16(cp.width as u16);
        self.os.buf.put_u16(cp.height as u16);
        cp.pf().write(&mut self.os.buf);
        self.os.put_string(cp.name());
    }

    fn start_msg(&mut self, ty: ServerMsgType) {
        self.os.buf.put_u8(ty as u8);
    }

    pub fn write_bell(&mut self) {
        self.start_msg(ServerMsgType::Bell);
    }

    pub fn write_server_cut_text(&mut self, text: &str) {
        self.start_msg(ServerMsgType::ServerCutText);
        self.os.buf.put_bytes(0, 3);
        self.os.put_string(text);
    }

    pub fn write_binary_clipboard(&mut self, entries: &[ClipboardEntry]) {
        // +--------------+--------------+-------------------+
        // | No. of bytes | Type [Value] | Description       |
        // +--------------+--------------+-------------------+
        // | 1            | U8           | number of entries |
        // | 4            | U32          | id                |
        // | 1            | U8           | mime length       |
        // | mime length  | U8 array     | mime type         |
        // | 4            | U32          | data length       |
        // | data length  | U8 array     | data              |
        // +--------------+--------------+-------------------+
        self.start_msg(ServerMsgType::BinaryClipboard);
        let entries = &entries[..entries.len().min(u8::MAX as usize)];
        self.os.buf.put_u8(entries.len() as u8);
        for entry in entries {
            let mime = &entry.mime.as_bytes()[..entry.mime.len().min(u8::MAX as usize)];
            self.os.buf.put_u32(entry.id);
            self.os.buf.put_u8(mime.len() as u8);
            self.os.buf.put_slice(mime);
            self.os.buf.put_u32(entry.data.len() as u32);
            self.os.buf.put_slice(&entry.data);
        }
    }

    pub fn write_stats(&mut self, stats: &str) {
        self.start_msg(ServerMsgType::Stats);
        self.os.buf.put_bytes(0, 3);
        self.os.put_string(stats);
    }

    pub fn write_request_frame_stats(&mut self) {
        self.start_msg(ServerMsgType::RequestFrameStats);
    }

    pub fn write_user_joined(&mut self, user: &str) {
        self.start_msg(ServerMsgType::UserJoinedSession);
        self.os.put_string(user);
    }

    pub fn write_user_left(&mut self, user: &str) {
        self.start_msg(ServerMsgType::UserLeftSession);
        self.os.put_string(user);
    }

    pub fn write_fence(
        &mut self,
        cp: &ClientParams,
        flags: u32,
        payload: &[u8],
    ) -> Result<(), VncError> {
        // +--------------+--------------+-------------+
        // | No. of bytes | Type [Value] | Description |
        // +--------------+--------------+-------------+
        // | 1            | U8 [248]     | type        |
        // | 3            |              | padding     |
        // | 4            | U32          | flags       |
        // | 1            | U8           | length      |
        // | length       | U8 array     | payload     |
        // +--------------+--------------+-------------+
        if !cp.supports_fence {
            return Err(VncError::Unsupported("fences"));
        }
        if payload.len() > MAX_FENCE_PAYLOAD {
            return Err(VncError::Protocol("Too large fence payload".to_string()));
        }
        if flags & !FENCE_FLAGS_SUPPORTED != 0 {
            return Err(VncError::Protocol("Unknown fence flags".to_string()));
        }
        self.start_msg(ServerMsgType::ServerFence);
        self.os.buf.put_bytes(0, 3);
        self.os.buf.put_u32(flags);
        self.os.buf.put_u8(payload.len() as u8);
        self.os.buf.put_slice(payload);
        Ok(())
    }

    pub fn write_end_of_continuous_updates(&mut self, cp: &ClientParams) -> Result<(), VncError> {
        if !cp.supports_continuous_updates {
            return Err(VncError::Unsupported("continuous updates"));
        }
        self.start_msg(ServerMsgType::EndOfContinuousUpdates);
        Ok(())
    }

    pub fn write_set_desktop_size(&mut self, cp: &ClientParams) -> bool {
        if !cp.supports_desktop_resize {
            return false;
        }
        self.need_set_desktop_size = true;
        true
    }

    /// Announce the current layout, with reason and result zero
    pub fn write_extended_desktop_size(&mut self, cp: &ClientParams) -> bool {
        if !cp.supports_extended_desktop_size {
            return false;
        }
        self.need_extended_desktop_size = true;
        true
    }

    pub fn write_extended_desktop_size_msg(
        &mut self,
        cp: &ClientParams,
        reason: u16,
        result: u16,
        fb_width: i32,
        fb_height: i32,
        layout: &ScreenSet,
    ) -> bool {
        if !cp.supports_extended_desktop_size {
            return false;
        }
        self.extended_desktop_size_msgs.push(ExtendedDesktopSizeMsg {
            reason,
            result,
            fb_width,
            fb_height,
            layout: layout.clone(),
        });
        true
    }

    pub fn write_set_desktop_name(&mut self, cp: &ClientParams) -> bool {
        if !cp.supports_desktop_rename {
            return false;
        }
        self.need_set_desktop_name = true;
        true
    }

    /// Queue the cursor shape in the best form the client understands
    pub fn write_cursor(&mut self, cp: &ClientParams) -> bool {
        if cp.supports_vmware_cursor {
            self.need_set_vmware_cursor = true;
        } else if cp.supports_local_cursor_with_alpha {
            self.need_set_cursor_with_alpha = true;
        } else if cp.supports_local_cursor {
            self.need_set_cursor = true;
        } else if cp.supports_local_xcursor {
            self.need_set_xcursor = true;
        } else {
            return false;
        }
        true
    }

    pub fn write_cursor_pos(&mut self, cp: &ClientParams) -> Result<(), VncError> {
        if !cp.supports_cursor_position {
            return Err(VncError::Unsupported("cursor position"));
        }
        self.need_cursor_pos = true;
        Ok(())
    }

    pub fn write_led_state(&mut self, cp: &ClientParams) -> bool {
        if !cp.supports_led_state || cp.led_state().is_none() {
            return false;
        }
        self.need_led_state = true;
        true
    }

    pub fn write_qemu_key_event(&mut self, cp: &ClientParams) -> bool {
        if !cp.supports_qemu_key_event {
            return false;
        }
        self.need_qemu_key_event = true;
        true
    }

    /// Something has to be sent even if no pixels changed
    pub fn need_fake_update(&self) -> bool {
        self.need_set_desktop_name
            || self.need_set_cursor
            || self.need_set_xcursor
            || self.need_set_cursor_with_alpha
            || self.need_set_vmware_cursor
            || self.need_cursor_pos
            || self.need_led_state
            || self.need_qemu_key_event
            || self.need_no_data_update()
    }

    /// A resize is pending, which has to go out before any pixel data
    pub fn need_no_data_update(&self) -> bool {
        self.need_set_desktop_size
            || self.need_extended_desktop_size
            || !self.extended_desktop_size_msgs.is_empty()
    }

    pub fn write_no_data_update(&mut self, cp: &ClientParams) -> Result<(), VncError> {
        let mut n_rects = self.extended_desktop_size_msgs.len();
        if self.need_set_desktop_size {
            n_rects += 1;
        }
        if self.need_extended_desktop_size {
            n_rects += 1;
        }
        self.write_framebuffer_update_start(cp, n_rects as u16)?;
        self.write_no_data_rects(cp)?;
        self.write_framebuffer_update_end(cp)
    }

    /// `n_rects` counts data and resize rects; pending pseudo rects are added
    /// unless it is [`UNKNOWN_RECT_COUNT`]
    pub fn write_framebuffer_update_start(
        &mut self,
        cp: &ClientParams,
        n_rects: u16,
    ) -> Result<(), VncError> {
        // +--------------+--------------+----------------------+
        // | No. of bytes | Type [Value] | Description          |
        // +--------------+--------------+----------------------+
        // | 1            | U8 [0]       | message-type         |
        // | 1            |              | padding              |
        // | 2            | U16          | number-of-rectangles |
        // +--------------+--------------+----------------------+
        let mut n_rects = n_rects as usize;
        if n_rects != UNKNOWN_RECT_COUNT as usize {
            n_rects += [
                self.need_set_desktop_name,
                self.need_set_cursor,
                self.need_set_xcursor,
                self.need_set_cursor_with_alpha,
                self.need_set_vmware_cursor,
                self.need_cursor_pos,
                self.need_led_state,
                self.need_qemu_key_event,
            ]
            .iter()
            .filter(|need| **need)
            .count();
            if n_rects >= UNKNOWN_RECT_COUNT as usize {
                return Err(VncError::Protocol("Too many rects in update".to_string()));
            }
        }

        self.start_msg(ServerMsgType::FramebufferUpdate);
        self.os.buf.put_u8(0);
        self.os.buf.put_u16(n_rects as u16);

        self.n_rects_in_update = 0;
        self.data_rects_in_update = 0;
        self.unknown_count = n_rects == UNKNOWN_RECT_COUNT as usize;
        self.n_rects_in_header = if self.unknown_count { 0 } else { n_rects };
        self.in_update = true;

        self.write_pseudo_rects(cp)
    }

    pub fn write_framebuffer_update_end(&mut self, cp: &ClientParams) -> Result<(), VncError> {
        self.in_update = false;
        if !self.unknown_count && self.n_rects_in_update != self.n_rects_in_header {
            return Err(VncError::Protocol(format!(
                "nRects out of sync: {} of {} written",
                self.n_rects_in_update, self.n_rects_in_header
            )));
        }

        if self.unknown_count {
            write_rect_header(
                &mut self.os.buf,
                &Rect::default(),
                VncEncoding::LastRectPseudo,
            );

            let data_rects = self.data_rects_in_update;
            if self.udp_active(cp) {
                if let Some(udp) = self.udp.as_mut() {
                    // flip marker, x carries the number of data rects
                    udp.buf.put_i16(data_rects as i16);
                    udp.buf.put_i16(0);
                    udp.buf.put_u16(0);
                    udp.buf.put_u16(0);
                    udp.buf.put_i32(VncEncoding::LastRectPseudo.into());
                    udp.flush()?;
                }
            }
        }
        Ok(())
    }

    /// Header of a data rect; the payload follows in [`data_out`](Self::data_out)
    pub fn start_rect(
        &mut self,
        cp: &ClientParams,
        r: &Rect,
        encoding: VncEncoding,
    ) -> Result<(), VncError> {
        self.count_rect("start_rect")?;
        self.data_rects_in_update += 1;
        write_rect_header(self.data_out(cp), r, encoding);
        Ok(())
    }

    /// Each data rect is one datagram on the side channel
    pub fn end_rect(&mut self, cp: &ClientParams) -> Result<(), VncError> {
        if self.udp_active(cp) {
            if let Some(udp) = self.udp.as_mut() {
                udp.flush()?;
            }
        }
        Ok(())
    }

    pub fn write_copy_rect(
        &mut self,
        cp: &ClientParams,
        r: &Rect,
        src: Point,
    ) -> Result<(), VncError> {
        self.start_rect(cp, r, VncEncoding::CopyRect)?;
        let out = self.data_out(cp);
        out.put_u16(src.x as u16);
        out.put_u16(src.y as u16);
        self.end_rect(cp)
    }

    fn write_pseudo_rects(&mut self, cp: &ClientParams) -> Result<(), VncError> {
        let cursor = cp.cursor();

        if self.need_set_cursor {
            self.count_rect("cursor")?;
            write_cursor_header(&mut self.os.buf, cp, VncEncoding::CursorPseudo);
            write_rich_cursor(&mut self.os.buf, cursor, cp.pf());
            self.need_set_cursor = false;
        }

        if self.need_set_xcursor {
            self.count_rect("x cursor")?;
            write_cursor_header(&mut self.os.buf, cp, VncEncoding::XCursorPseudo);
            write_x_cursor(&mut self.os.buf, cursor);
            self.need_set_xcursor = false;
        }

        if self.need_set_cursor_with_alpha {
            self.count_rect("alpha cursor")?;
            write_cursor_header(&mut self.os.buf, cp, VncEncoding::CursorWithAlphaPseudo);
            write_alpha_cursor(&mut self.os.buf, cursor);
            self.need_set_cursor_with_alpha = false;
        }

        if self.need_set_vmware_cursor {
            self.count_rect("vmware cursor")?;
            write_cursor_header(&mut self.os.buf, cp, VncEncoding::VMwareCursorPseudo);
            write_vmware_cursor(&mut self.os.buf, cursor);
            self.need_set_vmware_cursor = false;
        }

        if self.need_cursor_pos {
            if !cp.supports_cursor_position {
                return Err(VncError::Unsupported("cursor position"));
            }
            self.count_rect("cursor position")?;
            let pos = cp.cursor_pos();
            write_rect_header(
                &mut self.os.buf,
                &Rect::new(pos.x, pos.y, pos.x, pos.y),
                VncEncoding::VMwareCursorPositionPseudo,
            );
            self.need_cursor_pos = false;
        }

        if self.need_set_desktop_name {
            self.count_rect("desktop name")?;
            write_rect_header(&mut self.os.buf, &Rect::default(), VncEncoding::DesktopNamePseudo);
            self.os.put_string(cp.name());
            self.need_set_desktop_name = false;
        }

        if self.need_led_state {
            let Some(state) = cp.led_state() else {
                return Err(VncError::Protocol("Server LED state is unknown".to_string()));
            };
            self.count_rect("led state")?;
            write_rect_header(&mut self.os.buf, &Rect::default(), VncEncoding::LedStatePseudo);
            self.os.buf.put_u8(state);
            self.need_led_state = false;
        }

        if self.need_qemu_key_event {
            self.count_rect("qemu key event")?;
            write_rect_header(&mut self.os.buf, &Rect::default(), VncEncoding::QemuKeyEventPseudo);
            self.need_qemu_key_event = false;
        }
        Ok(())
    }

    fn write_no_data_rects(&mut self, cp: &ClientParams) -> Result<(), VncError> {
        for msg in std::mem::take(&mut self.extended_desktop_size_msgs) {
            self.write_extended_desktop_size_rect(
                cp,
                msg.reason,
                msg.result,
                msg.fb_width,
                msg.fb_height,
                &msg.layout,
            )?;
        }

        // before DesktopSize, some clients stop reading after that one
        if self.need_extended_desktop_size {
            self.write_extended_desktop_size_rect(cp, 0, 0, cp.width, cp.height, &cp.layout)?;
            self.need_extended_desktop_size = false;
        }

        if self.need_set_desktop_size {
            if !cp.supports_desktop_resize {
                return Err(VncError::Unsupported("desktop resize"));
            }
            self.count_rect("desktop size")?;
            write_rect_header(
                &mut self.os.buf,
                &Rect::new(0, 0, cp.width, cp.height),
                VncEncoding::DesktopSizePseudo,
            );
            self.need_set_desktop_size = false;
        }
        Ok(())
    }

    fn write_extended_desktop_size_rect(
        &mut self,
        cp: &ClientParams,
        reason: u16,
        result: u16,
        fb_width: i32,
        fb_height: i32,
        layout: &ScreenSet,
    ) -> Result<(), VncError> {
        // +--------------+--------------+-------------------+
        // | No. of bytes | Type [Value] | Description       |
        // +--------------+--------------+-------------------+
        // | 1            | U8           | number-of-screens |
        // | 3            |              | padding           |
        // | 4            | U32          | id                |
        // | 2            | U16          | x-position        |
        // | 2            | U16          | y-position        |
        // | 2            | U16          | width             |
        // | 2            | U16          | height            |
        // | 4            | U32          | flags             |
        // +--------------+--------------+-------------------+
        if !cp.supports_extended_desktop_size {
            return Err(VncError::Unsupported("extended desktop resize"));
        }
        self.count_rect("extended desktop size")?;
        let buf = &mut self.os.buf;
        buf.put_u16(reason);
        buf.put_u16(result);
        buf.put_u16(fb_width as u16);
        buf.put_u16(fb_height as u16);
        buf.put_i32(VncEncoding::ExtendedDesktopSizePseudo.into());
        buf.put_u8(layout.num_screens() as u8);
        buf.put_bytes(0, 3);
        for screen in layout {
            buf.put_u32(screen.id);
            buf.put_u16(screen.dimensions.tl.x as u16);
            buf.put_u16(screen.dimensions.tl.y as u16);
            buf.put_u16(screen.dimensions.width() as u16);
            buf.put_u16(screen.dimensions.height() as u16);
            buf.put_u32(screen.flags);
        }
        Ok(())
    }

    /// Return to the reliable stream only
    pub fn udp_downgrade(&mut self, cp: &mut ClientParams) {
        if self.udp.take().is_some() {
            info!("Downgrading client to the reliable stream");
        }
        cp.supports_udp = false;
    }
}

/// `(x: s16, y: s16, w: u16, h: u16, encoding: s32)`
pub(crate) fn write_rect_header<B: BufMut>(out: &mut B, r: &Rect, encoding: VncEncoding) {
    out.put_i16(r.tl.x as i16);
    out.put_i16(r.tl.y as i16);
    out.put_u16(r.width() as u16);
    out.put_u16(r.height() as u16);
    out.put_i32(encoding.into());
}

fn write_cursor_header<B: BufMut>(out: &mut B, cp: &ClientParams, encoding: VncEncoding) {
    let cursor = cp.cursor();
    write_rect_header(
        out,
        &Rect::from_xywh(cursor.hotspot.x, cursor.hotspot.y, cursor.width, cursor.height),
        encoding,
    );
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::event::Cursor;
    use crate::screen::Screen;
    use crate::PixelFormat;
    use bytes::Bytes;
    use tokio::sync::mpsc;

    fn params(encodings: &[VncEncoding]) -> ClientParams {
        let mut cp = ClientParams::new(800, 600, ScreenSet::single(800, 600), PixelFormat::bgra(), "desk");
        let list: Vec<i32> = encodings.iter().map(|e| i32::from(*e)).collect();
        cp.set_encodings(&list);
        cp
    }

    #[test]
    fn known_count_must_match() {
        let cp = params(&[]);
        let mut w = UpdateWriter::new();
        w.write_framebuffer_update_start(&cp, 2).unwrap();
        w.start_rect(&cp, &Rect::new(0, 0, 10, 10), VncEncoding::Raw).unwrap();
        w.end_rect(&cp).unwrap();
        assert!(w.write_framebuffer_update_end(&cp).is_err());

        let mut w = UpdateWriter::new();
        w.write_framebuffer_update_start(&cp, 1).unwrap();
        w.start_rect(&cp, &Rect::new(0, 0, 10, 10), VncEncoding::Raw).unwrap();
        assert!(w.start_rect(&cp, &Rect::new(0, 0, 10, 10), VncEncoding::Raw).is_err());
    }

    #[test]
    fn unknown_count_ends_with_last_rect() {
        let cp = params(&[VncEncoding::DesktopNamePseudo]);
        let mut w = UpdateWriter::new();
        assert!(w.write_set_desktop_name(&cp));
        w.write_framebuffer_update_start(&cp, UNKNOWN_RECT_COUNT).unwrap();
        w.start_rect(&cp, &Rect::new(0, 0, 1, 1), VncEncoding::Raw).unwrap();
        w.data_out(&cp).put_slice(&[1, 2, 3, 4]);
        w.end_rect(&cp).unwrap();
        w.write_framebuffer_update_end(&cp).unwrap();

        let out = w.os().unsent();
        assert_eq!(&out[..4], &[0, 0, 0xff, 0xff]);
        // desktop name: header + u32 len + "desk"
        assert_eq!(&out[4 + 8..4 + 12], &(-307_i32).to_be_bytes());
        assert_eq!(&out[16..24], &[0, 0, 0, 4, b'd', b'e', b's', b'k']);
        let tail = &out[out.len() - 12..];
        assert_eq!(tail, &[0, 0, 0, 0, 0, 0, 0, 0, 0xff, 0xff, 0xff, 0x20]);
        assert_eq!(out.len(), 4 + 16 + 4 + 12 + 4 + 12);
    }

    #[test]
    fn pseudo_rects_are_counted() {
        let mut cp = params(&[
            VncEncoding::CursorPseudo,
            VncEncoding::VMwareCursorPositionPseudo,
            VncEncoding::LedStatePseudo,
        ]);
        cp.set_cursor(Cursor::new(1, 1, Point::new(0, 0), vec![255, 255, 255, 255]).unwrap());
        let mut w = UpdateWriter::new();
        assert!(w.write_cursor(&cp));
        w.write_cursor_pos(&cp).unwrap();
        // LED state unknown
        assert!(!w.write_led_state(&cp));
        cp.set_led_state(Some(2));
        assert!(w.write_led_state(&cp));
        assert!(w.need_fake_update());
        assert!(!w.need_no_data_update());

        w.write_framebuffer_update_start(&cp, 0).unwrap();
        w.write_framebuffer_update_end(&cp).unwrap();
        assert_eq!(&w.os().unsent()[2..4], &[0, 3]);
        assert!(!w.need_fake_update());
    }

    #[test]
    fn missing_capabilities() {
        let cp = params(&[]);
        let mut w = UpdateWriter::new();
        assert!(!w.write_cursor(&cp));
        assert!(!w.write_set_desktop_size(&cp));
        assert!(!w.write_extended_desktop_size(&cp));
        assert!(w.write_cursor_pos(&cp).is_err());
        assert!(w.write_fence(&cp, 0, &[]).is_err());
        assert!(w.write_end_of_continuous_updates(&cp).is_err());
        assert_eq!(w.os().buffer_usage(), 0);
    }

    #[test]
    fn no_data_update_orders_resizes() {
        let mut cp = params(&[
            VncEncoding::DesktopSizePseudo,
            VncEncoding::ExtendedDesktopSizePseudo,
        ]);
        let layout: ScreenSet = vec![
            Screen::new(0, 0, 0, 400, 600, 0),
            Screen::new(1, 400, 0, 400, 600, 0),
        ]
        .into();
        cp.layout = layout.clone();
        let mut w = UpdateWriter::new();
        assert!(w.write_extended_desktop_size_msg(&cp, 1, 0, 800, 600, &layout));
        assert!(w.write_extended_desktop_size(&cp));
        assert!(w.write_set_desktop_size(&cp));
        w.write_no_data_update(&cp).unwrap();

        let out = w.os().unsent();
        assert_eq!(&out[..4], &[0, 0, 0, 3]);
        let eds_len = 12 + 4 + 2 * 16;
        // the reason of the first rect
        assert_eq!(&out[4..6], &[0, 1]);
        assert_eq!(&out[4 + eds_len..4 + eds_len + 2], &[0, 0]);
        let last = &out[4 + 2 * eds_len..];
        assert_eq!(last, &[0, 0, 0, 0, 0x03, 0x20, 0x02, 0x58, 0xff, 0xff, 0xff, 0x21]);
        assert!(!w.need_no_data_update());
    }

    #[test]
    fn fence_framing() {
        let cp = params(&[VncEncoding::FencePseudo]);
        let mut w = UpdateWriter::new();
        w.write_fence(&cp, 0x8000_0001, &[1]).unwrap();
        assert_eq!(w.os().unsent(), &[248, 0, 0, 0, 0x80, 0, 0, 1, 1, 1]);
        assert!(w.write_fence(&cp, 0x10, &[]).is_err());
        assert!(w.write_fence(&cp, 0, &[0; 65]).is_err());
    }

    #[test]
    fn rollback_and_consume() {
        let mut w = UpdateWriter::new();
        w.write_bell();
        let mark = w.os().mark();
        w.write_stats("[ 10.0 ]");
        w.os_mut().rollback(mark);
        assert_eq!(w.os().unsent(), &[2]);
        w.os_mut().consume(1);
        assert_eq!(w.os().buffer_usage(), 0);
        assert_eq!(w.os().length(), 1);
    }

    #[test]
    fn datagram_side_channel() {
        let cp = params(&[VncEncoding::UdpPseudo]);
        let (tx, mut rx) = mpsc::unbounded_channel::<Bytes>();
        let mut w = UpdateWriter::new();
        w.set_datagram(Some(Box::new(tx)));
        w.write_framebuffer_update_start(&cp, UNKNOWN_RECT_COUNT).unwrap();
        for _ in 0..2 {
            w.start_rect(&cp, &Rect::new(0, 0, 2, 1), VncEncoding::Raw).unwrap();
            w.data_out(&cp).put_slice(&[0; 8]);
            w.end_rect(&cp).unwrap();
        }
        w.write_framebuffer_update_end(&cp).unwrap();

        // only the header and the last rect marker on the stream
        assert_eq!(w.os().buffer_usage(), 4 + 12);
        assert_eq!(rx.try_recv().unwrap().len(), 12 + 8);
        assert_eq!(rx.try_recv().unwrap().len(), 12 + 8);
        let flip = rx.try_recv().unwrap();
        assert_eq!(&flip[..2], &[0, 2]);
        assert!(rx.try_recv().is_err());

        let mut cp = cp;
        w.udp_downgrade(&mut cp);
        assert!(!w.has_datagram() && !cp.supports_udp);
    }
}
