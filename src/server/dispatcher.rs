//! Per screen video encoders of one connection.
//!
//! Screens are encoded concurrently on the blocking pool, the results are
//! written in ascending screen id so the wire order never depends on which
//! encode finished first.

use super::params::ClientParams;
use super::stats::EncodeStats;
use super::writer::UpdateWriter;
use crate::codec::{create_encoder, render_cursor, solid_colour, Codec, EncoderBackend, VideoEncoder, MSG_SKIP};
use crate::config::EncoderParams;
use crate::desktop::{ManagedPixelBuffer, PixelBuffer};
use crate::event::Cursor;
use crate::region::{Point, Rect, Region};
use crate::screen::{Screen, ScreenSet, MAX_SCREEN_ID};
use crate::{VncEncoding, VncError};
use bytes::{BufMut, BytesMut};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::Semaphore;
use tracing::*;

const SLOTS: usize = MAX_SCREEN_ID as usize + 1;

struct ScreenSlot {
    screen: Screen,
    encoder: Option<Box<dyn VideoEncoder>>,
    dirty: bool,
}

/// Live screen ids, one bit each
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
struct ScreenMask([u64; SLOTS / 64]);

impl ScreenMask {
    fn set(&mut self, id: usize) {
        self.0[id / 64] |= 1 << (id % 64);
    }

    fn clear(&mut self, id: usize) {
        self.0[id / 64] &= !(1 << (id % 64));
    }

    fn contains(&self, id: usize) -> bool {
        self.0[id / 64] & (1 << (id % 64)) != 0
    }

    fn count(&self) -> usize {
        self.0.iter().map(|w| w.count_ones() as usize).sum()
    }

    /// Ascending ids
    fn iter(self) -> impl Iterator<Item = usize> {
        (0..SLOTS).filter(move |id| self.contains(*id))
    }
}

/// Pixels of one dirty screen, ready to be encoded off the connection task
pub struct ScreenJob {
    id: u8,
    rect: Rect,
    pixels: ManagedPixelBuffer,
    encoder: Option<Box<dyn VideoEncoder>>,
}

impl ScreenJob {
    pub fn id(&self) -> u8 {
        self.id
    }

    pub fn rect(&self) -> Rect {
        self.rect
    }
}

struct ScreenResult {
    id: u8,
    rect: Rect,
    encoder: Option<Box<dyn VideoEncoder>>,
    payload: Result<BytesMut, VncError>,
}

fn encode_screen(job: ScreenJob) -> ScreenResult {
    let ScreenJob {
        id,
        rect,
        pixels,
        mut encoder,
    } = job;
    let payload = match encoder.as_mut() {
        Some(encoder) => {
            let mut out = BytesMut::new();
            let written = match solid_colour(&pixels) {
                Some(colour) => encoder.write_solid_rect(&mut out, pixels.format(), colour),
                None => encoder.render(&pixels).map(|changed| {
                    if changed {
                        encoder.write_rect(&mut out);
                    } else {
                        encoder.write_skip_rect(&mut out);
                    }
                }),
            };
            written.map(|_| out)
        }
        None => Err(VncError::EncoderUnavailable(format!("screen {}", id))),
    };
    ScreenResult {
        id,
        rect,
        encoder,
        payload,
    }
}

/// Maps the screen layout to video encoders
pub struct EncodeDispatcher {
    codec: Codec,
    params: EncoderParams,
    backend: Option<Arc<dyn EncoderBackend>>,
    pool: Arc<Semaphore>,
    slots: Box<[Option<ScreenSlot>; SLOTS]>,
    live: ScreenMask,
    encode_time: Duration,
}

impl EncodeDispatcher {
    pub fn new(
        codec: Codec,
        params: EncoderParams,
        backend: Option<Arc<dyn EncoderBackend>>,
        pool: Arc<Semaphore>,
    ) -> Self {
        Self {
            codec,
            params,
            backend,
            pool,
            slots: Box::new(std::array::from_fn(|_| None)),
            live: ScreenMask::default(),
            encode_time: Duration::ZERO,
        }
    }

    pub fn codec(&self) -> Codec {
        self.codec
    }

    /// Switching codecs drops every encoder, they are rebuilt on demand
    pub fn set_codec(&mut self, codec: Codec) {
        if codec == self.codec {
            return;
        }
        info!("Switching video codec from {} to {}", self.codec, codec);
        self.codec = codec;
        for id in self.live.iter() {
            if let Some(slot) = self.slots[id].as_mut() {
                slot.encoder = None;
                slot.dirty = true;
            }
        }
    }

    pub fn num_screens(&self) -> usize {
        self.live.count()
    }

    pub fn screen_ids(&self) -> Vec<u8> {
        self.live.iter().map(|id| id as u8).collect()
    }

    pub fn dirty_ids(&self) -> Vec<u8> {
        self.live
            .iter()
            .filter(|id| self.slots[*id].as_ref().map_or(false, |s| s.dirty))
            .map(|id| id as u8)
            .collect()
    }

    pub fn has_encoder(&self, id: u8) -> bool {
        self.slots[id as usize]
            .as_ref()
            .map_or(false, |s| s.encoder.is_some())
    }

    /// Time the last [`encode`](Self::encode) spent rendering
    pub fn encode_time(&self) -> Duration {
        self.encode_time
    }

    /// Follow a new layout: moved or resized screens get a fresh encoder,
    /// screens that are gone are torn down
    pub fn sync_layout(&mut self, layout: &ScreenSet) {
        let mut seen = ScreenMask::default();
        for screen in layout.iter() {
            if screen.id > MAX_SCREEN_ID {
                warn!("Ignoring screen id {} out of range", screen.id);
                continue;
            }
            let id = screen.id as usize;
            seen.set(id);
            let slot = &mut self.slots[id];
            match slot {
                Some(current) if current.screen.dimensions == screen.dimensions => {
                    current.screen = *screen;
                }
                _ => {
                    debug!(
                        "Screen {} now at {:?}, encoder recreated lazily",
                        screen.id, screen.dimensions
                    );
                    *slot = Some(ScreenSlot {
                        screen: *screen,
                        encoder: None,
                        dirty: true,
                    });
                }
            }
        }
        for id in self.live.iter() {
            if !seen.contains(id) {
                debug!("Screen {} removed", id);
                self.slots[id] = None;
            }
        }
        self.live = seen;
    }

    /// Mark the screens touched by `region`, returns how many are dirty now
    pub fn mark_dirty(&mut self, region: &Region) -> usize {
        let mut dirty = 0;
        for id in self.live.iter() {
            if let Some(slot) = self.slots[id].as_mut() {
                if !slot.dirty && !region.intersect_rect(slot.screen.dimensions).is_empty() {
                    slot.dirty = true;
                }
                dirty += slot.dirty as usize;
            }
        }
        dirty
    }

    pub fn mark_all_dirty(&mut self) {
        for id in self.live.iter() {
            if let Some(slot) = self.slots[id].as_mut() {
                slot.dirty = true;
            }
        }
    }

    pub fn request_key_frames(&mut self) {
        for id in self.live.iter() {
            if let Some(encoder) = self.slots[id].as_mut().and_then(|s| s.encoder.as_mut()) {
                encoder.request_key_frame();
            }
        }
    }

    fn ensure_encoder(&mut self, id: usize) -> Result<(), VncError> {
        let codec = self.codec;
        let params = self.params;
        let backend = self.backend.clone();
        let Some(slot) = self.slots[id].as_mut() else {
            return Ok(());
        };
        if slot.encoder.is_none() {
            slot.encoder = Some(create_encoder(backend.as_deref(), codec, &slot.screen, &params)?);
        }
        Ok(())
    }

    /// Take a copy of every dirty screen out of `pb`, with the cursor drawn in
    /// when `cursor` is given
    ///
    /// The dirty marks are cleared, the pixels no longer depend on `pb`.
    /// Fails with [`VncError::EncoderUnavailable`] when a screen cannot get
    /// an encoder for the negotiated codec.
    pub fn snapshot(
        &mut self,
        pb: &dyn PixelBuffer,
        cursor: Option<(&Cursor, Point)>,
    ) -> Result<Vec<ScreenJob>, VncError> {
        let mut jobs = Vec::new();
        for id in self.live.iter() {
            if !self.slots[id].as_ref().map_or(false, |s| s.dirty) {
                continue;
            }
            self.ensure_encoder(id)?;
            let Some(slot) = self.slots[id].as_mut() else {
                continue;
            };
            slot.dirty = false;
            let rect = slot.screen.dimensions;
            let mut pixels = ManagedPixelBuffer::snapshot(pb, rect);
            if let Some((cursor, pos)) = cursor {
                render_cursor(&mut pixels, rect.tl, cursor, pos);
            }
            jobs.push(ScreenJob {
                id: id as u8,
                rect,
                pixels,
                encoder: slot.encoder.take(),
            });
        }
        Ok(jobs)
    }

    /// Encode `jobs` and append one video rect per screen to the update
    /// that `writer` has open
    pub async fn encode(
        &mut self,
        jobs: Vec<ScreenJob>,
        writer: &mut UpdateWriter,
        cp: &ClientParams,
    ) -> Result<EncodeStats, VncError> {
        let started = Instant::now();
        let mut results = if jobs.len() <= 1 {
            jobs.into_iter().map(encode_screen).collect::<Vec<_>>()
        } else {
            let mut screens = Vec::with_capacity(jobs.len());
            let mut handles = Vec::with_capacity(jobs.len());
            for job in jobs {
                let permit = self
                    .pool
                    .clone()
                    .acquire_owned()
                    .await
                    .map_err(|e| VncError::Custom(format!("encode pool closed: {}", e)))?;
                screens.push((job.id, job.rect));
                handles.push(tokio::task::spawn_blocking(move || {
                    let result = encode_screen(job);
                    drop(permit);
                    result
                }));
            }
            let joined = futures::future::join_all(handles).await;
            screens
                .into_iter()
                .zip(joined)
                .map(|((id, rect), joined)| match joined {
                    Ok(result) => result,
                    Err(e) => {
                        // the encoder went down with the task, a new one is built next time
                        warn!("Encode task for screen {} failed: {}", id, e);
                        ScreenResult {
                            id,
                            rect,
                            encoder: None,
                            payload: Err(VncError::Custom(e.to_string())),
                        }
                    }
                })
                .collect()
        };
        self.encode_time = started.elapsed();

        results.sort_by_key(|r| r.id);
        let mut stats = EncodeStats {
            updates: 1,
            ..Default::default()
        };
        let bpp = cp.pf().bytes_per_pixel() as u64;
        for result in results {
            let ScreenResult {
                id,
                rect,
                encoder,
                payload,
            } = result;
            let payload = match payload {
                Ok(payload) => payload,
                Err(e) => {
                    error!("Failed to encode screen {}: {}", id, e);
                    let mut skip = BytesMut::with_capacity(2);
                    skip.put_u8(id);
                    skip.put_u8(MSG_SKIP);
                    skip
                }
            };
            // the encoder of a screen removed meanwhile is dropped here
            if let Some(slot) = self.slots[id as usize].as_mut() {
                if slot.screen.dimensions == rect && slot.encoder.is_none() {
                    if encoder.is_none() {
                        slot.dirty = true;
                    }
                    slot.encoder = encoder;
                }
            }

            writer.start_rect(cp, &rect, VncEncoding::Video)?;
            writer.data_out(cp).extend_from_slice(&payload);
            writer.end_rect(cp)?;

            stats.rects += 1;
            stats.pixels += rect.area() as u64;
            stats.bytes += payload.len() as u64;
            stats.equivalent += 12 + rect.area() as u64 * bpp;
        }
        trace!(
            "Encoded {} screens in {:?}: {}",
            stats.rects,
            self.encode_time,
            stats
        );
        Ok(stats)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::server::writer::UNKNOWN_RECT_COUNT;
    use crate::PixelFormat;
    use std::sync::atomic::{AtomicUsize, Ordering};

    /// Sleeps a pseudo random time before producing a frame
    struct Sleepy {
        screen: Screen,
        sleep: u64,
    }

    impl VideoEncoder for Sleepy {
        fn codec(&self) -> Codec {
            Codec::H264
        }

        fn screen_id(&self) -> u8 {
            self.screen.id as u8
        }

        fn rect(&self) -> Rect {
            self.screen.dimensions
        }

        fn render(&mut self, _pb: &dyn PixelBuffer) -> Result<bool, VncError> {
            if self.sleep == u64::MAX {
                panic!("encoder crashed");
            }
            std::thread::sleep(Duration::from_millis(self.sleep));
            Ok(true)
        }

        fn write_rect(&mut self, out: &mut BytesMut) {
            out.put_u8(self.screen_id());
            out.put_u8(Codec::H264.msg_id());
            out.put_u8(1);
            out.put_u8(1);
            out.put_u8(0xaa);
        }

        fn write_solid_rect(
            &mut self,
            out: &mut BytesMut,
            _pf: &PixelFormat,
            _colour: u32,
        ) -> Result<(), VncError> {
            self.render(&ManagedPixelBuffer::new(0, 0, PixelFormat::bgra()))?;
            self.write_rect(out);
            Ok(())
        }

        fn request_key_frame(&mut self) {}
    }

    struct SleepyBackend {
        seed: AtomicUsize,
    }

    impl EncoderBackend for SleepyBackend {
        fn create(
            &self,
            _codec: Codec,
            screen: &Screen,
            _params: &EncoderParams,
        ) -> Result<Box<dyn VideoEncoder>, VncError> {
            let n = self.seed.fetch_add(7919, Ordering::Relaxed);
            Ok(Box::new(Sleepy {
                screen: *screen,
                sleep: (n % 23) as u64,
            }))
        }
    }

    /// Hands out encoders that blow up on screen 2
    struct FaultyBackend;

    impl EncoderBackend for FaultyBackend {
        fn create(
            &self,
            _codec: Codec,
            screen: &Screen,
            _params: &EncoderParams,
        ) -> Result<Box<dyn VideoEncoder>, VncError> {
            Ok(Box::new(Sleepy {
                screen: *screen,
                sleep: if screen.id == 2 { u64::MAX } else { 1 },
            }))
        }
    }

    /// Refuses everything
    struct NoBackend;

    impl EncoderBackend for NoBackend {
        fn create(
            &self,
            codec: Codec,
            _screen: &Screen,
            _params: &EncoderParams,
        ) -> Result<Box<dyn VideoEncoder>, VncError> {
            Err(VncError::EncoderUnavailable(codec.name().to_string()))
        }
    }

    fn layout(n: u32) -> ScreenSet {
        (0..n)
            .map(|i| Screen::new(n - 1 - i, i as i32 * 64, 0, 64, 32, 0))
            .collect::<Vec<_>>()
            .into()
    }

    fn params() -> ClientParams {
        ClientParams::new(64 * 4, 32, layout(4), PixelFormat::bgra(), "test")
    }

    fn dispatcher(codec: Codec, backend: Option<Arc<dyn EncoderBackend>>) -> EncodeDispatcher {
        EncodeDispatcher::new(
            codec,
            EncoderParams::default(),
            backend,
            Arc::new(Semaphore::new(3)),
        )
    }

    fn screen_ids_on_wire(out: &[u8]) -> Vec<u8> {
        // skip the 4 byte update header, every rect is 12 + 5 bytes
        out[4..]
            .chunks(17)
            .filter(|c| c.len() == 17)
            .map(|c| c[12])
            .collect()
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn screens_are_written_in_id_order() {
        let backend: Arc<dyn EncoderBackend> = Arc::new(SleepyBackend {
            seed: AtomicUsize::new(11),
        });
        let mut dispatcher = dispatcher(Codec::H264, Some(backend));
        dispatcher.sync_layout(&layout(4));
        let pb = ManagedPixelBuffer::new(256, 32, PixelFormat::bgra());
        let cp = params();

        for _ in 0..5 {
            dispatcher.mark_all_dirty();
            let jobs = dispatcher.snapshot(&pb, None).unwrap();
            assert_eq!(jobs.len(), 4);
            let mut writer = UpdateWriter::new();
            writer
                .write_framebuffer_update_start(&cp, UNKNOWN_RECT_COUNT)
                .unwrap();
            let stats = dispatcher.encode(jobs, &mut writer, &cp).await.unwrap();
            writer.write_framebuffer_update_end(&cp).unwrap();
            assert_eq!(stats.rects, 4);
            assert_eq!(screen_ids_on_wire(writer.os().unsent()), vec![0, 1, 2, 3]);
            for id in 0..4 {
                assert!(dispatcher.has_encoder(id));
            }
        }
    }

    #[tokio::test]
    async fn layout_changes_rebuild_encoders() {
        let mut dispatcher = dispatcher(Codec::Zlib, None);
        dispatcher.sync_layout(&layout(2));
        assert_eq!(dispatcher.dirty_ids(), vec![0, 1]);
        let pb = ManagedPixelBuffer::new(128, 32, PixelFormat::bgra());
        let jobs = dispatcher.snapshot(&pb, None).unwrap();
        let cp = ClientParams::new(128, 32, layout(2), PixelFormat::bgra(), "test");
        let mut writer = UpdateWriter::new();
        writer
            .write_framebuffer_update_start(&cp, UNKNOWN_RECT_COUNT)
            .unwrap();
        dispatcher.encode(jobs, &mut writer, &cp).await.unwrap();
        assert!(dispatcher.dirty_ids().is_empty());

        // damage only touches screen 0 (at x 64..128)
        assert_eq!(dispatcher.mark_dirty(&Rect::new(70, 0, 80, 10).into()), 1);
        assert_eq!(dispatcher.dirty_ids(), vec![0]);

        // screen 1 moves, screen 0 goes away
        let moved: ScreenSet = vec![Screen::new(1, 0, 0, 32, 32, 0)].into();
        dispatcher.sync_layout(&moved);
        assert_eq!(dispatcher.screen_ids(), vec![1]);
        assert!(!dispatcher.has_encoder(1));
        assert_eq!(dispatcher.dirty_ids(), vec![1]);
    }

    #[test]
    fn unchanged_screens_keep_their_encoder() {
        let mut dispatcher = dispatcher(Codec::Zlib, None);
        dispatcher.sync_layout(&layout(1));
        let pb = ManagedPixelBuffer::new(64, 32, PixelFormat::bgra());
        let jobs = dispatcher.snapshot(&pb, None).unwrap();
        assert_eq!(jobs.len(), 1);
        let result = encode_screen(jobs.into_iter().next().unwrap());
        // a black screen is solid, sent as a key frame
        let payload = result.payload.unwrap();
        assert_eq!(&payload[..3], &[0, Codec::Zlib.msg_id(), 1]);
        assert!(result.encoder.is_some());
    }

    #[test]
    fn cursor_is_composited_into_snapshots() {
        let mut dispatcher = dispatcher(Codec::Zlib, None);
        dispatcher.sync_layout(&vec![Screen::new(0, 4, 4, 8, 8, 0)].into());
        let pb = ManagedPixelBuffer::new(16, 16, PixelFormat::bgra());
        let cursor = Cursor::new(1, 1, Point::new(0, 0), vec![255, 255, 255, 255]).unwrap();
        let jobs = dispatcher.snapshot(&pb, Some((&cursor, Point::new(5, 6)))).unwrap();
        assert_eq!(jobs[0].pixels.get_pixel(Point::new(1, 2)), Some(0x00ff_ffff));
        assert_eq!(jobs[0].pixels.get_pixel(Point::new(0, 0)), Some(0));
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn crashed_encode_keeps_the_rect_count() {
        let mut dispatcher = dispatcher(Codec::H264, Some(Arc::new(FaultyBackend)));
        dispatcher.sync_layout(&layout(4));
        let pb = ManagedPixelBuffer::new(256, 32, PixelFormat::bgra());
        let cp = params();

        let jobs = dispatcher.snapshot(&pb, None).unwrap();
        let mut writer = UpdateWriter::new();
        writer.write_framebuffer_update_start(&cp, 4).unwrap();
        let stats = dispatcher.encode(jobs, &mut writer, &cp).await.unwrap();
        // the announced count is still met
        writer.write_framebuffer_update_end(&cp).unwrap();
        assert_eq!(stats.rects, 4);

        let out = writer.os().unsent();
        let mut pos = 4;
        let mut seen = Vec::new();
        while pos < out.len() {
            let body = &out[pos + 12..];
            let id = body[0];
            let len = if body[1] == MSG_SKIP { 2 } else { 5 };
            seen.push((id, body[1] == MSG_SKIP));
            pos += 12 + len;
        }
        assert_eq!(pos, out.len());
        assert_eq!(seen, vec![(0, false), (1, false), (2, true), (3, false)]);
        assert!(!dispatcher.has_encoder(2));
        assert_eq!(dispatcher.dirty_ids(), vec![2]);
    }

    #[test]
    fn missing_encoder_is_reported() {
        let mut dispatcher = dispatcher(Codec::H264, Some(Arc::new(NoBackend)));
        dispatcher.sync_layout(&layout(2));
        let pb = ManagedPixelBuffer::new(128, 32, PixelFormat::bgra());
        assert!(matches!(
            dispatcher.snapshot(&pb, None),
            Err(VncError::EncoderUnavailable(_))
        ));
    }
}
