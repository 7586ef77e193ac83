//! One connected client, from ServerInit until the socket closes.
//!
//! The connection task owns all per-client state. It reacts to client
//! messages, desktop events broadcast by the server, control requests and
//! its own timers, and decides when a framebuffer update may go out.

use super::congestion::{Congestion, Verdict};
use super::dispatcher::EncodeDispatcher;
use super::fence::{Fence, FenceAction, FenceState};
use super::input::{KeyTracker, PointerTracker};
use super::messages::{ClientMsg, Discard};
use super::params::ClientParams;
use super::registry::{ClientId, Control, RegistryEntry};
use super::stats::{Bottleneck, BottleneckStats, EncodeStats};
use super::timer::{IdleTracker, IdleVerdict, Timer};
use super::tracker::{UpdateInfo, UpdateTracker};
use super::writer::{UpdateWriter, UNKNOWN_RECT_COUNT};
use super::{apply_permissions, ServerState};
use crate::codec::{render_cursor, RawEncoder};
use crate::desktop::{AccessRights, ManagedPixelBuffer, PixelBuffer};
use crate::event::{ClipboardEntry, Cursor, DesktopEvent};
use crate::region::{Point, Rect, Region};
use crate::screen::{
    REASON_CLIENT, REASON_OTHER_CLIENT, REASON_SERVER, RESULT_INVALID, RESULT_PROHIBITED,
    RESULT_SUCCESS,
};
use crate::{VncEncoding, VncError};
use bytes::{Buf, BytesMut};
use std::sync::Arc;
use std::time::{Duration, Instant, SystemTime};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt, ReadHalf, WriteHalf};
use tokio::sync::broadcast::{self, error::RecvError, error::TryRecvError};
use tokio::sync::mpsc::UnboundedReceiver;
use tracing::*;

const READ_BUFFER_SIZE: usize = 64 * 1024;
/// A client counts as steering the pointer for this long after its last event
const POINTER_GRACE: Duration = Duration::from_secs(1);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnState {
    Handshaking,
    Authenticating,
    Querying,
    Initialising,
    Normal,
    Closing,
    Terminated,
}

pub struct VncConnection<S>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    sock_in: ReadHalf<S>,
    sock_out: WriteHalf<S>,
    inbuf: BytesMut,
    discard: Discard,
    state: ConnState,
    close_reason: Option<String>,
    failure: Option<VncError>,

    server: Arc<ServerState>,
    entry: RegistryEntry,
    control: UnboundedReceiver<Control>,
    events: broadcast::Receiver<DesktopEvent>,
    peer: String,
    user: Option<String>,
    access: AccessRights,
    needs_perm_check: bool,
    complained_no_view: bool,

    cp: ClientParams,
    writer: UpdateWriter,
    tracker: UpdateTracker,
    requested: Region,
    continuous: bool,
    cu_region: Region,
    fences: FenceState,
    congestion: Congestion,
    dispatcher: Option<EncodeDispatcher>,
    in_process: bool,

    keys: KeyTracker,
    pointer: PointerTracker,
    pointer_event_time: Option<Instant>,
    pointer_event_pos: Point,

    damaged_cursor: Region,
    remove_rendered_cursor: bool,
    update_rendered_cursor: bool,
    client_has_cursor: bool,

    lossy: Region,
    last_real_update: Option<Instant>,
    last_frame: Option<Instant>,
    udp_frames: FullFrameCounter,

    clipboard: Option<Arc<Vec<ClipboardEntry>>>,
    last_clipboard_op: Option<Instant>,

    frame_tracking: bool,
    bottlenecks: BottleneckStats,
    encode_stats: EncodeStats,
    idle: IdleTracker,

    idle_timer: Timer,
    congestion_timer: Timer,
    lossless_timer: Timer,
    clip_timer: Timer,
    frame_timer: Timer,
}

impl<S> VncConnection<S>
where
    S: AsyncRead + AsyncWrite + Unpin + Send,
{
    #[allow(clippy::too_many_arguments)]
    pub(crate) fn new(
        stream: S,
        server: Arc<ServerState>,
        entry: RegistryEntry,
        control: UnboundedReceiver<Control>,
        events: broadcast::Receiver<DesktopEvent>,
        peer: String,
        user: Option<String>,
        access: AccessRights,
        cp: ClientParams,
        writer: UpdateWriter,
    ) -> Self {
        let (sock_in, sock_out) = tokio::io::split(stream);
        let congestion = Congestion::new(server.config.congestion);
        Self {
            sock_in,
            sock_out,
            inbuf: BytesMut::with_capacity(READ_BUFFER_SIZE),
            discard: Discard::default(),
            state: ConnState::Normal,
            close_reason: None,
            failure: None,
            server,
            entry,
            control,
            events,
            peer,
            user,
            access,
            needs_perm_check: false,
            complained_no_view: false,
            cp,
            writer,
            tracker: UpdateTracker::new(),
            requested: Region::new(),
            continuous: false,
            cu_region: Region::new(),
            fences: FenceState::new(),
            congestion,
            dispatcher: None,
            in_process: false,
            keys: KeyTracker::new(),
            pointer: PointerTracker::default(),
            pointer_event_time: None,
            pointer_event_pos: Point::default(),
            damaged_cursor: Region::new(),
            remove_rendered_cursor: false,
            update_rendered_cursor: false,
            client_has_cursor: false,
            lossy: Region::new(),
            last_real_update: None,
            last_frame: None,
            udp_frames: FullFrameCounter::default(),
            clipboard: None,
            last_clipboard_op: None,
            frame_tracking: false,
            bottlenecks: BottleneckStats::new(),
            encode_stats: EncodeStats::default(),
            idle: IdleTracker::new(SystemTime::now()),
            idle_timer: Timer::new(),
            congestion_timer: Timer::new(),
            lossless_timer: Timer::new(),
            clip_timer: Timer::new(),
            frame_timer: Timer::new(),
        }
    }

    pub fn id(&self) -> ClientId {
        self.entry.id()
    }

    pub fn peer(&self) -> &str {
        &self.peer
    }

    pub fn user(&self) -> Option<&str> {
        self.user.as_deref()
    }

    pub fn state(&self) -> ConnState {
        self.state
    }

    pub fn access_rights(&self) -> AccessRights {
        self.access
    }

    /// What all updates so far cost
    pub fn encode_stats(&self) -> &EncodeStats {
        &self.encode_stats
    }

    /// Serve the client until it disconnects or is closed
    pub async fn run(mut self) -> Result<(), VncError> {
        let span = info_span!("vnc", peer = %self.peer, id = %self.entry.id());
        async move {
            self.serve().await;
            self.shutdown().await;
            match self.failure.take() {
                Some(e) => Err(e),
                None => Ok(()),
            }
        }
        .instrument(span)
        .await
    }

    async fn serve(&mut self) {
        info!("Client connected, user {:?}", self.user);
        self.check_idle();

        while self.state == ConnState::Normal {
            let want_write = !self.writer.os().unsent().is_empty();
            tokio::select! {
                read = self.sock_in.read_buf(&mut self.inbuf) => match read {
                    Ok(0) => self.close("Clean disconnection"),
                    Ok(_) => self.process_messages().await,
                    Err(e) => self.fail(e.into()),
                },
                written = self.sock_out.write(self.writer.os().unsent()), if want_write => match written {
                    Ok(n) => {
                        self.writer.os_mut().consume(n);
                        // an update may have been held back by a full buffer
                        if self.writer.os().buffer_usage() == 0 {
                            self.write_framebuffer_update().await;
                        }
                    }
                    Err(e) => self.fail(e.into()),
                },
                msg = self.control.recv() => match msg {
                    Some(msg) => self.handle_control(msg).await,
                    None => self.close("Server shut down"),
                },
                event = self.events.recv() => match event {
                    Ok(event) => {
                        self.apply_event(event);
                        self.write_framebuffer_update().await;
                    }
                    Err(RecvError::Lagged(n)) => {
                        warn!("Missed {} desktop events, refreshing everything", n);
                        self.resync();
                        self.write_framebuffer_update().await;
                    }
                    Err(RecvError::Closed) => self.close("Server shut down"),
                },
                _ = Timer::fire(self.congestion_timer.deadline()) => {
                    self.congestion_timer.stop();
                    self.write_framebuffer_update().await;
                }
                _ = Timer::fire(self.lossless_timer.deadline()) => {
                    self.lossless_timer.stop();
                    self.write_framebuffer_update().await;
                }
                _ = Timer::fire(self.frame_timer.deadline()) => {
                    self.frame_timer.stop();
                    self.write_framebuffer_update().await;
                }
                _ = Timer::fire(self.clip_timer.deadline()) => {
                    self.clip_timer.stop();
                    self.write_binary_clipboard();
                }
                _ = Timer::fire(self.idle_timer.deadline()) => {
                    self.idle_timer.stop();
                    self.check_idle();
                }
            }
        }
    }

    /// Release what the client held and push out what is still queued
    async fn shutdown(&mut self) {
        self.keys.release_all(self.server.desktop.as_ref());
        let reason = self
            .close_reason
            .clone()
            .unwrap_or_else(|| "connection closed".to_string());
        self.entry.leave(&reason);
        info!("Closing connection: {}", reason);
        trace!("Encode statistics: {}", self.encode_stats);

        let wait = self.server.config.client_wait_time;
        let flush = async {
            self.sock_out.write_all(self.writer.os().unsent()).await?;
            self.sock_out.shutdown().await
        };
        match tokio::time::timeout(wait, flush).await {
            Ok(Ok(())) => {}
            Ok(Err(e)) => debug!("Failed to flush remaining socket data on close: {}", e),
            Err(_) => error!("Failed to flush remaining socket data on close"),
        }
        self.state = ConnState::Terminated;
    }

    fn close(&mut self, reason: &str) {
        match self.close_reason {
            None => self.close_reason = Some(reason.to_string()),
            Some(_) => debug!("second close: {}", reason),
        }
        self.state = ConnState::Closing;
    }

    fn fail(&mut self, e: VncError) {
        if e.is_eof() {
            self.close("Clean disconnection");
            return;
        }
        if !e.is_fatal() {
            warn!("{}", e);
            return;
        }
        error!("{}", e);
        self.close(&e.to_string());
        if self.failure.is_none() {
            self.failure = Some(e);
        }
    }

    fn check_idle(&mut self) {
        let timeout = self.server.config.idle_timeout;
        match self.idle.check(SystemTime::now(), timeout, true) {
            IdleVerdict::Disabled => self.idle_timer.stop(),
            IdleVerdict::Remaining(left) => self.idle_timer.start(left),
            IdleVerdict::Expired => {
                info!("Client has been idle for {:?}", timeout);
                self.close("Idle timeout");
            }
        }
    }

    async fn process_messages(&mut self) {
        self.in_process = true;
        let max_cut_text = self.server.config.max_cut_text;
        while self.state == ConnState::Normal {
            // the rest of an oversized message is dropped as it comes in
            if !self.discard.drain(&mut self.inbuf) {
                break;
            }
            let mut reader = &self.inbuf[..];
            let msg = match ClientMsg::read(&mut reader, max_cut_text).await {
                Ok(msg) => msg,
                // the rest has not arrived yet
                Err(e) if e.is_eof() => break,
                Err(e) => {
                    self.in_process = false;
                    self.fail(e);
                    return;
                }
            };
            let consumed = self.inbuf.len() - reader.len();
            self.inbuf.advance(consumed);
            trace!("Client message: {:?}", msg);
            if let Err(e) = self.handle_msg(msg) {
                self.fail(e);
            }
        }

        if let Some(fence) = self.fences.take_pending() {
            if let Err(e) = self.write_fence(&fence) {
                self.fail(e);
            }
        }
        self.in_process = false;
        self.write_framebuffer_update().await;
    }

    fn write_fence(&mut self, fence: &Fence) -> Result<(), VncError> {
        self.writer.write_fence(&self.cp, fence.flags, &fence.payload)
    }

    fn handle_msg(&mut self, msg: ClientMsg) -> Result<(), VncError> {
        match msg {
            ClientMsg::SetPixelFormat(pf) => {
                debug!("Client pixel format {:?}", pf);
                self.cp.set_pf(pf);
                // rich cursors are sent in the client's format
                self.set_cursor();
            }
            ClientMsg::SetEncodings(encodings) => self.set_encodings(&encodings)?,
            ClientMsg::FramebufferUpdateRequest { incremental, rect } => {
                self.framebuffer_update_request(rect, incremental)
            }
            ClientMsg::KeyEvent { down, keysym } => self.key_event(keysym, 0, down),
            ClientMsg::QemuKeyEvent {
                down,
                keysym,
                keycode,
            } => self.key_event(keysym, keycode, down),
            ClientMsg::PointerEvent { button_mask, x, y } => self.pointer_event(button_mask, x, y),
            ClientMsg::OversizedCutText(len) => {
                error!("Cut text too long ({} bytes), ignoring", len);
                self.discard.start(len as u64);
            }
            ClientMsg::ClientCutText(text) => {
                if !self.access.contains(AccessRights::CUT_TEXT) || !self.server.config.accept_cut_text {
                    return Ok(());
                }
                self.server.desktop.client_cut_text(&text);
            }
            ClientMsg::EnableContinuousUpdates { enable, rect } => {
                if !self.cp.supports_fence || !self.cp.supports_continuous_updates {
                    return Err(VncError::Protocol(
                        "Client tried to enable continuous updates when not allowed".to_string(),
                    ));
                }
                self.continuous = enable;
                self.cu_region = Region::from(rect.intersect(&self.cp.fb_rect()));
                if enable {
                    self.requested.clear();
                } else {
                    self.writer.write_end_of_continuous_updates(&self.cp)?;
                }
            }
            ClientMsg::ClientFence(fence) => match self.fences.received(fence) {
                FenceAction::Echo(reply) | FenceAction::Deferred(Some(reply)) => {
                    self.write_fence(&reply)?
                }
                FenceAction::Pong => self.congestion.got_pong(Instant::now()),
                FenceAction::Deferred(None) | FenceAction::Ignored => {}
            },
            ClientMsg::SetDesktopSize {
                width,
                height,
                layout,
            } => self.set_desktop_size(width as i32, height as i32, layout),
            ClientMsg::RequestStats => {
                let scores = self.bottlenecks.scores(Instant::now());
                info!("Sending client stats: {}", scores);
                self.writer.write_stats(&scores.to_string());
            }
            ClientMsg::FrameStats { all, render } => {
                self.server
                    .desktop
                    .frame_stats(all, render, self.congestion.ping_time());
                self.frame_tracking = false;
            }
        }
        Ok(())
    }

    fn set_encodings(&mut self, encodings: &[i32]) -> Result<(), VncError> {
        let had_cursor = self.cp.supports_any_cursor();
        let first = self.cp.set_encodings(encodings);
        if self.cp.supports_udp && !self.writer.has_datagram() {
            debug!("Client asked for the datagram channel, none attached");
            self.writer.udp_downgrade(&mut self.cp);
        }
        self.select_codec();

        if !had_cursor && self.cp.supports_any_cursor() && !self.damaged_cursor.is_empty() {
            self.remove_rendered_cursor = !self.need_rendered_cursor();
        }
        self.set_cursor();

        if first.fence {
            self.write_fence(&Fence::handshake())?;
        }
        // continuous updates cannot be throttled without fences
        if first.continuous_updates && self.cp.supports_fence {
            self.writer.write_end_of_continuous_updates(&self.cp)?;
        }
        if first.led_state {
            self.writer.write_led_state(&self.cp);
        }
        if first.qemu_key_event {
            self.writer.write_qemu_key_event(&self.cp);
        }
        Ok(())
    }

    fn select_codec(&mut self) {
        match self.cp.video_codec(&self.server.config.video_codecs) {
            Some(codec) => match self.dispatcher.as_mut() {
                Some(dispatcher) => dispatcher.set_codec(codec),
                None => {
                    info!("Streaming screens with {}", codec);
                    let mut dispatcher = EncodeDispatcher::new(
                        codec,
                        self.server.config.encoder,
                        self.server.backend.clone(),
                        self.server.encode_pool.clone(),
                    );
                    dispatcher.sync_layout(&self.cp.layout);
                    self.dispatcher = Some(dispatcher);
                }
            },
            None => {
                if self.dispatcher.take().is_some() {
                    info!("Video streaming turned off");
                }
            }
        }
    }

    fn framebuffer_update_request(&mut self, rect: Rect, incremental: bool) {
        if !self.access.contains(AccessRights::VIEW) {
            return;
        }
        let fb = self.cp.fb_rect();
        let safe = if rect.enclosed_by(&fb) {
            rect
        } else {
            error!(
                "FramebufferUpdateRequest {}x{} at {},{} exceeds framebuffer {}x{}",
                rect.width(),
                rect.height(),
                rect.tl.x,
                rect.tl.y,
                fb.width(),
                fb.height()
            );
            rect.intersect(&fb)
        };

        let region = Region::from(safe);
        if !incremental || !self.continuous {
            self.requested.assign_union(&region);
        }
        if !incremental {
            self.tracker.add_changed(&region);
            if let Some(dispatcher) = self.dispatcher.as_mut() {
                dispatcher.mark_dirty(&region);
                dispatcher.request_key_frames();
            }
            // the layout is not part of ServerInit; DesktopSize is left out,
            // the client knows the size already
            self.writer.write_extended_desktop_size(&self.cp);
        }
    }

    fn key_event(&mut self, keysym: u32, keycode: u32, down: bool) {
        self.idle.touch(SystemTime::now());
        if !self.access.contains(AccessRights::KEY_EVENTS) || !self.server.config.accept_key_events {
            return;
        }
        let led_state = self.server.frame().led_state;
        self.keys.key_event(
            self.server.desktop.as_ref(),
            keysym,
            keycode,
            down,
            led_state,
            self.cp.supports_led_state,
        );
    }

    fn pointer_event(&mut self, button_mask: u8, x: u16, y: u16) {
        self.idle.touch(SystemTime::now());
        self.pointer_event_time = Some(Instant::now());
        if !self.access.contains(AccessRights::PTR_EVENTS) {
            // the event is lost, the rights are looked up again
            self.needs_perm_check = true;
            return;
        }
        if !self.server.config.accept_pointer_events {
            return;
        }
        if !self.server.registry.claim_pointer(self.entry.id(), button_mask != 0) {
            trace!("Pointer held by another client");
            return;
        }
        let pos = self.pointer.resolve(x, y, self.cp.width, self.cp.height);
        self.pointer_event_pos = pos;
        self.server.desktop.pointer_event(pos, button_mask as u16);
    }

    fn set_desktop_size(&mut self, width: i32, height: i32, layout: crate::screen::ScreenSet) {
        if !self.access.contains(AccessRights::SET_DESKTOP_SIZE)
            || !self.server.config.accept_set_desktop_size
        {
            let (fb_width, fb_height, current) = {
                let frame = self.server.frame();
                (frame.pb.width(), frame.pb.height(), frame.layout.clone())
            };
            self.writer.write_extended_desktop_size_msg(
                &self.cp,
                REASON_CLIENT,
                RESULT_PROHIBITED,
                fb_width,
                fb_height,
                &current,
            );
            return;
        }

        // don't bother the desktop with an invalid configuration
        if !layout.validate(width, height) {
            self.writer.write_extended_desktop_size_msg(
                &self.cp,
                REASON_CLIENT,
                RESULT_INVALID,
                width,
                height,
                &layout,
            );
            return;
        }

        let result = self.server.desktop.set_screen_layout(width, height, &layout);
        self.writer.write_extended_desktop_size_msg(
            &self.cp,
            REASON_CLIENT,
            result,
            width,
            height,
            &layout,
        );
        if result == RESULT_SUCCESS {
            self.server
                .apply_layout(width, height, layout, Some(self.entry.id()));
        }
    }

    async fn handle_control(&mut self, msg: Control) {
        trace!("Control message: {:?}", msg);
        match msg {
            Control::Close(reason) => self.close(&reason),
            Control::UserJoined(user) => self.writer.write_user_joined(&user),
            Control::UserLeft(user) => self.writer.write_user_left(&user),
            Control::RecheckPermissions => {
                self.needs_perm_check = true;
                self.write_framebuffer_update().await;
            }
            Control::SetStatus(status) => {
                let input = AccessRights::PTR_EVENTS | AccessRights::KEY_EVENTS;
                match status {
                    0 => self.access.insert(input | AccessRights::VIEW),
                    1 => {
                        self.access.remove(input);
                        self.access.insert(AccessRights::VIEW);
                    }
                    2 => self.access.remove(input | AccessRights::VIEW),
                    other => warn!("Unknown client status {}", other),
                }
                self.framebuffer_update_request(self.cp.fb_rect(), false);
                self.write_framebuffer_update().await;
            }
            Control::RequestFrameStats => {
                self.frame_tracking = true;
                self.write_framebuffer_update().await;
            }
            Control::Approve { .. } => {}
        }
    }

    /// Fold a desktop change into the pending update
    fn apply_event(&mut self, event: DesktopEvent) {
        match event {
            DesktopEvent::Damage(region) => {
                self.tracker
                    .add_changed(&region.intersect_rect(self.cp.fb_rect()));
            }
            DesktopEvent::Copy { dest, delta } => {
                self.tracker
                    .add_copied(&dest.intersect_rect(self.cp.fb_rect()), delta);
            }
            DesktopEvent::FramebufferResized => self.pixel_buffer_change(),
            DesktopEvent::LayoutChanged { origin } => {
                self.cp.layout = self.server.frame().layout.clone();
                if let Some(dispatcher) = self.dispatcher.as_mut() {
                    dispatcher.sync_layout(&self.cp.layout);
                }
                if origin != Some(self.entry.id()) {
                    let reason = if origin.is_some() {
                        REASON_OTHER_CLIENT
                    } else {
                        REASON_SERVER
                    };
                    self.writer.write_extended_desktop_size_msg(
                        &self.cp,
                        reason,
                        RESULT_SUCCESS,
                        self.cp.width,
                        self.cp.height,
                        &self.cp.layout,
                    );
                }
            }
            DesktopEvent::CursorChanged => {
                self.rendered_cursor_change();
                self.set_cursor();
            }
            DesktopEvent::CursorMoved { warped } => {
                self.rendered_cursor_change();
                if warped && self.cp.supports_cursor_position {
                    self.cp.set_cursor_pos(self.server.frame().cursor_pos);
                    if let Err(e) = self.writer.write_cursor_pos(&self.cp) {
                        self.fail(e);
                    }
                }
            }
            DesktopEvent::NameChanged => {
                let name = self.server.frame().name.clone();
                self.cp.set_name(&name);
                if !self.writer.write_set_desktop_name(&self.cp) {
                    debug!("Client does not support desktop rename");
                }
            }
            DesktopEvent::LedStateChanged => {
                self.cp.set_led_state(self.server.frame().led_state);
                self.writer.write_led_state(&self.cp);
            }
            DesktopEvent::Bell => self.writer.write_bell(),
            DesktopEvent::CutText(text) => {
                if self.access.contains(AccessRights::CUT_TEXT) && self.server.config.send_cut_text {
                    self.writer.write_server_cut_text(&text);
                }
            }
            DesktopEvent::BinaryClipboard(entries) => {
                if !self.access.contains(AccessRights::CUT_TEXT) || !self.server.config.send_cut_text {
                    return;
                }
                self.clipboard = Some(entries);
                self.clip_timer.start(self.server.config.clipboard_delay);
            }
        }
    }

    /// Start over from the current desktop state
    fn resync(&mut self) {
        self.pixel_buffer_change();
        self.rendered_cursor_change();
        self.set_cursor();
    }

    fn pixel_buffer_change(&mut self) {
        let (fb, layout) = {
            let frame = self.server.frame();
            (frame.pb.rect(), frame.layout.clone())
        };
        let fb_region = Region::from(fb);
        if fb != self.cp.fb_rect() {
            self.damaged_cursor.assign_intersect(&fb_region);
            self.cp.width = fb.width();
            self.cp.height = fb.height();
            self.cp.layout = layout;
            // EDS for clients that understand both
            if !self.writer.write_extended_desktop_size(&self.cp)
                && !self.writer.write_set_desktop_size(&self.cp)
            {
                self.close("Client does not support desktop resize");
                return;
            }
            self.lossy.assign_intersect(&fb_region);
        } else if layout != self.cp.layout {
            self.cp.layout = layout;
            self.writer.write_extended_desktop_size_msg(
                &self.cp,
                REASON_SERVER,
                RESULT_SUCCESS,
                self.cp.width,
                self.cp.height,
                &self.cp.layout,
            );
        }
        if let Some(dispatcher) = self.dispatcher.as_mut() {
            dispatcher.sync_layout(&self.cp.layout);
            dispatcher.mark_all_dirty();
        }
        self.tracker.clear();
        self.tracker.add_changed(&fb_region);
    }

    /// Whether the cursor has to be drawn into the pixels we send
    ///
    /// Either the client cannot draw cursors, or the server moved the
    /// pointer away from where this client last put it.
    fn need_rendered_cursor(&self) -> bool {
        if self.state != ConnState::Normal {
            return false;
        }
        if !self.cp.supports_any_cursor() {
            return true;
        }
        let server_pos = self.server.frame().cursor_pos;
        server_pos != self.pointer_event_pos
            && self
                .pointer_event_time
                .map_or(true, |at| at.elapsed() >= POINTER_GRACE)
    }

    fn rendered_cursor_change(&mut self) {
        if self.state != ConnState::Normal {
            return;
        }
        // switching between client and server side cursor
        if self.client_has_cursor == self.need_rendered_cursor() {
            self.set_cursor();
        }
        if !self.damaged_cursor.is_empty() {
            self.remove_rendered_cursor = true;
        }
        if self.need_rendered_cursor() {
            self.update_rendered_cursor = true;
        }
    }

    /// Hand the client its cursor, or an empty one while we draw it
    fn set_cursor(&mut self) {
        if self.state != ConnState::Normal {
            return;
        }
        if self.need_rendered_cursor() {
            self.cp.set_cursor(Cursor::empty());
            self.client_has_cursor = false;
        } else {
            let cursor = self.server.frame().cursor.clone();
            self.cp.set_cursor(cursor);
            self.client_has_cursor = true;
        }
        self.writer.write_cursor(&self.cp);
    }

    fn write_binary_clipboard(&mut self) {
        let delay = self.server.config.clipboard_delay;
        if let Some(last) = self.last_clipboard_op {
            let since = last.elapsed();
            if since < delay {
                debug!("Binary clipboard held back, last one went out {:?} ago", since);
                self.clip_timer.start(delay - since);
                return;
            }
        }
        let Some(entries) = self.clipboard.take() else {
            return;
        };
        self.writer.write_binary_clipboard(&entries);
        self.last_clipboard_op = Some(Instant::now());
    }

    fn write_rtt_ping(&mut self) -> Result<(), VncError> {
        if !self.cp.supports_fence {
            return Ok(());
        }
        self.congestion.update_position(self.writer.os().length());
        // older updates must be processed before the answer comes back
        self.write_fence(&Fence::ping())?;
        self.congestion.sent_ping(Instant::now());
        Ok(())
    }

    fn is_congested(&mut self) -> bool {
        self.congestion_timer.stop();
        let now = Instant::now();
        let verdict = self.congestion.check(
            self.writer.os().buffer_usage(),
            self.cp.supports_fence,
            self.cp.supports_udp,
            self.writer.os().length(),
            now,
        );
        match verdict {
            Verdict::Clear => false,
            Verdict::Congested { eta } => {
                if let Some(eta) = eta {
                    self.congestion_timer.start(eta);
                    if eta > self.server.config.frame_interval() {
                        self.bottlenecks.record(Bottleneck::NetSlow, now);
                    }
                }
                true
            }
        }
    }

    async fn write_framebuffer_update(&mut self) {
        let mark = self.writer.os().mark();
        if let Err(e) = self.try_write_framebuffer_update().await {
            self.writer.os_mut().rollback(mark);
            self.fail(e);
        }
    }

    async fn try_write_framebuffer_update(&mut self) -> Result<(), VncError> {
        self.congestion.update_position(self.writer.os().length());

        // a sync fence has to be answered before anything else goes out
        if self.fences.sync_pending() {
            return Ok(());
        }
        // more messages are coming, answer them all at once
        if self.in_process {
            return Ok(());
        }
        if self.state != ConnState::Normal {
            return Ok(());
        }
        if self.requested.is_empty() && !self.continuous {
            return Ok(());
        }
        if self.is_congested() {
            return Ok(());
        }

        if self.needs_perm_check {
            self.needs_perm_check = false;
            match self.server.lookup_permissions(self.user.as_deref()) {
                Some(perms) => apply_permissions(&mut self.access, perms),
                None => {
                    self.close("User was deleted");
                    return Ok(());
                }
            }
        }
        if !self.access.contains(AccessRights::VIEW) {
            if !self.complained_no_view {
                self.complained_no_view = true;
                error!("User {:?} has no read permissions", self.user);
            }
            return Ok(());
        }

        if self.frame_tracking {
            self.writer.write_request_frame_stats();
        }

        // updates that cannot carry pixel data go first
        if self.writer.need_no_data_update() {
            self.writer.write_no_data_update(&self.cp)?;
            self.requested.clear();
            if !self.continuous {
                return Ok(());
            }
        }

        self.write_data_update().await?;

        self.congestion.update_position(self.writer.os().length());
        self.bottlenecks.record(Bottleneck::Frame, Instant::now());
        Ok(())
    }

    fn drain_events(&mut self) {
        loop {
            match self.events.try_recv() {
                Ok(event) => self.apply_event(event),
                Err(TryRecvError::Lagged(n)) => {
                    warn!("Missed {} desktop events, refreshing everything", n);
                    self.resync();
                }
                Err(_) => break,
            }
        }
    }

    async fn write_data_update(&mut self) -> Result<(), VncError> {
        // every change published so far becomes part of this update
        self.drain_events();
        if self.state != ConnState::Normal {
            return Ok(());
        }

        self.tracker
            .enable_copyrect(self.cp.use_copyrect() && self.dispatcher.is_none());

        let req = if self.continuous {
            self.cu_region.union(&self.requested)
        } else {
            self.requested.clone()
        };
        if req.is_empty() {
            return Ok(());
        }

        let fb = self.cp.fb_rect();
        let fb_region = Region::from(fb);
        let (cursor_rect, cursor_pos) = {
            let frame = self.server.frame();
            (
                frame.cursor.rect_at(frame.cursor_pos).intersect(&fb),
                frame.cursor_pos,
            )
        };

        let mut ui = self.tracker.get_update_info(&req);
        let mut refresh = false;

        // the copy would drag the old rendered cursor along
        if !ui.copied.is_empty() && !self.damaged_cursor.is_empty() {
            let bogus = self
                .damaged_cursor
                .translated(ui.copy_delta)
                .intersect(&fb_region);
            if !ui.copied.intersect(&bogus).is_empty() {
                self.tracker.add_changed(&bogus);
                refresh = true;
            }
        }
        if self.remove_rendered_cursor {
            self.tracker.add_changed(&self.damaged_cursor);
            self.damaged_cursor.clear();
            self.remove_rendered_cursor = false;
            refresh = true;
        }
        if self.update_rendered_cursor {
            self.tracker.add_changed(&Region::from(cursor_rect));
            self.update_rendered_cursor = false;
            refresh = true;
        }
        if refresh {
            ui = self.tracker.get_update_info(&req);
        }

        let rendered = self.need_rendered_cursor();
        if rendered {
            let cursor_region = Region::from(cursor_rect);
            let covered = ui.copied.intersect(&cursor_region);
            if !covered.is_empty() {
                ui.changed.assign_union(&covered);
                ui.copied.assign_subtract(&cursor_region);
            }
            self.damaged_cursor
                .assign_union(&ui.changed.intersect(&cursor_region));
        }

        let full_frames = self.server.config.udp_full_frame_frequency;
        let force_full = self.cp.supports_udp && self.udp_frames.is_due(full_frames);
        if force_full {
            ui.changed.assign_union(&fb_region);
        }

        let interval = self.server.config.frame_interval();
        let lossless_threshold =
            Duration::from_millis(80 + 2 * 1000 / self.server.config.frame_rate.max(1) as u64);
        let lossless_due = !self.lossy.intersect(&req).is_empty()
            && self
                .last_real_update
                .map_or(true, |at| at.elapsed() >= lossless_threshold);
        if ui.is_empty() && !self.writer.need_fake_update() && !lossless_due {
            return Ok(());
        }

        // no more than frame_rate updates per second
        if let Some(last) = self.last_frame {
            let since = last.elapsed();
            if since < interval {
                self.frame_timer.start_if_idle(interval - since);
                return Ok(());
            }
        }

        self.write_rtt_ping()?;

        let max_update_size = update_budget(
            self.congestion.bandwidth(),
            time_to_next_update(&self.frame_timer, interval),
        );

        let written = if !ui.is_empty() {
            let started = Instant::now();
            let stats = if self.dispatcher.is_some() {
                match self.write_video_update(&ui, rendered).await {
                    Err(VncError::EncoderUnavailable(reason)) => {
                        warn!("Video streaming unavailable ({}), sending Raw", reason);
                        self.dispatcher = None;
                        self.write_raw_update(&ui, rendered, cursor_pos)?
                    }
                    other => other?,
                }
            } else {
                self.write_raw_update(&ui, rendered, cursor_pos)?
            };
            if let Some(stats) = stats.as_ref() {
                let now = Instant::now();
                let encode_time = match self.dispatcher.as_ref() {
                    Some(dispatcher) => dispatcher.encode_time(),
                    None => now.saturating_duration_since(started),
                };
                self.last_real_update = Some(now);
                self.lossless_timer.start(lossless_threshold);
                self.bottlenecks.record_encode(encode_time, interval, now);
                self.encode_stats.add(stats);
            }
            stats.is_some()
        } else {
            self.write_lossless_refresh(&req, rendered, cursor_rect, max_update_size)?
        };
        if !written {
            return Ok(());
        }
        self.last_frame = Some(Instant::now());

        self.write_rtt_ping()?;

        // the request might cover only part of the screen
        self.tracker.subtract(&req);
        self.requested.clear();
        if full_frames > 0 && self.cp.supports_udp {
            self.udp_frames.sent(force_full);
        }
        Ok(())
    }

    async fn write_video_update(
        &mut self,
        ui: &UpdateInfo,
        rendered: bool,
    ) -> Result<Option<EncodeStats>, VncError> {
        let Some(dispatcher) = self.dispatcher.as_mut() else {
            return Ok(None);
        };
        dispatcher.mark_dirty(&ui.changed);
        let jobs = {
            let frame = self.server.frame();
            if frame.pb.rect() != self.cp.fb_rect() {
                debug!("Framebuffer changed size, update deferred");
                return Ok(None);
            }
            let cursor = if rendered {
                Some((&frame.cursor, frame.cursor_pos))
            } else {
                None
            };
            dispatcher.snapshot(&frame.pb, cursor)?
        };

        let rects: Vec<Rect> = jobs.iter().map(|job| job.rect()).collect();
        let count = if self.cp.supports_last_rect {
            UNKNOWN_RECT_COUNT
        } else {
            jobs.len() as u16
        };
        self.writer.write_framebuffer_update_start(&self.cp, count)?;
        let stats = dispatcher.encode(jobs, &mut self.writer, &self.cp).await?;
        self.writer.write_framebuffer_update_end(&self.cp)?;

        let lossy = dispatcher.codec().is_lossy();
        for rect in rects {
            let sent = Region::from(rect);
            if lossy {
                self.lossy.assign_union(&sent);
            } else {
                self.lossy.assign_subtract(&sent);
            }
        }
        Ok(Some(stats))
    }

    fn write_raw_update(
        &mut self,
        ui: &UpdateInfo,
        rendered: bool,
        cursor_pos: Point,
    ) -> Result<Option<EncodeStats>, VncError> {
        let frame = self.server.frame();
        if frame.pb.rect() != self.cp.fb_rect() {
            debug!("Framebuffer changed size, update deferred");
            return Ok(None);
        }
        let cursor = if rendered {
            Some((&frame.cursor, cursor_pos))
        } else {
            None
        };
        let stats = write_raw_rects(
            &mut self.writer,
            &self.cp,
            &frame.pb,
            &ui.copied,
            ui.copy_delta,
            ui.changed.rects(),
            cursor,
        )?;
        self.lossy.assign_subtract(&ui.changed);
        Ok(Some(stats))
    }

    /// Re-send areas that went out through a lossy codec, as Raw and
    /// within `max_size` bytes
    fn write_lossless_refresh(
        &mut self,
        req: &Region,
        rendered: bool,
        cursor_rect: Rect,
        max_size: usize,
    ) -> Result<bool, VncError> {
        let encoder = RawEncoder::new(*self.cp.pf());
        let mut rects = Vec::new();
        let mut size = 0;
        for r in self.lossy.intersect(req).rects() {
            let len = encoder.encoded_len(r);
            // always make some progress
            if !rects.is_empty() && size + len > max_size {
                break;
            }
            size += len;
            rects.push(*r);
        }
        if rects.is_empty() && !self.writer.need_fake_update() {
            return Ok(false);
        }

        let frame = self.server.frame();
        if frame.pb.rect() != self.cp.fb_rect() {
            return Ok(false);
        }
        let cursor = if rendered {
            Some((&frame.cursor, frame.cursor_pos))
        } else {
            None
        };
        let stats = write_raw_rects(
            &mut self.writer,
            &self.cp,
            &frame.pb,
            &Region::new(),
            Point::default(),
            &rects,
            cursor,
        )?;
        drop(frame);

        let sent: Region = rects.into_iter().collect();
        if rendered {
            self.damaged_cursor
                .assign_union(&sent.intersect_rect(cursor_rect));
        }
        self.lossy.assign_subtract(&sent);
        if stats.rects > 0 {
            trace!("Lossless refresh: {}", stats);
        }
        Ok(true)
    }
}

/// Datagram frames written since the last full one
#[derive(Debug, Default)]
struct FullFrameCounter {
    since_full: u32,
}

impl FullFrameCounter {
    fn is_due(&self, frequency: u32) -> bool {
        frequency > 0 && self.since_full >= frequency
    }

    fn sent(&mut self, full: bool) {
        self.since_full = if full { 0 } else { self.since_full + 1 };
    }
}

/// How long until the next frame slot, half a frame when none is scheduled
fn time_to_next_update(frame_timer: &Timer, interval: Duration) -> Duration {
    frame_timer.remaining().unwrap_or(interval / 2)
}

/// Bytes the link carries until the next frame slot
fn update_budget(bandwidth: u64, until_next: Duration) -> usize {
    (bandwidth * until_next.as_millis() as u64 / 1000) as usize
}

/// One complete update of CopyRect and Raw rects
fn write_raw_rects(
    writer: &mut UpdateWriter,
    cp: &ClientParams,
    pb: &dyn PixelBuffer,
    copied: &Region,
    copy_delta: Point,
    changed: &[Rect],
    cursor: Option<(&Cursor, Point)>,
) -> Result<EncodeStats, VncError> {
    let count = if cp.supports_last_rect {
        UNKNOWN_RECT_COUNT
    } else {
        u16::try_from(copied.num_rects() + changed.len())
            .map_err(|_| VncError::Protocol("Too many rects in update".to_string()))?
    };
    writer.write_framebuffer_update_start(cp, count)?;

    let mut stats = EncodeStats {
        updates: 1,
        ..Default::default()
    };

    // the client copies within its own framebuffer, sources must be read
    // before anything overwrites them
    let copy_src = copy_delta.negate();
    for r in copied.rects_ordered(copy_delta.x <= 0, copy_delta.y <= 0) {
        writer.write_copy_rect(cp, &r, r.tl.translate(copy_src))?;
        stats.rects += 1;
        stats.pixels += r.area() as u64;
        stats.bytes += 16;
        stats.equivalent += 12 + r.area() as u64 * cp.pf().bytes_per_pixel() as u64;
    }

    let encoder = RawEncoder::new(*cp.pf());
    for r in changed {
        writer.start_rect(cp, r, VncEncoding::Raw)?;
        let out = writer.data_out(cp);
        let before = out.len();
        match cursor {
            Some((cursor, pos)) if cursor.rect_at(pos).overlaps(r) => {
                let mut pixels = ManagedPixelBuffer::snapshot(pb, *r);
                render_cursor(&mut pixels, r.tl, cursor, pos);
                encoder.write_rect(&pixels, &pixels.rect(), out);
            }
            _ => encoder.write_rect(pb, r, out),
        }
        let written = out.len() - before;
        writer.end_rect(cp)?;

        stats.rects += 1;
        stats.pixels += r.area() as u64;
        stats.bytes += 12 + written as u64;
        stats.equivalent += 12 + encoder.encoded_len(r) as u64;
    }

    writer.write_framebuffer_update_end(cp)?;
    Ok(stats)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::event::Cursor;
    use crate::screen::ScreenSet;
    use crate::PixelFormat;

    fn params(w: i32, h: i32) -> ClientParams {
        ClientParams::new(w, h, ScreenSet::single(w, h), PixelFormat::bgra(), "test")
    }

    fn rect_header(buf: &[u8]) -> (i16, i16, u16, u16, i32) {
        (
            i16::from_be_bytes([buf[0], buf[1]]),
            i16::from_be_bytes([buf[2], buf[3]]),
            u16::from_be_bytes([buf[4], buf[5]]),
            u16::from_be_bytes([buf[6], buf[7]]),
            i32::from_be_bytes([buf[8], buf[9], buf[10], buf[11]]),
        )
    }

    #[test]
    fn copies_are_ordered_against_the_motion() {
        let cp = params(100, 100);
        let pb = ManagedPixelBuffer::new(100, 100, PixelFormat::bgra());
        let mut writer = UpdateWriter::new();
        // two bands moving down: the lower one has to go first
        let copied: Region = [Rect::new(0, 60, 10, 70), Rect::new(0, 20, 10, 30)]
            .into_iter()
            .collect();
        let stats =
            write_raw_rects(&mut writer, &cp, &pb, &copied, Point::new(0, 10), &[], None).unwrap();
        assert_eq!(stats.rects, 2);

        let out = writer.os().unsent();
        assert_eq!(&out[..4], &[0, 0, 0, 2]);
        let (_, y, _, _, encoding) = rect_header(&out[4..]);
        assert_eq!((y, encoding), (60, 1));
        // source is above the destination
        assert_eq!(u16::from_be_bytes([out[18], out[19]]), 50);
        let (_, y, _, _, _) = rect_header(&out[20..]);
        assert_eq!(y, 20);
    }

    #[test]
    fn rendered_cursor_is_composited() {
        let cp = params(8, 8);
        let pb = ManagedPixelBuffer::new(8, 8, PixelFormat::bgra());
        let cursor = Cursor::new(1, 1, Point::default(), vec![255, 255, 255, 255]).unwrap();
        let mut writer = UpdateWriter::new();
        write_raw_rects(
            &mut writer,
            &cp,
            &pb,
            &Region::new(),
            Point::default(),
            &[Rect::new(0, 0, 4, 1)],
            Some((&cursor, Point::new(2, 0))),
        )
        .unwrap();

        let out = writer.os().unsent();
        let pixels = &out[16..];
        assert_eq!(pixels.len(), 16);
        assert_eq!(&pixels[..8], &[0; 8]);
        assert_eq!(&pixels[8..11], &[255, 255, 255]);
        // the framebuffer itself stays untouched
        assert_eq!(pb.get_pixel(Point::new(2, 0)), Some(0));
    }

    #[test]
    fn refresh_budget_covers_the_time_to_the_next_frame() {
        let interval = Duration::from_millis(40);
        let mut timer = Timer::new();
        assert_eq!(time_to_next_update(&timer, interval), Duration::from_millis(20));
        assert_eq!(update_budget(1_000_000, Duration::from_millis(20)), 20_000);

        timer.start(Duration::from_millis(10));
        let left = time_to_next_update(&timer, interval);
        assert!(left <= Duration::from_millis(10));
        assert!(update_budget(1_000_000, left) <= 10_000);
    }

    #[test]
    fn deferred_full_frame_stays_due() {
        let mut frames = FullFrameCounter::default();
        assert!(!frames.is_due(0));
        for _ in 0..3 {
            assert!(!frames.is_due(3));
            frames.sent(false);
        }
        assert!(frames.is_due(3));
        // paced out, nothing written
        assert!(frames.is_due(3));
        frames.sent(true);
        assert!(!frames.is_due(3));
        assert!(!frames.is_due(0));
    }

    #[test]
    fn last_rect_ends_unknown_counts() {
        let mut cp = params(4, 4);
        cp.supports_last_rect = true;
        let pb = ManagedPixelBuffer::new(4, 4, PixelFormat::bgra());
        let mut writer = UpdateWriter::new();
        let stats = write_raw_rects(
            &mut writer,
            &cp,
            &pb,
            &Region::new(),
            Point::default(),
            &[Rect::new(0, 0, 4, 4)],
            None,
        )
        .unwrap();
        assert_eq!(stats.pixels, 16);
        assert_eq!(stats.bytes, stats.equivalent);

        let out = writer.os().unsent();
        assert_eq!(&out[..4], &[0, 0, 0xff, 0xff]);
        assert_eq!(out.len(), 4 + 12 + 64 + 12);
        let (_, _, _, _, encoding) = rect_header(&out[out.len() - 12..]);
        assert_eq!(encoding, i32::from(VncEncoding::LastRectPseudo));
    }
}
