//! The server side: the shared desktop state and the connections attached
//! to it.

pub mod congestion;
pub mod connection;
pub mod connector;
pub mod dispatcher;
pub mod fence;
pub mod input;
pub mod messages;
pub mod params;
pub mod registry;
pub mod stats;
pub mod timer;
pub mod tracker;
pub mod writer;

pub use connection::{ConnState, VncConnection};
pub use connector::{VncConnector, VncState};
pub use registry::{ClientId, Control, Registry};

use crate::codec::EncoderBackend;
use crate::desktop::{
    AccessRights, DatagramSink, Desktop, ManagedPixelBuffer, PermissionStore, Permissions,
    PixelBuffer,
};
use crate::event::{ClipboardEntry, Cursor, DesktopEvent};
use crate::region::{Point, Rect, Region};
use crate::screen::ScreenSet;
use crate::{PixelFormat, ServerConfig, VncError};
use std::sync::{Arc, PoisonError, RwLock, RwLockReadGuard, RwLockWriteGuard};
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::TcpListener;
use tokio::sync::{broadcast, Semaphore};
use tracing::*;

const EVENT_CHANNEL_SIZE: usize = 4096;

/// What every connection shows: pixels, layout and the pointer
pub(crate) struct FrameState {
    pub pb: ManagedPixelBuffer,
    pub layout: ScreenSet,
    pub cursor: Cursor,
    pub cursor_pos: Point,
    pub name: String,
    pub led_state: Option<u8>,
}

/// Shared by the server handle and all connection tasks
///
/// The frame lock is only ever taken for short synchronous sections, never
/// across an await.
pub(crate) struct ServerState {
    pub config: ServerConfig,
    pub desktop: Arc<dyn Desktop>,
    pub permissions: Option<Arc<dyn PermissionStore>>,
    pub backend: Option<Arc<dyn EncoderBackend>>,
    pub registry: Registry,
    pub events: broadcast::Sender<DesktopEvent>,
    pub encode_pool: Arc<Semaphore>,
    frame: RwLock<FrameState>,
}

impl ServerState {
    pub fn frame(&self) -> RwLockReadGuard<'_, FrameState> {
        self.frame.read().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn frame_mut(&self) -> RwLockWriteGuard<'_, FrameState> {
        self.frame.write().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn notify(&self, event: DesktopEvent) {
        // no receivers just means nobody is connected
        let _ = self.events.send(event);
    }

    /// Rights of `user` as the permission store sees them
    ///
    /// Without a store everybody may read and write. Clients without an
    /// identity are looked up under the empty name.
    pub fn lookup_permissions(&self, user: Option<&str>) -> Option<Permissions> {
        let Some(store) = self.permissions.as_ref() else {
            return Some(Permissions::FULL);
        };
        let mut perms = store.lookup(user.unwrap_or(""))?;
        // write implies read
        perms.read |= perms.write;
        Some(perms)
    }

    /// Switch to a layout the desktop accepted, resizing the framebuffer if
    /// needed
    pub fn apply_layout(&self, width: i32, height: i32, layout: ScreenSet, origin: Option<ClientId>) {
        let resized = {
            let mut frame = self.frame_mut();
            let resized = frame.pb.width() != width || frame.pb.height() != height;
            if resized {
                let mut pb = ManagedPixelBuffer::new(width, height, *frame.pb.format());
                let keep = pb.rect().intersect(&frame.pb.rect());
                if let Some((data, stride)) = frame.pb.buffer(keep) {
                    pb.image_rect(keep, data, stride);
                }
                frame.pb = pb;
            }
            frame.layout = layout;
            resized
        };
        if resized {
            info!("Framebuffer resized to {}x{}", width, height);
            self.notify(DesktopEvent::FramebufferResized);
        } else {
            self.notify(DesktopEvent::LayoutChanged { origin });
        }
    }
}

/// Keep the rights the permission store grants, drop the others
pub(crate) fn apply_permissions(access: &mut AccessRights, perms: Permissions) {
    if perms.write {
        access.insert(AccessRights::WRITER);
    } else {
        access.remove(AccessRights::WRITER);
    }
    if perms.read {
        access.insert(AccessRights::VIEW);
    } else {
        access.remove(AccessRights::VIEW);
    }
}

/// Builder of a [`VncServer`]
pub struct ServerBuilder {
    desktop: Arc<dyn Desktop>,
    config: ServerConfig,
    pb: Option<ManagedPixelBuffer>,
    layout: Option<ScreenSet>,
    permissions: Option<Arc<dyn PermissionStore>>,
    backend: Option<Arc<dyn EncoderBackend>>,
}

impl ServerBuilder {
    pub fn set_config(mut self, config: ServerConfig) -> Self {
        self.config = config;
        self
    }

    /// The initial framebuffer, 1024x768 BGRA if not set
    pub fn set_pixel_buffer(mut self, pb: ManagedPixelBuffer) -> Self {
        self.pb = Some(pb);
        self
    }

    /// A single screen covering the framebuffer if not set
    pub fn set_screen_layout(mut self, layout: ScreenSet) -> Self {
        self.layout = Some(layout);
        self
    }

    pub fn set_permission_store(mut self, store: Arc<dyn PermissionStore>) -> Self {
        self.permissions = Some(store);
        self
    }

    /// Where hardware or other codecs come from, the software encoder is
    /// used for everything else
    pub fn set_encoder_backend(mut self, backend: Arc<dyn EncoderBackend>) -> Self {
        self.backend = Some(backend);
        self
    }

    pub fn build(self) -> Result<VncServer, VncError> {
        let pb = self
            .pb
            .unwrap_or_else(|| ManagedPixelBuffer::new(1024, 768, PixelFormat::bgra()));
        let layout = self
            .layout
            .unwrap_or_else(|| ScreenSet::single(pb.width(), pb.height()));
        if !layout.validate(pb.width(), pb.height()) {
            return Err(VncError::InvalidLayout);
        }
        let (events, _) = broadcast::channel(EVENT_CHANNEL_SIZE);
        let frame = FrameState {
            pb,
            layout,
            cursor: Cursor::empty(),
            cursor_pos: Point::default(),
            name: self.config.name.clone(),
            led_state: None,
        };
        let encode_pool = Arc::new(Semaphore::new(self.config.max_encode_threads.max(1)));
        Ok(VncServer {
            state: Arc::new(ServerState {
                config: self.config,
                desktop: self.desktop,
                permissions: self.permissions,
                backend: self.backend,
                registry: Registry::new(),
                events,
                encode_pool,
                frame: RwLock::new(frame),
            }),
        })
    }
}

/// Handle to a running server, cheap to clone
///
/// ```no_run
/// use std::sync::Arc;
/// use tokio::net::TcpListener;
/// use vncserver::{Desktop, Point, VncServer};
///
/// struct Log;
///
/// impl Desktop for Log {
///     fn pointer_event(&self, pos: Point, button_mask: u16) {
///         println!("pointer {:?} {}", pos, button_mask);
///     }
///
///     fn key_event(&self, keysym: u32, _keycode: u32, down: bool) {
///         println!("key {:x} {}", keysym, down);
///     }
/// }
///
/// #[tokio::main]
/// async fn main() -> Result<(), vncserver::VncError> {
///     let server = VncServer::builder(Arc::new(Log)).build()?;
///     server.serve(TcpListener::bind("127.0.0.1:5900").await?).await
/// }
/// ```
#[derive(Clone)]
pub struct VncServer {
    state: Arc<ServerState>,
}

impl VncServer {
    pub fn builder(desktop: Arc<dyn Desktop>) -> ServerBuilder {
        ServerBuilder {
            desktop,
            config: ServerConfig::default(),
            pb: None,
            layout: None,
            permissions: None,
            backend: None,
        }
    }

    pub fn config(&self) -> &ServerConfig {
        &self.state.config
    }

    pub fn registry(&self) -> &Registry {
        &self.state.registry
    }

    /// Attach a client on an already connected stream, for transports
    /// other than plain TCP
    pub fn connector<S>(&self, stream: S) -> VncConnector<S>
    where
        S: AsyncRead + AsyncWrite + Unpin,
    {
        VncConnector::new(stream, self.state.clone())
    }

    /// Accept connections until the listener fails
    pub async fn serve(&self, listener: TcpListener) -> Result<(), VncError> {
        loop {
            let (stream, addr) = listener.accept().await?;
            if let Err(e) = stream.set_nodelay(true) {
                warn!("Failed to disable Nagle on {}: {}", addr, e);
            }
            let server = self.clone();
            tokio::spawn(async move {
                let peer = addr.to_string();
                if let Err(e) = server.run_connection(stream, &peer, None).await {
                    info!("Connection from {} ended: {}", peer, e);
                }
            });
        }
    }

    /// Drive one client from the handshake until it disconnects
    ///
    /// `peer` names the remote end, as `user@host:port` when the transport
    /// authenticated a user.
    pub async fn run_connection<S>(
        &self,
        stream: S,
        peer: &str,
        datagram: Option<Box<dyn DatagramSink>>,
    ) -> Result<(), VncError>
    where
        S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
    {
        let connector = VncConnector::new(stream, self.state.clone())
            .set_peer(peer)
            .set_datagram(datagram)
            .build()?;

        let idle = self.state.config.idle_timeout;
        let state = if idle.is_zero() {
            connector.try_start().await?
        } else {
            let grace = idle.max(timer::MIN_HANDSHAKE_IDLE);
            tokio::time::timeout(grace, connector.try_start()).await??
        };
        state.finish()?.run().await
    }

    /// Replace the framebuffer; the layout is kept if it still fits
    pub fn set_pixel_buffer(&self, pb: ManagedPixelBuffer, layout: Option<ScreenSet>) -> Result<(), VncError> {
        {
            let mut frame = self.state.frame_mut();
            let layout = match layout {
                Some(layout) => layout,
                None if frame.layout.validate(pb.width(), pb.height()) => frame.layout.clone(),
                None => ScreenSet::single(pb.width(), pb.height()),
            };
            if !layout.validate(pb.width(), pb.height()) {
                return Err(VncError::InvalidLayout);
            }
            frame.pb = pb;
            frame.layout = layout;
        }
        self.state.notify(DesktopEvent::FramebufferResized);
        Ok(())
    }

    pub fn set_screen_layout(&self, layout: ScreenSet) -> Result<(), VncError> {
        let (width, height) = {
            let frame = self.state.frame();
            (frame.pb.width(), frame.pb.height())
        };
        if !layout.validate(width, height) {
            return Err(VncError::InvalidLayout);
        }
        self.state.apply_layout(width, height, layout, None);
        Ok(())
    }

    pub fn screen_layout(&self) -> ScreenSet {
        self.state.frame().layout.clone()
    }

    /// Copy `data` (in the framebuffer's format, `stride` pixels per row) into `r`
    pub fn image_rect(&self, r: Rect, data: &[u8], stride: usize) {
        let damaged = {
            let mut frame = self.state.frame_mut();
            let r = r.intersect(&frame.pb.rect());
            frame.pb.image_rect(r, data, stride);
            r
        };
        self.damage(Region::from(damaged));
    }

    pub fn fill_rect(&self, r: Rect, pixel: u32) {
        let damaged = {
            let mut frame = self.state.frame_mut();
            let r = r.intersect(&frame.pb.rect());
            frame.pb.fill_rect(r, pixel);
            r
        };
        self.damage(Region::from(damaged));
    }

    /// Move the pixels that end up in `dest` by `delta`, clients get a
    /// CopyRect where they can
    pub fn copy_rect(&self, dest: Rect, delta: Point) {
        let dest = {
            let mut frame = self.state.frame_mut();
            let fb = frame.pb.rect();
            let dest = dest.intersect(&fb).intersect(&fb.translate(delta));
            frame.pb.copy_rect(dest, delta);
            dest
        };
        if dest.is_empty() {
            return;
        }
        self.state.notify(DesktopEvent::Copy {
            dest: Region::from(dest),
            delta,
        });
    }

    /// Report pixels changed through [`with_framebuffer`](Self::with_framebuffer)
    pub fn damage(&self, region: Region) {
        if region.is_empty() {
            return;
        }
        self.state.notify(DesktopEvent::Damage(region));
    }

    /// Draw straight into the framebuffer, then call [`damage`](Self::damage)
    pub fn with_framebuffer<F, R>(&self, f: F) -> R
    where
        F: FnOnce(&mut ManagedPixelBuffer) -> R,
    {
        f(&mut self.state.frame_mut().pb)
    }

    pub fn set_cursor(&self, cursor: Cursor) {
        self.state.frame_mut().cursor = cursor;
        self.state.notify(DesktopEvent::CursorChanged);
    }

    /// `warped` tells clients that support it to move their pointer too
    pub fn set_cursor_pos(&self, pos: Point, warped: bool) {
        {
            let mut frame = self.state.frame_mut();
            if frame.cursor_pos == pos {
                return;
            }
            frame.cursor_pos = pos;
        }
        self.state.notify(DesktopEvent::CursorMoved { warped });
    }

    pub fn set_name(&self, name: &str) {
        self.state.frame_mut().name = name.to_string();
        self.state.notify(DesktopEvent::NameChanged);
    }

    pub fn set_led_state(&self, state: u8) {
        {
            let mut frame = self.state.frame_mut();
            if frame.led_state == Some(state) {
                return;
            }
            frame.led_state = Some(state);
        }
        self.state.notify(DesktopEvent::LedStateChanged);
    }

    pub fn bell(&self) {
        self.state.notify(DesktopEvent::Bell);
    }

    pub fn send_cut_text(&self, text: &str) {
        self.state.notify(DesktopEvent::CutText(text.into()));
    }

    pub fn send_binary_clipboard(&self, entries: Vec<ClipboardEntry>) {
        self.state
            .notify(DesktopEvent::BinaryClipboard(Arc::new(entries)));
    }

    /// Answer a connection query the desktop left pending
    pub fn approve_connection(&self, id: ClientId, accept: bool, reason: &str) -> bool {
        self.state.registry.send(
            id,
            Control::Approve {
                accept,
                reason: reason.to_string(),
            },
        )
    }

    pub fn close_clients(&self, reason: &str) {
        self.state.registry.close_clients(reason, None);
    }

    pub fn close_client(&self, id: ClientId, reason: &str) -> bool {
        self.state
            .registry
            .send(id, Control::Close(reason.to_string()))
    }

    /// 0 full access, 1 view only, 2 no access
    pub fn set_status(&self, id: ClientId, status: u8) -> bool {
        self.state.registry.send(id, Control::SetStatus(status))
    }

    /// The permission store changed, every client looks itself up again
    /// before its next update
    pub fn recheck_permissions(&self) {
        self.state.registry.send_all(Control::RecheckPermissions);
    }

    pub fn request_frame_stats(&self, id: ClientId) -> bool {
        self.state.registry.send(id, Control::RequestFrameStats)
    }

    pub fn clients(&self) -> Vec<ClientId> {
        self.state.registry.ids()
    }

    pub fn users(&self) -> Vec<String> {
        self.state.registry.users()
    }
}
