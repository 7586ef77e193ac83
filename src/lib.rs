//! # vncserver
//!
//! The server side of the RFB protocol, one async task per client.
//!
//! A [`VncServer`] holds the shared desktop: framebuffer, screen layout,
//! cursor and name. The embedding application draws into it and gets input
//! back through its [`Desktop`] implementation. Every client connection runs
//! the handshake, then follows desktop changes and decides on its own when
//! an update may be sent, paced by the client's requests, the frame rate
//! and the measured network congestion.
//!
//! Screens can be streamed as video, one stream per screen, when both the
//! client and an [`EncoderBackend`] support a codec. Everything else goes
//! out as CopyRect and Raw.

pub mod codec;
pub mod config;
pub mod desktop;
pub mod error;
pub mod event;
pub mod region;
pub mod screen;
pub mod server;

pub use codec::{Codec, EncoderBackend, SoftwareEncoder, VideoEncoder};
pub use config::*;
pub use desktop::*;
pub use error::*;
pub use event::*;
pub use region::{Point, Rect, Region};
pub use screen::{Screen, ScreenSet};
pub use server::{
    ClientId, ConnState, ServerBuilder, VncConnection, VncConnector, VncServer, VncState,
};
