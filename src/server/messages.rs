use super::fence::{Fence, MAX_FENCE_PAYLOAD};
use crate::region::Rect;
use crate::screen::{Screen, ScreenSet};
use crate::{PixelFormat, VncError};
use bytes::{Buf, BytesMut};
use tokio::io::{AsyncRead, AsyncReadExt};

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ClientMsg {
    SetPixelFormat(PixelFormat),
    SetEncodings(Vec<i32>),
    FramebufferUpdateRequest { incremental: bool, rect: Rect },
    KeyEvent { down: bool, keysym: u32 },
    PointerEvent { button_mask: u8, x: u16, y: u16 },
    ClientCutText(String),
    /// Only the header was read, the `len` bytes of text that follow are
    /// left to a [`Discard`]
    OversizedCutText(u32),
    EnableContinuousUpdates { enable: bool, rect: Rect },
    ClientFence(Fence),
    SetDesktopSize { width: u16, height: u16, layout: ScreenSet },
    QemuKeyEvent { down: bool, keysym: u32, keycode: u32 },
    RequestStats,
    FrameStats { all: u32, render: u32 },
}

async fn read_rect<S>(reader: &mut S) -> Result<Rect, VncError>
where
    S: AsyncRead + Unpin,
{
    let x = reader.read_u16().await? as i32;
    let y = reader.read_u16().await? as i32;
    let w = reader.read_u16().await? as i32;
    let h = reader.read_u16().await? as i32;
    Ok(Rect::from_xywh(x, y, w, h))
}

/// Bytes of the inbound stream thrown away as they arrive
#[derive(Debug, Default)]
pub struct Discard {
    remaining: u64,
}

impl Discard {
    pub fn start(&mut self, len: u64) {
        self.remaining += len;
    }

    pub fn remaining(&self) -> u64 {
        self.remaining
    }

    /// Drop what `buf` holds of the discarded bytes, true once all are gone
    pub fn drain(&mut self, buf: &mut BytesMut) -> bool {
        let n = (buf.len() as u64).min(self.remaining);
        buf.advance(n as usize);
        self.remaining -= n;
        self.remaining == 0
    }
}

impl ClientMsg {
    /// Parse one message
    ///
    /// Reading from a buffer that holds only part of a message fails with
    /// an error for which [`VncError::is_eof`] is true.
    pub async fn read<S>(reader: &mut S, max_cut_text: usize) -> Result<Self, VncError>
    where
        S: AsyncRead + Unpin,
    {
        let client_msg = reader.read_u8().await?;

        match client_msg {
            0 => {
                // SetPixelFormat
                // +--------------+--------------+--------------+
                // | No. of bytes | Type [Value] | Description  |
                // +--------------+--------------+--------------+
                // | 1            | U8 [0]       | message-type |
                // | 3            |              | padding      |
                // | 16           | PIXEL_FORMAT | pixel-format |
                // +--------------+--------------+--------------+
                let mut padding = [0; 3];
                reader.read_exact(&mut padding).await?;
                let pf = PixelFormat::read(reader).await?;
                Ok(ClientMsg::SetPixelFormat(pf))
            }
            2 => {
                // SetEncodings
                // +--------------+--------------+---------------------+
                // | No. of bytes | Type [Value] | Description         |
                // +--------------+--------------+---------------------+
                // | 1            | U8 [2]       | message-type        |
                // | 1            |              | padding             |
                // | 2            | U16          | number-of-encodings |
                // | 4 * n        | S32 array    | encoding-types      |
                // +--------------+--------------+---------------------+
                let _padding = reader.read_u8().await?;
                let count = reader.read_u16().await?;
                let mut encodings = Vec::with_capacity(count as usize);
                for _ in 0..count {
                    encodings.push(reader.read_i32().await?);
                }
                Ok(ClientMsg::SetEncodings(encodings))
            }
            3 => {
                // FramebufferUpdateRequest
                // +--------------+--------------+--------------+
                // | No. of bytes | Type [Value] | Description  |
                // +--------------+--------------+--------------+
                // | 1            | U8 [3]       | message-type |
                // | 1            | U8           | incremental  |
                // | 2            | U16          | x-position   |
                // | 2            | U16          | y-position   |
                // | 2            | U16          | width        |
                // | 2            | U16          | height       |
                // +--------------+--------------+--------------+
                let incremental = reader.read_u8().await? != 0;
                let rect = read_rect(reader).await?;
                Ok(ClientMsg::FramebufferUpdateRequest { incremental, rect })
            }
            4 => {
                // KeyEvent
                // +--------------+--------------+--------------+
                // | No. of bytes | Type [Value] | Description  |
                // +--------------+--------------+--------------+
                // | 1            | U8 [4]       | message-type |
                // | 1            | U8           | down-flag    |
                // | 2            |              | padding      |
                // | 4            | U32          | key          |
                // +--------------+--------------+--------------+
                let down = reader.read_u8().await? != 0;
                let _padding = reader.read_u16().await?;
                let keysym = reader.read_u32().await?;
                Ok(ClientMsg::KeyEvent { down, keysym })
            }
            5 => {
                // PointerEvent
                // +--------------+--------------+--------------+
                // | No. of bytes | Type [Value] | Description  |
                // +--------------+--------------+--------------+
                // | 1            | U8 [5]       | message-type |
                // | 1            | U8           | button-mask  |
                // | 2            | U16          | x-position   |
                // | 2            | U16          | y-position   |
                // +--------------+--------------+--------------+
                let button_mask = reader.read_u8().await?;
                let x = reader.read_u16().await?;
                let y = reader.read_u16().await?;
                Ok(ClientMsg::PointerEvent { button_mask, x, y })
            }
            6 => {
                // ClientCutText
                // +--------------+--------------+--------------+
                // | No. of bytes | Type [Value] | Description  |
                // +--------------+--------------+--------------+
                // | 1            | U8 [6]       | message-type |
                // | 3            |              | padding      |
                // | 4            | U32          | length       |
                // | length       | U8 array     | text         |
                // +--------------+--------------+--------------+
                let mut padding = [0; 3];
                reader.read_exact(&mut padding).await?;
                let len = reader.read_u32().await?;
                if len as usize > max_cut_text {
                    return Ok(ClientMsg::OversizedCutText(len));
                }
                let mut text = vec![0; len as usize];
                reader.read_exact(&mut text).await?;
                // latin-1
                let text = text.into_iter().map(char::from).collect();
                Ok(ClientMsg::ClientCutText(text))
            }
            150 => {
                // EnableContinuousUpdates
                // +--------------+--------------+--------------+
                // | No. of bytes | Type [Value] | Description  |
                // +--------------+--------------+--------------+
                // | 1            | U8 [150]     | message-type |
                // | 1            | U8           | enable-flag  |
                // | 2            | U16          | x-position   |
                // | 2            | U16          | y-position   |
                // | 2            | U16          | width        |
                // | 2            | U16          | height       |
                // +--------------+--------------+--------------+
                let enable = reader.read_u8().await? != 0;
                let rect = read_rect(reader).await?;
                Ok(ClientMsg::EnableContinuousUpdates { enable, rect })
            }
            178 => {
                // RequestStats
                let mut padding = [0; 3];
                reader.read_exact(&mut padding).await?;
                Ok(ClientMsg::RequestStats)
            }
            179 => {
                // FrameStats
                // +--------------+--------------+--------------+
                // | No. of bytes | Type [Value] | Description  |
                // +--------------+--------------+--------------+
                // | 1            | U8 [179]     | message-type |
                // | 3            |              | padding      |
                // | 4            | U32          | all (ms)     |
                // | 4            | U32          | render (ms)  |
                // +--------------+--------------+--------------+
                let mut padding = [0; 3];
                reader.read_exact(&mut padding).await?;
                let all = reader.read_u32().await?;
                let render = reader.read_u32().await?;
                Ok(ClientMsg::FrameStats { all, render })
            }
            248 => {
                // ClientFence
                // +--------------+--------------+--------------+
                // | No. of bytes | Type [Value] | Description  |
                // +--------------+--------------+--------------+
                // | 1            | U8 [248]     | message-type |
                // | 3            |              | padding      |
                // | 4            | U32          | flags        |
                // | 1            | U8           | length       |
                // | length       | U8 array     | payload      |
                // +--------------+--------------+--------------+
                let mut padding = [0; 3];
                reader.read_exact(&mut padding).await?;
                let flags = reader.read_u32().await?;
                let len = reader.read_u8().await? as usize;
                if len > MAX_FENCE_PAYLOAD {
                    return Err(VncError::Protocol(format!(
                        "Fence payload of {} bytes is too large",
                        len
                    )));
                }
                let mut payload = vec![0; len];
                reader.read_exact(&mut payload).await?;
                Ok(ClientMsg::ClientFence(Fence::new(flags, payload)))
            }
            251 => {
                // SetDesktopSize
                // +--------------+--------------+-------------------+
                // | No. of bytes | Type [Value] | Description       |
                // +--------------+--------------+-------------------+
                // | 1            | U8 [251]     | message-type      |
                // | 1            |              | padding           |
                // | 2            | U16          | width             |
                // | 2            | U16          | height            |
                // | 1            | U8           | number-of-screens |
                // | 1            |              | padding           |
                // | 16 * n       | SCREEN array | screens           |
                // +--------------+--------------+-------------------+
                let _padding = reader.read_u8().await?;
                let width = reader.read_u16().await?;
                let height = reader.read_u16().await?;
                let count = reader.read_u8().await?;
                let _padding = reader.read_u8().await?;
                let mut layout = ScreenSet::new();
                for _ in 0..count {
                    let id = reader.read_u32().await?;
                    let rect = read_rect(reader).await?;
                    let flags = reader.read_u32().await?;
                    layout.add_screen(Screen {
                        id,
                        dimensions: rect,
                        flags,
                    });
                }
                Ok(ClientMsg::SetDesktopSize {
                    width,
                    height,
                    layout,
                })
            }
            255 => {
                // QEMU client message
                // +--------------+--------------+--------------+
                // | No. of bytes | Type [Value] | Description  |
                // +--------------+--------------+--------------+
                // | 1            | U8 [255]     | message-type |
                // | 1            | U8 [0]       | submessage   |
                // | 2            | U16          | down-flag    |
                // | 4            | U32          | keysym       |
                // | 4            | U32          | keycode      |
                // +--------------+--------------+--------------+
                let subtype = reader.read_u8().await?;
                if subtype != 0 {
                    return Err(VncError::Protocol(format!(
                        "Unknown QEMU submessage {}",
                        subtype
                    )));
                }
                let down = reader.read_u16().await? != 0;
                let keysym = reader.read_u32().await?;
                let keycode = reader.read_u32().await?;
                Ok(ClientMsg::QemuKeyEvent {
                    down,
                    keysym,
                    keycode,
                })
            }
            other => Err(VncError::WrongClientMessage(other)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    async fn parse(bytes: &[u8]) -> Result<(ClientMsg, usize), VncError> {
        let mut reader = bytes;
        let msg = ClientMsg::read(&mut reader, 16).await?;
        Ok((msg, bytes.len() - reader.len()))
    }

    #[tokio::test]
    async fn partial_messages_are_eof() {
        let request = [3, 0, 0, 0, 0, 0, 3, 0x20, 2, 0x58];
        let (msg, used) = parse(&request).await.unwrap();
        assert_eq!(used, 10);
        assert_eq!(
            msg,
            ClientMsg::FramebufferUpdateRequest {
                incremental: false,
                rect: Rect::new(0, 0, 800, 600)
            }
        );
        for cut in 0..request.len() {
            assert!(parse(&request[..cut]).await.unwrap_err().is_eof());
        }
    }

    #[tokio::test]
    async fn fence_and_layout() {
        let fence = [248, 0, 0, 0, 0x80, 0, 0, 5, 2, 7, 8];
        let (msg, _) = parse(&fence).await.unwrap();
        assert_eq!(msg, ClientMsg::ClientFence(Fence::new(0x8000_0005, vec![7, 8])));
        let big = [248, 0, 0, 0, 0, 0, 0, 0, 65];
        assert!(!parse(&big).await.unwrap_err().is_eof());

        let mut msg = vec![251, 0, 3, 0x20, 2, 0x58, 1, 0];
        msg.extend_from_slice(&[0, 0, 0, 9, 0, 0, 0, 0, 3, 0x20, 2, 0x58, 0, 0, 0, 0]);
        let (parsed, used) = parse(&msg).await.unwrap();
        assert_eq!(used, msg.len());
        match parsed {
            ClientMsg::SetDesktopSize { width, layout, .. } => {
                assert_eq!(width, 800);
                assert_eq!(layout.get(9).map(|s| s.dimensions), Some(Rect::new(0, 0, 800, 600)));
            }
            other => panic!("unexpected {:?}", other),
        }
    }

    #[tokio::test]
    async fn oversized_cut_text_stops_at_the_header() {
        let mut msg = vec![6, 0, 0, 0, 0xff, 0xff, 0xff, 0xff];
        msg.extend_from_slice(&[b'a'; 20]);
        let (parsed, used) = parse(&msg).await.unwrap();
        assert_eq!(parsed, ClientMsg::OversizedCutText(u32::MAX));
        assert_eq!(used, 8);

        let msg = [6, 0, 0, 0, 0, 0, 0, 2, 0xe9, b'!'];
        let (parsed, _) = parse(&msg).await.unwrap();
        assert_eq!(parsed, ClientMsg::ClientCutText("é!".to_string()));
    }

    #[test]
    fn discarded_bytes_are_never_held() {
        let mut discard = Discard::default();
        discard.start(u32::MAX as u64);
        let mut buf = BytesMut::new();
        let chunk = vec![b'a'; 64 * 1024];
        // 8 MiB arrive in socket sized pieces
        for _ in 0..128 {
            buf.extend_from_slice(&chunk);
            assert!(!discard.drain(&mut buf));
            assert!(buf.is_empty());
        }
        assert_eq!(discard.remaining(), u32::MAX as u64 - 8 * 1024 * 1024);

        // the tail of the text and the next message share a read
        let mut discard = Discard::default();
        discard.start(3);
        let mut buf = BytesMut::from(&[b'x', b'y', b'z', 3, 1][..]);
        assert!(discard.drain(&mut buf));
        assert_eq!(&buf[..], &[3, 1]);
    }

    #[tokio::test]
    async fn unknown_and_qemu() {
        assert!(matches!(
            parse(&[7]).await,
            Err(VncError::WrongClientMessage(7))
        ));
        let qemu = [255, 0, 0, 1, 0, 0, 0xff, 0x0d, 0, 0, 0, 0x1c];
        let (msg, _) = parse(&qemu).await.unwrap();
        assert_eq!(
            msg,
            ClientMsg::QemuKeyEvent {
                down: true,
                keysym: 0xff0d,
                keycode: 0x1c
            }
        );
        assert!(parse(&[255, 1]).await.is_err());
    }
}
