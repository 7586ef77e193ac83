use anyhow::{Context, Result};
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpListener;
use tokio::sync::mpsc;
use tracing::Level;
use vncserver::{Desktop, PixelFormat, Point, Rect, ServerConfig, VncServer};

const WIDTH: i32 = 800;
const HEIGHT: i32 = 600;
const BAR: i32 = 40;

enum Input {
    Pointer(Point, u16),
    Key(u32, bool),
    CutText(String),
}

/// Hands everything the clients do to the drawing loop
struct Demo {
    tx: mpsc::UnboundedSender<Input>,
}

impl Desktop for Demo {
    fn pointer_event(&self, pos: Point, button_mask: u16) {
        let _ = self.tx.send(Input::Pointer(pos, button_mask));
    }

    fn key_event(&self, keysym: u32, _keycode: u32, down: bool) {
        let _ = self.tx.send(Input::Key(keysym, down));
    }

    fn client_cut_text(&self, text: &str) {
        let _ = self.tx.send(Input::CutText(text.to_string()));
    }
}

fn rgb(r: u8, g: u8, b: u8) -> u32 {
    PixelFormat::bgra().pixel_from_rgb(r, g, b)
}

#[tokio::main]
async fn main() -> Result<()> {
    // Create tracing subscriber
    #[cfg(debug_assertions)]
    let subscriber = tracing_subscriber::fmt()
        .pretty()
        .with_max_level(Level::TRACE)
        .finish();
    #[cfg(not(debug_assertions))]
    let subscriber = tracing_subscriber::fmt()
        .pretty()
        .with_max_level(Level::INFO)
        .finish();

    tracing::subscriber::set_global_default(subscriber)
        .context("setting default subscriber failed")?;

    let (tx, mut inputs) = mpsc::unbounded_channel();
    let config = ServerConfig::default()
        .set_name("vnc-server-rs demo")
        .set_frame_rate(30)
        .set_idle_timeout(Duration::from_secs(3600));
    let server = VncServer::builder(Arc::new(Demo { tx }))
        .set_config(config)
        .set_pixel_buffer(vncserver::ManagedPixelBuffer::new(
            WIDTH,
            HEIGHT,
            PixelFormat::bgra(),
        ))
        .build()?;

    let listener = TcpListener::bind("127.0.0.1:5900")
        .await
        .context("Unable to listen on 5900")?;
    tracing::info!("Serving on 127.0.0.1:5900");
    let acceptor = server.clone();
    tokio::spawn(async move {
        if let Err(e) = acceptor.serve(listener).await {
            tracing::error!("{}", e);
        }
    });

    server.fill_rect(Rect::new(0, 0, WIDTH, HEIGHT), rgb(0x20, 0x20, 0x30));
    server.fill_rect(Rect::new(0, 0, BAR, BAR), rgb(0xe0, 0x80, 0x20));
    let mut ticker = tokio::time::interval(Duration::from_millis(33));
    let mut x = 0;
    loop {
        tokio::select! {
            _ = ticker.tick() => {
                // a bar sweeping across the top, moved with a copy
                let next = (x + 4) % (WIDTH - BAR);
                if next > x {
                    server.copy_rect(Rect::new(next, 0, next + BAR, BAR), Point::new(next - x, 0));
                    server.fill_rect(Rect::new(x, 0, next, BAR), rgb(0x20, 0x20, 0x30));
                } else {
                    server.fill_rect(Rect::new(x, 0, x + BAR, BAR), rgb(0x20, 0x20, 0x30));
                    server.fill_rect(Rect::new(next, 0, next + BAR, BAR), rgb(0xe0, 0x80, 0x20));
                }
                x = next;
            }
            input = inputs.recv() => match input {
                Some(Input::Pointer(pos, mask)) if mask & 1 != 0 => {
                    let canvas = Rect::new(0, BAR, WIDTH, HEIGHT);
                    let dot = Rect::new(pos.x - 2, pos.y - 2, pos.x + 2, pos.y + 2);
                    server.fill_rect(dot.intersect(&canvas), rgb(0xff, 0xff, 0xff));
                    server.set_cursor_pos(pos, false);
                }
                Some(Input::Pointer(pos, _)) => server.set_cursor_pos(pos, false),
                Some(Input::Key(keysym, true)) => {
                    tracing::info!("Key 0x{:x}", keysym);
                    if keysym == 0x62 {
                        server.bell();
                    }
                }
                Some(Input::Key(..)) => {}
                Some(Input::CutText(text)) => {
                    tracing::info!("Got clipboard message {}", text);
                    server.send_cut_text(&text);
                }
                None => break,
            }
        }
    }
    Ok(())
}
