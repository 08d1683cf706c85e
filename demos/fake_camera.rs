//! Fake camera producer
//!
//! Run with: cargo run --example fake_camera [URL] [FPS]
//!
//! Examples:
//!   cargo run --example fake_camera
//!   cargo run --example fake_camera ws://localhost:10000/ws/camera/DEMO-001
//!   cargo run --example fake_camera "ws://relay:10000/ws/camera/cam-2?key=supersecret123" 5
//!
//! ## Viewing
//!
//! MJPEG in a browser:
//!   http://localhost:10000/stream/DEMO-001
//!
//! Raw frames with websocat:
//!   websocat ws://localhost:10000/ws/view/DEMO-001
//!
//! The camera prints `VIEWER_ON` / `VIEWER_OFF` notices as viewers come and go.

use std::io::Cursor;
use std::time::Duration;

use futures_util::{SinkExt, StreamExt};
use image::{ImageFormat, Rgb, RgbImage};
use tokio_tungstenite::connect_async;
use tokio_tungstenite::tungstenite::Message;

const WIDTH: u32 = 320;
const HEIGHT: u32 = 240;

/// Moving diagonal bands so consecutive frames differ
fn render(frame_no: u32) -> Result<Vec<u8>, image::ImageError> {
    let image = RgbImage::from_fn(WIDTH, HEIGHT, |x, y| {
        let band = ((x + y + frame_no * 4) / 16) % 3;
        match band {
            0 => Rgb([200, 40, 40]),
            1 => Rgb([40, 200, 40]),
            _ => Rgb([40, 40, 200]),
        }
    });

    let mut jpeg = Cursor::new(Vec::new());
    image.write_to(&mut jpeg, ImageFormat::Jpeg)?;
    Ok(jpeg.into_inner())
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let mut args = std::env::args().skip(1);
    let url = args
        .next()
        .unwrap_or_else(|| "ws://127.0.0.1:10000/ws/camera/DEMO-001".to_string());
    let fps: u64 = args.next().and_then(|s| s.parse().ok()).unwrap_or(10).max(1);

    println!("Connecting to {}", url);
    let (socket, _) = connect_async(url.as_str()).await?;
    let (mut sink, mut stream) = socket.split();
    println!("Connected, sending {}x{} JPEG at {} fps", WIDTH, HEIGHT, fps);

    let mut ticker = tokio::time::interval(Duration::from_millis(1000 / fps));
    let mut frame_no: u32 = 0;

    loop {
        tokio::select! {
            _ = ticker.tick() => {
                let jpeg = render(frame_no)?;
                sink.send(Message::Binary(jpeg)).await?;
                frame_no = frame_no.wrapping_add(1);
                if frame_no % (fps as u32 * 10).max(1) == 0 {
                    println!("Sent {} frames", frame_no);
                }
            }
            incoming = stream.next() => match incoming {
                Some(Ok(Message::Text(notice))) => println!("Relay: {}", notice),
                Some(Ok(Message::Close(frame))) => {
                    println!("Closed by relay: {:?}", frame);
                    break;
                }
                Some(Ok(_)) => {}
                Some(Err(e)) => {
                    eprintln!("Connection error: {}", e);
                    break;
                }
                None => break,
            }
        }
    }

    Ok(())
}
