mod canvas;
mod color;
mod constants;
mod protocol;
mod render;
mod socket;
mod transport;

use std::time::Duration;

use anyhow::Result;
use tracing::{debug, info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use crate::canvas::PixelCanvas;
use crate::protocol::ServerMessage;
use crate::render::{RenderSurface, TraceSurface, ViewTransform};
use crate::socket::{CanvasClient, CanvasEvent};

const STATS_REQUEST_INTERVAL: Duration = Duration::from_secs(30);
const RESYNC_INTERVAL: Duration = Duration::from_secs(600);
const DEMO_PAINT_INTERVAL: Duration = Duration::from_millis(250);

#[tokio::main]
async fn main() -> Result<()> {
    // Initialize tracing
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or("info,canvas_sync=debug".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    let url = std::env::var("CANVAS_URL").unwrap_or_else(|_| constants::WEBSOCKET_URL.to_string());
    let demo_paint = std::env::var("CANVAS_DEMO_PAINT").ok();
    let paint_color = std::env::var("CANVAS_PAINT_COLOR")
        .ok()
        .and_then(|hex| color::hex_to_rgb(&hex));
    info!(%url, demo_paint = demo_paint.is_some(), "starting canvas sync client");

    let mut canvas = PixelCanvas::new(TraceSurface);

    let (viewport_width, viewport_height) = std::env::var("CANVAS_VIEWPORT")
        .ok()
        .and_then(|value| parse_viewport(&value))
        .unwrap_or((1280.0, 720.0));
    let mut view = ViewTransform::reset(
        canvas.width(),
        canvas.height(),
        viewport_width,
        viewport_height,
    );
    if let Some(zoom) = std::env::var("CANVAS_ZOOM").ok().and_then(|z| z.parse().ok()) {
        view = view.zoomed(zoom);
    }
    canvas.surface_mut().set_view(&view);

    let (client, mut events) = CanvasClient::connect(url);

    // paint quietly (no echo from the authority) unless asked otherwise;
    // the local buffer is updated optimistically either way
    let quiet_paint = demo_paint.as_deref() != Some("echo");
    let mut painted: u64 = 0;
    let mut paint_timer = tokio::time::interval(DEMO_PAINT_INTERVAL);
    let mut stats_timer = tokio::time::interval(STATS_REQUEST_INTERVAL);
    let mut resync_timer = tokio::time::interval(RESYNC_INTERVAL);

    loop {
        tokio::select! {
            event = events.recv() => match event {
                Some(event) => apply_event(&client, &mut canvas, event),
                None => {
                    warn!("session task ended");
                    break;
                }
            },
            _ = paint_timer.tick(), if demo_paint.is_some() => {
                if client.is_connected() {
                    let x = rand::random_range(0..canvas.width()) as u16;
                    let y = rand::random_range(0..canvas.height()) as u16;
                    let color = paint_color.unwrap_or_else(color::random_rgb);
                    // optimistic local write, then best-effort publish
                    canvas.set_local(i32::from(x), i32::from(y), color);
                    if quiet_paint {
                        client.send_set_pixel_quiet(x, y, color);
                    } else {
                        client.send_set_pixel(x, y, color);
                    }
                    painted += 1;
                    if painted % 16 == 0 {
                        // spot-check convergence against the authority
                        client.request_pixel(x, y);
                    }
                }
            }
            _ = stats_timer.tick() => {
                if client.is_connected() {
                    client.request_stats();
                }
            }
            _ = resync_timer.tick() => {
                if client.is_connected() {
                    debug!("periodic full resync");
                    client.request_all_pixels();
                }
            }
            _ = tokio::signal::ctrl_c() => {
                info!("shutting down");
                client.shutdown();
            }
        }
    }

    Ok(())
}

fn parse_viewport(value: &str) -> Option<(f32, f32)> {
    let (width, height) = value.split_once('x')?;
    Some((width.parse().ok()?, height.parse().ok()?))
}

fn apply_event<S: RenderSurface>(
    client: &CanvasClient,
    canvas: &mut PixelCanvas<S>,
    event: CanvasEvent,
) {
    match event {
        CanvasEvent::Connected => info!("session established"),
        CanvasEvent::Disconnected => info!(
            dropped_intents = client.dropped_intents(),
            "connection lost, canvas frozen until resync"
        ),
        CanvasEvent::Message(message) => apply_message(canvas, message),
    }
}

/// Route one decoded message into the local buffer. Last write wins, matching
/// the authority's own conflict policy.
fn apply_message<S: RenderSurface>(canvas: &mut PixelCanvas<S>, message: ServerMessage) {
    match message {
        ServerMessage::PixelUpdate { x, y, color } => {
            canvas.set_local(i32::from(x), i32::from(y), color);
        }
        ServerMessage::PixelColor { x, y, color } => {
            let local = canvas.get_color(i32::from(x), i32::from(y));
            if local != color {
                debug!(x, y, local, authority = color, "local cell was stale");
            }
            canvas.set_local(i32::from(x), i32::from(y), color);
        }
        ServerMessage::AllPixels(pixels) => {
            info!(pixels = pixels.len(), "received full canvas snapshot");
            canvas.replace_all(pixels);
        }
        ServerMessage::Stats {
            connected_clients,
            requests_per_second,
        } => {
            info!(connected_clients, requests_per_second, "authority stats");
        }
        ServerMessage::Error { code } => warn!(?code, "authority rejected a request"),
    }
}
