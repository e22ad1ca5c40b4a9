//! Local presenter window (feature `viewer`)
//!
//! Blits the shared frame buffer into a minifb window at a fixed cadence and
//! turns local mouse movement into broadcast pointer events.

use crate::protocol::buttons;
use crate::server::ServerHandle;
use crate::shm::Geometry;
use anyhow::{anyhow, Result};
use minifb::{Key, MouseButton, MouseMode, Window, WindowOptions};
use std::time::{Duration, Instant};
use tracing::{debug, info};

/// Converts raw frame buffer bytes to minifb's 0RGB pixels.
///
/// 32 and 24 bpp are little-endian 0xRRGGBB, 16 bpp is RGB565 and 8 bpp
/// is treated as grayscale.
pub fn to_0rgb(geometry: Geometry, src: &[u8], dst: &mut [u32]) {
    let bpp = geometry.bytes_per_pixel();
    let stride = geometry.stride();
    let width = geometry.width as usize;

    for (y, row) in src.chunks_exact(stride).enumerate() {
        for x in 0..width {
            let Some(out) = dst.get_mut(y * width + x) else {
                return;
            };
            let p = &row[x * bpp..(x + 1) * bpp];
            *out = match bpp {
                3 | 4 => u32::from_le_bytes([p[0], p[1], p[2], 0]),
                2 => {
                    let v = u16::from_le_bytes([p[0], p[1]]) as u32;
                    let r = (v >> 11) & 0x1f;
                    let g = (v >> 5) & 0x3f;
                    let b = v & 0x1f;
                    ((r << 3 | r >> 2) << 16) | ((g << 2 | g >> 4) << 8) | (b << 3 | b >> 2)
                }
                _ => {
                    let v = p[0] as u32;
                    (v << 16) | (v << 8) | v
                }
            };
        }
    }
}

fn pointer_buttons(window: &Window) -> u32 {
    let mut state = 0;
    if window.get_mouse_down(MouseButton::Left) {
        state |= buttons::LEFT;
    }
    if window.get_mouse_down(MouseButton::Right) {
        state |= buttons::RIGHT;
    }
    if window.get_mouse_down(MouseButton::Middle) {
        state |= buttons::MIDDLE;
    }
    state
}

/// Runs until the window is closed or Escape is pressed. Must stay on the
/// thread that created it, so the server runs in a spawned task.
pub async fn run(server: ServerHandle, refresh: Duration) -> Result<()> {
    let geometry = server.frame_buffer().geometry();
    let (width, height) = (geometry.width as usize, geometry.height as usize);

    let mut window = Window::new(
        &format!("fbws {}x{}", width, height),
        width,
        height,
        WindowOptions {
            resize: false,
            ..Default::default()
        },
    )
    .map_err(|e| anyhow!("failed to create window: {}", e))?;
    window.set_target_fps(60);

    let mut raw = vec![0u8; geometry.size()];
    let mut pixels = vec![0u32; width * height];
    let mut last_blit: Option<Instant> = None;
    let mut last_pointer = None;

    info!("viewer ready, press Escape to quit");

    loop {
        if !window.is_open() || window.is_key_down(Key::Escape) {
            break;
        }

        if last_blit.map_or(true, |t| t.elapsed() >= refresh) {
            server.frame_buffer().read_into(&mut raw)?;
            to_0rgb(geometry, &raw, &mut pixels);
            last_blit = Some(Instant::now());
        }
        window
            .update_with_buffer(&pixels, width, height)
            .map_err(|e| anyhow!("render error: {}", e))?;

        if let Some((x, y)) = window.get_mouse_pos(MouseMode::Clamp) {
            let pointer = (x as i32, y as i32, pointer_buttons(&window));
            if last_pointer != Some(pointer) {
                let sent = server
                    .broadcast_pointer_event(pointer.0, pointer.1, pointer.2)
                    .await;
                debug!(x = pointer.0, y = pointer.1, buttons = pointer.2, sent, "pointer");
                last_pointer = Some(pointer);
            }
        }

        tokio::time::sleep(Duration::from_millis(16)).await;
    }

    info!("viewer closed");
    Ok(())
}
