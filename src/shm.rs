//! Shared frame buffer
//!
//! One SysV shared memory segment holds the whole screen. The server creates
//! it before accepting connections and removes it when dropped; clients only
//! attach to it by the handle they get in the handshake and draw straight
//! into it. Nothing here synchronises pixel access between processes.

use crate::error::StartupError;
use crate::window::Rect;
use std::io;
use std::ptr;

/// Segment permissions: any local user's clients may attach.
pub const DEFAULT_SHM_MODE: u32 = 0o666;

/// Screen size and depth.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Geometry {
    pub width: u32,
    pub height: u32,
    pub bits_per_pixel: u32,
}

impl Geometry {
    pub fn new(width: u32, height: u32, bits_per_pixel: u32) -> Result<Self, StartupError> {
        if width == 0 || height == 0 {
            return Err(StartupError::Geometry(format!(
                "{}x{} has a zero dimension",
                width, height
            )));
        }
        if width > i32::MAX as u32 || height > i32::MAX as u32 {
            return Err(StartupError::Geometry(format!(
                "{}x{} exceeds the signed coordinate range",
                width, height
            )));
        }
        if !matches!(bits_per_pixel, 8 | 16 | 24 | 32) {
            return Err(StartupError::Geometry(format!(
                "unsupported depth {} (expected 8, 16, 24 or 32)",
                bits_per_pixel
            )));
        }
        let geometry = Self {
            width,
            height,
            bits_per_pixel,
        };
        geometry
            .checked_size()
            .ok_or_else(|| StartupError::Geometry(format!("{}x{} is too large", width, height)))?;
        Ok(geometry)
    }

    pub fn bytes_per_pixel(&self) -> usize {
        (self.bits_per_pixel / 8) as usize
    }

    /// Bytes per row.
    pub fn stride(&self) -> usize {
        self.width as usize * self.bytes_per_pixel()
    }

    pub fn size(&self) -> usize {
        self.stride() * self.height as usize
    }

    fn checked_size(&self) -> Option<usize> {
        (self.width as usize)
            .checked_mul(self.height as usize)?
            .checked_mul(self.bytes_per_pixel())
    }

    fn offset(&self, x: u32, y: u32) -> Option<usize> {
        (x < self.width && y < self.height)
            .then(|| y as usize * self.stride() + x as usize * self.bytes_per_pixel())
    }
}

/// A mapping of the segment into this process.
struct Segment {
    id: libc::c_int,
    ptr: *mut u8,
    len: usize,
}

// Raw pixel memory; callers go through the copy helpers below.
unsafe impl Send for Segment {}
unsafe impl Sync for Segment {}

impl Segment {
    fn attach(id: libc::c_int, len: usize) -> io::Result<Self> {
        let mut ds: libc::shmid_ds = unsafe { std::mem::zeroed() };
        if unsafe { libc::shmctl(id, libc::IPC_STAT, &mut ds) } < 0 {
            return Err(io::Error::last_os_error());
        }
        if (ds.shm_segsz as usize) < len {
            return Err(io::Error::new(
                io::ErrorKind::InvalidInput,
                format!(
                    "segment {} holds {} bytes, display needs {}",
                    id, ds.shm_segsz, len
                ),
            ));
        }

        let addr = unsafe { libc::shmat(id, ptr::null(), 0) };
        if addr as isize == -1 {
            return Err(io::Error::last_os_error());
        }
        Ok(Self {
            id,
            ptr: addr as *mut u8,
            len,
        })
    }

    fn read(&self, offset: usize, dst: &mut [u8]) -> io::Result<()> {
        self.check_range(offset, dst.len())?;
        unsafe { ptr::copy_nonoverlapping(self.ptr.add(offset), dst.as_mut_ptr(), dst.len()) };
        Ok(())
    }

    fn write(&mut self, offset: usize, src: &[u8]) -> io::Result<()> {
        self.check_range(offset, src.len())?;
        unsafe { ptr::copy_nonoverlapping(src.as_ptr(), self.ptr.add(offset), src.len()) };
        Ok(())
    }

    fn check_range(&self, offset: usize, len: usize) -> io::Result<()> {
        match offset.checked_add(len) {
            Some(end) if end <= self.len => Ok(()),
            _ => Err(io::Error::new(
                io::ErrorKind::InvalidInput,
                format!("{} bytes at offset {} exceed buffer of {}", len, offset, self.len),
            )),
        }
    }

    fn read_pixel(&self, geometry: &Geometry, x: u32, y: u32) -> Option<u32> {
        let offset = geometry.offset(x, y)?;
        let mut raw = [0u8; 4];
        self.read(offset, &mut raw[..geometry.bytes_per_pixel()]).ok()?;
        Some(u32::from_le_bytes(raw))
    }
}

impl Drop for Segment {
    fn drop(&mut self) {
        unsafe { libc::shmdt(self.ptr as *const libc::c_void) };
    }
}

/// The server's frame buffer. Owns the segment for the life of the server.
pub struct SharedFrameBuffer {
    segment: Segment,
    geometry: Geometry,
}

impl SharedFrameBuffer {
    pub fn create(geometry: Geometry) -> io::Result<Self> {
        Self::create_with_mode(geometry, DEFAULT_SHM_MODE)
    }

    /// Creates the segment with permission bits `mode` (e.g. `0o600` to keep
    /// other users' clients out).
    pub fn create_with_mode(geometry: Geometry, mode: u32) -> io::Result<Self> {
        if mode & !0o777 != 0 {
            return Err(io::Error::new(
                io::ErrorKind::InvalidInput,
                format!("invalid segment mode {:#o}", mode),
            ));
        }
        let size = geometry.size();
        let id = unsafe {
            libc::shmget(
                libc::IPC_PRIVATE,
                size,
                libc::IPC_CREAT | libc::IPC_EXCL | mode as libc::c_int,
            )
        };
        if id < 0 {
            return Err(io::Error::last_os_error());
        }

        let segment = match Segment::attach(id, size) {
            Ok(segment) => segment,
            Err(e) => {
                unsafe { libc::shmctl(id, libc::IPC_RMID, ptr::null_mut()) };
                return Err(e);
            }
        };

        tracing::debug!(shmid = id, size, "created shared frame buffer");
        Ok(Self { segment, geometry })
    }

    /// Handle clients pass to [`FrameBufferAttachment::attach`].
    pub fn handle(&self) -> u32 {
        self.segment.id as u32
    }

    pub fn geometry(&self) -> Geometry {
        self.geometry
    }

    pub fn len(&self) -> usize {
        self.segment.len
    }

    pub fn is_empty(&self) -> bool {
        self.segment.len == 0
    }

    /// Copies the current screen contents into `dst`.
    pub fn read_into(&self, dst: &mut [u8]) -> io::Result<()> {
        self.segment.read(0, dst)
    }

    pub fn snapshot(&self) -> io::Result<Vec<u8>> {
        let mut pixels = vec![0; self.len()];
        self.read_into(&mut pixels)?;
        Ok(pixels)
    }

    pub fn read_pixel(&self, x: u32, y: u32) -> Option<u32> {
        self.segment.read_pixel(&self.geometry, x, y)
    }
}

impl Drop for SharedFrameBuffer {
    fn drop(&mut self) {
        // Marked for removal; the kernel frees it once the last client detaches.
        unsafe { libc::shmctl(self.segment.id, libc::IPC_RMID, ptr::null_mut()) };
        tracing::debug!(shmid = self.segment.id, "released shared frame buffer");
    }
}

/// A client's view of the server's frame buffer. Detaches on drop.
pub struct FrameBufferAttachment {
    segment: Segment,
    geometry: Geometry,
}

impl FrameBufferAttachment {
    pub fn attach(handle: u32, geometry: Geometry) -> io::Result<Self> {
        let id = libc::c_int::try_from(handle)
            .map_err(|_| io::Error::new(io::ErrorKind::InvalidInput, "invalid shm handle"))?;
        let segment = Segment::attach(id, geometry.size())?;
        Ok(Self { segment, geometry })
    }

    pub fn geometry(&self) -> Geometry {
        self.geometry
    }

    pub fn write(&mut self, offset: usize, data: &[u8]) -> io::Result<()> {
        self.segment.write(offset, data)
    }

    pub fn write_pixel(&mut self, x: u32, y: u32, pixel: u32) -> io::Result<()> {
        let offset = self.geometry.offset(x, y).ok_or_else(|| {
            io::Error::new(io::ErrorKind::InvalidInput, format!("({}, {}) is off screen", x, y))
        })?;
        let bpp = self.geometry.bytes_per_pixel();
        self.segment.write(offset, &pixel.to_le_bytes()[..bpp])
    }

    /// Fills `rect`, clipped to the screen.
    pub fn fill_rect(&mut self, rect: Rect, pixel: u32) -> io::Result<()> {
        let g = self.geometry;
        let x0 = (rect.x as i64).clamp(0, g.width as i64) as u32;
        let y0 = (rect.y as i64).clamp(0, g.height as i64) as u32;
        let x1 = (rect.x as i64 + rect.width as i64).clamp(0, g.width as i64) as u32;
        let y1 = (rect.y as i64 + rect.height as i64).clamp(0, g.height as i64) as u32;
        if x0 >= x1 || y0 >= y1 {
            return Ok(());
        }

        let bpp = g.bytes_per_pixel();
        let row: Vec<u8> = pixel.to_le_bytes()[..bpp]
            .iter()
            .copied()
            .cycle()
            .take((x1 - x0) as usize * bpp)
            .collect();
        for y in y0..y1 {
            let offset = y as usize * g.stride() + x0 as usize * bpp;
            self.segment.write(offset, &row)?;
        }
        Ok(())
    }

    pub fn read_pixel(&self, x: u32, y: u32) -> Option<u32> {
        self.segment.read_pixel(&self.geometry, x, y)
    }
}
