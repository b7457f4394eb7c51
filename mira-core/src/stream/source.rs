//! Display frame sources.
//!
//! [`DxgiSource`] wraps the Direct3D 11 Desktop Duplication API for
//! GPU-backed capture with minimal latency. [`CpuSource`] is the
//! portable fallback built on `scrap`. [`open_source`] probes them in
//! order and returns whichever opens first.
//!
//! Both sources emit **tightly packed** BGRA buffers; GPU row padding
//! is stripped here so downstream stages never deal with stride.

use std::time::Duration;

use tracing::{info, warn};

use crate::config::StreamConfig;
use crate::error::MiraError;

// ── RawFrame ─────────────────────────────────────────────────────

/// One tightly packed BGRA frame straight from a source.
#[derive(Debug, Clone)]
pub struct RawFrame {
    pub data: Vec<u8>,
    pub width: u32,
    pub height: u32,
}

// ── FrameSource ──────────────────────────────────────────────────

/// A display capture backend.
///
/// `grab` blocks for at most `timeout` waiting for a fresh frame and
/// returns [`MiraError::Timeout`] when the display has not changed,
/// which the capture stage treats as "replay the cache".
pub trait FrameSource: Send {
    fn grab(&mut self, timeout: Duration) -> Result<RawFrame, MiraError>;

    /// Native dimensions of the captured display.
    fn dimensions(&self) -> (u32, u32);

    /// Backend name for logs.
    fn name(&self) -> &'static str;
}

/// Open the preferred source for `config`: desktop duplication when
/// hardware capture is enabled, otherwise (or on failure) the CPU
/// frame grabber.
pub fn open_source(config: &StreamConfig) -> Result<Box<dyn FrameSource>, MiraError> {
    if config.hardware_capture {
        match DxgiSource::new(0) {
            Ok(src) => {
                info!(backend = src.name(), "capture source opened");
                return Ok(Box::new(src));
            }
            Err(e) => {
                warn!("desktop duplication unavailable ({e}); falling back to CPU capture");
            }
        }
    }

    let src = CpuSource::new()?;
    info!(backend = src.name(), "capture source opened");
    Ok(Box::new(src))
}

// ── Cursor sampling ──────────────────────────────────────────────

/// Current cursor position in absolute pixels, plus the screen size.
#[cfg(target_os = "windows")]
pub fn cursor_position() -> Option<((i32, i32), (i32, i32))> {
    use windows::Win32::Foundation::POINT;
    use windows::Win32::UI::WindowsAndMessaging::{
        GetCursorPos, GetSystemMetrics, SM_CXSCREEN, SM_CYSCREEN,
    };

    let mut point = POINT::default();
    unsafe {
        if GetCursorPos(&mut point).is_err() {
            return None;
        }
        let w = GetSystemMetrics(SM_CXSCREEN);
        let h = GetSystemMetrics(SM_CYSCREEN);
        if w <= 0 || h <= 0 {
            return None;
        }
        Some(((point.x, point.y), (w, h)))
    }
}

#[cfg(not(target_os = "windows"))]
pub fn cursor_position() -> Option<((i32, i32), (i32, i32))> {
    None
}

/// Cursor position normalized to `[0, 1]`, or screen centre when the
/// platform cannot report one.
pub fn cursor_normalized() -> (f32, f32) {
    match cursor_position() {
        Some(((x, y), (w, h))) => (
            (x as f32 / w as f32).clamp(0.0, 1.0),
            (y as f32 / h as f32).clamp(0.0, 1.0),
        ),
        None => (0.5, 0.5),
    }
}

// ── DxgiSource ───────────────────────────────────────────────────

/// GPU desktop duplication source.
///
/// 1. Create a D3D11 device.
/// 2. Duplicate the primary output.
/// 3. Copy each acquired desktop texture into a CPU-readable staging
///    texture, map it, and strip the row pitch.
pub struct DxgiSource {
    width: u32,
    height: u32,

    #[cfg(target_os = "windows")]
    context: windows::Win32::Graphics::Direct3D11::ID3D11DeviceContext,
    #[cfg(target_os = "windows")]
    duplication: windows::Win32::Graphics::Dxgi::IDXGIOutputDuplication,
    #[cfg(target_os = "windows")]
    staging: windows::Win32::Graphics::Direct3D11::ID3D11Texture2D,
}

#[cfg(target_os = "windows")]
mod dxgi {
    use super::*;
    use windows::core::Interface;
    use windows::Win32::Graphics::{
        Direct3D::D3D_DRIVER_TYPE_HARDWARE,
        Direct3D11::*,
        Dxgi::{Common::*, *},
    };

    impl DxgiSource {
        /// Duplicate output `monitor_index` (0 = primary).
        pub fn new(monitor_index: u32) -> Result<Self, MiraError> {
            unsafe { Self::init(monitor_index) }
        }

        unsafe fn init(monitor_index: u32) -> Result<Self, MiraError> {
            let mut device = None;
            let mut context = None;
            D3D11CreateDevice(
                None,
                D3D_DRIVER_TYPE_HARDWARE,
                None,
                D3D11_CREATE_DEVICE_BGRA_SUPPORT,
                None,
                D3D11_SDK_VERSION,
                Some(&mut device),
                None,
                Some(&mut context),
            )
            .map_err(|e| MiraError::CaptureInit(format!("D3D11CreateDevice: {e}")))?;

            let device =
                device.ok_or_else(|| MiraError::CaptureInit("D3D11 device is None".into()))?;
            let context =
                context.ok_or_else(|| MiraError::CaptureInit("D3D11 context is None".into()))?;

            let dxgi_device: IDXGIDevice = device
                .cast()
                .map_err(|e| MiraError::CaptureInit(format!("cast IDXGIDevice: {e}")))?;
            let adapter = dxgi_device
                .GetAdapter()
                .map_err(|e| MiraError::CaptureInit(format!("GetAdapter: {e}")))?;
            let output = adapter
                .EnumOutputs(monitor_index)
                .map_err(|e| MiraError::CaptureInit(format!("EnumOutputs({monitor_index}): {e}")))?;
            let output1: IDXGIOutput1 = output
                .cast()
                .map_err(|e| MiraError::CaptureInit(format!("cast IDXGIOutput1: {e}")))?;
            let duplication = output1
                .DuplicateOutput(&device)
                .map_err(|e| MiraError::CaptureInit(format!("DuplicateOutput: {e}")))?;

            let desc = duplication.GetDesc();
            let width = desc.ModeDesc.Width;
            let height = desc.ModeDesc.Height;

            let staging_desc = D3D11_TEXTURE2D_DESC {
                Width: width,
                Height: height,
                MipLevels: 1,
                ArraySize: 1,
                Format: DXGI_FORMAT_B8G8R8A8_UNORM,
                SampleDesc: DXGI_SAMPLE_DESC {
                    Count: 1,
                    Quality: 0,
                },
                Usage: D3D11_USAGE_STAGING,
                BindFlags: 0,
                CPUAccessFlags: D3D11_CPU_ACCESS_READ.0 as u32,
                MiscFlags: 0,
            };
            let mut staging = None;
            device
                .CreateTexture2D(&staging_desc, None, Some(&mut staging))
                .map_err(|e| MiraError::CaptureInit(format!("CreateTexture2D: {e}")))?;
            let staging =
                staging.ok_or_else(|| MiraError::CaptureInit("staging texture is None".into()))?;

            Ok(Self {
                width,
                height,
                context,
                duplication,
                staging,
            })
        }

        unsafe fn grab_inner(&mut self, timeout: Duration) -> Result<RawFrame, MiraError> {
            let mut frame_info = DXGI_OUTDUPL_FRAME_INFO::default();
            let mut resource = None;

            match self.duplication.AcquireNextFrame(
                timeout.as_millis() as u32,
                &mut frame_info,
                &mut resource,
            ) {
                Ok(()) => {}
                Err(e) if e.code() == DXGI_ERROR_WAIT_TIMEOUT => {
                    return Err(MiraError::Timeout(timeout));
                }
                Err(e) => return Err(MiraError::Capture(format!("AcquireNextFrame: {e}"))),
            }

            let resource =
                resource.ok_or_else(|| MiraError::Capture("acquired resource is None".into()))?;
            let texture: ID3D11Texture2D = resource.cast().map_err(|e| {
                let _ = self.duplication.ReleaseFrame();
                MiraError::Capture(format!("cast ID3D11Texture2D: {e}"))
            })?;

            self.context.CopyResource(&self.staging, &texture);
            let _ = self.duplication.ReleaseFrame();

            let mut mapped = D3D11_MAPPED_SUBRESOURCE::default();
            self.context
                .Map(&self.staging, 0, D3D11_MAP_READ, 0, Some(&mut mapped))
                .map_err(|e| MiraError::Capture(format!("Map: {e}")))?;

            // Strip the row pitch into a tight buffer.
            let stride = mapped.RowPitch as usize;
            let row_len = self.width as usize * 4;
            let src = std::slice::from_raw_parts(
                mapped.pData as *const u8,
                stride * self.height as usize,
            );
            let mut data = Vec::with_capacity(row_len * self.height as usize);
            for y in 0..self.height as usize {
                data.extend_from_slice(&src[y * stride..y * stride + row_len]);
            }

            self.context.Unmap(&self.staging, 0);

            Ok(RawFrame {
                data,
                width: self.width,
                height: self.height,
            })
        }
    }

    impl FrameSource for DxgiSource {
        fn grab(&mut self, timeout: Duration) -> Result<RawFrame, MiraError> {
            unsafe { self.grab_inner(timeout) }
        }

        fn dimensions(&self) -> (u32, u32) {
            (self.width, self.height)
        }

        fn name(&self) -> &'static str {
            "dxgi-duplication"
        }
    }
}

#[cfg(not(target_os = "windows"))]
impl DxgiSource {
    pub fn new(_monitor_index: u32) -> Result<Self, MiraError> {
        Err(MiraError::CaptureInit(
            "desktop duplication is only available on Windows".into(),
        ))
    }
}

#[cfg(not(target_os = "windows"))]
impl FrameSource for DxgiSource {
    fn grab(&mut self, _timeout: Duration) -> Result<RawFrame, MiraError> {
        Err(MiraError::Capture("not supported on this platform".into()))
    }

    fn dimensions(&self) -> (u32, u32) {
        (self.width, self.height)
    }

    fn name(&self) -> &'static str {
        "dxgi-duplication"
    }
}

// ── CpuSource ────────────────────────────────────────────────────

/// Portable CPU frame grabber.
///
/// `scrap::Capturer` is not `Send` on every platform, so a dedicated
/// thread owns it and hands fresh frames over a rendezvous channel.
/// The channel holds a single frame; when the consumer lags, stale
/// frames are replaced rather than queued.
pub struct CpuSource {
    rx: std::sync::mpsc::Receiver<RawFrame>,
    width: u32,
    height: u32,
    stop: std::sync::Arc<std::sync::atomic::AtomicBool>,
}

impl CpuSource {
    pub fn new() -> Result<Self, MiraError> {
        use scrap::{Capturer, Display};

        // Probe dimensions up front so failures surface here, not in
        // the capture thread.
        let display = Display::primary()
            .map_err(|e| MiraError::CaptureInit(format!("no primary display: {e}")))?;
        let width = display.width() as u32;
        let height = display.height() as u32;
        drop(display);

        let (tx, rx) = std::sync::mpsc::sync_channel::<RawFrame>(1);
        let stop = std::sync::Arc::new(std::sync::atomic::AtomicBool::new(false));
        let stop_flag = std::sync::Arc::clone(&stop);

        std::thread::Builder::new()
            .name("mira-cpu-capture".into())
            .spawn(move || {
                let display = match Display::primary() {
                    Ok(d) => d,
                    Err(e) => {
                        warn!("cpu capture thread: no display: {e}");
                        return;
                    }
                };
                let mut capturer = match Capturer::new(display) {
                    Ok(c) => c,
                    Err(e) => {
                        warn!("cpu capture thread: capturer failed: {e}");
                        return;
                    }
                };

                while !stop_flag.load(std::sync::atomic::Ordering::Relaxed) {
                    match capturer.frame() {
                        Ok(frame) => {
                            let stride = frame.len() / height as usize;
                            let row_len = width as usize * 4;
                            let mut data = Vec::with_capacity(row_len * height as usize);
                            for y in 0..height as usize {
                                data.extend_from_slice(&frame[y * stride..y * stride + row_len]);
                            }
                            // try_send: replace-newest semantics via drop.
                            let _ = tx.try_send(RawFrame {
                                data,
                                width,
                                height,
                            });
                        }
                        Err(e) if e.kind() == std::io::ErrorKind::WouldBlock => {
                            std::thread::sleep(Duration::from_millis(2));
                        }
                        Err(e) => {
                            warn!("cpu capture thread: frame error: {e}");
                            return;
                        }
                    }
                }
            })
            .map_err(|e| MiraError::CaptureInit(format!("spawn capture thread: {e}")))?;

        Ok(Self {
            rx,
            width,
            height,
            stop,
        })
    }
}

impl FrameSource for CpuSource {
    fn grab(&mut self, timeout: Duration) -> Result<RawFrame, MiraError> {
        match self.rx.recv_timeout(timeout) {
            Ok(frame) => Ok(frame),
            Err(std::sync::mpsc::RecvTimeoutError::Timeout) => Err(MiraError::Timeout(timeout)),
            Err(std::sync::mpsc::RecvTimeoutError::Disconnected) => {
                Err(MiraError::Capture("capture thread exited".into()))
            }
        }
    }

    fn dimensions(&self) -> (u32, u32) {
        (self.width, self.height)
    }

    fn name(&self) -> &'static str {
        "scrap-cpu"
    }
}

impl Drop for CpuSource {
    fn drop(&mut self) {
        self.stop
            .store(true, std::sync::atomic::Ordering::Relaxed);
    }
}

// ── Tests ────────────────────────────────────────────────────────
