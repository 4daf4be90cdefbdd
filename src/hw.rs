//! Shared base for hardware-accelerated backends.
//!
//! `HardwareBackend<D>` carries everything every accelerated renderer has
//! in common: the render thread and its drain loop, pause-and-lock
//! bookkeeping, the EFB peek cache with synchronous readback on a miss,
//! frame pacing, invalid-state recovery and state serialization. The
//! device-specific half (draw submission, presentation, pixel readback)
//! lives behind [`RenderDevice`].
//!
//! Thread shape: the owner thread calls the `VideoBackend` operations;
//! the render thread runs [`render_loop`], which checks the pause safe
//! point and the request channel between FIFO bursts. The device is moved
//! into the render thread on `enter_render_loop` and travels back through
//! the `JoinHandle` on exit, so exactly one thread ever touches it.

use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::{mpsc, Arc};
use std::thread::{self, JoinHandle};

use crate::backend::{
    BackendState, DisplaySurface, EfbAccess, FieldType, FifoMemory, OsdMessage, PerfQueryType,
    VideoBackend,
};
use crate::efb::{EfbPeekCache, PeekCacheConfig};
use crate::error::VideoError;
use crate::fifo::{CommandFifo, DrainStatus, FIFO_BURST};
use crate::pause::PauseLock;
use crate::state::{StateMode, StateStream};

/// Device-specific half of an accelerated backend. Implementations own
/// the rendering context; everything here is called from the thread that
/// currently owns the device (the owner thread outside the render loop,
/// the render thread inside it).
pub trait RenderDevice: Send + 'static {
    fn name(&self) -> &'static str;

    fn display_name(&self) -> &'static str {
        self.name()
    }

    /// Create the rendering context bound to `surface`.
    fn create_context(&mut self, surface: &DisplaySurface) -> Result<(), VideoError>;

    fn destroy_context(&mut self);

    /// Render-thread side setup, after the context exists.
    fn prepare(&mut self) -> Result<(), VideoError> {
        Ok(())
    }

    /// Render-thread side teardown.
    fn cleanup(&mut self) {}

    /// Execute one contiguous burst of FIFO command bytes.
    fn execute(&mut self, commands: &[u8]);

    /// Present one displayed field.
    fn present(&mut self, field: FieldType, address: u32, pixel_format: u32);

    /// Synchronous readback of one EFB pixel.
    fn readback(&mut self, access: EfbAccess, x: u32, y: u32) -> u32;

    /// Direct write of one EFB pixel.
    fn write_efb(&mut self, access: EfbAccess, x: u32, y: u32, value: u32);

    fn query_result(&self, query: PerfQueryType) -> Option<u32>;

    fn screenshot(&mut self, path: &Path) -> Result<(), VideoError>;

    /// False once the rendering context is lost. Polled by the render
    /// loop; a lost context flips the backend into its invalid sub-state.
    fn context_ok(&self) -> bool {
        true
    }
}

enum RenderRequest {
    Efb {
        access: EfbAccess,
        x: u32,
        y: u32,
        value: u32,
        reply: mpsc::Sender<u32>,
    },
    Query {
        query: PerfQueryType,
        reply: mpsc::Sender<Option<u32>>,
    },
    Present {
        field: FieldType,
        address: u32,
        pixel_format: u32,
    },
    Screenshot {
        path: PathBuf,
        reply: mpsc::Sender<Result<(), VideoError>>,
    },
}

/// State shared between the owner thread and the render thread.
struct Shared {
    fifo: Arc<CommandFifo>,
    pause: PauseLock,
    exit: AtomicBool,
    loop_enabled: AtomicBool,
    rendering_enabled: AtomicBool,
    invalid: AtomicBool,
    frame: AtomicU32,
}

pub struct HardwareBackend<D: RenderDevice> {
    name: &'static str,
    display_name: &'static str,
    shared: Arc<Shared>,
    fifo: Arc<CommandFifo>,
    cache: EfbPeekCache,
    state: BackendState,
    surface: DisplaySurface,
    memory: Option<Arc<dyn FifoMemory>>,
    // Exactly one of `device` and `thread` is Some between operations:
    // the device either sits here or runs inside the render thread.
    device: Option<D>,
    thread: Option<JoinHandle<D>>,
    requests: Option<mpsc::Sender<RenderRequest>>,
    pending_field: Option<(FieldType, u32, u32)>,
    field: FieldType,
    messages: Vec<OsdMessage>,
}

impl<D: RenderDevice> HardwareBackend<D> {
    pub fn new(device: D) -> Self {
        Self::with_cache_config(device, PeekCacheConfig::default())
    }

    pub fn with_cache_config(device: D, cache: PeekCacheConfig) -> Self {
        let fifo = Arc::new(CommandFifo::new());
        Self {
            name: device.name(),
            display_name: device.display_name(),
            shared: Arc::new(Shared {
                fifo: Arc::clone(&fifo),
                pause: PauseLock::new(),
                exit: AtomicBool::new(false),
                loop_enabled: AtomicBool::new(false),
                rendering_enabled: AtomicBool::new(true),
                invalid: AtomicBool::new(false),
                frame: AtomicU32::new(0),
            }),
            fifo,
            cache: EfbPeekCache::new(cache),
            state: BackendState::Uninitialized,
            surface: DisplaySurface::default(),
            memory: None,
            device: Some(device),
            thread: None,
            requests: None,
            pending_field: None,
            field: FieldType::Progressive,
            messages: Vec::new(),
        }
    }

    /// Current frame index (incremented once per displayed field).
    pub fn frame_index(&self) -> u32 {
        self.shared.frame.load(Ordering::Acquire)
    }

    /// Flag the backend as invalid, as a device would after losing its
    /// context. Recovery happens on the next `check_invalid_state` poll.
    pub fn mark_invalid(&self) {
        self.shared.invalid.store(true, Ordering::Release);
    }

    pub fn is_invalid(&self) -> bool {
        self.shared.invalid.load(Ordering::Acquire)
    }

    fn send_request(&self, request: RenderRequest) -> bool {
        match self.requests.as_ref() {
            Some(tx) => tx.send(request).is_ok(),
            None => false,
        }
    }

    /// Synchronous EFB access on whichever thread currently owns the
    /// device: direct while the owner holds it, a round trip through the
    /// render thread otherwise. The reply channel is the only owner-thread
    /// blocking point outside pause-and-lock. `None` means the access
    /// never reached the device and must not touch the cache.
    fn efb_round_trip(&mut self, access: EfbAccess, x: u32, y: u32, value: u32) -> Option<u32> {
        if let Some(device) = self.device.as_mut() {
            return Some(match access {
                EfbAccess::PeekColor | EfbAccess::PeekZ => device.readback(access, x, y),
                EfbAccess::PokeColor | EfbAccess::PokeZ => {
                    device.write_efb(access, x, y, value);
                    value
                }
            });
        }
        if self.shared.pause.is_pause_requested() {
            // The render thread is parked at its safe point and cannot
            // service requests; waiting here would never return.
            log::error!("EFB access while the render thread is paused, refusing");
            return None;
        }
        let (reply_tx, reply_rx) = mpsc::channel();
        if !self.send_request(RenderRequest::Efb {
            access,
            x,
            y,
            value,
            reply: reply_tx,
        }) {
            log::warn!("EFB access with no device available");
            return None;
        }
        reply_rx.recv().ok()
    }

    fn spawn_render_thread(&mut self) -> Result<(), VideoError> {
        let mut device = self
            .device
            .take()
            .ok_or(VideoError::ProtocolMisuse("render loop already entered"))?;
        let memory = match self.memory.clone() {
            Some(memory) => memory,
            None => {
                self.device = Some(device);
                return Err(VideoError::ProtocolMisuse(
                    "enter_render_loop before initialize",
                ));
            }
        };

        self.shared.exit.store(false, Ordering::Release);
        let (tx, rx) = mpsc::channel();
        let shared = Arc::clone(&self.shared);
        let handle = thread::Builder::new()
            .name(format!("{}-render", self.name))
            .spawn(move || {
                if let Err(err) = device.prepare() {
                    log::error!("render thread setup failed: {err}");
                    shared.invalid.store(true, Ordering::Release);
                }
                render_loop(&shared, &memory, &rx, &mut device);
                device.cleanup();
                device
            })
            .map_err(|err| VideoError::Initialization(format!("render thread spawn: {err}")))?;
        self.requests = Some(tx);
        self.thread = Some(handle);
        Ok(())
    }

    fn join_render_thread(&mut self) -> Result<(), VideoError> {
        self.shared.exit.store(true, Ordering::Release);
        self.requests = None;
        // A render thread left parked by unlock(false) would never see
        // the exit flag; withdraw the pause request before joining.
        self.shared.pause.release_for_exit();
        if let Some(handle) = self.thread.take() {
            match handle.join() {
                Ok(device) => self.device = Some(device),
                Err(_) => {
                    return Err(VideoError::InvalidState("render thread panicked".into()));
                }
            }
        }
        self.shared.exit.store(false, Ordering::Release);
        Ok(())
    }
}

impl<D: RenderDevice> VideoBackend for HardwareBackend<D> {
    fn name(&self) -> &'static str {
        self.name
    }

    fn display_name(&self) -> &'static str {
        self.display_name
    }

    fn state(&self) -> BackendState {
        self.state
    }

    fn initialize(
        &mut self,
        surface: DisplaySurface,
        memory: Arc<dyn FifoMemory>,
    ) -> Result<(), VideoError> {
        if self.state != BackendState::Uninitialized {
            return Err(VideoError::ProtocolMisuse(
                "initialize on an already-initialized backend",
            ));
        }
        let device = self
            .device
            .as_mut()
            .ok_or(VideoError::ProtocolMisuse("initialize while loop active"))?;
        // On failure the backend stays Uninitialized.
        device.create_context(&surface)?;
        self.surface = surface;
        self.memory = Some(memory);
        self.fifo.reset();
        self.cache.invalidate();
        self.shared.frame.store(0, Ordering::Release);
        self.state = BackendState::Initialized;
        log::info!("{} backend initialized", self.display_name);
        Ok(())
    }

    fn shutdown(&mut self) -> Result<(), VideoError> {
        match self.state {
            BackendState::Uninitialized => {
                return Err(VideoError::ProtocolMisuse(
                    "shutdown on an uninitialized backend",
                ));
            }
            BackendState::ShutDown => {
                return Err(VideoError::ProtocolMisuse("double shutdown"));
            }
            _ => {}
        }
        if self.shared.pause.is_locked() {
            return Err(VideoError::ProtocolMisuse(
                "shutdown while pause-and-lock is held",
            ));
        }
        self.join_render_thread()?;
        if let Some(device) = self.device.as_mut() {
            device.destroy_context();
        }
        self.memory = None;
        self.cache.invalidate();
        self.state = BackendState::ShutDown;
        log::info!("{} backend shut down", self.display_name);
        Ok(())
    }

    fn run_loop(&mut self, enable: bool) {
        self.shared.loop_enabled.store(enable, Ordering::Release);
        self.state = match (self.state, enable) {
            (BackendState::Running, false) => BackendState::Paused,
            (BackendState::Paused, true) => BackendState::Running,
            (state, _) => state,
        };
    }

    fn prepare_resources(&mut self) -> Result<(), VideoError> {
        match self.device.as_mut() {
            Some(device) => device.prepare(),
            None => Err(VideoError::ProtocolMisuse(
                "prepare_resources while the render loop owns the device",
            )),
        }
    }

    fn enter_render_loop(&mut self) -> Result<(), VideoError> {
        if self.state != BackendState::Initialized {
            return Err(VideoError::ProtocolMisuse(
                "enter_render_loop outside the Initialized state",
            ));
        }
        self.spawn_render_thread()?;
        self.shared.loop_enabled.store(true, Ordering::Release);
        self.state = BackendState::Running;
        Ok(())
    }

    fn exit_render_loop(&mut self) -> Result<(), VideoError> {
        if self.shared.pause.is_locked() {
            return Err(VideoError::ProtocolMisuse(
                "exit_render_loop while pause-and-lock is held",
            ));
        }
        self.join_render_thread()?;
        if self.state == BackendState::Running || self.state == BackendState::Paused {
            self.state = BackendState::Initialized;
        }
        Ok(())
    }

    fn cleanup(&mut self) {
        if let Some(device) = self.device.as_mut() {
            device.cleanup();
        }
    }

    fn begin_field(&mut self, field: FieldType, address: u32, pixel_format: u32) {
        self.field = field;
        self.pending_field = Some((field, address, pixel_format));
    }

    fn end_field(&mut self) {
        if let Some((field, address, pixel_format)) = self.pending_field.take() {
            self.send_request(RenderRequest::Present {
                field,
                address,
                pixel_format,
            });
        }
        self.shared.frame.fetch_add(1, Ordering::AcqRel);
    }

    fn access_efb(&mut self, access: EfbAccess, x: u32, y: u32, input: u32) -> u32 {
        let frame = self.frame_index();
        match access {
            EfbAccess::PeekColor => {
                if let Some(value) = self.cache.peek_color(x, y, frame) {
                    return value;
                }
                match self.efb_round_trip(access, x, y, 0) {
                    Some(value) => {
                        self.cache.store_color(x, y, value, frame);
                        value
                    }
                    None => 0,
                }
            }
            EfbAccess::PeekZ => {
                if let Some(value) = self.cache.peek_depth(x, y, frame) {
                    return value;
                }
                match self.efb_round_trip(access, x, y, 0) {
                    Some(value) => {
                        self.cache.store_depth(x, y, value, frame);
                        value
                    }
                    None => 0,
                }
            }
            EfbAccess::PokeColor => {
                if self.efb_round_trip(access, x, y, input).is_some() {
                    self.cache.poke_color(x, y, input, frame);
                }
                input
            }
            EfbAccess::PokeZ => {
                if self.efb_round_trip(access, x, y, input).is_some() {
                    self.cache.poke_depth(x, y, input, frame);
                }
                input
            }
        }
    }

    fn query_result(&self, query: PerfQueryType) -> Option<u32> {
        if let Some(device) = self.device.as_ref() {
            return device.query_result(query);
        }
        let (reply_tx, reply_rx) = mpsc::channel();
        if !self.send_request(RenderRequest::Query {
            query,
            reply: reply_tx,
        }) {
            return None;
        }
        reply_rx.recv().unwrap_or(None)
    }

    fn add_message(&mut self, text: &str, duration_ms: u32) {
        log::info!("OSD: {text}");
        self.messages.push(OsdMessage {
            text: text.to_owned(),
            duration_ms,
        });
    }

    fn clear_messages(&mut self) {
        self.messages.clear();
    }

    fn screenshot(&mut self, path: &Path) -> Result<(), VideoError> {
        if let Some(device) = self.device.as_mut() {
            return device.screenshot(path);
        }
        let (reply_tx, reply_rx) = mpsc::channel();
        if !self.send_request(RenderRequest::Screenshot {
            path: path.to_owned(),
            reply: reply_tx,
        }) {
            return Err(VideoError::InvalidState(
                "screenshot with no render loop active".into(),
            ));
        }
        reply_rx
            .recv()
            .map_err(|_| VideoError::InvalidState("render thread dropped the reply".into()))?
    }

    fn set_rendering(&mut self, enabled: bool) {
        self.shared.rendering_enabled.store(enabled, Ordering::Release);
    }

    fn pause_and_lock(&mut self, lock: bool, unpause_on_unlock: bool) -> Result<(), VideoError> {
        if lock {
            if self.thread.is_some() {
                self.shared.pause.lock()?;
            } else {
                self.shared.pause.lock_idle()?;
            }
            if self.state == BackendState::Running {
                self.state = BackendState::Paused;
            }
        } else {
            self.shared.pause.unlock(unpause_on_unlock)?;
            if unpause_on_unlock && self.state == BackendState::Paused {
                self.state = BackendState::Running;
            }
        }
        Ok(())
    }

    fn do_state(&mut self, stream: &mut StateStream) -> Result<(), VideoError> {
        if !self.shared.pause.is_locked() {
            return Err(VideoError::ProtocolMisuse(
                "do_state requires pause_and_lock to be held",
            ));
        }
        self.fifo.do_state(stream)?;

        let mut parity = self.field.as_u8();
        stream.do_u8(&mut parity)?;
        self.field = FieldType::from_u8(parity);

        let mut frame = self.shared.frame.load(Ordering::Acquire);
        stream.do_u32(&mut frame)?;
        self.shared.frame.store(frame, Ordering::Release);

        if stream.mode() == StateMode::Load {
            // Peeks captured in the old session mean nothing now.
            self.cache.invalidate();
        }
        Ok(())
    }

    fn check_invalid_state(&mut self) -> Result<(), VideoError> {
        if !self.shared.invalid.load(Ordering::Acquire) {
            return Ok(());
        }
        log::warn!("{} backend is invalid, reinitializing", self.display_name);
        let was_enabled = self.shared.loop_enabled.load(Ordering::Acquire);
        let had_thread = self.thread.is_some();
        self.exit_render_loop()?;
        let device = self
            .device
            .as_mut()
            .ok_or_else(|| VideoError::InvalidState("device lost with the render thread".into()))?;
        device.destroy_context();
        device.create_context(&self.surface)?;
        self.cache.invalidate();
        self.shared.invalid.store(false, Ordering::Release);
        if had_thread {
            self.enter_render_loop()?;
            self.shared.loop_enabled.store(was_enabled, Ordering::Release);
        }
        Ok(())
    }

    fn fifo(&self) -> &Arc<CommandFifo> {
        &self.fifo
    }

    fn abort_frame(&mut self) {
        self.pending_field = None;
        self.fifo.abort();
    }
}

impl<D: RenderDevice> Drop for HardwareBackend<D> {
    fn drop(&mut self) {
        // Never leave a detached render thread behind.
        if self.thread.is_some() {
            let _ = self.join_render_thread();
        }
    }
}

/// The render thread body: safe point, requests, drain, repeat.
fn render_loop<D: RenderDevice>(
    shared: &Shared,
    memory: &Arc<dyn FifoMemory>,
    requests: &mpsc::Receiver<RenderRequest>,
    device: &mut D,
) {
    let fifo = &shared.fifo;
    let mut chunk = [0u8; FIFO_BURST as usize];

    while !shared.exit.load(Ordering::Acquire) {
        shared.pause.render_safe_point();

        while let Ok(request) = requests.try_recv() {
            match request {
                RenderRequest::Efb {
                    access,
                    x,
                    y,
                    value,
                    reply,
                } => {
                    let result = match access {
                        EfbAccess::PeekColor | EfbAccess::PeekZ => device.readback(access, x, y),
                        EfbAccess::PokeColor | EfbAccess::PokeZ => {
                            device.write_efb(access, x, y, value);
                            value
                        }
                    };
                    let _ = reply.send(result);
                }
                RenderRequest::Query { query, reply } => {
                    let _ = reply.send(device.query_result(query));
                }
                RenderRequest::Present {
                    field,
                    address,
                    pixel_format,
                } => {
                    if shared.rendering_enabled.load(Ordering::Acquire) {
                        device.present(field, address, pixel_format);
                    }
                }
                RenderRequest::Screenshot { path, reply } => {
                    let _ = reply.send(device.screenshot(&path));
                }
            }
        }

        if !device.context_ok() {
            if !shared.invalid.swap(true, Ordering::AcqRel) {
                log::warn!("render device context lost, waiting for reinitialization");
            }
            // Keep servicing the pause handshake and requests; draining
            // resumes after recovery.
            thread::yield_now();
            continue;
        }

        if shared.invalid.load(Ordering::Acquire)
            || !shared.loop_enabled.load(Ordering::Acquire)
        {
            thread::yield_now();
            continue;
        }

        match fifo.drain_step(FIFO_BURST) {
            DrainStatus::Idle | DrainStatus::Breakpoint => thread::yield_now(),
            DrainStatus::Chunk { addr, len } => {
                let buf = &mut chunk[..len as usize];
                memory.read(addr, buf);
                device.execute(buf);
                fifo.consume(len);
            }
        }
    }
}

/// The no-op hardware device: accepts every command, renders nothing,
/// keeps EFB planes so peeks and pokes behave. Useful headless and as the
/// template for real devices.
#[derive(Default)]
pub struct NullDevice {
    color: Vec<u32>,
    depth: Vec<u32>,
    has_context: bool,
}

impl NullDevice {
    fn plane_index(x: u32, y: u32) -> usize {
        let x = x.min(crate::efb::EFB_WIDTH - 1);
        let y = y.min(crate::efb::EFB_HEIGHT - 1);
        (y * crate::efb::EFB_WIDTH + x) as usize
    }
}

impl RenderDevice for NullDevice {
    fn name(&self) -> &'static str {
        "null"
    }

    fn display_name(&self) -> &'static str {
        "Null Renderer"
    }

    fn create_context(&mut self, _surface: &DisplaySurface) -> Result<(), VideoError> {
        let planes = (crate::efb::EFB_WIDTH * crate::efb::EFB_HEIGHT) as usize;
        self.color = vec![0; planes];
        self.depth = vec![0; planes];
        self.has_context = true;
        Ok(())
    }

    fn destroy_context(&mut self) {
        self.color.clear();
        self.depth.clear();
        self.has_context = false;
    }

    fn execute(&mut self, commands: &[u8]) {
        log::trace!("null device discarded {} command bytes", commands.len());
    }

    fn present(&mut self, field: FieldType, address: u32, _pixel_format: u32) {
        log::trace!("null device presented {field:?} field at {address:#010x}");
    }

    fn readback(&mut self, access: EfbAccess, x: u32, y: u32) -> u32 {
        let idx = Self::plane_index(x, y);
        match access {
            EfbAccess::PeekZ => self.depth.get(idx).copied().unwrap_or(0),
            _ => self.color.get(idx).copied().unwrap_or(0),
        }
    }

    fn write_efb(&mut self, access: EfbAccess, x: u32, y: u32, value: u32) {
        let idx = Self::plane_index(x, y);
        let plane = match access {
            EfbAccess::PokeZ => &mut self.depth,
            _ => &mut self.color,
        };
        if let Some(slot) = plane.get_mut(idx) {
            *slot = value;
        }
    }

    fn query_result(&self, _query: PerfQueryType) -> Option<u32> {
        None
    }

    fn screenshot(&mut self, _path: &Path) -> Result<(), VideoError> {
        Err(VideoError::Unsupported(
            "the null device has no display output to capture",
        ))
    }

    fn context_ok(&self) -> bool {
        self.has_context
    }
}
