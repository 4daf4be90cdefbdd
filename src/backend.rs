//! The video backend capability: the single point of polymorphism between
//! the CPU-emulation loop and whichever renderer is active.
//!
//! Exactly one backend is active at a time (selected through the
//! [`crate::BackendRegistry`]); each backend owns at most one render
//! thread. Everything the owner thread does to backend state outside the
//! operations below goes through `pause_and_lock`.

use std::path::Path;
use std::sync::Arc;

use crate::error::VideoError;
use crate::fifo::CommandFifo;
use crate::state::StateStream;

/// Scan parity of one displayed field.
#[derive(Clone, Copy, PartialEq, Eq, Debug, Default)]
pub enum FieldType {
    #[default]
    Progressive,
    Upper,
    Lower,
}

impl FieldType {
    pub(crate) fn from_u8(raw: u8) -> Self {
        match raw {
            1 => FieldType::Upper,
            2 => FieldType::Lower,
            _ => FieldType::Progressive,
        }
    }

    pub(crate) fn as_u8(self) -> u8 {
        match self {
            FieldType::Progressive => 0,
            FieldType::Upper => 1,
            FieldType::Lower => 2,
        }
    }
}

/// Which embedded-framebuffer operation an access performs.
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub enum EfbAccess {
    PeekZ,
    PokeZ,
    PeekColor,
    PokeColor,
}

/// Performance counters a backend may implement. A backend with no data
/// for a counter answers `None`.
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub enum PerfQueryType {
    ZCompInputZComploc,
    ZCompOutputZComploc,
    ZCompInput,
    ZCompOutput,
    BlendInput,
    EfbCopyClocks,
}

/// Lifecycle: `Uninitialized → Initialized → (Running ⇄ Paused) →
/// ShutDown`, terminal once shut down. A detected device fault is a
/// sub-state reported through `check_invalid_state`, not a lifecycle
/// state of its own.
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub enum BackendState {
    Uninitialized,
    Initialized,
    Running,
    Paused,
    ShutDown,
}

/// Opaque handle to the display surface a backend binds its output to.
#[derive(Clone, Copy, Debug, Default)]
pub struct DisplaySurface {
    pub raw_handle: usize,
    pub width: u32,
    pub height: u32,
}

/// The emulated memory the FIFO pointers address. The render thread pulls
/// command bytes through this seam.
pub trait FifoMemory: Send + Sync {
    fn read(&self, addr: u32, buf: &mut [u8]);
}

/// An on-screen message queued through the overlay pass-through. Rendering
/// the overlay is the backend's concern; this layer only carries the text.
#[derive(Clone, Debug)]
pub struct OsdMessage {
    pub text: String,
    pub duration_ms: u32,
}

pub trait VideoBackend: Send {
    /// Identifying name, matched exactly by registry activation.
    fn name(&self) -> &'static str;

    /// Human-readable name for selection UIs.
    fn display_name(&self) -> &'static str {
        self.name()
    }

    fn state(&self) -> BackendState;

    /// Allocate backend resources bound to `surface`. On failure the
    /// backend remains `Uninitialized` and must not be run.
    fn initialize(
        &mut self,
        surface: DisplaySurface,
        memory: Arc<dyn FifoMemory>,
    ) -> Result<(), VideoError>;

    /// Release all resources. Double shutdown is a protocol error, as is
    /// shutting down while pause-and-lock is held.
    fn shutdown(&mut self) -> Result<(), VideoError>;

    /// Start or stop the backend's cooperative loop. While enabled the
    /// backend stays responsive to pause requests between frames.
    fn run_loop(&mut self, enable: bool);

    /// Render-thread setup. For backends with an internal render thread
    /// this runs automatically when the loop is entered; calling it
    /// directly is only valid while the backend owns its device.
    fn prepare_resources(&mut self) -> Result<(), VideoError>;

    /// Spawn/enter the render loop.
    fn enter_render_loop(&mut self) -> Result<(), VideoError>;

    /// Leave the render loop and join the render thread.
    fn exit_render_loop(&mut self) -> Result<(), VideoError>;

    /// Render-thread teardown. Always executes on the backend's own
    /// thread, never cross-thread.
    fn cleanup(&mut self);

    /// Mark the start of one displayed field and select scan parity.
    fn begin_field(&mut self, field: FieldType, address: u32, pixel_format: u32);

    /// Mark the end of the field begun by the matching `begin_field`;
    /// produces exactly one displayed image and advances the frame index.
    fn end_field(&mut self);

    /// Peek or poke one EFB pixel. Peeks are answered from the peek cache
    /// when fresh, otherwise by a synchronous readback; pokes write
    /// through to the framebuffer and the cache. Not valid while
    /// pause-and-lock holds the render thread; such an access is refused
    /// (peeks answer zero) rather than left to wait on a parked thread.
    fn access_efb(&mut self, access: EfbAccess, x: u32, y: u32, input: u32) -> u32;

    /// Latest completed value for a performance counter, `None` when no
    /// result has completed.
    fn query_result(&self, query: PerfQueryType) -> Option<u32>;

    fn add_message(&mut self, text: &str, duration_ms: u32);
    fn clear_messages(&mut self);
    fn screenshot(&mut self, path: &Path) -> Result<(), VideoError>;

    /// Suppress or resume frame presentation without tearing anything
    /// down.
    fn set_rendering(&mut self, enabled: bool);

    /// The pause-and-lock handshake. `lock=true` blocks until the render
    /// thread holds at a command boundary; `lock=false` releases it and,
    /// with `unpause_on_unlock`, resumes the loop. Calls must alternate;
    /// violations are `ProtocolMisuse`.
    fn pause_and_lock(&mut self, lock: bool, unpause_on_unlock: bool) -> Result<(), VideoError>;

    /// Serialize or restore the session (FIFO registers, field parity,
    /// frame index, pending interrupts). Must be called while holding
    /// `pause_and_lock(true, ..)`.
    fn do_state(&mut self, stream: &mut StateStream) -> Result<(), VideoError>;

    /// Polled once per frame by the owning loop. If the backend detected
    /// an unrecoverable fault it reinitializes from scratch here.
    fn check_invalid_state(&mut self) -> Result<(), VideoError>;

    /// The command-processor FIFO this backend drains.
    fn fifo(&self) -> &Arc<CommandFifo>;

    /// Discard every queued command for the current frame.
    fn abort_frame(&mut self);

    fn is_hi_watermark_active(&self) -> bool {
        self.fifo().hi_watermark_active()
    }
}
