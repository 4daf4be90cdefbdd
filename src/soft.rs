//! The software rasterizer backend.
//!
//! Runs entirely on the owner thread: the FIFO drains synchronously at
//! `end_field`, so the backend is quiescent between calls and the pause
//! handshake degenerates to balance bookkeeping. EFB access reads and
//! writes the backend's own planes directly; there is no peek cache
//! because every answer is already exact.

use std::fs::File;
use std::io::Write;
use std::path::Path;
use std::sync::Arc;

use crate::backend::{
    BackendState, DisplaySurface, EfbAccess, FieldType, FifoMemory, OsdMessage, PerfQueryType,
    VideoBackend,
};
use crate::efb::{EFB_HEIGHT, EFB_WIDTH};
use crate::error::VideoError;
use crate::fifo::{CommandFifo, DrainStatus, FIFO_BURST};
use crate::state::StateStream;

pub struct SoftwareBackend {
    state: BackendState,
    fifo: Arc<CommandFifo>,
    memory: Option<Arc<dyn FifoMemory>>,
    color: Vec<u32>,
    depth: Vec<u32>,
    frame: u32,
    field: FieldType,
    pending_field: Option<(FieldType, u32, u32)>,
    locked: bool,
    loop_enabled: bool,
    rendering_enabled: bool,
    messages: Vec<OsdMessage>,
}

impl SoftwareBackend {
    pub fn new() -> Self {
        Self {
            state: BackendState::Uninitialized,
            fifo: Arc::new(CommandFifo::new()),
            memory: None,
            color: Vec::new(),
            depth: Vec::new(),
            frame: 0,
            field: FieldType::Progressive,
            pending_field: None,
            locked: false,
            loop_enabled: false,
            rendering_enabled: true,
            messages: Vec::new(),
        }
    }

    pub fn frame_index(&self) -> u32 {
        self.frame
    }

    fn plane_index(x: u32, y: u32) -> usize {
        let x = x.min(EFB_WIDTH - 1);
        let y = y.min(EFB_HEIGHT - 1);
        (y * EFB_WIDTH + x) as usize
    }

    /// Drain every queued command inline. Commands are consumed at burst
    /// granularity exactly like the threaded backends, so breakpoint and
    /// watermark behavior is identical.
    fn drain_all(&mut self) {
        let Some(memory) = self.memory.clone() else {
            return;
        };
        let mut chunk = [0u8; FIFO_BURST as usize];
        loop {
            match self.fifo.drain_step(FIFO_BURST) {
                DrainStatus::Idle | DrainStatus::Breakpoint => break,
                DrainStatus::Chunk { addr, len } => {
                    let buf = &mut chunk[..len as usize];
                    memory.read(addr, buf);
                    self.execute(buf);
                    self.fifo.consume(len);
                }
            }
        }
    }

    fn execute(&mut self, commands: &[u8]) {
        // Command interpretation belongs to the rasterizer proper.
        log::trace!("software backend consumed {} command bytes", commands.len());
    }
}

impl Default for SoftwareBackend {
    fn default() -> Self {
        Self::new()
    }
}

impl VideoBackend for SoftwareBackend {
    fn name(&self) -> &'static str {
        "software"
    }

    fn display_name(&self) -> &'static str {
        "Software Renderer"
    }

    fn state(&self) -> BackendState {
        self.state
    }

    fn initialize(
        &mut self,
        _surface: DisplaySurface,
        memory: Arc<dyn FifoMemory>,
    ) -> Result<(), VideoError> {
        if self.state != BackendState::Uninitialized {
            return Err(VideoError::ProtocolMisuse(
                "initialize on an already-initialized backend",
            ));
        }
        let planes = (EFB_WIDTH * EFB_HEIGHT) as usize;
        self.color = vec![0; planes];
        self.depth = vec![0; planes];
        self.memory = Some(memory);
        self.fifo.reset();
        self.frame = 0;
        self.state = BackendState::Initialized;
        log::info!("software backend initialized");
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
        if self.locked {
            return Err(VideoError::ProtocolMisuse(
                "shutdown while pause-and-lock is held",
            ));
        }
        self.color = Vec::new();
        self.depth = Vec::new();
        self.memory = None;
        self.state = BackendState::ShutDown;
        log::info!("software backend shut down");
        Ok(())
    }

    fn run_loop(&mut self, enable: bool) {
        self.loop_enabled = enable;
        self.state = match (self.state, enable) {
            (BackendState::Running, false) => BackendState::Paused,
            (BackendState::Paused, true) => BackendState::Running,
            (state, _) => state,
        };
    }

    fn prepare_resources(&mut self) -> Result<(), VideoError> {
        Ok(())
    }

    fn enter_render_loop(&mut self) -> Result<(), VideoError> {
        if self.state != BackendState::Initialized {
            return Err(VideoError::ProtocolMisuse(
                "enter_render_loop outside the Initialized state",
            ));
        }
        self.loop_enabled = true;
        self.state = BackendState::Running;
        Ok(())
    }

    fn exit_render_loop(&mut self) -> Result<(), VideoError> {
        if self.locked {
            return Err(VideoError::ProtocolMisuse(
                "exit_render_loop while pause-and-lock is held",
            ));
        }
        self.loop_enabled = false;
        if self.state == BackendState::Running || self.state == BackendState::Paused {
            self.state = BackendState::Initialized;
        }
        Ok(())
    }

    fn cleanup(&mut self) {}

    fn begin_field(&mut self, field: FieldType, address: u32, pixel_format: u32) {
        self.field = field;
        self.pending_field = Some((field, address, pixel_format));
    }

    fn end_field(&mut self) {
        if self.loop_enabled {
            self.drain_all();
        }
        if let Some((field, address, _)) = self.pending_field.take() {
            if self.rendering_enabled {
                log::trace!("software backend presented {field:?} field at {address:#010x}");
            }
        }
        self.frame = self.frame.wrapping_add(1);
    }

    fn access_efb(&mut self, access: EfbAccess, x: u32, y: u32, input: u32) -> u32 {
        let idx = Self::plane_index(x, y);
        match access {
            EfbAccess::PeekColor => self.color.get(idx).copied().unwrap_or(0),
            EfbAccess::PeekZ => self.depth.get(idx).copied().unwrap_or(0),
            EfbAccess::PokeColor => {
                if let Some(slot) = self.color.get_mut(idx) {
                    *slot = input;
                }
                input
            }
            EfbAccess::PokeZ => {
                if let Some(slot) = self.depth.get_mut(idx) {
                    *slot = input;
                }
                input
            }
        }
    }

    fn query_result(&self, _query: PerfQueryType) -> Option<u32> {
        None
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
        if self.color.is_empty() {
            return Err(VideoError::InvalidState(
                "screenshot before initialization".into(),
            ));
        }
        // Raw PPM dump of the color plane; fancier encodings belong to
        // the frontend.
        let mut file = File::create(path)
            .map_err(|err| VideoError::InvalidState(format!("screenshot create: {err}")))?;
        let mut out = Vec::with_capacity(self.color.len() * 3 + 32);
        out.extend_from_slice(format!("P6\n{EFB_WIDTH} {EFB_HEIGHT}\n255\n").as_bytes());
        for pixel in &self.color {
            out.extend_from_slice(&[
                (pixel >> 16) as u8,
                (pixel >> 8) as u8,
                *pixel as u8,
            ]);
        }
        file.write_all(&out)
            .map_err(|err| VideoError::InvalidState(format!("screenshot write: {err}")))?;
        Ok(())
    }

    fn set_rendering(&mut self, enabled: bool) {
        self.rendering_enabled = enabled;
    }

    fn pause_and_lock(&mut self, lock: bool, _unpause_on_unlock: bool) -> Result<(), VideoError> {
        // No render thread: the backend is quiescent between calls by
        // construction, so only the alternation contract is enforced.
        if lock {
            if self.locked {
                return Err(VideoError::ProtocolMisuse(
                    "pause_and_lock(true) while already locked",
                ));
            }
            self.locked = true;
        } else {
            if !self.locked {
                return Err(VideoError::ProtocolMisuse(
                    "pause_and_lock(false) without a matching lock",
                ));
            }
            self.locked = false;
        }
        Ok(())
    }

    fn do_state(&mut self, stream: &mut StateStream) -> Result<(), VideoError> {
        if !self.locked {
            return Err(VideoError::ProtocolMisuse(
                "do_state requires pause_and_lock to be held",
            ));
        }
        self.fifo.do_state(stream)?;
        let mut parity = self.field.as_u8();
        stream.do_u8(&mut parity)?;
        self.field = FieldType::from_u8(parity);
        stream.do_u32(&mut self.frame)?;
        Ok(())
    }

    fn check_invalid_state(&mut self) -> Result<(), VideoError> {
        // A software rasterizer has no device context to lose.
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
