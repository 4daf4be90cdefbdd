//! Boundary layer between a console emulator's CPU-side command
//! generation and its interchangeable video backends.
//!
//! The pieces, leaves first: [`CommandFifo`] is the command-processor
//! FIFO register model coupling producer and consumer through watermarks
//! and interrupts; [`EfbPeekCache`] answers embedded-framebuffer peeks
//! without a full synchronous stall; [`VideoBackend`] is the capability
//! every renderer implements, with [`HardwareBackend`] as the shared base
//! for accelerated devices and [`SoftwareBackend`] as the synchronous
//! rasterizer; [`BackendRegistry`] owns the compiled-in variants and the
//! active slot. Cross-thread mutation of backend state goes through the
//! pause-and-lock handshake ([`PauseLock`]), and sessions serialize
//! through [`StateStream`].

mod backend;
mod efb;
mod error;
mod fifo;
mod hw;
mod pause;
mod registry;
mod soft;
mod state;

pub use backend::{
    BackendState, DisplaySurface, EfbAccess, FieldType, FifoMemory, OsdMessage, PerfQueryType,
    VideoBackend,
};
pub use efb::{EfbPeekCache, PeekCacheConfig, EFB_HEIGHT, EFB_WIDTH};
pub use error::VideoError;
pub use fifo::{
    CommandFifo, CpClear, CpCtrl, CpStatus, DrainStatus, CP_CLEAR, CP_CTRL, CP_FIFO_BASE_HI,
    CP_FIFO_BASE_LO, CP_FIFO_BP_HI, CP_FIFO_BP_LO, CP_FIFO_END_HI, CP_FIFO_END_LO,
    CP_FIFO_HI_WATERMARK_HI, CP_FIFO_HI_WATERMARK_LO, CP_FIFO_LO_WATERMARK_HI,
    CP_FIFO_LO_WATERMARK_LO, CP_FIFO_READ_POINTER_HI, CP_FIFO_READ_POINTER_LO,
    CP_FIFO_RW_DISTANCE_HI, CP_FIFO_RW_DISTANCE_LO, CP_FIFO_WRITE_POINTER_HI,
    CP_FIFO_WRITE_POINTER_LO, CP_STATUS, CP_TOKEN, FIFO_BURST,
};
pub use hw::{HardwareBackend, NullDevice, RenderDevice};
pub use pause::PauseLock;
pub use registry::BackendRegistry;
pub use soft::SoftwareBackend;
pub use state::{StateMode, StateStream, STATE_VERSION};
