use std::path::Path;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

use gx_video::{
    BackendRegistry, BackendState, DisplaySurface, EfbAccess, FieldType, FifoMemory,
    HardwareBackend, PeekCacheConfig, PerfQueryType, RenderDevice, SoftwareBackend, StateStream,
    VideoBackend, VideoError,
};

/// Flat RAM standing in for the emulated command buffer.
struct TestRam {
    bytes: Vec<u8>,
}

impl TestRam {
    fn new(len: usize) -> Arc<Self> {
        Arc::new(Self {
            bytes: vec![0u8; len],
        })
    }
}

impl FifoMemory for TestRam {
    fn read(&self, addr: u32, buf: &mut [u8]) {
        for (i, out) in buf.iter_mut().enumerate() {
            *out = self
                .bytes
                .get(addr as usize + i)
                .copied()
                .unwrap_or(0);
        }
    }
}

/// Instrumented device: counts context creations and readbacks, and can
/// simulate a lost context.
#[derive(Clone, Default)]
struct Probe {
    creates: Arc<AtomicU32>,
    readbacks: Arc<AtomicU32>,
    context_alive: Arc<AtomicBool>,
}

struct TestDevice {
    probe: Probe,
    efb_value: u32,
}

impl TestDevice {
    fn new(probe: Probe, efb_value: u32) -> Self {
        Self { probe, efb_value }
    }
}

impl RenderDevice for TestDevice {
    fn name(&self) -> &'static str {
        "test"
    }

    fn create_context(&mut self, _surface: &DisplaySurface) -> Result<(), VideoError> {
        self.probe.creates.fetch_add(1, Ordering::AcqRel);
        self.probe.context_alive.store(true, Ordering::Release);
        Ok(())
    }

    fn destroy_context(&mut self) {}

    fn execute(&mut self, _commands: &[u8]) {}

    fn present(&mut self, _field: FieldType, _address: u32, _pixel_format: u32) {}

    fn readback(&mut self, _access: EfbAccess, _x: u32, _y: u32) -> u32 {
        self.probe.readbacks.fetch_add(1, Ordering::AcqRel);
        self.efb_value
    }

    fn write_efb(&mut self, _access: EfbAccess, _x: u32, _y: u32, _value: u32) {}

    fn query_result(&self, query: PerfQueryType) -> Option<u32> {
        (query == PerfQueryType::BlendInput).then_some(1234)
    }

    fn screenshot(&mut self, _path: &Path) -> Result<(), VideoError> {
        Ok(())
    }

    fn context_ok(&self) -> bool {
        self.probe.context_alive.load(Ordering::Acquire)
    }
}

fn wait_until(timeout: Duration, mut cond: impl FnMut() -> bool) -> bool {
    let deadline = Instant::now() + timeout;
    while Instant::now() < deadline {
        if cond() {
            return true;
        }
        thread::sleep(Duration::from_millis(1));
    }
    cond()
}

#[test]
fn unknown_backend_name_leaves_active_unchanged() {
    let _ = env_logger::builder().is_test(true).try_init();
    let mut registry = BackendRegistry::populate();
    assert!(!registry.is_empty());

    registry.activate("software").unwrap();
    assert_eq!(registry.active().unwrap().name(), "software");

    let err = registry.activate("direct3d9").unwrap_err();
    assert!(matches!(err, VideoError::ActivationNotFound(_)));
    // The previously active backend stays active.
    assert_eq!(registry.active().unwrap().name(), "software");
}

#[test]
fn registry_enumerates_compiled_in_backends() {
    let registry = BackendRegistry::populate();
    let names = registry.names();
    assert!(names.contains(&("software", "Software Renderer")));
    assert!(names.contains(&("null", "Null Renderer")));
}

#[test]
fn registry_clear_releases_the_active_slot() {
    let mut registry = BackendRegistry::populate();
    registry.activate("null").unwrap();
    registry.clear();
    assert!(registry.active().is_none());
    assert!(registry.is_empty());
}

#[test]
fn software_lifecycle_and_state_machine() {
    let mut backend = SoftwareBackend::new();
    assert_eq!(backend.state(), BackendState::Uninitialized);
    assert!(matches!(
        backend.shutdown(),
        Err(VideoError::ProtocolMisuse(_))
    ));

    let ram = TestRam::new(4096);
    backend
        .initialize(DisplaySurface::default(), ram)
        .unwrap();
    assert_eq!(backend.state(), BackendState::Initialized);

    backend.enter_render_loop().unwrap();
    assert_eq!(backend.state(), BackendState::Running);

    backend.run_loop(false);
    assert_eq!(backend.state(), BackendState::Paused);
    backend.run_loop(true);
    assert_eq!(backend.state(), BackendState::Running);

    backend.shutdown().unwrap();
    assert_eq!(backend.state(), BackendState::ShutDown);
    assert!(matches!(
        backend.shutdown(),
        Err(VideoError::ProtocolMisuse(_))
    ));
}

#[test]
fn software_efb_pokes_read_back_exactly() {
    let mut backend = SoftwareBackend::new();
    backend
        .initialize(DisplaySurface::default(), TestRam::new(64))
        .unwrap();
    backend.enter_render_loop().unwrap();

    assert_eq!(backend.access_efb(EfbAccess::PokeColor, 12, 34, 0xCAFE), 0xCAFE);
    assert_eq!(backend.access_efb(EfbAccess::PeekColor, 12, 34, 0), 0xCAFE);
    assert_eq!(backend.access_efb(EfbAccess::PokeZ, 12, 34, 0x00AB_CDEF), 0x00AB_CDEF);
    assert_eq!(backend.access_efb(EfbAccess::PeekZ, 12, 34, 0), 0x00AB_CDEF);
}

#[test]
fn pause_and_lock_must_alternate() {
    let mut backend = SoftwareBackend::new();
    backend
        .initialize(DisplaySurface::default(), TestRam::new(64))
        .unwrap();

    backend.pause_and_lock(true, true).unwrap();
    assert!(matches!(
        backend.pause_and_lock(true, true),
        Err(VideoError::ProtocolMisuse(_))
    ));
    // Shutdown while locked is also a protocol error.
    assert!(matches!(
        backend.shutdown(),
        Err(VideoError::ProtocolMisuse(_))
    ));
    backend.pause_and_lock(false, true).unwrap();
    assert!(matches!(
        backend.pause_and_lock(false, true),
        Err(VideoError::ProtocolMisuse(_))
    ));
}

#[test]
fn do_state_requires_the_lock_and_round_trips() {
    let ram = TestRam::new(8192);
    let mut backend = SoftwareBackend::new();
    backend
        .initialize(DisplaySurface::default(), Arc::clone(&ram) as Arc<dyn FifoMemory>)
        .unwrap();
    backend.enter_render_loop().unwrap();

    backend.fifo().configure(0x100, 0x900, 0x600, 0x80);
    backend.fifo().set_pe_token(0x5A5A);
    backend.fifo().push(0x222);
    backend.begin_field(FieldType::Upper, 0, 0);

    let mut save = StateStream::for_save();
    assert!(matches!(
        backend.do_state(&mut save),
        Err(VideoError::ProtocolMisuse(_))
    ));
    backend.pause_and_lock(true, true).unwrap();
    backend.do_state(&mut save).unwrap();
    backend.pause_and_lock(false, true).unwrap();

    // Restore into a fresh instance.
    let mut restored = SoftwareBackend::new();
    restored.pause_and_lock(true, true).unwrap();
    let mut load = StateStream::for_load(save.into_bytes()).unwrap();
    restored.do_state(&mut load).unwrap();
    restored.pause_and_lock(false, true).unwrap();

    let (a, b) = (backend.fifo(), restored.fifo());
    assert_eq!(b.base(), a.base());
    assert_eq!(b.end(), a.end());
    assert_eq!(b.hi_watermark(), a.hi_watermark());
    assert_eq!(b.lo_watermark(), a.lo_watermark());
    assert_eq!(b.write_pointer(), a.write_pointer());
    assert_eq!(b.read_pointer(), a.read_pointer());
    assert_eq!(b.distance(), a.distance());
    assert_eq!(b.pe_token(), a.pe_token());
    assert_eq!(b.hi_watermark_active(), a.hi_watermark_active());
    assert_eq!(b.lo_watermark_active(), a.lo_watermark_active());
}

#[test]
fn hardware_backend_peek_misses_trigger_one_readback() {
    let probe = Probe::default();
    let mut backend = HardwareBackend::with_cache_config(
        TestDevice::new(probe.clone(), 0x1122_3344),
        PeekCacheConfig {
            divisor: 1,
            life: 1,
        },
    );
    backend
        .initialize(DisplaySurface::default(), TestRam::new(4096))
        .unwrap();
    backend.enter_render_loop().unwrap();

    // Miss: synchronous readback from the render thread.
    assert_eq!(backend.access_efb(EfbAccess::PeekColor, 5, 5, 0), 0x1122_3344);
    assert_eq!(probe.readbacks.load(Ordering::Acquire), 1);

    // Fresh hit in the same frame: no new readback.
    assert_eq!(backend.access_efb(EfbAccess::PeekColor, 5, 5, 0), 0x1122_3344);
    assert_eq!(probe.readbacks.load(Ordering::Acquire), 1);

    // A poke writes through, so the peek that follows hits the cache.
    assert_eq!(backend.access_efb(EfbAccess::PokeColor, 9, 9, 0x77), 0x77);
    assert_eq!(backend.access_efb(EfbAccess::PeekColor, 9, 9, 0), 0x77);
    assert_eq!(probe.readbacks.load(Ordering::Acquire), 1);

    // Past the cache lifetime the entry goes stale and a readback
    // services the miss again.
    backend.begin_field(FieldType::Progressive, 0, 0);
    backend.end_field();
    backend.begin_field(FieldType::Progressive, 0, 0);
    backend.end_field();
    assert_eq!(backend.access_efb(EfbAccess::PeekColor, 5, 5, 0), 0x1122_3344);
    assert_eq!(probe.readbacks.load(Ordering::Acquire), 2);

    backend.shutdown().unwrap();
}

#[test]
fn hardware_backend_drains_fifo_on_render_thread() {
    let probe = Probe::default();
    let mut backend = HardwareBackend::new(TestDevice::new(probe.clone(), 0));
    backend
        .initialize(DisplaySurface::default(), TestRam::new(4096))
        .unwrap();
    backend.enter_render_loop().unwrap();

    let fifo = Arc::clone(backend.fifo());
    fifo.configure(0, 2048, 2048, 0);
    fifo.set_gp_read_enable(true);
    fifo.push(640);

    assert!(wait_until(Duration::from_secs(2), || fifo.distance() == 0));
    assert!(fifo.is_idle());
    // The watchdog kept ticking, so a liveness monitor would see
    // progress.
    assert!(fifo.watchdog() > 0);

    backend.shutdown().unwrap();
}

#[test]
fn hardware_pause_and_lock_handshakes_with_render_thread() {
    let probe = Probe::default();
    let mut backend = HardwareBackend::new(TestDevice::new(probe.clone(), 0));
    backend
        .initialize(DisplaySurface::default(), TestRam::new(4096))
        .unwrap();
    backend.enter_render_loop().unwrap();

    backend.pause_and_lock(true, true).unwrap();
    assert_eq!(backend.state(), BackendState::Paused);
    assert!(matches!(
        backend.pause_and_lock(true, true),
        Err(VideoError::ProtocolMisuse(_))
    ));

    // While held, the render thread sits at its safe boundary: pushed
    // commands stay queued.
    let fifo = Arc::clone(backend.fifo());
    fifo.configure(0, 1024, 1024, 0);
    fifo.set_gp_read_enable(true);
    fifo.push(96);
    thread::sleep(Duration::from_millis(20));
    assert_eq!(fifo.distance(), 96);

    backend.pause_and_lock(false, true).unwrap();
    assert_eq!(backend.state(), BackendState::Running);
    assert!(wait_until(Duration::from_secs(2), || fifo.distance() == 0));

    backend.shutdown().unwrap();
}

#[test]
fn unlock_without_unpause_keeps_render_thread_held() {
    let probe = Probe::default();
    let mut backend = HardwareBackend::new(TestDevice::new(probe.clone(), 0));
    backend
        .initialize(DisplaySurface::default(), TestRam::new(4096))
        .unwrap();
    backend.enter_render_loop().unwrap();

    backend.pause_and_lock(true, true).unwrap();
    // Release the hold without unpausing: the lock is free but the
    // render thread stays at its safe boundary.
    backend.pause_and_lock(false, false).unwrap();

    let fifo = Arc::clone(backend.fifo());
    fifo.configure(0, 1024, 1024, 0);
    fifo.set_gp_read_enable(true);
    fifo.push(96);
    thread::sleep(Duration::from_millis(20));
    assert_eq!(fifo.distance(), 96);

    // A later full lock/unlock(true) cycle resumes the loop.
    backend.pause_and_lock(true, true).unwrap();
    backend.pause_and_lock(false, true).unwrap();
    assert!(wait_until(Duration::from_secs(2), || fifo.distance() == 0));

    backend.shutdown().unwrap();
}

#[test]
fn shutdown_reclaims_render_thread_left_paused() {
    let probe = Probe::default();
    let mut backend = HardwareBackend::new(TestDevice::new(probe.clone(), 0));
    backend
        .initialize(DisplaySurface::default(), TestRam::new(4096))
        .unwrap();
    backend.enter_render_loop().unwrap();

    backend.pause_and_lock(true, true).unwrap();
    backend.pause_and_lock(false, false).unwrap();

    // The render thread is parked, but teardown must still be able to
    // join it.
    backend.shutdown().unwrap();
    assert_eq!(backend.state(), BackendState::ShutDown);
}

#[test]
fn efb_access_uses_the_owner_owned_device_before_the_loop() {
    let probe = Probe::default();
    let mut backend = HardwareBackend::new(TestDevice::new(probe.clone(), 0x55AA));
    backend
        .initialize(DisplaySurface::default(), TestRam::new(64))
        .unwrap();

    // No render thread yet: peeks read back from the device directly.
    assert_eq!(backend.access_efb(EfbAccess::PeekColor, 3, 3, 0), 0x55AA);
    assert_eq!(probe.readbacks.load(Ordering::Acquire), 1);

    // Pokes reach the device and write through to the cache.
    assert_eq!(backend.access_efb(EfbAccess::PokeColor, 4, 4, 0x77), 0x77);
    assert_eq!(backend.access_efb(EfbAccess::PeekColor, 4, 4, 0), 0x77);
    assert_eq!(probe.readbacks.load(Ordering::Acquire), 1);

    // Entries captured before the loop stay valid after it starts.
    backend.enter_render_loop().unwrap();
    assert_eq!(backend.access_efb(EfbAccess::PeekColor, 3, 3, 0), 0x55AA);
    assert_eq!(probe.readbacks.load(Ordering::Acquire), 1);

    backend.shutdown().unwrap();
}

#[test]
fn efb_access_while_held_is_refused_not_hung() {
    let probe = Probe::default();
    let mut backend = HardwareBackend::new(TestDevice::new(probe.clone(), 0xABCD));
    backend
        .initialize(DisplaySurface::default(), TestRam::new(64))
        .unwrap();
    backend.enter_render_loop().unwrap();

    backend.pause_and_lock(true, true).unwrap();
    // The render thread cannot service the readback while parked; the
    // access is refused instead of waiting forever.
    assert_eq!(backend.access_efb(EfbAccess::PeekColor, 2, 2, 0), 0);
    assert_eq!(probe.readbacks.load(Ordering::Acquire), 0);
    backend.pause_and_lock(false, true).unwrap();

    // The refusal never touched the cache: the next peek performs the
    // real readback.
    assert_eq!(backend.access_efb(EfbAccess::PeekColor, 2, 2, 0), 0xABCD);
    assert_eq!(probe.readbacks.load(Ordering::Acquire), 1);

    backend.shutdown().unwrap();
}

#[test]
fn hardware_state_restores_into_fresh_backend() {
    let probe = Probe::default();
    let mut backend = HardwareBackend::new(TestDevice::new(probe.clone(), 0));
    backend
        .initialize(DisplaySurface::default(), TestRam::new(4096))
        .unwrap();
    backend.enter_render_loop().unwrap();

    backend.fifo().configure(0x200, 0xA00, 0x700, 0x100);
    backend.fifo().set_pe_token(0x1357);

    backend.pause_and_lock(true, true).unwrap();
    let mut save = StateStream::for_save();
    backend.do_state(&mut save).unwrap();
    backend.pause_and_lock(false, true).unwrap();
    backend.shutdown().unwrap();

    let mut restored = HardwareBackend::new(TestDevice::new(Probe::default(), 0));
    restored.pause_and_lock(true, true).unwrap();
    let mut load = StateStream::for_load(save.into_bytes()).unwrap();
    restored.do_state(&mut load).unwrap();
    restored.pause_and_lock(false, true).unwrap();

    assert_eq!(restored.fifo().base(), 0x200);
    assert_eq!(restored.fifo().end(), 0xA00);
    assert_eq!(restored.fifo().hi_watermark(), 0x700);
    assert_eq!(restored.fifo().lo_watermark(), 0x100);
    assert_eq!(restored.fifo().pe_token(), 0x1357);
}

#[test]
fn lost_context_recovers_through_reinitialization() {
    let probe = Probe::default();
    let mut backend = HardwareBackend::new(TestDevice::new(probe.clone(), 0));
    backend
        .initialize(DisplaySurface::default(), TestRam::new(4096))
        .unwrap();
    backend.enter_render_loop().unwrap();
    assert_eq!(probe.creates.load(Ordering::Acquire), 1);

    // Simulate a lost device context; the render thread notices and
    // flags the backend invalid.
    probe.context_alive.store(false, Ordering::Release);
    assert!(wait_until(Duration::from_secs(2), || backend.is_invalid()));

    // The per-frame poll performs the recovery: reinitialization from
    // scratch, never partial repair.
    backend.check_invalid_state().unwrap();
    assert!(!backend.is_invalid());
    assert_eq!(probe.creates.load(Ordering::Acquire), 2);
    assert_eq!(backend.state(), BackendState::Running);

    backend.shutdown().unwrap();
}

#[test]
fn query_results_pass_through_to_the_device() {
    let probe = Probe::default();
    let mut backend = HardwareBackend::new(TestDevice::new(probe.clone(), 0));
    backend
        .initialize(DisplaySurface::default(), TestRam::new(64))
        .unwrap();

    // Device owned by the backend: direct answer.
    assert_eq!(backend.query_result(PerfQueryType::BlendInput), Some(1234));
    assert_eq!(backend.query_result(PerfQueryType::ZCompInput), None);

    // Device owned by the render thread: answered over the request
    // channel.
    backend.enter_render_loop().unwrap();
    assert_eq!(backend.query_result(PerfQueryType::BlendInput), Some(1234));

    backend.shutdown().unwrap();
}

#[test]
fn abort_frame_discards_queued_commands() {
    let mut backend = SoftwareBackend::new();
    backend
        .initialize(DisplaySurface::default(), TestRam::new(4096))
        .unwrap();
    backend.fifo().configure(0, 1024, 1024, 0);
    backend.fifo().push(500);
    assert_eq!(backend.fifo().distance(), 500);

    backend.abort_frame();
    assert_eq!(backend.fifo().distance(), 0);
    assert_eq!(backend.fifo().read_pointer(), backend.fifo().write_pointer());
}
