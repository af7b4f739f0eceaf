use crate::drm::Driver;
use crate::drm::device::V3dDevice;
use crate::error::{BlasError, BlasResult};
use crate::runtime::config::{ExitHandler, RuntimeConfig};
use crate::runtime::dispatch;
use crate::runtime::kernels::{KernelKind, KernelLibrary, LoadedKernels};
use crate::runtime::memory::{AlignedAllocator, DmaMemoryManager, Resolved};
use crate::runtime::uniform::UniformBuffer;
use std::cell::{Cell, RefCell};
use std::fmt;
use std::io;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

// ===============================================================================================
// Initialization Phases
// ===============================================================================================

/// Sub-initializers, in the order they run. Teardown mirrors this in reverse.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Phase {
    Uniforms,
    Support,
    Kernels,
}

impl Phase {
    const ORDER: [Self; 3] = [Self::Uniforms, Self::Support, Self::Kernels];

    const fn name(self) -> &'static str {
        match self {
            Self::Uniforms => "uniforms",
            Self::Support => "support",
            Self::Kernels => "kernels",
        }
    }
}

// ===============================================================================================
// Context
// ===============================================================================================

/// Set while a context owns the real device.
static DEVICE_IN_USE: AtomicBool = AtomicBool::new(false);

/// The runtime state every routine works against: the driver, DMA bookkeeping, the
/// shared uniform buffer, loaded kernel images, the wait timeout and the exit handler.
///
/// A context is `Send` but not `Sync`. Each routine uses the single uniform buffer and
/// blocks until its job completes, so calls must not overlap.
pub struct Context {
    driver: Box<dyn Driver>,
    pub(crate) memory: RefCell<DmaMemoryManager>,
    pub(crate) aligned: RefCell<AlignedAllocator>,
    uniforms: Option<UniformBuffer>,
    kernels: LoadedKernels,
    initialized: Vec<Phase>,
    timeout: Cell<Duration>,
    exit_handler: Cell<ExitHandler>,
    /// Uniform buffer handle of a job whose wait failed. Blocks every later dispatch.
    outstanding: Cell<Option<u32>>,
    exclusive: bool,
}

impl Context {
    /// Build a context over `driver`, loading every image in `library`.
    ///
    /// If a phase fails, the phases already initialized are torn down again before the
    /// error is returned.
    ///
    /// # Errors
    /// Returns the error of the first failing phase.
    pub fn new(
        driver: impl Driver + 'static,
        library: &KernelLibrary,
        config: &RuntimeConfig,
    ) -> BlasResult<Self> {
        let mut ctx = Self {
            driver: Box::new(driver),
            memory: RefCell::new(DmaMemoryManager::new()),
            aligned: RefCell::new(AlignedAllocator::default()),
            uniforms: None,
            kernels: LoadedKernels::default(),
            initialized: Vec::new(),
            timeout: Cell::new(config.timeout),
            exit_handler: Cell::new(config.exit_handler),
            outstanding: Cell::new(None),
            exclusive: false,
        };

        for phase in Phase::ORDER {
            if let Err(e) = ctx.init_phase(phase, library, config) {
                log::debug!("initializing {} failed: {e}", phase.name());
                ctx.teardown().ok();
                return Err(e);
            }
            ctx.initialized.push(phase);
        }

        log::debug!(
            "context ready: {} kernels, timeout {:?}",
            ctx.kernels.len(),
            config.timeout
        );
        Ok(ctx)
    }

    /// Open the V3D device named by `config.device_path` (or the first one found) and
    /// build a context over it.
    ///
    /// Only one such context may exist per process at a time.
    ///
    /// # Errors
    /// Returns `Device` if the device is already claimed or cannot be opened, otherwise
    /// the error of the first failing phase.
    pub fn open(library: &KernelLibrary, config: &RuntimeConfig) -> BlasResult<Self> {
        if DEVICE_IN_USE.swap(true, Ordering::AcqRel) {
            return Err(BlasError::Device(io::Error::from_raw_os_error(libc::EBUSY)));
        }

        let device = match &config.device_path {
            Some(path) => V3dDevice::open_path(path),
            None => V3dDevice::open(),
        };

        match device
            .map_err(BlasError::Device)
            .and_then(|device| Self::new(device, library, config))
        {
            Ok(mut ctx) => {
                ctx.exclusive = true;
                Ok(ctx)
            }
            Err(e) => {
                DEVICE_IN_USE.store(false, Ordering::Release);
                Err(e)
            }
        }
    }

    fn init_phase(
        &mut self,
        phase: Phase,
        library: &KernelLibrary,
        config: &RuntimeConfig,
    ) -> BlasResult<()> {
        let memory = self.memory.get_mut();
        match phase {
            Phase::Uniforms => {
                let unif = UniformBuffer::allocate(memory, &*self.driver, config.uniform_words)?;
                self.uniforms = Some(unif);
            }
            Phase::Support => {
                *self.aligned.get_mut() = AlignedAllocator::new(config.default_alignment);
            }
            Phase::Kernels => {
                self.kernels = LoadedKernels::load(memory, &*self.driver, library)?;
            }
        }
        log::debug!("initialized {}", phase.name());
        Ok(())
    }

    fn finalize_phase(&mut self, phase: Phase) -> BlasResult<()> {
        let memory = self.memory.get_mut();
        match phase {
            Phase::Kernels => self.kernels.unload(memory, &*self.driver)?,
            Phase::Support => self.aligned.get_mut().check_released()?,
            Phase::Uniforms => {
                if let Some(unif) = self.uniforms.take() {
                    unif.release(memory, &*self.driver)?;
                }
            }
        }
        log::debug!("finalized {}", phase.name());
        Ok(())
    }

    /// Wait once more for a job that previously timed out.
    fn settle(&mut self) -> BlasResult<()> {
        let Some(handle) = self.outstanding.get() else {
            return Ok(());
        };

        if let Err(e) = dispatch::wait_for_handles(&*self.driver, self.timeout.get(), &[handle]) {
            log::error!("job using handle {handle} is still running: {e}");
            return Err(BlasError::JobOutstanding { handle });
        }
        log::debug!("outstanding job on handle {handle} completed");
        self.outstanding.set(None);
        Ok(())
    }

    /// Run every initialized phase's teardown, most recent first, keeping the first error.
    ///
    /// If a job is still running, no memory is released; the device may still write it.
    fn teardown(&mut self) -> BlasResult<()> {
        if self.initialized.is_empty() {
            return Ok(());
        }

        if let Err(e) = self.settle() {
            self.initialized.clear();
            return Err(e);
        }

        let mut first_err = None;
        while let Some(phase) = self.initialized.pop() {
            if let Err(e) = self.finalize_phase(phase) {
                log::debug!("finalizing {} failed: {e}", phase.name());
                first_err.get_or_insert(e);
            }
        }

        let remaining = self.memory.get_mut().len();
        if remaining > 0 {
            first_err.get_or_insert(BlasError::ResourceLeak(remaining));
        }
        first_err.map_or(Ok(()), Err)
    }

    /// Tear the context down and report what went wrong instead of terminating.
    ///
    /// # Errors
    /// Returns `JobOutstanding` if a job that timed out earlier still has not completed,
    /// `ResourceLeak` if aligned allocations were never freed, or the first driver error
    /// met while releasing memory.
    pub fn finalize(mut self) -> BlasResult<()> {
        self.teardown()
    }

    // ===========================================================================================
    // Fatal Error Reporting
    // ===========================================================================================

    /// Report `err` for `routine` on stderr and call the exit handler with `EXIT_FAILURE`.
    pub fn fatal(&self, routine: &str, err: BlasError) -> ! {
        eprintln!("v3d-blas: {routine}: {err} (info = {})", err.info());
        log::error!("{routine}: {err}");
        (self.exit_handler.get())(libc::EXIT_FAILURE)
    }

    /// The value of `result`, or [`Context::fatal`] on error.
    pub fn unwrap_or_fatal<T>(&self, routine: &str, result: BlasResult<T>) -> T {
        match result {
            Ok(value) => value,
            Err(e) => self.fatal(routine, e),
        }
    }

    /// Replace the action taken after a fatal error. `None` restores process exit.
    pub fn set_exit_handler(&self, handler: Option<ExitHandler>) {
        self.exit_handler.set(handler.unwrap_or(std::process::exit));
    }

    // ===========================================================================================
    // Accessors
    // ===========================================================================================

    /// How long a routine waits for the accelerator before failing.
    pub fn timeout(&self) -> Duration {
        self.timeout.get()
    }

    pub fn set_timeout(&self, timeout: Duration) {
        self.timeout.set(timeout);
    }

    /// Bus address and handle of any address inside a live DMA allocation.
    ///
    /// # Errors
    /// Returns `UnknownAddress` if `ptr` is not inside one.
    pub fn resolve(&self, ptr: *const u8) -> BlasResult<Resolved> {
        self.memory.borrow().resolve(ptr as usize)
    }

    /// Number of live DMA regions, including the ones the runtime itself holds.
    pub fn live_regions(&self) -> usize {
        self.memory.borrow().len()
    }

    pub(crate) fn driver(&self) -> &dyn Driver {
        &*self.driver
    }

    pub(crate) fn uniform_buffer(&self) -> BlasResult<&UniformBuffer> {
        self.uniforms
            .as_ref()
            .ok_or(BlasError::Uninitialized(Phase::Uniforms.name()))
    }

    /// Fails while a job whose wait failed may still be using the uniform buffer.
    pub(crate) fn ensure_idle(&self) -> BlasResult<()> {
        match self.outstanding.get() {
            Some(handle) => Err(BlasError::JobOutstanding { handle }),
            None => Ok(()),
        }
    }

    /// Every job references the uniform buffer, so waiting on it later waits for the job.
    pub(crate) fn mark_outstanding(&self, handle: u32) {
        log::debug!("job using handle {handle} left outstanding");
        self.outstanding.set(Some(handle));
    }

    pub(crate) fn kernel_bus(&self, kind: KernelKind) -> BlasResult<u32> {
        self.kernels.bus_addr(kind)
    }
}

impl Drop for Context {
    fn drop(&mut self) {
        let result = self.teardown();
        if self.exclusive {
            DEVICE_IN_USE.store(false, Ordering::Release);
        }
        if std::thread::panicking() {
            return;
        }
        if let Err(e) = result {
            self.fatal("finalize", e);
        }
    }
}

impl fmt::Debug for Context {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Context")
            .field("live_regions", &self.memory.borrow().len())
            .field("aligned", &self.aligned.borrow().live())
            .field("kernels", &self.kernels.len())
            .field("timeout", &self.timeout.get())
            .field("outstanding", &self.outstanding.get())
            .finish_non_exhaustive()
    }
}
