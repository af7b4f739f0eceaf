use crate::drm::Driver;
use crate::error::{BlasError, BlasResult};
use crate::runtime::memory::{DmaMemoryManager, MemoryRegion};
use std::borrow::Cow;
use std::collections::BTreeMap;
use std::fmt;
use std::io;
use std::path::Path;
use std::ptr;

/// Bytes per QPU instruction.
const INSTRUCTION_BYTES: usize = 8;

/// The fan-out a kernel image is compiled for.
///
/// A job spans `units` execution units of `threads` lanes each; every lane
/// processes `queues × unroll` elements per pass.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Granularity {
    pub queues: usize,
    pub threads: usize,
    pub units: usize,
    pub unroll: usize,
}

impl Granularity {
    #[must_use]
    pub const fn new(queues: usize, threads: usize, units: usize, unroll: usize) -> Self {
        Self {
            queues,
            threads,
            units,
            unroll,
        }
    }

    /// Elements (or rows) consumed by one full pass over every lane.
    #[must_use]
    pub const fn align(self) -> usize {
        self.queues * self.threads * self.units * self.unroll
    }

    /// Number of per-lane partial results a reduction kernel writes.
    #[must_use]
    pub const fn lanes(self) -> usize {
        self.threads * self.units
    }
}

/// Execution units available on VideoCore VI.
pub const NUM_QPUS: usize = 8;
const THREADS: usize = 16;

/// Identifies one precompiled kernel image and its calling convention.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum KernelKind {
    Saxpy,
    Scopy,
    Sscal,
    Sdot,
    Snrm2,
    Sasum,
    SgemvN,
    SgemvT,
    SgemmRnn,
    SgemmRnt,
    SgemmRtn,
    SgemmRtt,
}

impl KernelKind {
    pub const ALL: [Self; 12] = [
        Self::Saxpy,
        Self::Scopy,
        Self::Sscal,
        Self::Sdot,
        Self::Snrm2,
        Self::Sasum,
        Self::SgemvN,
        Self::SgemvT,
        Self::SgemmRnn,
        Self::SgemmRnt,
        Self::SgemmRtn,
        Self::SgemmRtt,
    ];

    #[must_use]
    pub const fn name(self) -> &'static str {
        match self {
            Self::Saxpy => "saxpy",
            Self::Scopy => "scopy",
            Self::Sscal => "sscal",
            Self::Sdot => "sdot",
            Self::Snrm2 => "snrm2",
            Self::Sasum => "sasum",
            Self::SgemvN => "sgemv_n",
            Self::SgemvT => "sgemv_t",
            Self::SgemmRnn => "sgemm_rnn",
            Self::SgemmRnt => "sgemm_rnt",
            Self::SgemmRtn => "sgemm_rtn",
            Self::SgemmRtt => "sgemm_rtt",
        }
    }

    /// Fan-out constants the image was built with. These must match the image.
    #[must_use]
    pub const fn granularity(self) -> Granularity {
        match self {
            Self::Saxpy | Self::Sscal => Granularity::new(4, THREADS, NUM_QPUS, 1 << 1),
            Self::Scopy => Granularity::new(8, THREADS, NUM_QPUS, 1 << 0),
            Self::Sdot | Self::Sasum => Granularity::new(4, THREADS, NUM_QPUS, 1 << 4),
            Self::Snrm2 => Granularity::new(8, THREADS, NUM_QPUS, 1 << 5),
            Self::SgemvN
            | Self::SgemvT
            | Self::SgemmRnn
            | Self::SgemmRnt
            | Self::SgemmRtn
            | Self::SgemmRtt => Granularity::new(1, THREADS, NUM_QPUS, 1),
        }
    }

    /// Whether the kernel leaves per-lane partials in the uniform buffer.
    #[must_use]
    pub const fn is_reduction(self) -> bool {
        matches!(self, Self::Sdot | Self::Snrm2 | Self::Sasum)
    }
}

impl fmt::Display for KernelKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// The kernel images the embedder supplies, typically via `include_bytes!`.
#[derive(Debug, Clone, Default)]
pub struct KernelLibrary {
    images: BTreeMap<KernelKind, Cow<'static, [u8]>>,
}

impl KernelLibrary {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn with_image(mut self, kind: KernelKind, image: impl Into<Cow<'static, [u8]>>) -> Self {
        self.insert(kind, image);
        self
    }

    pub fn insert(&mut self, kind: KernelKind, image: impl Into<Cow<'static, [u8]>>) {
        self.images.insert(kind, image.into());
    }

    /// Loads `<dir>/<name>.bin` for every kernel that has a file there.
    ///
    /// # Errors
    /// Returns an error if a present file cannot be read.
    pub fn from_dir(dir: &Path) -> io::Result<Self> {
        let mut library = Self::new();
        for kind in KernelKind::ALL {
            let path = dir.join(format!("{}.bin", kind.name()));
            match std::fs::read(&path) {
                Ok(bytes) => library.insert(kind, bytes),
                Err(e) if e.kind() == io::ErrorKind::NotFound => {}
                Err(e) => return Err(e),
            }
        }
        Ok(library)
    }

    /// One distinct, well-formed stand-in image per kernel.
    ///
    /// These carry no machine code; they are what [`crate::drm::mock::MockDriver`]
    /// recognises to emulate each kernel.
    #[must_use]
    pub fn placeholder() -> Self {
        let mut library = Self::new();
        for kind in KernelKind::ALL {
            library.insert(kind, placeholder_image(kind));
        }
        library
    }

    #[must_use]
    pub fn get(&self, kind: KernelKind) -> Option<&[u8]> {
        self.images.get(&kind).map(AsRef::as_ref)
    }

    pub fn iter(&self) -> impl Iterator<Item = (KernelKind, &[u8])> {
        self.images.iter().map(|(kind, image)| (*kind, image.as_ref()))
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.images.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.images.is_empty()
    }
}

pub(crate) fn placeholder_image(kind: KernelKind) -> Vec<u8> {
    let mut image = b"V3DBLAS\0".to_vec();
    image.extend_from_slice(&(kind as u64).to_le_bytes());
    image
}

fn validate_image(kind: KernelKind, image: &[u8]) -> BlasResult<()> {
    if image.is_empty() {
        return Err(BlasError::InvalidKernelImage {
            kind,
            reason: "image is empty".into(),
        });
    }
    if image.len() % INSTRUCTION_BYTES != 0 {
        return Err(BlasError::InvalidKernelImage {
            kind,
            reason: format!(
                "{} bytes is not a whole number of {INSTRUCTION_BYTES}-byte instructions",
                image.len()
            ),
        });
    }
    Ok(())
}

/// Kernel images copied into accelerator-visible memory.
#[derive(Debug, Default)]
pub struct LoadedKernels {
    regions: Vec<(KernelKind, MemoryRegion)>,
}

impl LoadedKernels {
    /// Copy every image of `library` into its own DMA region.
    ///
    /// On failure, the images loaded so far are released again.
    pub fn load(
        memory: &mut DmaMemoryManager,
        driver: &dyn Driver,
        library: &KernelLibrary,
    ) -> BlasResult<Self> {
        let mut loaded = Self::default();

        for (kind, image) in library.iter() {
            if let Err(e) = loaded.load_one(memory, driver, kind, image) {
                loaded.unload(memory, driver).ok();
                return Err(e);
            }
        }

        Ok(loaded)
    }

    fn load_one(
        &mut self,
        memory: &mut DmaMemoryManager,
        driver: &dyn Driver,
        kind: KernelKind,
        image: &[u8],
    ) -> BlasResult<()> {
        validate_image(kind, image)?;

        let region = memory.allocate(driver, image.len())?;
        unsafe {
            ptr::copy_nonoverlapping(image.as_ptr(), region.as_mut_ptr(), image.len());
        }

        log::debug!(
            "loaded {kind} ({} instructions) at bus {:#010x}",
            image.len() / INSTRUCTION_BYTES,
            region.bus_addr
        );
        self.regions.push((kind, region));
        Ok(())
    }

    /// Release every image, most recently loaded first.
    pub fn unload(&mut self, memory: &mut DmaMemoryManager, driver: &dyn Driver) -> BlasResult<()> {
        let mut first_err = None;
        while let Some((_, region)) = self.regions.pop() {
            if let Err(e) = memory.free(driver, region.virt_addr) {
                first_err.get_or_insert(e);
            }
        }
        first_err.map_or(Ok(()), Err)
    }

    /// Bus address of a loaded image.
    pub fn bus_addr(&self, kind: KernelKind) -> BlasResult<u32> {
        self.regions
            .iter()
            .find(|(k, _)| *k == kind)
            .map(|(_, region)| region.bus_addr)
            .ok_or(BlasError::KernelNotLoaded(kind))
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.regions.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.regions.is_empty()
    }
}
