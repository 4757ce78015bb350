//! Runtime CPU capability detection
//!
//! The host is inspected once per process and the result is cached in a
//! `OnceLock`. Kernels read the cached value to pick an instruction sequence:
//! - AVX2 enables the 256-bit integer paths (bulk popcount, XNOR)
//! - AVX2 + FMA enables the 8-wide fused multiply-add dot product
//! - POPCNT enables the single-instruction popcount tier
//!
//! On targets without feature detection every flag reads `false` and all kernels run
//! their portable scalar versions.

use std::fmt;
use std::ops::BitAnd;
use std::sync::OnceLock;

use tracing::debug;

static CAPABILITIES: OnceLock<Capabilities> = OnceLock::new();

/// Instruction set extensions available to the kernels.
///
/// Values built by hand (for tests or to disable a tier) are always clamped
/// to [`capabilities()`] before a kernel acts on them.
#[derive(Clone, Copy, PartialEq, Eq, Hash, Default)]
pub struct Capabilities {
    avx2: bool,
    fma: bool,
    popcnt: bool,
}

impl Capabilities {
    /// No extensions: every kernel takes its portable path.
    pub const fn none() -> Self {
        Self {
            avx2: false,
            fma: false,
            popcnt: false,
        }
    }

    /// Every extension the kernels know about.
    pub const fn all() -> Self {
        Self {
            avx2: true,
            fma: true,
            popcnt: true,
        }
    }

    pub const fn with_avx2(mut self, enabled: bool) -> Self {
        self.avx2 = enabled;
        self
    }

    pub const fn with_fma(mut self, enabled: bool) -> Self {
        self.fma = enabled;
        self
    }

    pub const fn with_popcnt(mut self, enabled: bool) -> Self {
        self.popcnt = enabled;
        self
    }

    #[inline]
    pub const fn avx2(self) -> bool {
        self.avx2
    }

    #[inline]
    pub const fn fma(self) -> bool {
        self.fma
    }

    #[inline]
    pub const fn popcnt(self) -> bool {
        self.popcnt
    }

    /// AVX2 and FMA together, required by the dense dot product.
    #[inline]
    pub const fn avx2_fma(self) -> bool {
        self.avx2 && self.fma
    }

    /// Restrict `self` to what the host actually supports.
    #[inline]
    pub fn clamp_to_host(self) -> Self {
        self & capabilities()
    }

    /// Query the host CPU. Prefer [`capabilities()`], which caches the result.
    pub fn detect() -> Self {
        #[cfg(target_arch = "x86_64")]
        {
            Self {
                avx2: is_x86_feature_detected!("avx2"),
                fma: is_x86_feature_detected!("fma"),
                popcnt: is_x86_feature_detected!("popcnt"),
            }
        }

        #[cfg(not(target_arch = "x86_64"))]
        {
            Self::none()
        }
    }

    /// Every subset of the known flags, used to exercise each dispatch tier.
    pub fn combinations() -> impl Iterator<Item = Self> {
        (0u8..8).map(|bits| Self {
            avx2: bits & 0b001 != 0,
            fma: bits & 0b010 != 0,
            popcnt: bits & 0b100 != 0,
        })
    }
}

impl BitAnd for Capabilities {
    type Output = Self;

    fn bitand(self, rhs: Self) -> Self {
        Self {
            avx2: self.avx2 && rhs.avx2,
            fma: self.fma && rhs.fma,
            popcnt: self.popcnt && rhs.popcnt,
        }
    }
}

impl fmt::Debug for Capabilities {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut names = Vec::with_capacity(3);
        if self.avx2 {
            names.push("avx2");
        }
        if self.fma {
            names.push("fma");
        }
        if self.popcnt {
            names.push("popcnt");
        }
        if names.is_empty() {
            f.write_str("Capabilities(scalar)")
        } else {
            write!(f, "Capabilities({})", names.join("+"))
        }
    }
}

/// Capabilities of the host CPU, detected on first call and cached for the
/// lifetime of the process.
#[inline]
pub fn capabilities() -> Capabilities {
    *CAPABILITIES.get_or_init(detect_and_log)
}

fn detect_and_log() -> Capabilities {
    let caps = Capabilities::detect();
    debug!("detected cpu capabilities: {:?}", caps);
    caps
}
