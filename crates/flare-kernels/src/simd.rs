//! Runtime SIMD capability detection.
//!
//! The block matmuls dispatch their inner loops on the detected tier.

use std::sync::OnceLock;

/// SIMD capabilities detected at runtime.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SimdCapability {
    pub avx2: bool,
    pub fma: bool,
    pub neon: bool,
}

static DETECTED: OnceLock<SimdCapability> = OnceLock::new();

impl SimdCapability {
    /// Detect SIMD capabilities for the current CPU.
    pub fn detect() -> &'static SimdCapability {
        DETECTED.get_or_init(|| {
            #[cfg(target_arch = "x86_64")]
            {
                SimdCapability {
                    avx2: is_x86_feature_detected!("avx2"),
                    fma: is_x86_feature_detected!("fma"),
                    neon: false,
                }
            }

            #[cfg(target_arch = "aarch64")]
            {
                SimdCapability {
                    avx2: false,
                    fma: false,
                    neon: true,
                }
            }

            #[cfg(not(any(target_arch = "x86_64", target_arch = "aarch64")))]
            {
                SimdCapability {
                    avx2: false,
                    fma: false,
                    neon: false,
                }
            }
        })
    }

    /// Whether the AVX2+FMA axpy path can be used.
    pub fn has_avx2_fma(&self) -> bool {
        self.avx2 && self.fma
    }

    /// Best available SIMD tier as a human-readable string.
    pub fn best_tier(&self) -> &'static str {
        if self.has_avx2_fma() {
            "AVX2+FMA"
        } else if self.neon {
            "NEON"
        } else {
            "scalar"
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_detect_is_stable() {
        let cap = SimdCapability::detect();
        let cap2 = SimdCapability::detect();
        assert_eq!(cap, cap2);
    }

    #[test]
    fn test_best_tier() {
        let scalar = SimdCapability { avx2: false, fma: false, neon: false };
        assert_eq!(scalar.best_tier(), "scalar");

        // AVX2 without FMA is not enough for the fused path
        let avx2 = SimdCapability { avx2: true, fma: false, neon: false };
        assert_eq!(avx2.best_tier(), "scalar");

        let both = SimdCapability { avx2: true, fma: true, neon: false };
        assert_eq!(both.best_tier(), "AVX2+FMA");
    }
}
