//! Compilation options, CPU capabilities, and the per-job context.

use std::collections::BTreeSet;
use std::sync::Mutex;

use bitflags::bitflags;

use crate::diag::Diagnostics;
use crate::env::LabelGenerator;

#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub enum CpuFamily {
    /// Plain NMOS 6502.
    Nmos6502,
    /// The NES variant: NMOS with decimal mode fused off.
    Ricoh,
    Cmos65C02,
    Cmos65CE02,
    HuC6280,
    W65C816,
}

bitflags! {
    /// Instruction-set capabilities, switchable independently of the
    /// family (e.g. ILLEGALS only makes sense on NMOS, and is opt-in).
    #[derive(Debug, Copy, Clone, Eq, PartialEq)]
    pub struct CpuFeature: u32 {
        const CMOS_OPS = 1;
        const CE02_OPS = 1 << 1;
        const HUC6280_OPS = 1 << 2;
        const EMULATION_65816 = 1 << 3;
        const NATIVE_65816 = 1 << 4;
        const ILLEGALS = 1 << 5;
        const DECIMAL_MODE = 1 << 6;
    }
}

impl CpuFamily {
    pub fn base_features(self) -> CpuFeature {
        match self {
            CpuFamily::Nmos6502 => CpuFeature::DECIMAL_MODE,
            CpuFamily::Ricoh => CpuFeature::empty(),
            CpuFamily::Cmos65C02 => CpuFeature::CMOS_OPS | CpuFeature::DECIMAL_MODE,
            CpuFamily::Cmos65CE02 => {
                CpuFeature::CMOS_OPS | CpuFeature::CE02_OPS | CpuFeature::DECIMAL_MODE
            }
            CpuFamily::HuC6280 => {
                CpuFeature::CMOS_OPS | CpuFeature::HUC6280_OPS | CpuFeature::DECIMAL_MODE
            }
            CpuFamily::W65C816 => {
                CpuFeature::CMOS_OPS | CpuFeature::EMULATION_65816 | CpuFeature::DECIMAL_MODE
            }
        }
    }
}

/// What the optimizer is told to minimize.
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub enum OptimizationMetric {
    /// Cycles, the default.
    Speed,
    /// Bytes.
    Size,
    /// Cycles, and size regressions are acceptable.
    ExtremeSpeed,
}

#[derive(Debug, Clone)]
pub struct CompilationOptions {
    pub family: CpuFamily,
    pub features: CpuFeature,
    /// 0..=9; 9 enables the superoptimizer.
    pub optimization_level: u8,
    pub metric: OptimizationMetric,
    /// Width of the zero-page pseudoregister block, in bytes.
    pub zp_register_size: u8,
    pub check_array_bounds: bool,
    /// Distinct from bounds checking; consumed by the external allocator.
    pub allow_variable_overlap: bool,
    pub single_threaded: bool,
    pub fatal_warnings: bool,
}

impl Default for CompilationOptions {
    fn default() -> CompilationOptions {
        let family = CpuFamily::Nmos6502;
        CompilationOptions {
            family,
            features: family.base_features(),
            optimization_level: 1,
            metric: OptimizationMetric::Speed,
            zp_register_size: 4,
            check_array_bounds: false,
            allow_variable_overlap: false,
            single_threaded: false,
            fatal_warnings: false,
        }
    }
}

impl CompilationOptions {
    pub fn for_family(family: CpuFamily) -> CompilationOptions {
        CompilationOptions {
            family,
            features: family.base_features(),
            ..CompilationOptions::default()
        }
    }

    pub fn with_level(mut self, level: u8) -> CompilationOptions {
        self.optimization_level = level;
        self
    }

    pub fn with_features(mut self, features: CpuFeature) -> CompilationOptions {
        self.features |= features;
        self
    }

    pub fn has(&self, feature: CpuFeature) -> bool {
        self.features.contains(feature)
    }
}

/// Runtime subroutines the compiler may lean on; requested lazily and
/// appended to the program before assembly.
#[derive(Debug, Copy, Clone, Eq, PartialEq, Ord, PartialOrd)]
pub enum RuntimeRoutine {
    MulU8,
    BoundsFail,
}

impl RuntimeRoutine {
    pub fn name(self) -> &'static str {
        match self {
            RuntimeRoutine::MulU8 => "__mul_u8",
            RuntimeRoutine::BoundsFail => "__bounds_fail",
        }
    }
}

/// State shared across one compilation job: options, diagnostics, the
/// label counter, and the set of runtime routines the compiled code
/// turned out to need.
#[derive(Debug)]
pub struct JobContext {
    pub options: CompilationOptions,
    pub diagnostics: Diagnostics,
    pub labels: LabelGenerator,
    runtime: Mutex<BTreeSet<RuntimeRoutine>>,
}

impl JobContext {
    pub fn new(options: CompilationOptions) -> JobContext {
        let fatal_warnings = options.fatal_warnings;
        JobContext {
            options,
            diagnostics: Diagnostics::new(fatal_warnings),
            labels: LabelGenerator::default(),
            runtime: Mutex::new(BTreeSet::new()),
        }
    }

    pub fn require_runtime(&self, routine: RuntimeRoutine) {
        self.runtime.lock().unwrap().insert(routine);
    }

    pub fn runtime_routines(&self) -> Vec<RuntimeRoutine> {
        self.runtime.lock().unwrap().iter().copied().collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ricoh_has_no_decimal_mode() {
        assert!(!CpuFamily::Ricoh
            .base_features()
            .contains(CpuFeature::DECIMAL_MODE));
        assert!(CpuFamily::Nmos6502
            .base_features()
            .contains(CpuFeature::DECIMAL_MODE));
    }

    #[test]
    fn runtime_requests_deduplicate() {
        let job = JobContext::new(CompilationOptions::default());
        job.require_runtime(RuntimeRoutine::MulU8);
        job.require_runtime(RuntimeRoutine::MulU8);
        job.require_runtime(RuntimeRoutine::BoundsFail);
        assert_eq!(
            job.runtime_routines(),
            vec![RuntimeRoutine::MulU8, RuntimeRoutine::BoundsFail]
        );
    }
}
