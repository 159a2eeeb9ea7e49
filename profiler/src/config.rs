//! Configuration for the profiler core
//!
//! All knobs are read from environment variables at initialization, the way
//! an injected library must be configured. Defaults match a sensible
//! single-GPU training-process deployment.

use anyhow::Result;
use tracing::info;

/// Deep-learning backend whose operator symbols the pruning pass recognizes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Backend {
    Torch,
    Tensorflow,
}

impl std::str::FromStr for Backend {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "torch" | "pytorch" => Ok(Backend::Torch),
            "tf" | "tensorflow" => Ok(Backend::Tensorflow),
            _ => anyhow::bail!("Invalid backend: {}", s),
        }
    }
}

/// How the driver hands PC samples back (see the GPU-PC consumer).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CollectionMode {
    /// Drain only when the driver holds at least one full block of samples
    Continuous,

    /// Drain to empty on every kernel-launch exit
    KernelSerialized,
}

impl std::str::FromStr for CollectionMode {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "continuous" => Ok(CollectionMode::Continuous),
            "kernel_serialized" | "serialized" => Ok(CollectionMode::KernelSerialized),
            _ => anyhow::bail!("Invalid collection mode: {}", s),
        }
    }
}

/// Profiler configuration
#[derive(Debug, Clone)]
pub struct Config {
    /// GPU PC sampling period exponent (None = driver default)
    pub sampling_period: Option<u32>,

    /// Driver scratch buffer size in bytes (None = driver default)
    pub scratch_buf_size: Option<u64>,

    /// Driver hardware buffer size in bytes (None = driver default)
    pub hw_buf_size: Option<u64>,

    /// Record capacity of the per-context provisioning buffer
    pub provision_record_count: usize,

    /// Number of slots in the PC-sample ring
    pub ring_buf_count: usize,

    /// Record capacity of each ring slot
    pub ring_buf_size: usize,

    /// Skip unwinding entirely and attribute everything to the thread root
    pub fake_unwind: bool,

    /// Master switch for launch-time attribution
    pub do_cpu_unwind: bool,

    /// Apply the critical-node pruning pass at report time
    pub prune_cct: bool,

    /// Use the stack-pointer shortcut to skip repeat unwinds
    pub check_sp: bool,

    /// Synchronize all kernel-launching threads (signal barrier) around
    /// sampling start/stop
    pub sync_before_start: bool,

    /// Debug traces on the unwind path
    pub verbose: bool,

    /// Fuse interpreter frames into unwound stacks
    pub do_interp_unwind: bool,

    /// Run one self-driven session and dump the report to `dump_file`
    pub no_rpc: bool,

    /// Tracing mode: accumulate kernel durations instead of PC sampling
    pub no_sampling: bool,

    /// Operator-regex set used by the pruning pass
    pub backend: Backend,

    /// Override for the backend operator regex
    pub op_regex: Option<String>,

    /// Entry-file basename used by the `loss` pruning heuristic
    pub entry_file: String,

    /// Dump path for the self-driven (no-RPC) mode
    pub dump_file: String,

    /// How the driver hands back PC samples
    pub collection_mode: CollectionMode,

    /// CPU perf sampling period (cpu-clock, nanoseconds)
    pub cpu_sampling_period: u64,

    /// CPU perf ring size in pages (power of two)
    pub cpu_sampling_pages: u64,

    /// Poll timeout for one CPU sample collection, in ms (< 0 = infinite)
    pub cpu_sampling_timeout_ms: i32,

    /// Maximum callchain depth kept per CPU sample
    pub cpu_sampling_max_depth: usize,

    /// Substrings hiding profiler/vendor internals from unwound stacks
    pub exclude_patterns: Vec<String>,

    /// Native symbol marking an interpreter eval frame (fusion rule)
    pub eval_frame_symbol: String,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            sampling_period: None,
            scratch_buf_size: None,
            hw_buf_size: None,
            provision_record_count: 1000,
            ring_buf_count: 10,
            ring_buf_size: 500,
            fake_unwind: false,
            do_cpu_unwind: true,
            prune_cct: true,
            check_sp: true,
            sync_before_start: false,
            verbose: false,
            do_interp_unwind: false,
            no_rpc: false,
            no_sampling: false,
            backend: Backend::Torch,
            op_regex: None,
            entry_file: "main.py".to_string(),
            dump_file: "profiling_report.bin".to_string(),
            collection_mode: CollectionMode::Continuous,
            cpu_sampling_period: 10_000_000,
            cpu_sampling_pages: 8,
            cpu_sampling_timeout_ms: 100,
            cpu_sampling_max_depth: 128,
            exclude_patterns: vec![
                "cupti".to_string(),
                "CUpti".to_string(),
                "kernelscope".to_string(),
            ],
            eval_frame_symbol: "_PyEval_EvalFrameDefault".to_string(),
        }
    }
}

fn env_parse<T: std::str::FromStr>(name: &str, target: &mut T) {
    if let Ok(raw) = std::env::var(name) {
        if let Ok(value) = raw.parse::<T>() {
            *target = value;
        }
    }
}

fn env_parse_opt<T: std::str::FromStr>(name: &str, target: &mut Option<T>) {
    if let Ok(raw) = std::env::var(name) {
        if let Ok(value) = raw.parse::<T>() {
            *target = Some(value);
        }
    }
}

fn env_bool(name: &str, target: &mut bool) {
    if let Ok(raw) = std::env::var(name) {
        *target = matches!(raw.as_str(), "1" | "true" | "yes" | "on");
    }
}

impl Config {
    /// Read configuration from the environment, starting from defaults.
    pub fn from_env() -> Self {
        let mut config = Self::default();

        env_parse_opt("KSCOPE_SAMPLING_PERIOD", &mut config.sampling_period);
        env_parse_opt("KSCOPE_SCRATCH_BUF_SIZE", &mut config.scratch_buf_size);
        env_parse_opt("KSCOPE_HW_BUF_SIZE", &mut config.hw_buf_size);
        env_parse(
            "KSCOPE_PROVISION_RECORD_COUNT",
            &mut config.provision_record_count,
        );
        env_parse("KSCOPE_RING_BUF_COUNT", &mut config.ring_buf_count);
        env_parse("KSCOPE_RING_BUF_SIZE", &mut config.ring_buf_size);
        env_bool("KSCOPE_FAKE_UNWIND", &mut config.fake_unwind);
        env_bool("KSCOPE_DO_CPU_UNWIND", &mut config.do_cpu_unwind);
        env_bool("KSCOPE_PRUNE_CCT", &mut config.prune_cct);
        env_bool("KSCOPE_CHECK_SP", &mut config.check_sp);
        env_bool("KSCOPE_SYNC_BEFORE_START", &mut config.sync_before_start);
        env_bool("KSCOPE_VERBOSE", &mut config.verbose);
        env_bool("KSCOPE_DO_INTERP_UNWIND", &mut config.do_interp_unwind);
        env_bool("KSCOPE_NO_RPC", &mut config.no_rpc);
        env_bool("KSCOPE_NO_SAMPLING", &mut config.no_sampling);
        env_parse("KSCOPE_BACKEND", &mut config.backend);
        if let Ok(raw) = std::env::var("KSCOPE_OP_REGEX") {
            if !raw.is_empty() {
                config.op_regex = Some(raw);
            }
        }
        if let Ok(raw) = std::env::var("KSCOPE_ENTRY_FILE") {
            config.entry_file = raw;
        }
        if let Ok(raw) = std::env::var("KSCOPE_DUMP_FILE") {
            config.dump_file = raw;
        }
        env_parse("KSCOPE_COLLECTION_MODE", &mut config.collection_mode);
        env_parse("KSCOPE_CPU_SAMPLING_PERIOD", &mut config.cpu_sampling_period);
        env_parse("KSCOPE_CPU_SAMPLING_PAGES", &mut config.cpu_sampling_pages);
        env_parse(
            "KSCOPE_CPU_SAMPLING_TIMEOUT",
            &mut config.cpu_sampling_timeout_ms,
        );
        env_parse(
            "KSCOPE_CPU_SAMPLING_MAX_DEPTH",
            &mut config.cpu_sampling_max_depth,
        );

        config
    }

    /// Validate configuration
    pub fn validate(&self) -> Result<()> {
        if self.ring_buf_count == 0 {
            anyhow::bail!("Ring buffer count must be greater than 0");
        }
        if self.ring_buf_size == 0 {
            anyhow::bail!("Ring buffer record capacity must be greater than 0");
        }
        if self.provision_record_count == 0 {
            anyhow::bail!("Provisioning buffer record count must be greater than 0");
        }
        if self.cpu_sampling_pages == 0 || !self.cpu_sampling_pages.is_power_of_two() {
            anyhow::bail!(
                "CPU sampling pages must be a power of two, got {}",
                self.cpu_sampling_pages
            );
        }
        if self.cpu_sampling_max_depth == 0 {
            anyhow::bail!("CPU sampling max depth must be greater than 0");
        }
        Ok(())
    }

    /// Log a configuration summary at startup.
    pub fn log_summary(&self) {
        info!("============ configuration details ============");
        info!("provisioning buffer records  : {}", self.provision_record_count);
        info!("ring buffer count            : {}", self.ring_buf_count);
        info!("ring buffer record capacity  : {}", self.ring_buf_size);
        info!("collection mode              : {:?}", self.collection_mode);
        info!("check sp                     : {}", self.check_sp);
        info!("dl backend                   : {:?}", self.backend);
        info!("prune cct                    : {}", self.prune_cct);
        info!("sync before start/stop       : {}", self.sync_before_start);
        info!("unwind verbose               : {}", self.verbose);
        info!("do interp unwinding          : {}", self.do_interp_unwind);
        info!("tracing mode (no sampling)   : {}", self.no_sampling);
        info!("===============================================");
    }

    /// True when an unwound frame should be hidden from the tree.
    pub fn is_excluded(&self, func_name: &str) -> bool {
        self.exclude_patterns
            .iter()
            .any(|pattern| func_name.contains(pattern.as_str()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::str::FromStr;

    #[test]
    fn test_defaults_valid() {
        assert!(Config::default().validate().is_ok());
    }

    #[test]
    fn test_backend_from_str() {
        assert_eq!(Backend::from_str("torch").unwrap(), Backend::Torch);
        assert_eq!(Backend::from_str("TF").unwrap(), Backend::Tensorflow);
        assert!(Backend::from_str("jax").is_err());
    }

    #[test]
    fn test_collection_mode_from_str() {
        assert_eq!(
            CollectionMode::from_str("continuous").unwrap(),
            CollectionMode::Continuous
        );
        assert_eq!(
            CollectionMode::from_str("kernel_serialized").unwrap(),
            CollectionMode::KernelSerialized
        );
    }

    #[test]
    fn test_validation_zero_ring() {
        let config = Config {
            ring_buf_count: 0,
            ..Default::default()
        };
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_validation_pages_power_of_two() {
        let config = Config {
            cpu_sampling_pages: 6,
            ..Default::default()
        };
        assert!(config.validate().is_err());

        let config = Config {
            cpu_sampling_pages: 16,
            ..Default::default()
        };
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_exclusion_patterns() {
        let config = Config::default();
        assert!(config.is_excluded("cuptiPCSamplingGetData"));
        assert!(config.is_excluded("kernelscope_profiler::attribution"));
        assert!(!config.is_excluded("at::_ops::add::call"));
    }
}
