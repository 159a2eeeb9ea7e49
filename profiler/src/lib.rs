//! kernelscope profiler core
//!
//! A GPU-aware hybrid profiler loaded into a host process that launches GPU
//! kernels. On every kernel launch (and on a wall-clock CPU timer) it
//! attributes GPU program-counter samples and kernel durations to the
//! CPU-side call context that triggered them, building one calling context
//! tree per launching thread. GPU samples are the leaves.
//!
//! The host (or its injection shim) wires the two external collaborators in
//! at initialization: the vendor PC-sampling driver and, optionally, the
//! interpreter frame introspection helper.

pub mod attribution;
pub mod cct;
pub mod config;
pub mod courier;
pub mod cpu;
pub mod gpu;
pub mod interp;
pub mod prune;
pub mod report;
pub mod session;
pub mod signals;
pub mod sys;
pub mod threads;
pub mod trace;
pub mod unwind;

pub use config::Config;
pub use session::profile;

use crate::attribution::{ActiveNodeTable, AttributionEngine};
use crate::cct::CctStore;
use crate::courier::Courier;
use crate::cpu::SamplerCollection;
use crate::gpu::consumer::QueuedBlock;
use crate::gpu::context::ContextRegistry;
use crate::gpu::driver::{CallbackEvent, PcSamplingDriver};
use crate::gpu::interceptor::Interceptor;
use crate::gpu::ring::PcRing;
use crate::interp::InterpreterIntrospect;
use crate::threads::ThreadRegistry;
use crate::trace::TraceAccumulator;
use crate::unwind::Unwinder;
use anyhow::{Context, Result};
use crossbeam_channel::{Receiver, Sender};
use kernelscope_shared::PcSampleBlock;
use once_cell::sync::OnceCell;
use std::sync::atomic::{AtomicBool, AtomicU64};
use std::sync::{Arc, Mutex};
use tracing::info;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

/// The process-wide profiler handle.
///
/// All mutable state lives behind this struct; the driver-facing callback
/// trampoline and the signal handlers reach it through the installed
/// singleton.
pub struct Engine {
    pub(crate) config: Arc<Config>,
    pub(crate) driver: Arc<dyn PcSamplingDriver>,
    pub(crate) store: Arc<CctStore>,
    pub(crate) active: Arc<ActiveNodeTable>,
    pub(crate) attribution: Arc<AttributionEngine>,
    pub(crate) contexts: Arc<ContextRegistry>,
    pub(crate) ring: Arc<PcRing>,
    pub(crate) queue_tx: Sender<QueuedBlock>,
    pub(crate) queue_rx: Receiver<QueuedBlock>,
    pub(crate) threads: Arc<ThreadRegistry>,
    pub(crate) samplers: Arc<SamplerCollection>,
    pub(crate) tracer: Arc<TraceAccumulator>,
    pub(crate) courier: Option<Arc<Courier>>,
    pub(crate) interceptor: Interceptor,
    pub(crate) sampling_active: Arc<AtomicBool>,
    pub(crate) tracing_active: Arc<AtomicBool>,
    pub(crate) session_busy: AtomicBool,
    /// Start of the self-driven session, nanos since epoch (no-RPC mode)
    pub(crate) session_start_ns: AtomicU64,
    /// Blocks the consumer has appended for the current session
    pub(crate) collected: Arc<Mutex<Vec<PcSampleBlock>>>,
    /// Background threads of the self-driven mode, joined at teardown
    pub(crate) background: Mutex<Vec<std::thread::JoinHandle<()>>>,
}

impl Engine {
    /// Build an engine around the given driver and optional interpreter
    /// helper. The calling thread is recorded as the interpreter main
    /// thread for the remote-frame courier.
    pub fn new(
        config: Config,
        driver: Arc<dyn PcSamplingDriver>,
        interp: Option<Arc<dyn InterpreterIntrospect>>,
    ) -> Result<Arc<Self>> {
        config.validate().context("invalid configuration")?;
        let config = Arc::new(config);

        let store = Arc::new(CctStore::new());
        let active = Arc::new(ActiveNodeTable::new());
        let courier = match (&interp, config.do_interp_unwind) {
            (Some(helper), true) => Some(Arc::new(Courier::new(
                sys::current_pthread(),
                helper.clone(),
            ))),
            _ => None,
        };
        let unwinder = Unwinder::new(config.clone(), interp);
        let attribution = Arc::new(AttributionEngine::new(
            config.clone(),
            store.clone(),
            active.clone(),
            unwinder,
            courier.clone(),
        ));

        let contexts = Arc::new(ContextRegistry::new());
        let ring = Arc::new(PcRing::new(config.ring_buf_count, config.ring_buf_size));
        let (queue_tx, queue_rx) = crossbeam_channel::unbounded();
        let threads = Arc::new(ThreadRegistry::new());
        let samplers = Arc::new(SamplerCollection::new(config.clone()));
        let tracer = Arc::new(TraceAccumulator::new());
        let sampling_active = Arc::new(AtomicBool::new(false));
        let tracing_active = Arc::new(AtomicBool::new(false));

        let interceptor = Interceptor {
            config: config.clone(),
            driver: driver.clone(),
            attribution: attribution.clone(),
            contexts: contexts.clone(),
            ring: ring.clone(),
            queue_tx: queue_tx.clone(),
            threads: threads.clone(),
            samplers: samplers.clone(),
            tracer: tracer.clone(),
            sampling_active: sampling_active.clone(),
            tracing_active: tracing_active.clone(),
        };

        Ok(Arc::new(Self {
            config,
            driver,
            store,
            active,
            attribution,
            contexts,
            ring,
            queue_tx,
            queue_rx,
            threads,
            samplers,
            tracer,
            courier,
            interceptor,
            sampling_active,
            tracing_active,
            session_busy: AtomicBool::new(false),
            session_start_ns: AtomicU64::new(0),
            collected: Arc::new(Mutex::new(Vec::new())),
            background: Mutex::new(Vec::new()),
        }))
    }

    /// Entry point for every driver callback.
    pub fn handle_callback(&self, event: &CallbackEvent) {
        self.interceptor.handle_callback(event);
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    pub fn store(&self) -> &Arc<CctStore> {
        &self.store
    }

    pub fn active(&self) -> &Arc<ActiveNodeTable> {
        &self.active
    }

    pub fn tracer(&self) -> &Arc<TraceAccumulator> {
        &self.tracer
    }

    /// True while a PC-sampling session is running.
    pub fn is_sampling_active(&self) -> bool {
        self.sampling_active.load(std::sync::atomic::Ordering::Acquire)
    }

    /// True while a tracing-mode session is running.
    pub fn is_tracing_active(&self) -> bool {
        self.tracing_active.load(std::sync::atomic::Ordering::Acquire)
    }
}

static ENGINE: OnceCell<Arc<Engine>> = OnceCell::new();

/// Initialize the injected profiler once: read configuration from the
/// environment, install signal handlers, register the at-exit hook, and,
/// in no-RPC mode, start the self-driven session.
///
/// Returns the installed engine; repeated calls return the first one.
pub fn initialize(
    driver: Arc<dyn PcSamplingDriver>,
    interp: Option<Arc<dyn InterpreterIntrospect>>,
) -> Result<&'static Arc<Engine>> {
    init_tracing();

    let engine = match ENGINE.get() {
        Some(existing) => return Ok(existing),
        None => {
            let config = Config::from_env();
            config.log_summary();
            Engine::new(config, driver, interp)?
        }
    };
    let engine = ENGINE.get_or_init(|| engine);

    signals::install(engine);
    // Teardown must run even when the host exits without asking us.
    unsafe { libc::atexit(at_exit_hook) };

    if engine.config.no_rpc {
        info!("no-rpc mode: starting self-driven session");
        session::start_self_driven(engine);
    }

    info!(pid = std::process::id(), "profiler initialized");
    Ok(engine)
}

/// The installed engine, if `initialize` has run.
pub fn try_engine() -> Option<&'static Arc<Engine>> {
    ENGINE.get()
}

extern "C" fn at_exit_hook() {
    if let Some(engine) = ENGINE.get() {
        session::shutdown(engine);
    }
}

/// Install a tracing subscriber unless the host already owns one.
fn init_tracing() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let _ = tracing_subscriber::registry()
        .with(filter)
        .with(tracing_subscriber::fmt::layer().with_target(false))
        .try_init();
}
