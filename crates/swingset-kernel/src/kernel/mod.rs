//! The kernel proper: builder, crank loop and host control surface.

use std::collections::{BTreeMap, BTreeSet};
use std::fmt;

use serde_json::{Value, json};
use swingset_store::SwingStore;

use crate::capdata::{CapData, Message};
use crate::clist::MapOpts;
use crate::device::DeviceHandler;
use crate::error::KernelError;
use crate::ids::{DeviceId, KernelSlot, VatId, VatSlot};
use crate::local_worker::LocalWorkerFactory;
use crate::options::{DEFAULT_MANAGER_TYPE, KernelOptions, VatOptions};
use crate::persist::KernelStorage;
use crate::run_queue::RunQueueEvent;
use crate::state::{KernelState, VatRecord};
use crate::transcript::TranscriptEntry;
use crate::worker::{VatSource, VatWorker, WorkerFactory};

mod crank;
mod delivery;
mod query_api;
mod syscall;
mod vat_lifecycle;

pub use query_api::{PromiseStatus, Resolution};

/// A vat created when the kernel is first initialized.
#[derive(Clone, Debug, PartialEq)]
pub struct StaticVat {
    pub name: String,
    pub source: VatSource,
    pub options: VatOptions,
    pub parameters: Value,
}

impl StaticVat {
    pub fn new(name: impl Into<String>, bundle: impl Into<String>) -> Self {
        let name = name.into();
        Self {
            options: VatOptions::named(name.clone()),
            name,
            source: VatSource::bundle(bundle),
            parameters: Value::Null,
        }
    }

    pub fn with_options(mut self, options: VatOptions) -> Self {
        self.options = VatOptions {
            name: Some(self.name.clone()),
            ..options
        };
        self
    }

    pub fn with_parameters(mut self, parameters: Value) -> Self {
        self.parameters = parameters;
        self
    }
}

/// Builder-level configuration. None of it is persisted except what it
/// seeds into a fresh store.
#[derive(Default)]
pub struct KernelConfig {
    pub options: KernelOptions,
    pub worker_factories: BTreeMap<String, Box<dyn WorkerFactory>>,
    pub devices: Vec<(String, Box<dyn DeviceHandler>)>,
    pub static_vats: Vec<StaticVat>,
    pub bootstrap: Option<String>,
}

impl fmt::Debug for KernelConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("KernelConfig")
            .field("options", &self.options)
            .field(
                "worker_factories",
                &self.worker_factories.keys().collect::<Vec<_>>(),
            )
            .field(
                "devices",
                &self.devices.iter().map(|(name, _)| name).collect::<Vec<_>>(),
            )
            .field("static_vats", &self.static_vats)
            .field("bootstrap", &self.bootstrap)
            .finish()
    }
}

pub struct KernelBuilder {
    store: SwingStore,
    config: KernelConfig,
}

impl KernelBuilder {
    pub fn new(store: SwingStore) -> Self {
        Self {
            store,
            config: KernelConfig::default(),
        }
    }

    pub fn with_config(mut self, config: KernelConfig) -> Self {
        self.config = config;
        self
    }

    pub fn with_options(mut self, options: KernelOptions) -> Self {
        self.config.options = options;
        self
    }

    pub fn with_worker_factory(
        mut self,
        manager_type: impl Into<String>,
        factory: impl WorkerFactory + 'static,
    ) -> Self {
        self.config
            .worker_factories
            .insert(manager_type.into(), Box::new(factory));
        self
    }

    pub fn with_local_workers(self, factory: LocalWorkerFactory) -> Self {
        self.with_worker_factory(DEFAULT_MANAGER_TYPE, factory)
    }

    pub fn with_vat(self, name: impl Into<String>, bundle: impl Into<String>) -> Self {
        self.with_static_vat(StaticVat::new(name, bundle))
    }

    pub fn with_static_vat(mut self, vat: StaticVat) -> Self {
        self.config.static_vats.push(vat);
        self
    }

    pub fn with_device(mut self, name: impl Into<String>, handler: impl DeviceHandler + 'static) -> Self {
        self.config.devices.push((name.into(), Box::new(handler)));
        self
    }

    pub fn with_bootstrap(mut self, name: impl Into<String>) -> Self {
        self.config.bootstrap = Some(name.into());
        self
    }

    /// Open the kernel. A store that already holds kernel state is resumed;
    /// otherwise the configured devices and static vats are created and
    /// their start deliveries queued.
    pub fn build(self) -> Result<Kernel, KernelError> {
        let KernelConfig {
            options,
            worker_factories,
            devices,
            static_vats,
            bootstrap,
        } = self.config;
        let mut storage = KernelStorage::new(self.store);
        let resumed = storage.is_initialized();
        let mut state = if resumed {
            storage.load_state()?
        } else {
            KernelState::new(options)
        };

        let mut handlers = BTreeMap::new();
        for (name, handler) in devices {
            let device_id = match state.device_names.get(&name) {
                Some(device_id) => *device_id,
                None if !resumed => state.add_device(&name),
                None => return Err(KernelError::UnknownDevice(name)),
            };
            handlers.insert(device_id, handler);
        }

        if !resumed {
            initialize(&mut state, static_vats, bootstrap.as_deref())?;
            log::info!(
                "initialized kernel with {} vats and {} devices",
                state.vats.len(),
                state.devices.len()
            );
        } else {
            log::info!(
                "resumed kernel at crank {} with {} vats",
                state.crank_number,
                state.vats.len()
            );
        }

        let mut kernel = Kernel {
            state,
            storage,
            factories: worker_factories,
            workers: BTreeMap::new(),
            devices: handlers,
            pending_transcripts: Vec::new(),
            touched: BTreeSet::new(),
            panic: None,
        };
        if !resumed {
            kernel.commit_host()?;
        }
        Ok(kernel)
    }
}

fn initialize(
    state: &mut KernelState,
    static_vats: Vec<StaticVat>,
    bootstrap: Option<&str>,
) -> Result<(), KernelError> {
    for vat in static_vats {
        let vat_id = state.allocate_vat_id();
        state.add_vat(VatRecord::new(vat_id, vat.source, vat.options, false));
        state.enqueue(RunQueueEvent::StartVat {
            vat_id,
            vat_parameters: vat.parameters,
        })?;
    }
    let Some(bootstrap) = bootstrap else {
        return Ok(());
    };
    let bootstrap_id = state.vat_id_by_name(bootstrap)?;
    state.bootstrap_vat = Some(bootstrap_id);

    let mut slots = Vec::new();
    let mut vats = serde_json::Map::new();
    let names: Vec<(String, VatId)> = state
        .vat_names
        .iter()
        .map(|(name, vat_id)| (name.clone(), *vat_id))
        .collect();
    for (name, vat_id) in names {
        let root = state.vat_to_kernel(vat_id, VatSlot::root(), MapOpts::default())?;
        vats.insert(name, json!(format!("${}", slots.len())));
        slots.push(root);
    }
    let mut devices = serde_json::Map::new();
    let device_ids: Vec<(String, DeviceId)> = state
        .device_names
        .iter()
        .map(|(name, device_id)| (name.clone(), *device_id))
        .collect();
    for (name, device_id) in device_ids {
        let node = state.device_root(device_id)?;
        devices.insert(name, json!(format!("${}", slots.len())));
        slots.push(KernelSlot::Device(node));
    }
    let args = CapData::from_json(&json!([vats, devices]), slots);
    let target = state.vat_to_kernel(bootstrap_id, VatSlot::root(), MapOpts::default())?;
    state.enqueue(RunQueueEvent::Send {
        target,
        msg: Message::new("bootstrap", args, None),
    })
}

/// The single-threaded kernel. Everything mutable lives in `state`; the
/// store only sees its changes, at crank boundaries.
pub struct Kernel {
    state: KernelState,
    storage: KernelStorage,
    factories: BTreeMap<String, Box<dyn WorkerFactory>>,
    workers: BTreeMap<VatId, Box<dyn VatWorker>>,
    devices: BTreeMap<DeviceId, Box<dyn DeviceHandler>>,
    pending_transcripts: Vec<(VatId, u64, TranscriptEntry)>,
    /// Vats whose workers ran during the current crank.
    touched: BTreeSet<VatId>,
    panic: Option<String>,
}

impl Kernel {
    pub fn builder(store: SwingStore) -> KernelBuilder {
        KernelBuilder::new(store)
    }

    fn check_panic(&self) -> Result<(), KernelError> {
        match &self.panic {
            Some(problem) => Err(KernelError::Panicked(problem.clone())),
            None => Ok(()),
        }
    }

    /// Commit host-initiated changes made outside a crank.
    fn commit_host(&mut self) -> Result<(), KernelError> {
        let transcripts = std::mem::take(&mut self.pending_transcripts);
        self.storage.commit(&mut self.state, transcripts)
    }

    fn evict_worker(&mut self, vat_id: VatId) {
        if let Some(mut worker) = self.workers.remove(&vat_id) {
            worker.shutdown();
        }
    }
}
