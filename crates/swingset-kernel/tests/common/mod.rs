//! Vat programs and helpers shared by the kernel integration tests.
//!
//! Each integration test compiles this module separately, so some helpers
//! appear unused in some test binaries.

#![allow(dead_code)]

use std::collections::BTreeMap;
use std::sync::{Arc, Mutex};

use serde_json::{Value, json};
use swingset_kernel::{
    CapData, DeviceHandler, Kernel, KernelOptions, KernelSlot, LocalWorkerFactory, ProgramError,
    ProgramResult, SlotKind, SwingStore, VatContext, VatMessage, VatProgram, VatResolution,
    VatSlot,
};

/// Lines written by vat programs outside of replay.
pub type Log = Arc<Mutex<Vec<String>>>;

pub fn new_log() -> Log {
    Arc::new(Mutex::new(Vec::new()))
}

pub fn lines(log: &Log) -> Vec<String> {
    log.lock().unwrap().clone()
}

fn note(log: &Log, ctx: &VatContext<'_>, line: String) {
    if !ctx.replaying() {
        log.lock().unwrap().push(line);
    }
}

fn resolve_json(ctx: &mut VatContext<'_>, message: &VatMessage, value: Value) {
    if let Some(result) = message.result {
        ctx.resolve(result, CapData::from_json(&value, Vec::new()));
    }
}

/// Keeps a RAM counter and a durable counter in the vatstore.
pub struct Counter {
    label: &'static str,
    count: u64,
    waiting: Vec<VatSlot>,
    log: Log,
}

impl Counter {
    pub fn new(label: &'static str, log: Log) -> Self {
        Self {
            label,
            count: 0,
            waiting: Vec::new(),
            log,
        }
    }

    fn durable(ctx: &mut VatContext<'_>) -> u64 {
        ctx.vatstore_get("durable")
            .and_then(|value| value.parse().ok())
            .unwrap_or_default()
    }
}

impl VatProgram for Counter {
    fn start_vat(&mut self, ctx: &mut VatContext<'_>, _vat_parameters: &Value) -> ProgramResult {
        if ctx.vatstore_get("durable").is_none() {
            ctx.vatstore_set("durable", "0");
        }
        let line = format!("{} started incarnation {}", self.label, ctx.incarnation());
        note(&self.log, ctx, line);
        Ok(())
    }

    fn deliver_message(
        &mut self,
        ctx: &mut VatContext<'_>,
        _target: &VatSlot,
        message: &VatMessage,
    ) -> ProgramResult {
        match message.method.as_str() {
            "increment" => {
                self.count += 1;
                let durable = Self::durable(ctx) + 1;
                ctx.vatstore_set("durable", &durable.to_string());
                let line = format!("{} count {} durable {durable}", self.label, self.count);
                note(&self.log, ctx, line);
                resolve_json(ctx, message, json!({ "ram": self.count, "durable": durable }));
                Ok(())
            }
            "wait" => {
                self.waiting.extend(message.result);
                Ok(())
            }
            "boom" => Err("boom".into()),
            "crash" => Err(ProgramError::Fatal("crash".into())),
            "stash" => {
                let count = message
                    .args
                    .to_json()
                    .and_then(|args| args[0].as_u64())
                    .ok_or("stash needs a count")?;
                for n in 0..count {
                    ctx.vatstore_set(&format!("stash.{n}"), "x");
                }
                resolve_json(ctx, message, json!(count));
                Ok(())
            }
            "illegal" => {
                ctx.send_only(
                    VatSlot::import(SlotKind::Object, 99),
                    "poke",
                    CapData::undefined(),
                );
                Ok(())
            }
            "quit" => {
                resolve_json(ctx, message, json!("bye"));
                ctx.exit(false, CapData::error("quitting"));
                Ok(())
            }
            "giveUp" => {
                ctx.vatstore_set("durable", "999");
                ctx.exit(true, CapData::error("giving up"));
                Ok(())
            }
            other => Err(format!("counter has no method {other}").into()),
        }
    }

    fn bring_out_your_dead(&mut self, ctx: &mut VatContext<'_>) -> ProgramResult {
        note(&self.log, ctx, format!("{} reaped", self.label));
        Ok(())
    }

    fn snapshot(&self) -> Option<Vec<u8>> {
        Some(self.count.to_le_bytes().to_vec())
    }

    fn restore(&mut self, snapshot: &[u8]) -> ProgramResult {
        let bytes: [u8; 8] = snapshot
            .try_into()
            .map_err(|_| "counter snapshot must be 8 bytes".to_string())?;
        self.count = u64::from_le_bytes(bytes);
        Ok(())
    }
}

/// Hands out fresh exports and reports GC deliveries.
pub struct Exporter {
    log: Log,
}

impl VatProgram for Exporter {
    fn deliver_message(
        &mut self,
        ctx: &mut VatContext<'_>,
        _target: &VatSlot,
        message: &VatMessage,
    ) -> ProgramResult {
        match message.method.as_str() {
            "make" => {
                let vref = ctx.allocate_export();
                if let Some(result) = message.result {
                    ctx.resolve(result, CapData::slot(vref));
                }
                Ok(())
            }
            "giveTo" => {
                let target = message
                    .args
                    .slots
                    .first()
                    .copied()
                    .ok_or("giveTo needs a recipient")?;
                let vref = ctx.allocate_export();
                ctx.send_only(target, "hold", CapData::slot(vref));
                note(&self.log, ctx, format!("exporter gave {vref}"));
                Ok(())
            }
            "ping" => {
                resolve_json(ctx, message, json!("pong"));
                Ok(())
            }
            other => Err(format!("exporter has no method {other}").into()),
        }
    }

    fn drop_exports(&mut self, ctx: &mut VatContext<'_>, vrefs: &[VatSlot]) -> ProgramResult {
        note(&self.log, ctx, format!("exporter dropExports {}", join(vrefs)));
        Ok(())
    }

    fn retire_exports(&mut self, ctx: &mut VatContext<'_>, vrefs: &[VatSlot]) -> ProgramResult {
        note(&self.log, ctx, format!("exporter retireExports {}", join(vrefs)));
        Ok(())
    }
}

/// Holds imports until told to let go.
pub struct Holder {
    held: Vec<VatSlot>,
    log: Log,
}

impl VatProgram for Holder {
    fn deliver_message(
        &mut self,
        ctx: &mut VatContext<'_>,
        _target: &VatSlot,
        message: &VatMessage,
    ) -> ProgramResult {
        match message.method.as_str() {
            "hold" => {
                self.held.extend(message.args.slots.iter().copied());
                note(&self.log, ctx, format!("holder holds {}", join(&self.held)));
                resolve_json(ctx, message, json!(self.held.len()));
                Ok(())
            }
            "drop" => {
                let held = std::mem::take(&mut self.held);
                ctx.drop_imports(held.clone());
                ctx.retire_imports(held);
                resolve_json(ctx, message, json!(0));
                Ok(())
            }
            "forget" => {
                ctx.drop_imports(self.held.clone());
                resolve_json(ctx, message, json!(self.held.len()));
                Ok(())
            }
            other => Err(format!("holder has no method {other}").into()),
        }
    }

    fn retire_imports(&mut self, ctx: &mut VatContext<'_>, vrefs: &[VatSlot]) -> ProgramResult {
        self.held.retain(|vref| !vrefs.contains(vref));
        note(&self.log, ctx, format!("holder retireImports {}", join(vrefs)));
        Ok(())
    }
}

/// Receives the bootstrap message and drives other vats and devices.
pub struct Bootstrap {
    vats: BTreeMap<String, VatSlot>,
    devices: BTreeMap<String, VatSlot>,
    forwards: Vec<(VatSlot, VatSlot)>,
    log: Log,
}

impl Bootstrap {
    fn record(names: &Value, slots: &[VatSlot]) -> BTreeMap<String, VatSlot> {
        let Some(names) = names.as_object() else {
            return BTreeMap::new();
        };
        names
            .iter()
            .filter_map(|(name, reference)| {
                let index: usize = reference.as_str()?.strip_prefix('$')?.parse().ok()?;
                Some((name.clone(), *slots.get(index)?))
            })
            .collect()
    }
}

impl VatProgram for Bootstrap {
    fn deliver_message(
        &mut self,
        ctx: &mut VatContext<'_>,
        _target: &VatSlot,
        message: &VatMessage,
    ) -> ProgramResult {
        match message.method.as_str() {
            "bootstrap" => {
                let args = message.args.to_json().ok_or("unreadable bootstrap args")?;
                self.vats = Self::record(&args[0], &message.args.slots);
                self.devices = Self::record(&args[1], &message.args.slots);
                let names: Vec<&str> = self.vats.keys().map(String::as_str).collect();
                note(&self.log, ctx, format!("bootstrap saw vats {}", names.join(",")));
                Ok(())
            }
            "incrementCounter" => {
                let counter = *self.vats.get("counter").ok_or("no counter vat")?;
                let vpid = ctx.send(counter, "increment", CapData::undefined());
                ctx.subscribe(vpid);
                if let Some(result) = message.result {
                    self.forwards.push((vpid, result));
                }
                Ok(())
            }
            "readClock" => {
                let clock = *self.devices.get("clock").ok_or("no clock device")?;
                let Some(result) = message.result else {
                    return Ok(());
                };
                match ctx.call_now(clock, "now", CapData::undefined()) {
                    Ok(data) => ctx.resolve(result, data),
                    Err(reason) => ctx.reject(result, CapData::error(reason)),
                }
                Ok(())
            }
            other => Err(format!("bootstrap has no method {other}").into()),
        }
    }

    fn notify(&mut self, ctx: &mut VatContext<'_>, resolutions: &[VatResolution]) -> ProgramResult {
        for resolution in resolutions {
            note(&self.log, ctx, format!("bootstrap notified {}", resolution.data.body));
            let Some(index) = self
                .forwards
                .iter()
                .position(|(vpid, _)| *vpid == resolution.vpid)
            else {
                continue;
            };
            let (_, result) = self.forwards.remove(index);
            if resolution.rejected {
                ctx.reject(result, resolution.data.clone());
            } else {
                ctx.resolve(result, resolution.data.clone());
            }
        }
        Ok(())
    }
}

/// Fails its first delivery.
pub struct BadStart;

impl VatProgram for BadStart {
    fn start_vat(&mut self, _ctx: &mut VatContext<'_>, _vat_parameters: &Value) -> ProgramResult {
        Err("refusing to start".into())
    }

    fn deliver_message(
        &mut self,
        _ctx: &mut VatContext<'_>,
        _target: &VatSlot,
        _message: &VatMessage,
    ) -> ProgramResult {
        Ok(())
    }
}

/// A device reporting a fixed time.
pub struct Clock {
    pub now: u64,
}

impl DeviceHandler for Clock {
    fn invoke(
        &mut self,
        _target: &VatSlot,
        method: &str,
        _args: &CapData<VatSlot>,
    ) -> Result<CapData<VatSlot>, String> {
        match method {
            "now" => Ok(CapData::from_json(&json!(self.now), Vec::new())),
            other => Err(format!("clock has no method {other}")),
        }
    }
}

fn join(vrefs: &[VatSlot]) -> String {
    vrefs
        .iter()
        .map(ToString::to_string)
        .collect::<Vec<_>>()
        .join(",")
}

/// Every test program, writing to `log`.
pub fn programs(log: &Log) -> LocalWorkerFactory {
    let mut factory = LocalWorkerFactory::new();
    let counter_log = log.clone();
    factory.register("counter", move || {
        Box::new(Counter::new("counter", counter_log.clone()))
    });
    let upgraded_log = log.clone();
    factory.register("counter-v2", move || {
        Box::new(Counter::new("counter-v2", upgraded_log.clone()))
    });
    let exporter_log = log.clone();
    factory.register("exporter", move || {
        Box::new(Exporter {
            log: exporter_log.clone(),
        })
    });
    let holder_log = log.clone();
    factory.register("holder", move || {
        Box::new(Holder {
            held: Vec::new(),
            log: holder_log.clone(),
        })
    });
    let bootstrap_log = log.clone();
    factory.register("bootstrap", move || {
        Box::new(Bootstrap {
            vats: BTreeMap::new(),
            devices: BTreeMap::new(),
            forwards: Vec::new(),
            log: bootstrap_log.clone(),
        })
    });
    factory.register("bad-start", || Box::new(BadStart));
    factory
}

/// Serves the exporter program under the counter's bundle name, so a replayed
/// counter transcript diverges.
pub fn impostor_programs(log: &Log) -> LocalWorkerFactory {
    let mut factory = LocalWorkerFactory::new();
    let exporter_log = log.clone();
    factory.register("counter", move || {
        Box::new(Exporter {
            log: exporter_log.clone(),
        })
    });
    factory
}

/// A kernel running the named static vats `(name, bundle)`.
pub fn kernel_with(
    store: SwingStore,
    log: &Log,
    options: KernelOptions,
    vats: &[(&str, &str)],
) -> anyhow::Result<Kernel> {
    let mut builder = Kernel::builder(store)
        .with_options(options)
        .with_local_workers(programs(log));
    for (name, bundle) in vats {
        builder = builder.with_vat(*name, *bundle);
    }
    Ok(builder.build()?)
}

pub fn json_of(data: &CapData<KernelSlot>) -> Value {
    data.to_json().unwrap_or(Value::Null)
}

pub fn undefined() -> CapData<KernelSlot> {
    CapData::undefined()
}
