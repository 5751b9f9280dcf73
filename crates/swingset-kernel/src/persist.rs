//! Kernel state to kv keys and back.
//!
//! Scalar state (options, counters, names, per-vat settings) forms a small
//! header image that is re-encoded and diffed at every commit. The large
//! tables (objects, promises, c-lists, vatstores, the run queue) are written
//! key by key from their journals, so a commit costs what the crank changed.
//! Keys under `local.` are host-local and excluded from the activity hash.

use std::collections::{BTreeMap, BTreeSet, VecDeque};
use std::str::FromStr;

use indexmap::IndexMap;
use serde::Serialize;
use serde::de::DeserializeOwned;
use swingset_store::{ACTIVITY_HASH_KEY, Hash, KvStore, SwingStore};

use crate::capdata::{CapData, Message};
use crate::clist::{CList, CListEntry};
use crate::error::KernelError;
use crate::ids::{DeviceId, KDevice, KPid, KRef, KernelSlot, VatId, VatSlot};
use crate::journal::TrackedMap;
use crate::object_table::{ObjectRecord, ObjectTable, PromiseRecord, PromiseState, ResultPolicy};
use crate::options::{KernelOptions, Threshold};
use crate::run_queue::{RunQueue, RunQueueEvent};
use crate::state::{DeviceRecord, KernelState, SnapshotInfo, VatLifecycle, VatRecord};
use crate::transcript::TranscriptEntry;

pub const STATE_VERSION: &str = "1";

type Image = BTreeMap<String, String>;

fn to_json<T: Serialize + ?Sized>(value: &T) -> Result<String, KernelError> {
    Ok(serde_json::to_string(value)?)
}

fn lifecycle_str(lifecycle: VatLifecycle) -> &'static str {
    match lifecycle {
        VatLifecycle::Starting => "starting",
        VatLifecycle::Active => "active",
        VatLifecycle::Upgrading => "upgrading",
        VatLifecycle::Terminated => "terminated",
    }
}

fn encode_clist_counters(image: &mut Image, prefix: &str, clist: &CList) {
    image.insert(format!("{prefix}.o.nextID"), clist.next_object.to_string());
    image.insert(format!("{prefix}.p.nextID"), clist.next_promise.to_string());
    image.insert(format!("{prefix}.d.nextID"), clist.next_device.to_string());
}

fn clist_entry_value(entry: &CListEntry) -> String {
    let flag = if entry.reachable { "R" } else { "_" };
    format!("{flag} {}", entry.vref)
}

fn encode_promise(image: &mut Image, kpid: KPid, record: &PromiseRecord) -> Result<(), KernelError> {
    image.insert(format!("{kpid}.state"), record.state.label().to_string());
    image.insert(format!("{kpid}.refCount"), record.refcount.to_string());
    image.insert(format!("{kpid}.policy"), record.policy.as_str().to_string());
    if record.held_by_host {
        image.insert(format!("{kpid}.host"), "1".to_string());
    }
    match &record.state {
        PromiseState::Unresolved {
            decider,
            subscribers,
            queue,
        } => {
            if let Some(decider) = decider {
                image.insert(format!("{kpid}.decider"), decider.to_string());
            }
            let subscribers: Vec<VatId> = subscribers.iter().copied().collect();
            image.insert(format!("{kpid}.subscribers"), to_json(&subscribers)?);
            for (n, msg) in queue.iter().enumerate() {
                image.insert(format!("{kpid}.queue.{n}"), to_json(msg)?);
            }
        }
        PromiseState::Fulfilled(data) | PromiseState::Rejected(data) => {
            image.insert(format!("{kpid}.data.body"), data.body.clone());
            image.insert(format!("{kpid}.data.slots"), to_json(&data.slots)?);
        }
    }
    Ok(())
}

fn encode_vat_header(image: &mut Image, state: &KernelState, vat: &VatRecord) -> Result<(), KernelError> {
    let v = vat.vat_id;
    image.insert(format!("{v}.source"), to_json(&vat.source)?);
    image.insert(format!("{v}.options"), to_json(&vat.options)?);
    image.insert(format!("{v}.lifecycle"), lifecycle_str(vat.lifecycle).to_string());
    image.insert(format!("{v}.incarnationNumber"), vat.incarnation.to_string());
    image.insert(format!("{v}.reapInterval"), state.reap_interval(vat).to_string());
    image.insert(format!("{v}.reapGCKrefs"), state.reap_gc_krefs(vat).to_string());
    image.insert(format!("{v}.reapDirt"), to_json(&vat.reap_dirt)?);
    image.insert(format!("{v}.t.startPosition"), vat.transcript_start.to_string());
    image.insert(format!("{v}.t.endPosition"), vat.transcript_end.to_string());
    encode_clist_counters(image, &v.to_string(), &vat.clist);
    if let Some(snapshot) = &vat.last_snapshot {
        image.insert(format!("local.{v}.lastSnapshot"), to_json(snapshot)?);
    }
    Ok(())
}

/// The scalar keys: everything except table entries and queued events.
fn encode_header(state: &KernelState) -> Result<Image, KernelError> {
    let mut image = Image::new();
    image.insert("version".into(), STATE_VERSION.into());
    image.insert("crankNumber".into(), state.crank_number.to_string());

    let options = &state.options;
    image.insert("kernel.defaultManagerType".into(), options.default_manager_type.clone());
    image.insert("kernel.defaultReapInterval".into(), options.default_reap_interval.to_string());
    image.insert("kernel.defaultReapGCKrefs".into(), options.default_reap_gc_krefs.to_string());
    image.insert("kernel.snapshotInitial".into(), options.snapshot_initial.to_string());
    image.insert("kernel.snapshotInterval".into(), options.snapshot_interval.to_string());

    image.insert("vat.nextID".into(), state.next_vat_id.to_string());
    let names: Vec<&String> = state.vat_names.keys().collect();
    image.insert("vat.names".into(), to_json(&names)?);
    for (name, vat_id) in &state.vat_names {
        image.insert(format!("vat.name.{name}"), vat_id.to_string());
    }
    let dynamic: Vec<VatId> = state
        .vats
        .values()
        .chain(state.dead_vats.values())
        .filter(|vat| vat.dynamic)
        .map(|vat| vat.vat_id)
        .collect();
    image.insert("vat.dynamicIDs".into(), to_json(&dynamic)?);
    image.insert("vats.terminated".into(), to_json(&state.terminated)?);

    image.insert("device.nextID".into(), state.next_device_id.to_string());
    let device_names: Vec<&String> = state.device_names.keys().collect();
    image.insert("device.names".into(), to_json(&device_names)?);
    for (name, device_id) in &state.device_names {
        image.insert(format!("device.name.{name}"), device_id.to_string());
    }

    image.insert("ko.nextID".into(), state.objects.next_object.to_string());
    image.insert("kp.nextID".into(), state.objects.next_promise.to_string());
    image.insert("kd.nextID".into(), state.objects.next_device_node.to_string());

    image.insert("gcActions".into(), to_json(&state.gc_actions)?);
    image.insert("reapQueue".into(), to_json(&state.reap_queue)?);
    image.insert(
        "runQueue".into(),
        to_json(&[state.run_queue.head, state.run_queue.tail()])?,
    );
    image.insert("pinnedObjects".into(), to_json(&state.pinned)?);
    if let Some(bootstrap) = state.bootstrap_vat {
        image.insert("bootstrapVat".into(), bootstrap.to_string());
    }

    for vat in state.vats.values().chain(state.dead_vats.values()) {
        encode_vat_header(&mut image, state, vat)?;
    }
    for device in state.devices.values() {
        let d = device.device_id;
        image.insert(format!("{d}.name"), device.name.clone());
        encode_clist_counters(&mut image, &d.to_string(), &device.clist);
    }
    Ok(image)
}

fn set_or_delete(kv: &mut KvStore, key: &str, value: Option<&str>) {
    match value {
        Some(value) => kv.set(key, value),
        None => kv.delete(key),
    }
}

fn write_objects(kv: &mut KvStore, objects: &mut ObjectTable) -> Result<(), KernelError> {
    for kref in objects.objects.take_dirty() {
        let record = objects.objects.get(&kref);
        let owner = record.and_then(|record| record.owner).map(|owner| owner.to_string());
        set_or_delete(kv, &format!("{kref}.owner"), owner.as_deref());
        let counts = record.map(|record| format!("{},{}", record.reachable, record.recognizable));
        set_or_delete(kv, &format!("{kref}.refCount"), counts.as_deref());
    }
    for kpid in objects.promises.take_dirty() {
        for key in kv.get_prefixed_keys(&format!("{kpid}.")) {
            kv.delete(&key);
        }
        if let Some(record) = objects.promises.get(&kpid) {
            let mut entries = Image::new();
            encode_promise(&mut entries, kpid, record)?;
            for (key, value) in &entries {
                kv.set(key, value);
            }
        }
    }
    for node in objects.device_nodes.take_dirty() {
        let owner = objects.device_nodes.get(&node).map(|owner| owner.to_string());
        set_or_delete(kv, &format!("{node}.owner"), owner.as_deref());
    }
    Ok(())
}

fn write_clist(kv: &mut KvStore, prefix: &str, clist: &mut CList) {
    for slot in clist.kernel_to_vat.take_dirty() {
        let value = clist.kernel_to_vat.get(&slot).map(clist_entry_value);
        set_or_delete(kv, &format!("{prefix}.c.{slot}"), value.as_deref());
    }
    for vref in clist.vat_to_kernel.take_dirty() {
        let value = clist.vat_to_kernel.get(&vref).map(|slot| slot.to_string());
        set_or_delete(kv, &format!("{prefix}.c.{vref}"), value.as_deref());
    }
}

fn write_vat(kv: &mut KvStore, vat: &mut VatRecord) {
    let v = vat.vat_id;
    write_clist(kv, &v.to_string(), &mut vat.clist);
    for key in vat.vatstore.take_dirty() {
        let value = vat.vatstore.get(&key).cloned();
        set_or_delete(kv, &format!("{v}.vs.{key}"), value.as_deref());
    }
}

/// Queued events keep their position for life, so only the consumed range
/// and the newly appended range change.
fn write_run_queue(kv: &mut KvStore, queue: &RunQueue, committed: (u64, u64)) -> Result<(), KernelError> {
    let (old_head, old_tail) = committed;
    for position in old_head..queue.head.min(old_tail) {
        kv.delete(&format!("runQueue.{position}"));
    }
    let skip = old_tail.saturating_sub(queue.head);
    for (offset, event) in queue.iter().enumerate().skip(skip as usize) {
        let position = queue.head + offset as u64;
        kv.set(&format!("runQueue.{position}"), &to_json(event)?);
    }
    Ok(())
}

struct Reader<'a> {
    image: &'a Image,
}

impl<'a> Reader<'a> {
    fn opt(&self, key: &str) -> Option<&'a str> {
        self.image.get(key).map(String::as_str)
    }

    fn get(&self, key: &str) -> Result<&'a str, KernelError> {
        self.opt(key)
            .ok_or_else(|| KernelError::Decode(format!("missing key {key}")))
    }

    fn parse<T: FromStr>(&self, key: &str) -> Result<T, KernelError> {
        let raw = self.get(key)?;
        raw.parse()
            .map_err(|_| KernelError::Decode(format!("bad value for {key}: {raw}")))
    }

    fn json<T: DeserializeOwned>(&self, key: &str) -> Result<T, KernelError> {
        serde_json::from_str(self.get(key)?)
            .map_err(|err| KernelError::Decode(format!("bad JSON at {key}: {err}")))
    }

    fn threshold(&self, key: &str) -> Result<Threshold, KernelError> {
        let raw = self.get(key)?;
        Threshold::parse_kv(raw).ok_or_else(|| KernelError::Decode(format!("bad threshold at {key}: {raw}")))
    }

    fn prefixed(&self, prefix: &str) -> Vec<(&'a str, &'a str)> {
        self.image
            .range(prefix.to_string()..)
            .take_while(|(key, _)| key.starts_with(prefix))
            .map(|(key, value)| (&key[prefix.len()..], value.as_str()))
            .collect()
    }

    /// Identifiers of every record that has `suffix` as one of its keys.
    fn ids_with_suffix<T: FromStr>(&self, suffix: &str) -> Vec<T> {
        self.image
            .keys()
            .filter_map(|key| key.strip_suffix(suffix))
            .filter_map(|id| id.parse().ok())
            .collect()
    }
}

fn decode_clist(reader: &Reader<'_>, prefix: &str) -> Result<CList, KernelError> {
    let mut kernel_to_vat = BTreeMap::new();
    let mut vat_to_kernel = BTreeMap::new();
    let entry_prefix = format!("{prefix}.c.");
    for (suffix, value) in reader.prefixed(&entry_prefix) {
        let Ok(slot) = suffix.parse::<KernelSlot>() else {
            continue;
        };
        let (flag, vref) = value
            .split_once(' ')
            .ok_or_else(|| KernelError::Decode(format!("bad c-list entry {prefix}.c.{suffix}")))?;
        let vref: VatSlot = vref
            .parse()
            .map_err(|_| KernelError::Decode(format!("bad vref in {prefix}.c.{suffix}")))?;
        kernel_to_vat.insert(
            slot,
            CListEntry {
                vref,
                reachable: flag == "R",
            },
        );
        vat_to_kernel.insert(vref, slot);
    }
    Ok(CList {
        kernel_to_vat: kernel_to_vat.into_iter().collect(),
        vat_to_kernel: vat_to_kernel.into_iter().collect(),
        next_object: reader.parse(&format!("{prefix}.o.nextID"))?,
        next_promise: reader.parse(&format!("{prefix}.p.nextID"))?,
        next_device: reader.parse(&format!("{prefix}.d.nextID"))?,
    })
}

fn decode_promise(reader: &Reader<'_>, kpid: KPid) -> Result<PromiseRecord, KernelError> {
    let policy_raw = reader.get(&format!("{kpid}.policy"))?;
    let policy = ResultPolicy::parse(policy_raw)
        .ok_or_else(|| KernelError::Decode(format!("bad policy for {kpid}: {policy_raw}")))?;
    let state = match reader.get(&format!("{kpid}.state"))? {
        "unresolved" => {
            let decider = reader
                .opt(&format!("{kpid}.decider"))
                .map(|raw| {
                    raw.parse::<VatId>()
                        .map_err(|_| KernelError::Decode(format!("bad decider for {kpid}")))
                })
                .transpose()?;
            let subscribers: Vec<VatId> = reader.json(&format!("{kpid}.subscribers"))?;
            let mut queue = Vec::new();
            loop {
                let key = format!("{kpid}.queue.{}", queue.len());
                if reader.opt(&key).is_none() {
                    break;
                }
                queue.push(reader.json::<Message>(&key)?);
            }
            PromiseState::Unresolved {
                decider,
                subscribers: subscribers.into_iter().collect(),
                queue,
            }
        }
        settled @ ("fulfilled" | "rejected") => {
            let data = CapData::new(
                reader.get(&format!("{kpid}.data.body"))?,
                reader.json(&format!("{kpid}.data.slots"))?,
            );
            if settled == "fulfilled" {
                PromiseState::Fulfilled(data)
            } else {
                PromiseState::Rejected(data)
            }
        }
        other => {
            return Err(KernelError::Decode(format!("bad state for {kpid}: {other}")));
        }
    };
    Ok(PromiseRecord {
        state,
        refcount: reader.parse(&format!("{kpid}.refCount"))?,
        policy,
        held_by_host: reader.opt(&format!("{kpid}.host")).is_some(),
    })
}

fn decode_vat(reader: &Reader<'_>, vat_id: VatId, dynamic: bool) -> Result<VatRecord, KernelError> {
    let v = vat_id;
    let lifecycle = match reader.get(&format!("{v}.lifecycle"))? {
        "starting" => VatLifecycle::Starting,
        "active" => VatLifecycle::Active,
        "upgrading" => VatLifecycle::Upgrading,
        "terminated" => VatLifecycle::Terminated,
        other => return Err(KernelError::Decode(format!("bad lifecycle for {v}: {other}"))),
    };
    let vatstore_prefix = format!("{v}.vs.");
    let vatstore = reader
        .prefixed(&vatstore_prefix)
        .into_iter()
        .map(|(key, value)| (key.to_string(), value.to_string()))
        .collect();
    let last_snapshot: Option<SnapshotInfo> = match reader.opt(&format!("local.{v}.lastSnapshot")) {
        Some(_) => Some(reader.json(&format!("local.{v}.lastSnapshot"))?),
        None => None,
    };
    Ok(VatRecord {
        vat_id,
        source: reader.json(&format!("{v}.source"))?,
        options: reader.json(&format!("{v}.options"))?,
        lifecycle,
        incarnation: reader.parse(&format!("{v}.incarnationNumber"))?,
        clist: decode_clist(reader, &v.to_string())?,
        vatstore,
        reap_dirt: reader.json(&format!("{v}.reapDirt"))?,
        transcript_start: reader.parse(&format!("{v}.t.startPosition"))?,
        transcript_end: reader.parse(&format!("{v}.t.endPosition"))?,
        last_snapshot,
        dynamic,
    })
}

/// Rebuild kernel state from a committed image. Every table comes back with
/// an empty journal.
pub fn decode_state(image: &Image) -> Result<KernelState, KernelError> {
    let reader = Reader { image };
    let version = reader.get("version")?;
    if version != STATE_VERSION {
        return Err(KernelError::Decode(format!("unsupported state version {version}")));
    }

    let options = KernelOptions {
        default_manager_type: reader.get("kernel.defaultManagerType")?.to_string(),
        default_reap_interval: reader.threshold("kernel.defaultReapInterval")?,
        default_reap_gc_krefs: reader.threshold("kernel.defaultReapGCKrefs")?,
        snapshot_initial: reader.parse("kernel.snapshotInitial")?,
        snapshot_interval: reader.parse("kernel.snapshotInterval")?,
    };

    let mut object_records = Vec::new();
    for kref in reader.ids_with_suffix::<KRef>(".refCount") {
        let raw = reader.get(&format!("{kref}.refCount"))?;
        let (reachable, recognizable) = raw
            .split_once(',')
            .and_then(|(r, c)| Some((r.parse().ok()?, c.parse().ok()?)))
            .ok_or_else(|| KernelError::Decode(format!("bad refCount for {kref}: {raw}")))?;
        let owner = reader
            .opt(&format!("{kref}.owner"))
            .map(|raw| {
                raw.parse::<VatId>()
                    .map_err(|_| KernelError::Decode(format!("bad owner for {kref}")))
            })
            .transpose()?;
        object_records.push((
            kref,
            ObjectRecord {
                owner,
                reachable,
                recognizable,
            },
        ));
    }
    let promises: TrackedMap<KPid, PromiseRecord> = reader
        .ids_with_suffix::<KPid>(".state")
        .into_iter()
        .map(|kpid| decode_promise(&reader, kpid).map(|record| (kpid, record)))
        .collect::<Result<_, _>>()?;
    let device_nodes: TrackedMap<KDevice, DeviceId> = reader
        .ids_with_suffix::<KDevice>(".owner")
        .into_iter()
        .map(|node| {
            reader
                .parse::<DeviceId>(&format!("{node}.owner"))
                .map(|owner| (node, owner))
        })
        .collect::<Result<_, _>>()?;
    let objects = ObjectTable {
        objects: object_records.into_iter().collect(),
        promises,
        device_nodes,
        next_object: reader.parse("ko.nextID")?,
        next_promise: reader.parse("kp.nextID")?,
        next_device_node: reader.parse("kd.nextID")?,
        ..ObjectTable::default()
    };

    let dynamic: BTreeSet<VatId> = reader.json("vat.dynamicIDs")?;
    let mut vats = BTreeMap::new();
    let mut dead_vats = BTreeMap::new();
    for vat_id in reader.ids_with_suffix::<VatId>(".source") {
        let vat = decode_vat(&reader, vat_id, dynamic.contains(&vat_id))?;
        if vat.lifecycle == VatLifecycle::Terminated {
            dead_vats.insert(vat_id, vat);
        } else {
            vats.insert(vat_id, vat);
        }
    }

    let mut vat_names = IndexMap::new();
    for name in reader.json::<Vec<String>>("vat.names")? {
        let vat_id = reader.parse(&format!("vat.name.{name}"))?;
        vat_names.insert(name, vat_id);
    }

    let mut devices = BTreeMap::new();
    let mut device_names = IndexMap::new();
    for name in reader.json::<Vec<String>>("device.names")? {
        let device_id: DeviceId = reader.parse(&format!("device.name.{name}"))?;
        devices.insert(
            device_id,
            DeviceRecord {
                device_id,
                name: reader.get(&format!("{device_id}.name"))?.to_string(),
                clist: decode_clist(&reader, &device_id.to_string())?,
            },
        );
        device_names.insert(name, device_id);
    }

    let [head, tail]: [u64; 2] = reader.json("runQueue")?;
    let events: VecDeque<RunQueueEvent> = (head..tail)
        .map(|position| reader.json(&format!("runQueue.{position}")))
        .collect::<Result<_, _>>()?;

    Ok(KernelState {
        options,
        objects,
        vats,
        dead_vats,
        forgotten: Vec::new(),
        devices,
        vat_names,
        device_names,
        terminated: reader.json("vats.terminated")?,
        run_queue: RunQueue::new(head, events),
        reap_queue: reader.json("reapQueue")?,
        gc_actions: reader.json("gcActions")?,
        pinned: reader.json("pinnedObjects")?,
        bootstrap_vat: reader
            .opt("bootstrapVat")
            .map(|raw| {
                raw.parse()
                    .map_err(|_| KernelError::Decode(format!("bad bootstrapVat {raw}")))
            })
            .transpose()?,
        next_vat_id: reader.parse("vat.nextID")?,
        next_device_id: reader.parse("device.nextID")?,
        crank_number: reader.parse("crankNumber")?,
    })
}

/// The kernel's handle on the store. It remembers the committed header and
/// run-queue bounds so each commit writes only what differs.
pub struct KernelStorage {
    store: SwingStore,
    header: Image,
    queue: (u64, u64),
}

impl KernelStorage {
    pub fn new(store: SwingStore) -> Self {
        Self {
            store,
            header: Image::new(),
            queue: (0, 0),
        }
    }

    pub fn is_initialized(&self) -> bool {
        self.store.kv().has("version")
    }

    pub fn load_state(&mut self) -> Result<KernelState, KernelError> {
        let kv = self.store.kv();
        let mut image = Image::new();
        for key in kv.get_keys("", "") {
            if key == ACTIVITY_HASH_KEY {
                continue;
            }
            if let Some(value) = kv.get(&key) {
                image.insert(key, value);
            }
        }
        let state = decode_state(&image)?;
        self.header = encode_header(&state)?;
        self.queue = (state.run_queue.head, state.run_queue.tail());
        Ok(state)
    }

    /// Write the crank's transcript entries and every key the state changed
    /// since the last commit, then commit the store. Consumes the journals,
    /// so earlier savepoints are no longer valid afterwards.
    pub fn commit(
        &mut self,
        state: &mut KernelState,
        transcripts: Vec<(VatId, u64, TranscriptEntry)>,
    ) -> Result<(), KernelError> {
        for (vat_id, position, entry) in transcripts {
            self.store
                .transcripts_mut()
                .append(&vat_id.to_string(), position, entry.encode()?);
        }
        let header = encode_header(state)?;
        let kv = self.store.kv_mut();
        for (key, value) in &header {
            if self.header.get(key) != Some(value) {
                kv.set(key, value);
            }
        }
        for key in self.header.keys() {
            if !header.contains_key(key) {
                kv.delete(key);
            }
        }

        write_objects(kv, &mut state.objects)?;
        let KernelState {
            vats,
            dead_vats,
            forgotten,
            devices,
            ..
        } = &mut *state;
        for vat in vats
            .values_mut()
            .chain(dead_vats.values_mut())
            .chain(forgotten.iter_mut())
        {
            write_vat(kv, vat);
        }
        for device in devices.values_mut() {
            write_clist(kv, &device.device_id.to_string(), &mut device.clist);
        }
        write_run_queue(kv, &state.run_queue, self.queue)?;

        self.store.commit()?;
        state.run_queue.settle();
        state.forgotten.clear();
        self.header = header;
        self.queue = (state.run_queue.head, state.run_queue.tail());
        Ok(())
    }

    pub fn abort(&mut self) {
        self.store.abort();
    }

    pub fn read_transcript(&self, vat_id: VatId, start: u64, end: u64) -> Result<Vec<TranscriptEntry>, KernelError> {
        self.store
            .transcripts()
            .read_range(&vat_id.to_string(), start, end)?
            .iter()
            .map(|bytes| TranscriptEntry::decode(bytes))
            .collect()
    }

    pub fn delete_transcript(&mut self, vat_id: VatId) {
        self.store.transcripts_mut().delete_vat(&vat_id.to_string());
    }

    pub fn save_snapshot(&mut self, bytes: Vec<u8>) -> Hash {
        self.store.snapshots_mut().save(bytes)
    }

    pub fn load_snapshot(&self, hash: Hash) -> Result<Vec<u8>, KernelError> {
        Ok(self.store.snapshots().load(hash)?)
    }

    pub fn activity_hash(&self) -> Option<String> {
        self.store.kv().activity_hash()
    }

    pub fn store(&self) -> &SwingStore {
        &self.store
    }

    pub fn store_mut(&mut self) -> &mut SwingStore {
        &mut self.store
    }
}
