mod common;

use common::{Clock, json_of, kernel_with, lines, new_log, programs, undefined};
use serde_json::json;
use swingset_kernel::{
    CrankLimitPolicy, ForeverPolicy, Kernel, KernelError, KernelOptions, KernelSlot, MemBackends,
    PromiseStatus, ResultPolicy, SwingStore,
};

fn mem_store() -> anyhow::Result<SwingStore> {
    Ok(SwingStore::open_mem(&MemBackends::new())?)
}

#[test]
fn host_messages_are_delivered_in_order() -> anyhow::Result<()> {
    let log = new_log();
    let mut kernel = kernel_with(mem_store()?, &log, KernelOptions::default(), &[("counter", "counter")])?;
    let first = kernel.queue_to_vat_root("counter", "increment", undefined(), ResultPolicy::Ignore)?;
    let second = kernel.queue_to_vat_root("counter", "increment", undefined(), ResultPolicy::Ignore)?;
    assert_eq!(kernel.kp_status(first), PromiseStatus::Unresolved);

    kernel.run(&mut ForeverPolicy)?;

    assert_eq!(json_of(&kernel.kp_resolution(first)?.data), json!({ "ram": 1, "durable": 1 }));
    assert_eq!(json_of(&kernel.kp_resolution(second)?.data), json!({ "ram": 2, "durable": 2 }));
    assert_eq!(
        lines(&log),
        vec![
            "counter started incarnation 0",
            "counter count 1 durable 1",
            "counter count 2 durable 2",
        ]
    );
    assert_eq!(kernel.store().kv().get("v1.vs.durable").as_deref(), Some("2"));
    assert!(!kernel.has_work());
    Ok(())
}

#[test]
fn unknown_vat_names_are_host_errors() -> anyhow::Result<()> {
    let log = new_log();
    let mut kernel = kernel_with(mem_store()?, &log, KernelOptions::default(), &[("counter", "counter")])?;
    let err = kernel
        .queue_to_vat_root("nobody", "increment", undefined(), ResultPolicy::Ignore)
        .unwrap_err();
    assert!(matches!(err, KernelError::UnknownVatName(name) if name == "nobody"));
    // the kernel is still usable
    kernel.run(&mut ForeverPolicy)?;
    Ok(())
}

#[test]
fn bootstrap_relays_results_through_subscriptions() -> anyhow::Result<()> {
    let log = new_log();
    let mut kernel = Kernel::builder(mem_store()?)
        .with_local_workers(programs(&log))
        .with_vat("bootstrap", "bootstrap")
        .with_vat("counter", "counter")
        .with_device("clock", Clock { now: 42 })
        .with_bootstrap("bootstrap")
        .build()?;
    kernel.run(&mut ForeverPolicy)?;
    assert!(lines(&log).contains(&"bootstrap saw vats bootstrap,counter".to_string()));

    let relayed = kernel.queue_to_vat_root("bootstrap", "incrementCounter", undefined(), ResultPolicy::Ignore)?;
    kernel.run(&mut ForeverPolicy)?;
    let resolution = kernel.kp_resolution(relayed)?;
    assert!(!resolution.rejected);
    assert_eq!(json_of(&resolution.data), json!({ "ram": 1, "durable": 1 }));
    assert!(lines(&log).iter().any(|line| line.starts_with("bootstrap notified")));
    Ok(())
}

#[test]
fn vats_call_devices_synchronously() -> anyhow::Result<()> {
    let log = new_log();
    let mut kernel = Kernel::builder(mem_store()?)
        .with_local_workers(programs(&log))
        .with_vat("bootstrap", "bootstrap")
        .with_device("clock", Clock { now: 42 })
        .with_bootstrap("bootstrap")
        .build()?;
    kernel.run(&mut ForeverPolicy)?;

    let read = kernel.queue_to_vat_root("bootstrap", "readClock", undefined(), ResultPolicy::Ignore)?;
    kernel.run(&mut ForeverPolicy)?;
    assert_eq!(json_of(&kernel.kp_resolution(read)?.data), json!(42));

    let clock = kernel.device_node("clock")?;
    let dump = kernel.dump();
    assert!(dump.mentions(KernelSlot::Device(clock)));
    Ok(())
}

#[test]
fn sends_to_a_fulfilled_promise_follow_its_resolution() -> anyhow::Result<()> {
    let log = new_log();
    let mut kernel = kernel_with(mem_store()?, &log, KernelOptions::default(), &[("exporter", "exporter")])?;
    kernel.pin_vat_root("exporter")?;
    let made = kernel.queue_to_vat_root("exporter", "make", undefined(), ResultPolicy::Ignore)?;
    let pinged = kernel.queue_to_kref(KernelSlot::Promise(made), "ping", undefined(), ResultPolicy::Ignore)?;
    kernel.run(&mut ForeverPolicy)?;

    let made = kernel.kp_resolution(made)?;
    assert!(matches!(made.data.single_slot(), Some(KernelSlot::Object(_))));
    assert_eq!(json_of(&kernel.kp_resolution(pinged)?.data), json!("pong"));
    Ok(())
}

#[test]
fn sends_to_plain_data_are_rejected() -> anyhow::Result<()> {
    let log = new_log();
    let mut kernel = kernel_with(mem_store()?, &log, KernelOptions::default(), &[("counter", "counter")])?;
    let counted = kernel.queue_to_vat_root("counter", "increment", undefined(), ResultPolicy::Ignore)?;
    kernel.run(&mut ForeverPolicy)?;

    let bounced = kernel.queue_to_kref(KernelSlot::Promise(counted), "ping", undefined(), ResultPolicy::Ignore)?;
    kernel.run(&mut ForeverPolicy)?;
    let resolution = kernel.kp_resolution(bounced)?;
    assert!(resolution.rejected);
    assert_eq!(
        resolution.data.error_message().as_deref(),
        Some("data is not callable, has no method ping")
    );
    Ok(())
}

#[test]
fn messages_queued_on_a_promise_share_its_rejection() -> anyhow::Result<()> {
    let log = new_log();
    let mut kernel = kernel_with(mem_store()?, &log, KernelOptions::default(), &[("counter", "counter")])?;
    let waiting = kernel.queue_to_vat_root("counter", "wait", undefined(), ResultPolicy::Ignore)?;
    kernel.run(&mut ForeverPolicy)?;

    let queued = kernel.queue_to_kref(KernelSlot::Promise(waiting), "increment", undefined(), ResultPolicy::Ignore)?;
    kernel.run(&mut ForeverPolicy)?;
    let dump = kernel.dump();
    let row = dump
        .promises
        .iter()
        .find(|row| row.kpid == waiting)
        .expect("waiting promise is still tracked");
    assert_eq!(row.queued, 1);
    assert_eq!(kernel.kp_status(queued), PromiseStatus::Unresolved);

    let counter = kernel.vat_id_by_name("counter")?;
    kernel.terminate_vat(counter, "shutting down")?;
    kernel.run(&mut ForeverPolicy)?;
    for kpid in [waiting, queued] {
        let resolution = kernel.kp_resolution(kpid)?;
        assert!(resolution.rejected);
        assert_eq!(resolution.data.error_message().as_deref(), Some("shutting down"));
    }
    Ok(())
}

#[test]
fn run_policies_bound_the_work_per_call() -> anyhow::Result<()> {
    let log = new_log();
    let mut kernel = kernel_with(mem_store()?, &log, KernelOptions::default(), &[("counter", "counter")])?;
    kernel.pin_vat_root("counter")?;
    for _ in 0..3 {
        kernel.queue_to_vat_root("counter", "increment", undefined(), ResultPolicy::Ignore)?;
    }
    assert_eq!(kernel.run(&mut CrankLimitPolicy::new(2))?, 2);
    assert!(kernel.has_work());
    assert_eq!(kernel.crank_number(), 2);
    assert_eq!(kernel.run(&mut ForeverPolicy)?, 2);
    assert!(!kernel.has_work());
    Ok(())
}

#[test]
fn identical_inputs_give_identical_activity_hashes() -> anyhow::Result<()> {
    let drive = || -> anyhow::Result<Kernel> {
        let log = new_log();
        let mut kernel = kernel_with(
            mem_store()?,
            &log,
            KernelOptions::default(),
            &[("counter", "counter"), ("exporter", "exporter")],
        )?;
        for method in ["increment", "increment", "wait"] {
            kernel.queue_to_vat_root("counter", method, undefined(), ResultPolicy::Ignore)?;
        }
        kernel.queue_to_vat_root("exporter", "make", undefined(), ResultPolicy::Ignore)?;
        kernel.run(&mut ForeverPolicy)?;
        Ok(kernel)
    };
    let left = drive()?;
    let right = drive()?;
    assert!(left.activity_hash().is_some());
    assert_eq!(left.activity_hash(), right.activity_hash());
    assert_eq!(left.dump(), right.dump());
    Ok(())
}
