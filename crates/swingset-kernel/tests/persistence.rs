mod common;

use common::{Log, impostor_programs, json_of, kernel_with, lines, new_log, undefined};
use serde_json::json;
use swingset_kernel::{
    CrankLimitPolicy, ForeverPolicy, Kernel, KernelError, KernelOptions, MemBackends,
    ResultPolicy, SwingStore, Threshold,
};

fn increment(kernel: &mut Kernel) -> anyhow::Result<serde_json::Value> {
    let kpid = kernel.queue_to_vat_root("counter", "increment", undefined(), ResultPolicy::Ignore)?;
    kernel.run(&mut ForeverPolicy)?;
    Ok(json_of(&kernel.kp_resolution(kpid)?.data))
}

fn count_lines(log: &Log) -> usize {
    lines(log)
        .iter()
        .filter(|line| line.starts_with("counter count"))
        .count()
}

fn reaped_lines(log: &Log) -> usize {
    lines(log)
        .iter()
        .filter(|line| line.as_str() == "counter reaped")
        .count()
}

fn counted_to_five(store: SwingStore, log: &Log) -> anyhow::Result<()> {
    let mut kernel = kernel_with(store, log, KernelOptions::default(), &[("counter", "counter")])?;
    kernel.pin_vat_root("counter")?;
    for _ in 0..5 {
        increment(&mut kernel)?;
    }
    assert!(kernel.store().kv().has("local.v1.lastSnapshot"));
    Ok(())
}

#[test]
fn restart_resumes_from_snapshot_and_transcript() -> anyhow::Result<()> {
    let log = new_log();
    let backends = MemBackends::new();
    counted_to_five(SwingStore::open_mem(&backends)?, &log)?;

    let mut kernel = kernel_with(
        SwingStore::open_mem(&backends)?,
        &log,
        KernelOptions::default(),
        &[("counter", "counter")],
    )?;
    assert_eq!(increment(&mut kernel)?, json!({ "ram": 6, "durable": 6 }));
    // replayed deliveries do not reach the program's side channels
    assert_eq!(count_lines(&log), 6);
    Ok(())
}

#[test]
fn restart_from_the_filesystem() -> anyhow::Result<()> {
    let log = new_log();
    let dir = tempfile::tempdir()?;
    counted_to_five(SwingStore::open_fs(dir.path())?, &log)?;

    let mut kernel = kernel_with(
        SwingStore::open_fs(dir.path())?,
        &log,
        KernelOptions::default(),
        &[("counter", "counter")],
    )?;
    assert_eq!(increment(&mut kernel)?, json!({ "ram": 6, "durable": 6 }));
    assert_eq!(count_lines(&log), 6);
    Ok(())
}

#[test]
fn replay_divergence_panics_the_kernel() -> anyhow::Result<()> {
    let log = new_log();
    let backends = MemBackends::new();
    let options = KernelOptions {
        snapshot_initial: 1000,
        ..KernelOptions::default()
    };
    {
        let store = SwingStore::open_mem(&backends)?;
        let mut kernel = kernel_with(store, &log, options.clone(), &[("counter", "counter")])?;
        kernel.pin_vat_root("counter")?;
        increment(&mut kernel)?;
        assert!(!kernel.store().kv().has("local.v1.lastSnapshot"));
    }

    let mut kernel = Kernel::builder(SwingStore::open_mem(&backends)?)
        .with_options(options)
        .with_local_workers(impostor_programs(&log))
        .with_vat("counter", "counter")
        .build()?;
    kernel.queue_to_vat_root("counter", "increment", undefined(), ResultPolicy::Ignore)?;
    let err = kernel.run(&mut ForeverPolicy).unwrap_err();
    assert!(matches!(err, KernelError::TranscriptDivergence { .. }));
    assert!(matches!(kernel.step(), Err(KernelError::Panicked(_))));
    Ok(())
}

#[test]
fn vats_are_reaped_on_their_interval() -> anyhow::Result<()> {
    let log = new_log();
    let options = KernelOptions {
        default_reap_interval: Threshold::every(3),
        ..KernelOptions::default()
    };
    let store = SwingStore::open_mem(&MemBackends::new())?;
    let mut kernel = kernel_with(store, &log, options, &[("counter", "counter")])?;
    kernel.pin_vat_root("counter")?;
    kernel.run(&mut ForeverPolicy)?;
    assert_eq!(kernel.store().kv().get("v1.reapInterval").as_deref(), Some("3"));

    for _ in 0..3 {
        increment(&mut kernel)?;
    }
    assert_eq!(reaped_lines(&log), 1);

    let counter = kernel.vat_id_by_name("counter")?;
    kernel.change_vat_options(counter, &json!({ "reapInterval": 2 }))?;
    for _ in 0..2 {
        increment(&mut kernel)?;
    }
    assert_eq!(reaped_lines(&log), 2);
    assert_eq!(kernel.store().kv().get("v1.reapInterval").as_deref(), Some("2"));
    Ok(())
}

fn counter_reaped_every(interval: u64, log: &Log) -> anyhow::Result<Kernel> {
    let options = KernelOptions {
        default_reap_interval: Threshold::every(interval),
        ..KernelOptions::default()
    };
    let store = SwingStore::open_mem(&MemBackends::new())?;
    let mut kernel = kernel_with(store, log, options, &[("counter", "counter")])?;
    kernel.pin_vat_root("counter")?;
    kernel.run(&mut ForeverPolicy)?;
    Ok(kernel)
}

#[test]
fn the_tenth_delivery_triggers_exactly_one_reap() -> anyhow::Result<()> {
    let log = new_log();
    let mut kernel = counter_reaped_every(10, &log)?;
    for _ in 0..9 {
        increment(&mut kernel)?;
    }
    assert_eq!(reaped_lines(&log), 0);
    increment(&mut kernel)?;
    assert_eq!(reaped_lines(&log), 1);
    Ok(())
}

#[test]
fn a_queued_reap_survives_an_interval_change() -> anyhow::Result<()> {
    let log = new_log();
    let mut kernel = counter_reaped_every(10, &log)?;
    for _ in 0..9 {
        increment(&mut kernel)?;
    }
    kernel.queue_to_vat_root("counter", "increment", undefined(), ResultPolicy::Ignore)?;
    kernel.run(&mut CrankLimitPolicy::new(1))?;
    let counter = kernel.vat_id_by_name("counter")?;
    assert_eq!(kernel.dump().reap_queue, vec![counter]);
    assert_eq!(reaped_lines(&log), 0);

    kernel.change_kernel_options(&json!({ "defaultReapInterval": "never" }))?;
    assert_eq!(kernel.store().kv().get("v1.reapInterval").as_deref(), Some("never"));
    kernel.run(&mut ForeverPolicy)?;
    assert_eq!(reaped_lines(&log), 1);
    for _ in 0..10 {
        increment(&mut kernel)?;
    }
    assert_eq!(reaped_lines(&log), 1);
    Ok(())
}

#[test]
fn kernel_options_change_the_default_reap_interval() -> anyhow::Result<()> {
    let log = new_log();
    let options = KernelOptions {
        default_reap_interval: Threshold::every(1),
        ..KernelOptions::default()
    };
    let store = SwingStore::open_mem(&MemBackends::new())?;
    let mut kernel = kernel_with(store, &log, options, &[("counter", "counter")])?;
    kernel.pin_vat_root("counter")?;
    kernel.run(&mut ForeverPolicy)?;

    kernel.change_kernel_options(&json!({ "defaultReapInterval": "never" }))?;
    assert_eq!(kernel.kernel_options().default_reap_interval, Threshold::Never);
    assert_eq!(kernel.store().kv().get("v1.reapInterval").as_deref(), Some("never"));
    for _ in 0..5 {
        increment(&mut kernel)?;
    }
    assert_eq!(reaped_lines(&log), 0);

    let err = kernel
        .change_kernel_options(&json!({ "banana": 1 }))
        .unwrap_err();
    assert!(matches!(err, KernelError::InvalidOption { .. }));
    let err = kernel
        .change_kernel_options(&json!({ "snapshotInterval": 50, "defaultReapInterval": "banana" }))
        .unwrap_err();
    assert!(
        matches!(&err, KernelError::InvalidOption { option, .. } if option == "defaultReapInterval")
    );
    assert_eq!(kernel.kernel_options().default_reap_interval, Threshold::Never);
    assert_eq!(kernel.kernel_options().snapshot_interval, 200);
    let kv = kernel.store().kv();
    assert_eq!(kv.get("kernel.defaultReapInterval").as_deref(), Some("never"));
    assert_eq!(kv.get("kernel.snapshotInterval").as_deref(), Some("200"));
    Ok(())
}

#[test]
fn host_reap_requests_reach_every_live_vat() -> anyhow::Result<()> {
    let log = new_log();
    let store = SwingStore::open_mem(&MemBackends::new())?;
    let mut kernel = kernel_with(store, &log, KernelOptions::default(), &[("counter", "counter")])?;
    kernel.run(&mut ForeverPolicy)?;
    kernel.reap_all_vats()?;
    kernel.run(&mut ForeverPolicy)?;
    assert_eq!(reaped_lines(&log), 1);
    Ok(())
}
