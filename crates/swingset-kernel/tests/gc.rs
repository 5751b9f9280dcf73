mod common;

use common::{Log, kernel_with, lines, new_log, undefined};
use swingset_kernel::{
    CapData, ForeverPolicy, KPid, KRef, Kernel, KernelOptions, KernelSlot, MemBackends,
    PromiseStatus, ResultPolicy, SwingStore,
};

fn exporter_and_holder(log: &Log) -> anyhow::Result<Kernel> {
    let store = SwingStore::open_mem(&MemBackends::new())?;
    let mut kernel = kernel_with(
        store,
        log,
        KernelOptions::default(),
        &[("exporter", "exporter"), ("holder", "holder")],
    )?;
    kernel.pin_vat_root("exporter")?;
    kernel.pin_vat_root("holder")?;
    kernel.run(&mut ForeverPolicy)?;
    Ok(kernel)
}

/// Has the exporter hand a fresh object to the holder and returns its kref.
fn give_object(kernel: &mut Kernel) -> anyhow::Result<KRef> {
    let holder = kernel.vat_root("holder")?;
    kernel.queue_to_vat_root(
        "exporter",
        "giveTo",
        CapData::slot(KernelSlot::Object(holder)),
        ResultPolicy::Ignore,
    )?;
    kernel.run(&mut ForeverPolicy)?;
    let dump = kernel.dump();
    let holder_id = kernel.vat_id_by_name("holder")?.to_string();
    let row = dump
        .kernel_table
        .iter()
        .find(|row| row.holder == holder_id && row.vref.to_string() == "o-50")
        .ok_or_else(|| anyhow::anyhow!("holder never imported the object"))?;
    let Some(kref) = row.kernel_slot.as_object() else {
        anyhow::bail!("o-50 mapped to {}", row.kernel_slot);
    };
    Ok(kref)
}

#[test]
fn imported_objects_are_counted_against_their_exporter() -> anyhow::Result<()> {
    let log = new_log();
    let mut kernel = exporter_and_holder(&log)?;
    let kref = give_object(&mut kernel)?;

    let exporter = kernel.vat_id_by_name("exporter")?;
    let dump = kernel.dump();
    let object = dump
        .objects
        .iter()
        .find(|row| row.kref == kref)
        .ok_or_else(|| anyhow::anyhow!("{kref} missing from the object table"))?;
    assert_eq!(object.owner, Some(exporter));
    assert_eq!((object.reachable, object.recognizable), (1, 1));
    assert!(lines(&log).contains(&"exporter gave o+1".to_string()));
    assert!(lines(&log).contains(&"holder holds o-50".to_string()));
    Ok(())
}

#[test]
fn dropping_the_last_import_notifies_the_exporter() -> anyhow::Result<()> {
    let log = new_log();
    let mut kernel = exporter_and_holder(&log)?;
    let kref = give_object(&mut kernel)?;

    kernel.queue_to_vat_root("holder", "drop", undefined(), ResultPolicy::Ignore)?;
    kernel.run(&mut ForeverPolicy)?;

    let dump = kernel.dump();
    assert!(!dump.mentions(KernelSlot::Object(kref)));
    assert!(dump.objects.iter().all(|row| row.kref != kref));
    assert!(dump.gc_actions.is_empty());
    let log = lines(&log);
    let dropped = log.iter().position(|line| line == "exporter dropExports o+1");
    let retired = log.iter().position(|line| line == "exporter retireExports o+1");
    assert!(dropped.is_some());
    assert!(retired.is_some());
    assert!(dropped < retired);
    Ok(())
}

#[test]
fn terminating_an_exporter_orphans_its_objects() -> anyhow::Result<()> {
    let log = new_log();
    let mut kernel = exporter_and_holder(&log)?;
    let kref = give_object(&mut kernel)?;

    let exporter = kernel.vat_id_by_name("exporter")?;
    kernel.terminate_vat(exporter, "retired")?;
    kernel.run(&mut ForeverPolicy)?;
    let dump = kernel.dump();
    let object = dump
        .objects
        .iter()
        .find(|row| row.kref == kref)
        .ok_or_else(|| anyhow::anyhow!("orphan {kref} was collected early"))?;
    assert_eq!(object.owner, None);
    assert_eq!((object.reachable, object.recognizable), (1, 1));
    assert!(dump.terminated.contains(&exporter));

    // once unreachable, the orphan is retired from the remaining importers
    kernel.queue_to_vat_root("holder", "forget", undefined(), ResultPolicy::Ignore)?;
    kernel.run(&mut ForeverPolicy)?;
    assert!(lines(&log).contains(&"holder retireImports o-50".to_string()));
    let dump = kernel.dump();
    assert!(!dump.mentions(KernelSlot::Object(kref)));
    assert!(dump.objects.iter().all(|row| row.kref != kref));
    Ok(())
}

#[test]
fn reading_a_resolution_releases_the_promise_and_its_data() -> anyhow::Result<()> {
    let log = new_log();
    let mut kernel = exporter_and_holder(&log)?;
    let made = kernel.queue_to_vat_root("exporter", "make", undefined(), ResultPolicy::Ignore)?;
    kernel.run(&mut ForeverPolicy)?;
    let dump = kernel.dump();
    let promise = dump
        .promises
        .iter()
        .find(|row| row.kpid == made)
        .ok_or_else(|| anyhow::anyhow!("{made} collected while the host holds it"))?;
    assert_eq!(promise.refcount, 1);
    // the exporter no longer has a c-list entry for the promise
    assert!(!dump.mentions(KernelSlot::Promise(made)));

    let made_object = kernel
        .kp_resolution(made)?
        .data
        .single_slot()
        .and_then(|slot| slot.as_object())
        .ok_or_else(|| anyhow::anyhow!("make resolved to data"))?;
    assert_eq!(kernel.kp_status(made), PromiseStatus::Unknown);
    kernel.run(&mut ForeverPolicy)?;

    let dump = kernel.dump();
    assert!(dump.objects.iter().all(|row| row.kref != made_object));
    assert!(lines(&log).contains(&"exporter retireExports o+1".to_string()));
    Ok(())
}

#[test]
fn host_traffic_returns_the_tables_to_their_baseline() -> anyhow::Result<()> {
    let log = new_log();
    let mut kernel = exporter_and_holder(&log)?;
    let before = kernel.dump();

    let made = (0..50)
        .map(|_| kernel.queue_to_vat_root("exporter", "make", undefined(), ResultPolicy::Ignore))
        .collect::<Result<Vec<KPid>, _>>()?;
    kernel.run(&mut ForeverPolicy)?;
    for kpid in made {
        kernel.kp_resolution(kpid)?;
    }
    kernel.reap_all_vats()?;
    kernel.run(&mut ForeverPolicy)?;

    let after = kernel.dump();
    assert_eq!(after.promises.len(), before.promises.len());
    assert_eq!(after.objects.len(), before.objects.len());
    assert_eq!(after.kernel_table.len(), before.kernel_table.len());
    Ok(())
}
