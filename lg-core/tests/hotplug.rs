//! Driver availability following kernel events

mod common;

use common::{FakeHardware, Machine, FAN_CURVE};
use lg_core::constants::drivers;
use lg_core::{DriverState, KernelEvent};
use lg_error::LegionError;
use lg_protocol::{
    DataType, DriverEventData, EventAction, FanCurveData, Payload, SetStatus, ToggleData,
};

fn module(action: &str, name: &str) -> KernelEvent {
    KernelEvent::new(action, &format!("/module/{}", name), "module", None)
}

fn cpu(action: &str, n: u32) -> KernelEvent {
    KernelEvent::new(action, &format!("/devices/system/cpu/cpu{}", n), "cpu", None)
}

#[test]
fn test_removed_driver_reports_unavailable() {
    let machine = Machine::new();
    let hw = FakeHardware::new();
    let mut ctx = machine.context(&hw);
    assert!(ctx.get(DataType::FanCurve).unwrap().is_available());

    machine.remove_legion();
    let published = ctx.handle_kernel_events(&[module("remove", drivers::LEGION_MODULE)]);
    assert_eq!(
        published,
        vec![Payload::ModuleEvent(DriverEventData {
            driver: drivers::LEGION.to_string(),
            action: EventAction::Removed,
            detail: "module legion_laptop".to_string(),
        })]
    );

    assert_eq!(ctx.manager().state(drivers::LEGION), Some(DriverState::Uninitialized));
    assert!(matches!(
        ctx.manager().get_descriptor(drivers::LEGION),
        Err(LegionError::DriverNotAvailable(_))
    ));

    let payload = ctx.get(DataType::FanCurve).unwrap();
    assert_eq!(payload, Payload::FanCurve(FanCurveData { points: [0; 10], available: false }));

    let set = Payload::FanCurve(FanCurveData { points: [10; 10], available: true });
    assert_eq!(ctx.set(&set), SetStatus::NotAvailable);
}

#[test]
fn test_module_reload_restores_driver() {
    let machine = Machine::new();
    let hw = FakeHardware::new();
    let mut ctx = machine.context(&hw);

    machine.remove_legion();
    ctx.handle_kernel_events(&[module("remove", drivers::LEGION_MODULE)]);

    machine.write(&machine.legion_dir().join("fancurve"), FAN_CURVE);
    let published = ctx.handle_kernel_events(&[module("add", drivers::LEGION_MODULE)]);
    assert!(matches!(
        published.as_slice(),
        [Payload::ModuleEvent(DriverEventData { action: EventAction::Added, .. })]
    ));
    assert!(ctx.get(DataType::FanCurve).unwrap().is_available());

    // add while already initialized is a reload
    let published = ctx.handle_kernel_events(&[module("add", drivers::LEGION_MODULE)]);
    assert!(matches!(
        published.as_slice(),
        [Payload::ModuleEvent(DriverEventData { action: EventAction::Reloaded, .. })]
    ));
}

#[test]
fn test_module_loaded_after_boot_is_added() {
    let machine = Machine::new();
    machine.remove_legion();
    let hw = FakeHardware::new();
    let mut ctx = machine.context(&hw);

    // never usable at boot, so not initialized
    assert_eq!(ctx.manager().state(drivers::LEGION), Some(DriverState::Uninitialized));
    assert_eq!(ctx.get(DataType::FanCurve).unwrap(), Payload::unavailable(DataType::FanCurve));

    machine.write(&machine.legion_dir().join("fancurve"), FAN_CURVE);
    let published = ctx.handle_kernel_events(&[module("add", drivers::LEGION_MODULE)]);
    assert_eq!(
        published,
        vec![Payload::ModuleEvent(DriverEventData {
            driver: drivers::LEGION.to_string(),
            action: EventAction::Added,
            detail: "module legion_laptop".to_string(),
        })]
    );
    assert_eq!(ctx.manager().state(drivers::LEGION), Some(DriverState::Initialized));
    assert!(ctx.get(DataType::FanCurve).unwrap().is_available());
}

#[test]
fn test_module_add_without_hardware_stays_uninitialized() {
    let machine = Machine::new();
    machine.remove_legion();
    let hw = FakeHardware::new();
    let mut ctx = machine.context(&hw);

    let published = ctx.handle_kernel_events(&[module("add", drivers::LEGION_MODULE)]);
    assert!(matches!(
        published.as_slice(),
        [Payload::ModuleEvent(DriverEventData { action: EventAction::Added, .. })]
    ));
    assert_eq!(ctx.manager().state(drivers::LEGION), Some(DriverState::Uninitialized));

    // the directory shows up on the next load
    machine.write(&machine.legion_dir().join("fancurve"), FAN_CURVE);
    let published = ctx.handle_kernel_events(&[module("add", drivers::LEGION_MODULE)]);
    assert!(matches!(
        published.as_slice(),
        [Payload::ModuleEvent(DriverEventData { action: EventAction::Added, .. })]
    ));
    assert!(ctx.manager().is_available(drivers::LEGION));
}

#[test]
fn test_unrelated_events_are_ignored() {
    let machine = Machine::new();
    let hw = FakeHardware::new();
    let mut ctx = machine.context(&hw);

    let published = ctx.handle_kernel_events(&[
        module("add", "snd_hda_intel"),
        KernelEvent::new("change", "/devices/pci0000:00/0000:00:02.0", "pci", None),
        KernelEvent::new("change", "/devices/platform/serial8250", "platform", Some("serial8250")),
    ]);
    assert!(published.is_empty());
}

#[test]
fn test_platform_change_reprobes_legion() {
    let machine = Machine::new();
    let hw = FakeHardware::new();
    let mut ctx = machine.context(&hw);

    std::fs::remove_file(machine.legion_dir().join("lockfancontroller")).unwrap();
    let event = KernelEvent::new("change", "/devices/platform/PNP0C09:00", "platform", Some("legion"));
    let published = ctx.handle_kernel_events(&[event]);
    assert_eq!(
        published,
        vec![Payload::SubsystemEvent(DriverEventData {
            driver: drivers::LEGION.to_string(),
            action: EventAction::Changed,
            detail: "change PNP0C09:00".to_string(),
        })]
    );
    assert_eq!(ctx.get(DataType::FanLock).unwrap(), Payload::unavailable(DataType::FanLock));
}

#[test]
fn test_smt_toggle_blocks_cpu_events_until_tick() {
    let machine = Machine::new();
    let hw = FakeHardware::new();
    let mut ctx = machine.context(&hw);

    let off = Payload::CpuSmt(ToggleData { enabled: false, available: true });
    assert_eq!(ctx.set(&off), SetStatus::Success);

    // the sibling CPUs going offline must not be reported
    assert!(ctx.handle_kernel_events(&[cpu("offline", 8), cpu("offline", 9)]).is_empty());

    ctx.tick();
    let published = ctx.handle_kernel_events(&[cpu("online", 8)]);
    assert_eq!(
        published,
        vec![Payload::SubsystemEvent(DriverEventData {
            driver: drivers::CPU_CONTROL.to_string(),
            action: EventAction::Changed,
            detail: "cpu8 online".to_string(),
        })]
    );
}

#[test]
fn test_rapl_engine_follows_thermal_module() {
    let machine = Machine::new();
    let hw = FakeHardware::new();
    let mut ctx = machine.context(&hw);
    assert!(ctx.rapl().is_ok());

    ctx.handle_kernel_events(&[module("remove", drivers::PROCESSOR_THERMAL_MODULE)]);
    assert!(ctx.rapl().is_err());
    assert_eq!(ctx.get(DataType::CpuPowerLimits).unwrap(), Payload::unavailable(DataType::CpuPowerLimits));

    ctx.handle_kernel_events(&[module("add", drivers::PROCESSOR_THERMAL_MODULE)]);
    assert!(ctx.rapl().is_ok());
    assert_eq!(hw.mapped.lock().unwrap().len(), 2);
}

#[test]
fn test_module_events_handled_before_subsystem_events() {
    let machine = Machine::new();
    let hw = FakeHardware::new();
    let mut ctx = machine.context(&hw);

    machine.remove_legion();
    let change = KernelEvent::new("change", "/devices/platform/PNP0C09:00", "platform", Some("legion"));
    // subsystem event first in the batch, but the module removal wins
    let published = ctx.handle_kernel_events(&[change, module("remove", drivers::LEGION_MODULE)]);
    assert_eq!(published.len(), 1);
    assert_eq!(published[0].data_type(), DataType::ModuleEvent);
}
