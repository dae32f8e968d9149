//! Condition-gated maintenance through the service.
//!
//! Covered:
//! - Unmet gates defer with both listeners and a forced fallback alarm
//! - Screen off with battery independently satisfied runs exactly once
//! - Listeners are gone after the run; later device events are ignored
//! - The fallback alarm runs maintenance regardless of the device state
//! - Alarms and events reach only their own scheduler

use super::*;
use crate::{
    AlarmKey, BatteryStatus, DeviceEvent, Evaluation, ListenerKind, ManualAlarmClock,
    ServiceEvent, ServiceOutcome,
};

struct Fixture {
    transport: Arc<ScriptedTransport>,
    clock: Arc<ManualAlarmClock>,
    conditions: Arc<StaticConditions>,
    service: MaintenanceService,
}

fn fixture(level: u8, charging: bool, screen_on: bool, targets: &[&str]) -> Fixture {
    let transport = ScriptedTransport::new();
    let clock = Arc::new(ManualAlarmClock::new());
    let conditions = Arc::new(StaticConditions::new(level, charging, screen_on));
    let service = service(
        transport.clone(),
        Arc::new(TaskStore::in_memory(SCOPE).unwrap()),
        clock.clone(),
        conditions.clone(),
        targets,
    );
    service.start().unwrap();
    Fixture {
        transport,
        clock,
        conditions,
        service,
    }
}

fn fire(f: &Fixture, target: &str) -> ServiceOutcome {
    let fired = f.clock.fire(&AlarmKey::new(SCOPE, target)).unwrap();
    f.service.handle(ServiceEvent::AlarmFired(fired)).unwrap()
}

fn maintenance_calls(f: &Fixture, target: &str) -> usize {
    f.transport
        .methods_for(target)
        .iter()
        .filter(|m| *m == "db_maintenance_start")
        .count()
}

#[test]
fn deferred_then_screen_off_runs_once() {
    let f = fixture(50, false, true, &["contacts"]);

    let outcome = fire(&f, "contacts");
    assert_eq!(
        outcome,
        ServiceOutcome::Evaluated(vec![(
            ResourceAddress::from("contacts"),
            Evaluation::Deferred {
                listeners: vec![ListenerKind::BatteryChanged, ListenerKind::ScreenOff]
            }
        )])
    );
    assert_eq!(maintenance_calls(&f, "contacts"), 0);
    let fallback = f.clock.get(&AlarmKey::new(SCOPE, "contacts")).unwrap();
    assert!(fallback.forced);

    // Plugged in without a battery broadcast reaching the scheduler.
    f.conditions.set_battery(50, true);
    let outcome = f
        .service
        .handle(ServiceEvent::Device(DeviceEvent::ScreenOff))
        .unwrap();
    assert_eq!(
        outcome,
        ServiceOutcome::Evaluated(vec![(
            ResourceAddress::from("contacts"),
            Evaluation::Ran { success: true }
        )])
    );
    assert_eq!(maintenance_calls(&f, "contacts"), 1);

    let scheduler = f.service.scheduler(&ResourceAddress::from("contacts")).unwrap();
    assert!(scheduler.registered_listeners().is_empty());
    assert!(!f.clock.get(scheduler.key()).unwrap().forced);

    let later = f
        .service
        .handle(ServiceEvent::Device(DeviceEvent::BatteryChanged(BatteryStatus {
            level_percent: 100,
            charging: true,
        })))
        .unwrap();
    assert_eq!(later, ServiceOutcome::Ignored);
    assert_eq!(maintenance_calls(&f, "contacts"), 1);
}

#[test]
fn battery_event_alone_is_not_enough_while_screen_on() {
    let f = fixture(50, false, true, &["contacts"]);
    fire(&f, "contacts");

    let outcome = f
        .service
        .handle(ServiceEvent::Device(DeviceEvent::BatteryChanged(BatteryStatus {
            level_percent: 60,
            charging: true,
        })))
        .unwrap();
    assert_eq!(
        outcome,
        ServiceOutcome::Evaluated(vec![(
            ResourceAddress::from("contacts"),
            Evaluation::Deferred {
                listeners: vec![ListenerKind::ScreenOff]
            }
        )])
    );
    assert_eq!(maintenance_calls(&f, "contacts"), 0);
}

#[test]
fn forced_fallback_ignores_device_state() {
    let f = fixture(5, false, true, &["contacts"]);
    fire(&f, "contacts");

    let outcome = fire(&f, "contacts");
    assert_eq!(
        outcome,
        ServiceOutcome::Evaluated(vec![(
            ResourceAddress::from("contacts"),
            Evaluation::Ran { success: true }
        )])
    );
    assert_eq!(maintenance_calls(&f, "contacts"), 1);
}

#[test]
fn idle_device_runs_on_periodic_alarm() {
    let f = fixture(90, false, false, &["contacts"]);

    fire(&f, "contacts");
    assert_eq!(maintenance_calls(&f, "contacts"), 1);

    let next = f.clock.get(&AlarmKey::new(SCOPE, "contacts")).unwrap();
    assert!(!next.forced);
    assert_eq!(next.delay, MaintenanceConfig::default().period());
}

#[test]
fn failed_maintenance_still_reschedules() {
    let f = fixture(90, false, false, &["contacts"]);
    f.transport.fail("contacts", Method::DbMaintenanceStart);

    let outcome = fire(&f, "contacts");
    assert_eq!(
        outcome,
        ServiceOutcome::Evaluated(vec![(
            ResourceAddress::from("contacts"),
            Evaluation::Ran { success: false }
        )])
    );
    assert!(f.clock.is_scheduled(&AlarmKey::new(SCOPE, "contacts")));
}

#[test]
fn alarms_reach_only_their_scheduler() {
    let f = fixture(90, false, false, &["contacts", "messages"]);

    fire(&f, "messages");
    assert_eq!(maintenance_calls(&f, "messages"), 1);
    assert_eq!(maintenance_calls(&f, "contacts"), 0);

    let stray = crate::AlarmFired {
        key: AlarmKey::new("someone-else", "contacts"),
        forced: true,
    };
    assert_eq!(
        f.service.handle(ServiceEvent::AlarmFired(stray)).unwrap(),
        ServiceOutcome::Ignored
    );
    assert_eq!(maintenance_calls(&f, "contacts"), 0);
}

#[test]
fn screen_on_event_is_ignored() {
    let f = fixture(50, false, true, &["contacts"]);
    fire(&f, "contacts");

    assert_eq!(
        f.service
            .handle(ServiceEvent::Device(DeviceEvent::ScreenOn))
            .unwrap(),
        ServiceOutcome::Ignored
    );
}
