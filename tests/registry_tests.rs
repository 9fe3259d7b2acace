use gradix::errors::Error;
use gradix::storage::{Registry, Storage};
use gradix::CPU_F32;

#[test]
fn views_share_a_bucket_and_free_once() {
    let mut reg = Registry::new();
    let root = Storage::init(&mut reg, &[2, 2], CPU_F32).unwrap();
    let view = root.shallow_copy(&mut reg).unwrap();
    assert_eq!(reg.live_count(), 2);
    assert_eq!(reg.bucket_count(), 1);

    root.free(&mut reg).unwrap();
    // bucket survives while a member remains
    assert_eq!(reg.bucket_count(), 1);
    view.free(&mut reg).unwrap();
    assert_eq!(reg.bucket_count(), 0);
    assert_eq!(reg.live_count(), 0);
}

#[test]
fn view_outliving_root_still_reads() {
    let mut reg = Registry::new();
    let mut root = Storage::init(&mut reg, &[2], CPU_F32).unwrap();
    root.fill(5.0).unwrap();
    let view = root.shallow_copy(&mut reg).unwrap();
    root.free(&mut reg).unwrap();
    assert_eq!(view.get(&[1]).unwrap(), 5.0);
    view.free(&mut reg).unwrap();
}

#[test]
fn deregistering_twice_fails() {
    let mut reg = Registry::new();
    let s = Storage::init(&mut reg, &[2], CPU_F32).unwrap();
    let copy = s.clone();
    s.free(&mut reg).unwrap();
    assert!(matches!(
        copy.free(&mut reg),
        Err(Error::HandleUninitialized)
    ));
}

#[test]
fn shallow_copy_of_freed_parent_fails() {
    let mut reg = Registry::new();
    let s = Storage::init(&mut reg, &[2], CPU_F32).unwrap();
    let stale = s.clone();
    s.free(&mut reg).unwrap();
    assert!(matches!(
        stale.shallow_copy(&mut reg),
        Err(Error::ParentNotRegistered)
    ));
}

#[test]
fn recorder_captures_registrations() {
    let mut reg = Registry::new();
    let outside = Storage::init(&mut reg, &[2], CPU_F32).unwrap();

    let rec = reg.start_recording();
    let _a = Storage::init(&mut reg, &[2], CPU_F32).unwrap();
    let _b = Storage::init(&mut reg, &[3], CPU_F32).unwrap();
    let recording = reg.stop_recording(rec).unwrap();
    assert_eq!(recording.len(), 2);

    reg.free_recorded(recording).unwrap();
    assert_eq!(reg.live_count(), 1);
    outside.free(&mut reg).unwrap();
    assert_eq!(reg.live_count(), 0);
}

#[test]
fn deregister_while_recording_removes_from_capture() {
    let mut reg = Registry::new();
    let rec = reg.start_recording();
    let a = Storage::init(&mut reg, &[2], CPU_F32).unwrap();
    let _b = Storage::init(&mut reg, &[2], CPU_F32).unwrap();
    a.free(&mut reg).unwrap();
    let recording = reg.stop_recording(rec).unwrap();
    assert_eq!(recording.len(), 1);
    reg.free_recorded(recording).unwrap();
    assert_eq!(reg.live_count(), 0);
}

#[test]
fn nested_recorders_stop_in_lifo_order() {
    let mut reg = Registry::new();
    let outer = reg.start_recording();
    let _a = Storage::init(&mut reg, &[2], CPU_F32).unwrap();
    let inner = reg.start_recording();
    let _b = Storage::init(&mut reg, &[2], CPU_F32).unwrap();

    // the outer recorder is not on top
    assert!(matches!(
        reg.stop_recording(outer),
        Err(Error::RecordNotFound)
    ));

    let inner_rec = reg.stop_recording(inner).unwrap();
    assert_eq!(inner_rec.len(), 1);
    let outer_rec = reg.stop_recording(outer).unwrap();
    // the outer scope saw both registrations
    assert_eq!(outer_rec.len(), 2);
    reg.free_recorded(outer_rec).unwrap();
    reg.free_recorded(inner_rec).unwrap();
    assert_eq!(reg.live_count(), 0);
}

#[test]
fn teardown_rejects_live_storages() {
    let mut reg = Registry::new();
    let s = Storage::init(&mut reg, &[2], CPU_F32).unwrap();
    assert!(matches!(
        reg.teardown(),
        Err(Error::RegistryNotEmpty { live: 1 })
    ));
    s.free(&mut reg).unwrap();
    reg.teardown().unwrap();
}

#[test]
fn unknown_backend_is_rejected() {
    let mut reg = Registry::new();
    assert!(matches!(
        Storage::init(&mut reg, &[2], "gpu_f64"),
        Err(Error::InvalidBackend(_))
    ));
}
