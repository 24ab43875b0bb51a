use aero_host_vm::{
    memory_reserve, CriticalMapping, Protection, Reservation, SharedMemory, SharedMemoryOptions,
    VmError, MAPPING_ALIGNMENT,
};

#[test]
fn file_backed_object_is_resized_and_cleared() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("guest.ram");
    std::fs::write(&path, vec![0xEEu8; 0x100]).unwrap();

    let shm = SharedMemory::with_options(SharedMemoryOptions::new(0x18000).storage(&path)).unwrap();
    assert_eq!(shm.size(), 0x20000);
    assert_eq!(shm.storage_path(), Some(path.as_path()));
    assert_eq!(std::fs::metadata(&path).unwrap().len(), 0x20000);

    let view = shm.map(None, Protection::ReadWrite, false).unwrap();
    unsafe {
        // Stale file contents were discarded.
        assert_eq!(view.as_ptr().read(), 0);
        view.as_ptr().add(0x1FFFF).write(0x42);
        shm.unmap(view);
    }
}

#[test]
fn critical_map_replaces_placeholder_in_place() {
    let shm = SharedMemory::new(0x20000).unwrap();
    let placeholder = Reservation::placeholder(shm.size()).unwrap();
    let target = placeholder.as_ptr();

    let mapping = unsafe { shm.map_critical(target, Protection::ReadWrite, false) }.unwrap();
    assert_eq!(mapping.ptr(), target);
    if cfg!(unix) {
        assert!(matches!(mapping, CriticalMapping::Atomic(_)));
    }

    let other = shm.map(None, Protection::ReadOnly, false).unwrap();
    unsafe {
        target.as_ptr().add(0x10010).write(0xC3);
        assert_eq!(other.as_ptr().add(0x10010).read(), 0xC3);
        shm.unmap(other);
        shm.unmap_critical(target);
    }

    // The range is unbacked again but still reserved.
    assert!(shm.try_map(target, Protection::ReadWrite, false).is_err());
    assert!(matches!(
        memory_reserve(shm.size(), Some(target), false),
        Err(VmError::AddressUnavailable { .. } | VmError::Os { .. })
    ));
    drop(placeholder);
}

#[test]
fn hinted_map_lands_on_free_aligned_address_or_reports_it() {
    let shm = SharedMemory::new(0x10000).unwrap();

    let probe = Reservation::new(0x10000, None).unwrap();
    let hint = probe.as_ptr();
    drop(probe);

    match shm.map(Some(hint), Protection::ReadWrite, false) {
        Ok(view) => {
            assert_eq!(view, hint);
            assert_eq!(view.as_ptr() as usize % MAPPING_ALIGNMENT, 0);
            unsafe { shm.unmap(view) };
        }
        Err(VmError::AddressUnavailable { requested, .. }) => {
            assert_eq!(requested, hint.as_ptr() as usize);
        }
        Err(err) => panic!("unexpected error: {err}"),
    }
}

#[test]
fn map_over_occupied_hint_is_refused() {
    let shm = SharedMemory::new(0x10000).unwrap();
    let taken = Reservation::new(0x10000, None).unwrap();

    let err = shm
        .map(Some(taken.as_ptr()), Protection::ReadWrite, false)
        .unwrap_err();
    assert!(matches!(err, VmError::AddressUnavailable { .. } | VmError::Os { .. }));
}
