use std::ffi::c_void;
use std::fs::OpenOptions;
use std::io;
use std::mem;
use std::os::windows::io::{AsRawHandle, OwnedHandle};
use std::path::Path;
use std::ptr;
use std::sync::OnceLock;

use windows_sys::Win32::Foundation::{CloseHandle, HANDLE, INVALID_HANDLE_VALUE};
use windows_sys::Win32::System::LibraryLoader::{GetModuleHandleW, GetProcAddress};
use windows_sys::Win32::System::Memory::{
    CreateFileMappingW, MapViewOfFileEx, UnmapViewOfFile, VirtualAlloc, VirtualFree, VirtualLock,
    VirtualProtect, VirtualQuery, FILE_MAP_COPY, FILE_MAP_EXECUTE,
    FILE_MAP_READ, FILE_MAP_WRITE, MEMORY_BASIC_INFORMATION, MEMORY_MAPPED_VIEW_ADDRESS,
    MEM_COMMIT, MEM_DECOMMIT, MEM_RELEASE, MEM_RESERVE, PAGE_EXECUTE_READ,
    PAGE_EXECUTE_READWRITE, PAGE_EXECUTE_WRITECOPY, PAGE_NOACCESS, PAGE_PROTECTION_FLAGS,
    PAGE_READONLY, PAGE_READWRITE, PAGE_WRITECOPY,
};
use windows_sys::Win32::System::SystemInformation::{GetSystemInfo, SYSTEM_INFO};
use windows_sys::Win32::System::Threading::GetCurrentProcess;

use super::CriticalKind;
use crate::protection::Protection;

// Placeholder flags (Windows 10 1803+).
const MEM_COALESCE_PLACEHOLDERS: u32 = 0x0000_0001;
const MEM_PRESERVE_PLACEHOLDER: u32 = 0x0000_0002;
const MEM_REPLACE_PLACEHOLDER: u32 = 0x0000_4000;
const MEM_RESERVE_PLACEHOLDER: u32 = 0x0004_0000;

type VirtualAlloc2Fn = unsafe extern "system" fn(
    process: HANDLE,
    base: *const c_void,
    size: usize,
    allocation_type: u32,
    protection: u32,
    params: *mut c_void,
    param_count: u32,
) -> *mut c_void;

type MapViewOfFile3Fn = unsafe extern "system" fn(
    mapping: HANDLE,
    process: HANDLE,
    base: *const c_void,
    offset: u64,
    size: usize,
    allocation_type: u32,
    protection: u32,
    params: *mut c_void,
    param_count: u32,
) -> *mut c_void;

type UnmapViewOfFile2Fn =
    unsafe extern "system" fn(process: HANDLE, base: *const c_void, flags: u32) -> i32;

/// Placeholder entry points, resolved at runtime so older hosts fall back to the gapped path.
struct PlaceholderApi {
    virtual_alloc2: VirtualAlloc2Fn,
    map_view_of_file3: MapViewOfFile3Fn,
    unmap_view_of_file2: UnmapViewOfFile2Fn,
}

fn placeholder_api() -> Option<&'static PlaceholderApi> {
    static API: OnceLock<Option<PlaceholderApi>> = OnceLock::new();
    API.get_or_init(|| {
        let module_name: Vec<u16> = "kernelbase.dll\0".encode_utf16().collect();
        // SAFETY: kernelbase is loaded into every process; symbol names are NUL-terminated and
        // the transmuted signatures match the documented prototypes.
        unsafe {
            let module = GetModuleHandleW(module_name.as_ptr());
            if module == 0 {
                return None;
            }
            let virtual_alloc2 = GetProcAddress(module, b"VirtualAlloc2\0".as_ptr())?;
            let map_view_of_file3 = GetProcAddress(module, b"MapViewOfFile3\0".as_ptr())?;
            let unmap_view_of_file2 = GetProcAddress(module, b"UnmapViewOfFile2\0".as_ptr())?;
            Some(PlaceholderApi {
                virtual_alloc2: mem::transmute::<_, VirtualAlloc2Fn>(virtual_alloc2),
                map_view_of_file3: mem::transmute::<_, MapViewOfFile3Fn>(map_view_of_file3),
                unmap_view_of_file2: mem::transmute::<_, UnmapViewOfFile2Fn>(unmap_view_of_file2),
            })
        }
    })
    .as_ref()
}

fn native(prot: Protection) -> PAGE_PROTECTION_FLAGS {
    match prot {
        Protection::ReadWrite => PAGE_READWRITE,
        Protection::ReadOnly => PAGE_READONLY,
        Protection::NoAccess => PAGE_NOACCESS,
        Protection::ReadWriteExecute => PAGE_EXECUTE_READWRITE,
        Protection::ReadExecute => PAGE_EXECUTE_READ,
    }
}

fn view_protection(prot: Protection, cow: bool) -> PAGE_PROTECTION_FLAGS {
    match (prot, cow) {
        (Protection::ReadWrite, true) => PAGE_WRITECOPY,
        (Protection::ReadWriteExecute, true) => PAGE_EXECUTE_WRITECOPY,
        _ => native(prot),
    }
}

fn view_access(prot: Protection, cow: bool) -> u32 {
    let mut access = if cow {
        FILE_MAP_COPY
    } else if prot.is_writable() {
        FILE_MAP_WRITE
    } else {
        FILE_MAP_READ
    };
    if prot.is_executable() {
        access |= FILE_MAP_EXECUTE;
    }
    access
}

fn check(ok: i32) -> io::Result<()> {
    if ok == 0 {
        Err(io::Error::last_os_error())
    } else {
        Ok(())
    }
}

fn check_ptr(ptr: *mut c_void) -> io::Result<*mut u8> {
    if ptr.is_null() {
        Err(io::Error::last_os_error())
    } else {
        Ok(ptr.cast())
    }
}

pub(crate) fn query_page_size() -> usize {
    // SAFETY: GetSystemInfo only writes into the provided struct.
    let info = unsafe {
        let mut info: SYSTEM_INFO = mem::zeroed();
        GetSystemInfo(&mut info);
        info
    };
    info.dwPageSize as usize
}

/// Reserves address space. With `placeholder`, the range can later be replaced by a view in
/// place (see [`shm_map_critical`]).
pub(crate) fn reserve(size: usize, hint: *mut u8, placeholder: bool) -> io::Result<*mut u8> {
    // SAFETY: reserving never touches existing allocations.
    unsafe {
        if placeholder {
            if let Some(api) = placeholder_api() {
                return check_ptr((api.virtual_alloc2)(
                    GetCurrentProcess(),
                    hint.cast(),
                    size,
                    MEM_RESERVE | MEM_RESERVE_PLACEHOLDER,
                    PAGE_NOACCESS,
                    ptr::null_mut(),
                    0,
                ));
            }
        }
        check_ptr(VirtualAlloc(hint.cast(), size, MEM_RESERVE, PAGE_NOACCESS))
    }
}

pub(crate) unsafe fn commit(ptr: *mut u8, size: usize, prot: Protection) -> io::Result<()> {
    check_ptr(VirtualAlloc(ptr.cast(), size, MEM_COMMIT, native(prot))).map(drop)
}

pub(crate) unsafe fn decommit(ptr: *mut u8, size: usize) -> io::Result<()> {
    check(VirtualFree(ptr.cast(), size, MEM_DECOMMIT))
}

pub(crate) unsafe fn reset(ptr: *mut u8, size: usize, prot: Protection) -> io::Result<()> {
    decommit(ptr, size)?;
    commit(ptr, size, prot)
}

pub(crate) unsafe fn release(ptr: *mut u8, _size: usize) -> io::Result<()> {
    check(VirtualFree(ptr.cast(), 0, MEM_RELEASE))
}

pub(crate) unsafe fn protect(ptr: *mut u8, size: usize, prot: Protection) -> io::Result<()> {
    // VirtualProtect cannot cross allocation boundaries (e.g. adjacent views): walk regions.
    let end = ptr as usize + size;
    let mut cursor = ptr as usize;
    while cursor < end {
        let mut info: MEMORY_BASIC_INFORMATION = mem::zeroed();
        if VirtualQuery(
            cursor as *const c_void,
            &mut info,
            mem::size_of::<MEMORY_BASIC_INFORMATION>(),
        ) == 0
        {
            return Err(io::Error::last_os_error());
        }
        let region_end = (info.BaseAddress as usize + info.RegionSize).min(end);
        let mut old: PAGE_PROTECTION_FLAGS = 0;
        check(VirtualProtect(
            cursor as *const c_void,
            region_end - cursor,
            native(prot),
            &mut old,
        ))?;
        cursor = region_end;
    }
    Ok(())
}

pub(crate) unsafe fn lock(ptr: *mut u8, size: usize) -> io::Result<()> {
    check(VirtualLock(ptr.cast(), size))
}

pub(crate) struct ShmHandle {
    mapping: HANDLE,
    // Keeps the storage file open for the lifetime of the mapping object.
    _file: Option<OwnedHandle>,
}

impl Drop for ShmHandle {
    fn drop(&mut self) {
        // SAFETY: `mapping` is owned by this handle.
        unsafe { CloseHandle(self.mapping) };
    }
}

pub(crate) fn shm_create(size: usize, storage: Option<&Path>) -> io::Result<ShmHandle> {
    let file = match storage {
        Some(path) => {
            let file = OpenOptions::new()
                .read(true)
                .write(true)
                .create(true)
                .truncate(false)
                .open(path)?;
            file.set_len(0)?;
            file.set_len(size as u64)?;
            Some(OwnedHandle::from(file))
        }
        None => None,
    };

    let file_handle = file
        .as_ref()
        .map_or(INVALID_HANDLE_VALUE, |f| f.as_raw_handle() as HANDLE);
    let size = size as u64;
    // SAFETY: all pointer arguments are either null or valid.
    let mapping = unsafe {
        CreateFileMappingW(
            file_handle,
            ptr::null(),
            PAGE_EXECUTE_READWRITE,
            (size >> 32) as u32,
            size as u32,
            ptr::null(),
        )
    };
    if mapping == 0 {
        return Err(io::Error::last_os_error());
    }
    Ok(ShmHandle {
        mapping,
        _file: file,
    })
}

unsafe fn map_view_at(
    handle: &ShmHandle,
    size: usize,
    addr: *mut u8,
    prot: Protection,
    cow: bool,
) -> io::Result<*mut u8> {
    let view = MapViewOfFileEx(
        handle.mapping,
        view_access(prot, cow),
        0,
        0,
        size,
        addr.cast(),
    );
    let ptr = check_ptr(view.Value)?;

    // Views are created with the widest rights their access mask allows; narrow afterwards.
    if !matches!(prot, Protection::ReadWrite | Protection::ReadWriteExecute) {
        let mut old: PAGE_PROTECTION_FLAGS = 0;
        if VirtualProtect(ptr.cast(), size, native(prot), &mut old) == 0 {
            let err = io::Error::last_os_error();
            UnmapViewOfFile(view);
            return Err(err);
        }
    }
    Ok(ptr)
}

pub(crate) unsafe fn shm_map(
    handle: &ShmHandle,
    size: usize,
    hint: *mut u8,
    prot: Protection,
    cow: bool,
) -> io::Result<*mut u8> {
    // MapViewOfFileEx either honours the address exactly or fails; retry anywhere so that a
    // hint behaves like a hint. The caller decides whether a different address is acceptable.
    match map_view_at(handle, size, hint, prot, cow) {
        Ok(ptr) => Ok(ptr),
        Err(_) if !hint.is_null() => map_view_at(handle, size, ptr::null_mut(), prot, cow),
        Err(err) => Err(err),
    }
}

pub(crate) unsafe fn shm_try_map(
    handle: &ShmHandle,
    size: usize,
    addr: *mut u8,
    prot: Protection,
    cow: bool,
) -> io::Result<*mut u8> {
    map_view_at(handle, size, addr, prot, cow)
}

pub(crate) unsafe fn shm_map_critical(
    handle: &ShmHandle,
    size: usize,
    addr: *mut u8,
    prot: Protection,
    cow: bool,
) -> io::Result<CriticalKind> {
    if let Some(api) = placeholder_api() {
        // Split the placeholder so that exactly `size` bytes can be replaced. This fails
        // harmlessly when the placeholder already has that size.
        VirtualFree(addr.cast(), size, MEM_RELEASE | MEM_PRESERVE_PLACEHOLDER);

        let ptr = (api.map_view_of_file3)(
            handle.mapping,
            GetCurrentProcess(),
            addr.cast(),
            0,
            size,
            MEM_REPLACE_PLACEHOLDER,
            view_protection(prot, cow),
            ptr::null_mut(),
            0,
        );
        check_ptr(ptr)?;
        return Ok(CriticalKind::Atomic);
    }

    // No placeholder support: the reservation must be dropped before the view can take its
    // place, leaving a window where the range is unmapped.
    check(VirtualFree(addr.cast(), 0, MEM_RELEASE))?;
    if let Err(err) = map_view_at(handle, size, addr, prot, cow) {
        // Put the reservation back so the caller still owns the range it passed in.
        VirtualAlloc(addr.cast(), size, MEM_RESERVE, PAGE_NOACCESS);
        return Err(err);
    }
    Ok(CriticalKind::WithGap)
}

pub(crate) unsafe fn shm_unmap(ptr: *mut u8, _size: usize) -> io::Result<()> {
    check(UnmapViewOfFile(MEMORY_MAPPED_VIEW_ADDRESS { Value: ptr.cast() }))
}

pub(crate) unsafe fn shm_unmap_critical(ptr: *mut u8, size: usize) -> io::Result<()> {
    if let Some(api) = placeholder_api() {
        check((api.unmap_view_of_file2)(
            GetCurrentProcess(),
            ptr.cast(),
            MEM_PRESERVE_PLACEHOLDER,
        ))?;
        // Merging back into neighbouring placeholders is best-effort.
        VirtualFree(ptr.cast(), size, MEM_RELEASE | MEM_COALESCE_PLACEHOLDERS);
        return Ok(());
    }

    shm_unmap(ptr, size)?;
    check_ptr(VirtualAlloc(ptr.cast(), size, MEM_RESERVE, PAGE_NOACCESS)).map(drop)
}
