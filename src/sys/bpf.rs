//! Wrappers over the BPF syscall commands used by the loader.

use std::{
    cmp,
    ffi::{CStr, CString},
    io, mem,
    os::fd::{AsRawFd as _, BorrowedFd, FromRawFd as _, OwnedFd},
};

use crate::{
    bindings::{
        bpf_attr, bpf_cmd, bpf_insn, bpf_map_info, bpf_prog_info, BPF_OBJ_NAME_LEN,
    },
    sys::{syscall, SysResult, Syscall, SyscallError},
};

bitflags::bitflags! {
    /// Log level bits passed to the kernel verifier.
    #[derive(Clone, Copy, Debug, Default)]
    pub(crate) struct VerifierLogLevel: u32 {
        const LEVEL1 = 1;
        const LEVEL2 = 2;
        const STATS = 4;
    }
}

pub(crate) fn bpf_create_map(
    name: &CStr,
    map_type: u32,
    key_size: u32,
    value_size: u32,
    max_entries: u32,
    map_flags: u32,
) -> SysResult<OwnedFd> {
    let mut attr = unsafe { mem::zeroed::<bpf_attr>() };

    let u = unsafe { &mut attr.map_create };
    u.map_type = map_type;
    u.key_size = key_size;
    u.value_size = value_size;
    u.max_entries = max_entries;
    u.map_flags = map_flags;

    // map_name is 16 bytes max and must be NUL terminated
    let name_len = cmp::min(name.to_bytes().len(), BPF_OBJ_NAME_LEN - 1);
    u.map_name[..name_len].copy_from_slice(&name.to_bytes()[..name_len]);

    // SAFETY: BPF_MAP_CREATE returns a new file descriptor.
    unsafe { fd_sys_bpf(bpf_cmd::BPF_MAP_CREATE, &mut attr) }
}

pub(crate) fn bpf_pin_object(fd: BorrowedFd<'_>, path: &CStr) -> SysResult<i64> {
    let mut attr = unsafe { mem::zeroed::<bpf_attr>() };
    let u = unsafe { &mut attr.obj };
    u.bpf_fd = fd.as_raw_fd() as u32;
    u.pathname = path.as_ptr() as u64;
    sys_bpf(bpf_cmd::BPF_OBJ_PIN, &mut attr)
}

pub(crate) fn bpf_get_object(path: &CStr, file_flags: u32) -> SysResult<OwnedFd> {
    let mut attr = unsafe { mem::zeroed::<bpf_attr>() };
    let u = unsafe { &mut attr.obj };
    u.pathname = path.as_ptr() as u64;
    u.file_flags = file_flags;
    // SAFETY: BPF_OBJ_GET returns a new file descriptor.
    unsafe { fd_sys_bpf(bpf_cmd::BPF_OBJ_GET, &mut attr) }
}

pub(crate) struct LoadProgramAttrs<'a> {
    pub(crate) name: CString,
    pub(crate) prog_type: u32,
    pub(crate) insns: &'a [bpf_insn],
    pub(crate) license: &'a CStr,
    pub(crate) kernel_version: u32,
    pub(crate) expected_attach_type: u32,
}

pub(crate) fn bpf_load_program(
    load_attrs: &LoadProgramAttrs<'_>,
    log_buf: &mut [u8],
    log_level: VerifierLogLevel,
) -> SysResult<OwnedFd> {
    let mut attr = unsafe { mem::zeroed::<bpf_attr>() };

    let u = unsafe { &mut attr.prog_load };
    u.prog_type = load_attrs.prog_type;
    u.expected_attach_type = load_attrs.expected_attach_type;
    u.insns = load_attrs.insns.as_ptr() as u64;
    u.insn_cnt = load_attrs.insns.len() as u32;
    u.license = load_attrs.license.as_ptr() as u64;
    u.kern_version = load_attrs.kernel_version;

    // prog_name is 16 bytes max and must be NUL terminated
    let name_bytes = load_attrs.name.to_bytes();
    let name_len = cmp::min(name_bytes.len(), BPF_OBJ_NAME_LEN - 1);
    u.prog_name[..name_len].copy_from_slice(&name_bytes[..name_len]);

    if !log_buf.is_empty() {
        u.log_level = log_level.bits();
        u.log_buf = log_buf.as_mut_ptr() as u64;
        u.log_size = log_buf.len() as u32;
    }

    // SAFETY: BPF_PROG_LOAD returns a new file descriptor.
    unsafe { fd_sys_bpf(bpf_cmd::BPF_PROG_LOAD, &mut attr) }
}

fn bpf_obj_get_info_by_fd<T>(fd: BorrowedFd<'_>) -> Result<T, SyscallError> {
    let mut attr = unsafe { mem::zeroed::<bpf_attr>() };
    let mut info = unsafe { mem::zeroed::<T>() };

    let u = unsafe { &mut attr.info };
    u.bpf_fd = fd.as_raw_fd() as u32;
    u.info = &mut info as *mut _ as u64;
    u.info_len = mem::size_of::<T>() as u32;

    match sys_bpf(bpf_cmd::BPF_OBJ_GET_INFO_BY_FD, &mut attr) {
        Ok(_) => Ok(info),
        Err((_, io_error)) => Err(SyscallError {
            call: "bpf_obj_get_info_by_fd",
            io_error,
        }),
    }
}

pub(crate) fn bpf_map_get_info_by_fd(fd: BorrowedFd<'_>) -> Result<bpf_map_info, SyscallError> {
    bpf_obj_get_info_by_fd::<bpf_map_info>(fd)
}

pub(crate) fn bpf_prog_get_info_by_fd(fd: BorrowedFd<'_>) -> Result<bpf_prog_info, SyscallError> {
    bpf_obj_get_info_by_fd::<bpf_prog_info>(fd)
}

// SAFETY: only use for bpf_cmd that return a new file descriptor on success.
unsafe fn fd_sys_bpf(cmd: bpf_cmd, attr: &mut bpf_attr) -> SysResult<OwnedFd> {
    let fd = sys_bpf(cmd, attr)?;
    let fd = fd.try_into().map_err(|_| {
        (
            fd,
            io::Error::new(
                io::ErrorKind::InvalidData,
                format!("{cmd:?}: invalid fd returned: {fd}"),
            ),
        )
    })?;
    Ok(OwnedFd::from_raw_fd(fd))
}

fn sys_bpf(cmd: bpf_cmd, attr: &mut bpf_attr) -> SysResult<i64> {
    syscall(Syscall::Ebpf { cmd, attr })
}
