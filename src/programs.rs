//! Submission of programs to the kernel verifier.

use std::{
    ffi::{CStr, CString},
    fs, io,
    os::{
        fd::{AsFd as _, OwnedFd},
        unix::{ffi::OsStrExt as _, fs::PermissionsExt as _},
    },
    path::{Path, PathBuf},
};

use log::{debug, error, warn};
use thiserror::Error;

use crate::{
    obj::{CodeSection, Object},
    sys::{
        bpf_get_object, bpf_load_program, bpf_pin_object, bpf_prog_get_info_by_fd,
        LoadProgramAttrs, SyscallError, VerifierLogLevel,
    },
};

/// Size of the buffer the verifier writes its log into.
const BPF_LOG_BUF_SIZE: usize = 0xfffff;

/// Mode of every program pin.
const PROG_PIN_MODE: u32 = 0o440;

/// Submits every program of `obj` to the verifier (or reuses its pin) and
/// pins the result. Must run after map relocations have been applied.
pub(crate) fn install_programs(
    obj: &Object,
    prefix: &str,
    bpffs: &Path,
    kvers: u32,
) -> Result<(), ProgramError> {
    if kvers == 0 {
        error!("unable to get kernel version");
        return Err(ProgramError::UnknownKernelVersion);
    }

    for cs in &obj.programs {
        let name = &cs.name;

        if kvers < cs.def.min_kver || kvers >= cs.def.max_kver {
            debug!(
                "skipping program {name} min_kver:{:x} max_kver:{:x} (kvers:{kvers:x})",
                cs.def.min_kver, cs.def.max_kver
            );
            continue;
        }

        // A trailing $suffix marks version-gated duplicates of the same
        // program; the pin name drops it, the in-kernel name keeps it.
        let pin_name = match name.rfind('$') {
            Some(i) => &name[..i],
            None => name.as_str(),
        };
        let pin_path = bpffs.join(format!("{prefix}prog_{}_{pin_name}", obj.name));

        let reused = pin_path.exists();
        let fd: OwnedFd = if reused {
            let path_string = pin_cstring(&pin_path)?;
            let fd = bpf_get_object(&path_string, 0).map_err(|(_, io_error)| {
                ProgramError::GetPinnedFailed {
                    path: pin_path.clone(),
                    io_error,
                }
            })?;
            debug!("reusing program {name} from pin {}", pin_path.display());
            fd
        } else {
            match load_program(obj, cs, kvers)? {
                Some(fd) => fd,
                // verifier rejection of an optional program
                None => continue,
            }
        };

        if !reused {
            let path_string = pin_cstring(&pin_path)?;
            bpf_pin_object(fd.as_fd(), &path_string).map_err(|(_, io_error)| {
                ProgramError::PinFailed {
                    name: name.clone(),
                    path: pin_path.clone(),
                    io_error,
                }
            })?;
            fs::set_permissions(&pin_path, fs::Permissions::from_mode(PROG_PIN_MODE)).map_err(
                |io_error| ProgramError::ChmodFailed {
                    path: pin_path.clone(),
                    io_error,
                },
            )?;
            std::os::unix::fs::chown(&pin_path, Some(cs.def.uid), Some(cs.def.gid)).map_err(
                |io_error| ProgramError::ChownFailed {
                    path: pin_path.clone(),
                    io_error,
                },
            )?;
        }

        match bpf_prog_get_info_by_fd(fd.as_fd()) {
            Ok(info) => debug!("prog {} id {}", pin_path.display(), info.id),
            Err(err) => error!("failed to query id of program {name}: {err}"),
        }
    }

    Ok(())
}

/// Submits one program to the verifier. Returns `None` when the verifier
/// rejected a program marked optional; any other rejection is an error.
fn load_program(
    obj: &Object,
    cs: &CodeSection,
    kvers: u32,
) -> Result<Option<OwnedFd>, ProgramError> {
    let name = &cs.name;
    let c_name = CString::new(name.as_str()).map_err(|_| ProgramError::InvalidName {
        name: name.clone(),
    })?;

    let attrs = LoadProgramAttrs {
        name: c_name,
        prog_type: cs.prog_type,
        insns: &cs.insns,
        license: &obj.license,
        kernel_version: kvers,
        expected_attach_type: cs.expected_attach_type,
    };
    let mut log_buf = vec![0u8; BPF_LOG_BUF_SIZE];

    match bpf_load_program(&attrs, &mut log_buf, VerifierLogLevel::LEVEL1) {
        Ok(fd) => Ok(Some(fd)),
        Err((_, io_error)) => {
            warn!("BPF_PROG_LOAD call for {} ({name}) failed: {io_error}", obj.name);

            let log = CStr::from_bytes_until_nul(&log_buf)
                .map(|log| log.to_string_lossy())
                .unwrap_or_default();
            warn!("BPF_PROG_LOAD - BEGIN log_buf contents:");
            for line in log.lines() {
                warn!("{line}");
            }
            warn!("BPF_PROG_LOAD - END log_buf contents.");

            if cs.def.optional != 0 {
                warn!("failed program is marked optional - continuing...");
                return Ok(None);
            }
            error!("non-optional program failed to load.");
            Err(ProgramError::LoadFailed {
                name: name.clone(),
                io_error,
            })
        }
    }
}

fn pin_cstring(path: &Path) -> Result<CString, ProgramError> {
    CString::new(path.as_os_str().as_bytes()).map_err(|error| ProgramError::InvalidPinPath {
        path: path.into(),
        error,
    })
}

/// An error installing a program.
#[derive(Debug, Error)]
pub enum ProgramError {
    /// The running kernel version could not be determined.
    #[error("unable to determine the running kernel version")]
    UnknownKernelVersion,

    /// The kernel verifier rejected a program that is not marked optional.
    #[error("the kernel verifier rejected program `{name}`")]
    LoadFailed {
        /// Program name.
        name: String,
        #[source]
        /// The error returned by the syscall.
        io_error: io::Error,
    },

    /// An existing pin could not be opened.
    #[error("failed to open pinned program `{}`", path.display())]
    GetPinnedFailed {
        /// The pin path.
        path: PathBuf,
        #[source]
        /// The error returned by the syscall.
        io_error: io::Error,
    },

    /// The program name contains a NUL byte.
    #[error("invalid program name `{name}`")]
    InvalidName {
        /// Program name.
        name: String,
    },

    /// The pin path contains a NUL byte.
    #[error("invalid pin path `{}`", path.display())]
    InvalidPinPath {
        /// The pin path.
        path: PathBuf,
        #[source]
        /// The nul error.
        error: std::ffi::NulError,
    },

    /// The BPF_OBJ_PIN syscall failed.
    #[error("failed to pin program `{name}` at `{}`", path.display())]
    PinFailed {
        /// Program name.
        name: String,
        /// The pin path.
        path: PathBuf,
        #[source]
        /// The error returned by the syscall.
        io_error: io::Error,
    },

    /// Setting the pin file mode failed.
    #[error("failed to set permissions on `{}`", path.display())]
    ChmodFailed {
        /// The pin path.
        path: PathBuf,
        #[source]
        /// The underlying error.
        io_error: io::Error,
    },

    /// Setting the pin file ownership failed.
    #[error("failed to set ownership on `{}`", path.display())]
    ChownFailed {
        /// The pin path.
        path: PathBuf,
        #[source]
        /// The underlying error.
        io_error: io::Error,
    },

    /// A syscall failed.
    #[error(transparent)]
    Syscall(#[from] SyscallError),
}

#[cfg(test)]
mod tests {
    use std::{cell::RefCell, io, os::unix::fs::PermissionsExt as _};

    use assert_matches::assert_matches;

    use super::*;
    use crate::{
        bindings::{bpf_cmd, bpf_insn, bpf_prog_type},
        obj::{bpf_prog_def, CodeSection},
        sys::{override_syscall, SysResult, Syscall},
    };

    thread_local! {
        static LOADED: RefCell<Vec<(u32, u32, u32)>> = const { RefCell::new(Vec::new()) };
    }

    fn dup_fd() -> i64 {
        let fd = unsafe { libc::dup(1) };
        assert!(fd >= 0);
        fd as i64
    }

    unsafe fn prog_kernel(call: Syscall<'_>) -> SysResult<i64> {
        match call {
            Syscall::Ebpf {
                cmd: bpf_cmd::BPF_PROG_LOAD,
                attr,
            } => {
                let u = &attr.prog_load;
                LOADED.with(|loaded| {
                    loaded
                        .borrow_mut()
                        .push((u.prog_type, u.insn_cnt, u.kern_version))
                });
                Ok(dup_fd())
            }
            Syscall::Ebpf {
                cmd: bpf_cmd::BPF_OBJ_GET,
                ..
            } => Ok(dup_fd()),
            Syscall::Ebpf {
                cmd: bpf_cmd::BPF_OBJ_PIN,
                attr,
            } => {
                let path = CStr::from_ptr(attr.obj.pathname as *const _).to_str().unwrap();
                fs::File::create(path).unwrap();
                Ok(0)
            }
            Syscall::Ebpf {
                cmd: bpf_cmd::BPF_OBJ_GET_INFO_BY_FD,
                ..
            } => Ok(0),
            call => panic!("unexpected syscall {call:?}"),
        }
    }

    unsafe fn rejecting_kernel(call: Syscall<'_>) -> SysResult<i64> {
        match call {
            Syscall::Ebpf {
                cmd: bpf_cmd::BPF_PROG_LOAD,
                attr,
            } => {
                let u = &attr.prog_load;
                let log = u.log_buf as *mut u8;
                let text = b"R1 type=ctx expected=fp\nprocessed 2 insns\0";
                std::ptr::copy_nonoverlapping(text.as_ptr(), log, text.len());
                Err((-1, io::Error::from_raw_os_error(libc::EACCES)))
            }
            call => panic!("unexpected syscall {call:?}"),
        }
    }

    fn test_section(name: &str, def: bpf_prog_def) -> CodeSection {
        CodeSection {
            prog_type: bpf_prog_type::BPF_PROG_TYPE_TRACEPOINT as u32,
            expected_attach_type: 0,
            name: name.to_owned(),
            insns: vec![
                bpf_insn::new(0xb7, 0, 0, 0, 0), // mov64 r0 = 0
                bpf_insn::new(0x95, 0, 0, 0, 0), // exit
            ],
            relocations: Vec::new(),
            def,
        }
    }

    fn test_object(programs: Vec<CodeSection>) -> Object {
        Object {
            name: "foo".to_owned(),
            license: c"GPL".to_owned(),
            critical: None,
            maps: Vec::new(),
            programs,
            symbol_names_by_index: Default::default(),
        }
    }

    fn current_owner_def() -> bpf_prog_def {
        bpf_prog_def {
            uid: unsafe { libc::geteuid() },
            gid: unsafe { libc::getegid() },
            min_kver: 0,
            max_kver: 0xffff_ffff,
            ..Default::default()
        }
    }

    #[test]
    fn test_load_and_pin() {
        override_syscall(prog_kernel);
        let root = tempfile::tempdir().unwrap();
        let obj = test_object(vec![test_section(
            "tracepoint_sched_switch",
            current_owner_def(),
        )]);

        install_programs(&obj, "test_", root.path(), 0x050a00).unwrap();

        let pin = root.path().join("test_prog_foo_tracepoint_sched_switch");
        assert!(pin.exists());
        let mode = fs::metadata(&pin).unwrap().permissions().mode();
        assert_eq!(mode & 0o777, 0o440);
        LOADED.with(|loaded| {
            assert_eq!(loaded.borrow().as_slice(), &[(
                bpf_prog_type::BPF_PROG_TYPE_TRACEPOINT as u32,
                2,
                0x050a00
            )])
        });
    }

    #[test]
    fn test_version_gated_program_skipped() {
        override_syscall(|call| panic!("unexpected syscall {call:?}"));
        let root = tempfile::tempdir().unwrap();

        let mut def = current_owner_def();
        def.min_kver = 0xffff_0000;
        let obj = test_object(vec![test_section("tracepoint_sched_switch", def)]);

        install_programs(&obj, "test_", root.path(), 0x050a00).unwrap();
        assert!(!root
            .path()
            .join("test_prog_foo_tracepoint_sched_switch")
            .exists());
    }

    #[test]
    fn test_pin_name_strips_dollar_suffix() {
        override_syscall(prog_kernel);
        let root = tempfile::tempdir().unwrap();
        let obj = test_object(vec![test_section(
            "tracepoint_sched_switch$5_10",
            current_owner_def(),
        )]);

        install_programs(&obj, "", root.path(), 0x050a00).unwrap();
        assert!(root.path().join("prog_foo_tracepoint_sched_switch").exists());
    }

    #[test]
    fn test_reuse_existing_pin() {
        override_syscall(prog_kernel);
        let root = tempfile::tempdir().unwrap();
        let pin = root.path().join("prog_foo_tracepoint_sched_switch");
        fs::File::create(&pin).unwrap();

        let obj = test_object(vec![test_section(
            "tracepoint_sched_switch",
            current_owner_def(),
        )]);
        install_programs(&obj, "", root.path(), 0x050a00).unwrap();

        LOADED.with(|loaded| assert!(loaded.borrow().is_empty()));
    }

    #[test]
    fn test_optional_program_survives_verifier_rejection() {
        override_syscall(rejecting_kernel);
        let root = tempfile::tempdir().unwrap();

        let mut def = current_owner_def();
        def.optional = 1;
        let obj = test_object(vec![test_section("tracepoint_sched_switch", def)]);

        install_programs(&obj, "", root.path(), 0x050a00).unwrap();
        assert!(!root.path().join("prog_foo_tracepoint_sched_switch").exists());
    }

    #[test]
    fn test_required_program_fails_on_verifier_rejection() {
        override_syscall(rejecting_kernel);
        let root = tempfile::tempdir().unwrap();
        let obj = test_object(vec![test_section(
            "tracepoint_sched_switch",
            current_owner_def(),
        )]);

        assert_matches!(
            install_programs(&obj, "", root.path(), 0x050a00),
            Err(ProgramError::LoadFailed { name, io_error }) => {
                assert_eq!(name, "tracepoint_sched_switch");
                assert_eq!(io_error.raw_os_error(), Some(libc::EACCES));
            }
        );
    }

    #[test]
    fn test_zero_kernel_version_is_an_error() {
        override_syscall(|call| panic!("unexpected syscall {call:?}"));
        let root = tempfile::tempdir().unwrap();
        let obj = test_object(vec![test_section(
            "tracepoint_sched_switch",
            current_owner_def(),
        )]);

        assert_matches!(
            install_programs(&obj, "", root.path(), 0),
            Err(ProgramError::UnknownKernelVersion)
        );
    }
}
