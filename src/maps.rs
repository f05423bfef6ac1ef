//! Installation of map definitions into the kernel.

use std::{
    ffi::CString,
    fs, io,
    os::{
        fd::{AsFd as _, OwnedFd},
        unix::{ffi::OsStrExt as _, fs::PermissionsExt as _},
    },
    path::{Path, PathBuf},
    process,
};

use log::{debug, error};
use thiserror::Error;

use crate::{
    bindings::{bpf_map_type, BPF_F_RDONLY, BPF_F_RDONLY_PROG},
    obj::{bpf_map_def, Object},
    sys::{
        bpf_create_map, bpf_get_object, bpf_map_get_info_by_fd, bpf_pin_object, SyscallError,
    },
    util::{page_size, KernelVersion},
};

/// A map installed into the kernel, alive for the duration of one load.
/// The pin outlives the fd.
#[derive(Debug)]
pub(crate) struct MapData {
    pub(crate) fd: OwnedFd,
    /// Whether the fd came from an existing pin rather than a fresh map.
    pub(crate) reused: bool,
}

/// Installs every map defined by `obj`, returning one entry per definition
/// in definition order. Version-gated maps leave a `None` placeholder so
/// that indices keep lining up with the definition records.
pub(crate) fn install_maps(
    obj: &Object,
    prefix: &str,
    bpffs: &Path,
    kvers: u32,
) -> Result<Vec<Option<MapData>>, MapError> {
    let mut installed = Vec::with_capacity(obj.maps.len());

    for spec in &obj.maps {
        let name = &spec.name;
        let def = &spec.def;

        if def.zero != 0 {
            // the object file is structurally broken, nothing can be trusted
            error!("map {name} has a non-zero reserved field, aborting");
            process::abort();
        }

        if kvers < def.min_kver {
            debug!(
                "skipping map {name} which requires kernel version {kvers:#x} >= {:#x}",
                def.min_kver
            );
            installed.push(None);
            continue;
        }
        if kvers >= def.max_kver {
            debug!(
                "skipping map {name} which requires kernel version {kvers:#x} < {:#x}",
                def.max_kver
            );
            installed.push(None);
            continue;
        }

        let mut map_type = def.map_type;
        if map_type == bpf_map_type::BPF_MAP_TYPE_DEVMAP_HASH as u32
            && kvers < KernelVersion::new(5, 4, 0).code()
        {
            // DEVMAP_HASH doesn't exist before 5.4; HASH has the same
            // userspace visible api, though programs doing bpf_redirect_map()
            // against it must themselves be gated on 5.4.
            map_type = bpf_map_type::BPF_MAP_TYPE_HASH as u32;
        }

        // page size and max_entries are both powers of two, so this is
        // enough to make max_entries a page multiple as the kernel requires
        let mut max_entries = def.max_entries;
        if map_type == bpf_map_type::BPF_MAP_TYPE_RINGBUF as u32 && max_entries < page_size() {
            max_entries = page_size();
        }

        // the kernel marks DEVMAP variants read-only from the program side,
        // keep the desired flags in sync with what it will report
        let mut map_flags = def.map_flags;
        if map_type == bpf_map_type::BPF_MAP_TYPE_DEVMAP as u32
            || map_type == bpf_map_type::BPF_MAP_TYPE_DEVMAP_HASH as u32
        {
            map_flags |= BPF_F_RDONLY_PROG;
        }

        // Pin location is <bpffs>/<prefix>map_<objname>_<mapname>, with an
        // empty object name for maps shared across objects.
        let obj_name = if def.shared != 0 { "" } else { obj.name.as_str() };
        let pin_path = bpffs.join(format!("{prefix}map_{obj_name}_{name}"));

        let reused = pin_path.exists();
        let fd = if reused {
            let path_string = pin_cstring(&pin_path)?;
            let fd = bpf_get_object(&path_string, BPF_F_RDONLY).map_err(|(_, io_error)| {
                MapError::GetPinnedFailed {
                    path: pin_path.clone(),
                    io_error,
                }
            })?;
            debug!("reusing map {name} from pin {}", pin_path.display());
            fd
        } else {
            let c_name = CString::new(name.as_str()).map_err(|_| MapError::InvalidName {
                name: name.clone(),
            })?;
            let fd = bpf_create_map(
                &c_name,
                map_type,
                def.key_size,
                def.value_size,
                max_entries,
                map_flags,
            )
            .map_err(|(_, io_error)| MapError::CreateFailed {
                name: name.clone(),
                io_error,
            })?;
            debug!("created map {name}");
            fd
        };

        // When reusing a pinned map the type/sizes/flags must match, but
        // since the reuse path is rare run the check on fresh maps too.
        check_map_shape(name, fd.as_fd(), def, map_type, max_entries, map_flags)?;

        if !reused {
            let path_string = pin_cstring(&pin_path)?;
            bpf_pin_object(fd.as_fd(), &path_string).map_err(|(_, io_error)| {
                MapError::PinFailed {
                    name: name.clone(),
                    path: pin_path.clone(),
                    io_error,
                }
            })?;
            fs::set_permissions(&pin_path, fs::Permissions::from_mode(def.mode)).map_err(
                |io_error| MapError::ChmodFailed {
                    path: pin_path.clone(),
                    io_error,
                },
            )?;
            std::os::unix::fs::chown(&pin_path, Some(def.uid), Some(def.gid)).map_err(
                |io_error| MapError::ChownFailed {
                    path: pin_path.clone(),
                    io_error,
                },
            )?;
        }

        match bpf_map_get_info_by_fd(fd.as_fd()) {
            Ok(info) => debug!("map {} id {}", pin_path.display(), info.id),
            Err(err) => error!("failed to query id of map {name}: {err}"),
        }

        installed.push(Some(MapData { fd, reused }));
    }

    Ok(installed)
}

fn check_map_shape(
    name: &str,
    fd: std::os::fd::BorrowedFd<'_>,
    def: &bpf_map_def,
    map_type: u32,
    max_entries: u32,
    map_flags: u32,
) -> Result<(), MapError> {
    let info = bpf_map_get_info_by_fd(fd)?;

    if info.map_type == map_type
        && info.key_size == def.key_size
        && info.value_size == def.value_size
        && info.max_entries == max_entries
        && info.map_flags == map_flags
    {
        return Ok(());
    }

    error!(
        "map {name} mismatch, desired/found: type {map_type}/{} key {}/{} value {}/{} \
         entries {max_entries}/{} flags {map_flags}/{}",
        info.map_type,
        def.key_size,
        info.key_size,
        def.value_size,
        info.value_size,
        info.max_entries,
        info.map_flags,
    );
    Err(MapError::NotUnique { name: name.into() })
}

fn pin_cstring(path: &Path) -> Result<CString, MapError> {
    CString::new(path.as_os_str().as_bytes()).map_err(|error| MapError::InvalidPinPath {
        path: path.into(),
        error,
    })
}

/// An error installing a map.
#[derive(Debug, Error)]
pub enum MapError {
    /// The live attributes of an already pinned map do not match the
    /// desired ones; usually a stale pin from a structurally different
    /// build.
    #[error("map `{name}` does not match the attributes of its pinned object")]
    NotUnique {
        /// Map name.
        name: String,
    },

    /// The BPF_MAP_CREATE syscall failed.
    #[error("failed to create map `{name}`")]
    CreateFailed {
        /// Map name.
        name: String,
        #[source]
        /// The error returned by the syscall.
        io_error: io::Error,
    },

    /// An existing pin could not be opened.
    #[error("failed to open pinned map `{}`", path.display())]
    GetPinnedFailed {
        /// The pin path.
        path: PathBuf,
        #[source]
        /// The error returned by the syscall.
        io_error: io::Error,
    },

    /// The map name contains a NUL byte.
    #[error("invalid map name `{name}`")]
    InvalidName {
        /// Map name.
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
    #[error("failed to pin map `{name}` at `{}`", path.display())]
    PinFailed {
        /// Map name.
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
