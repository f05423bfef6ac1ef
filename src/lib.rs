//! A boot-time loader for compiled eBPF object files.
//!
//! Takes one ELF relocatable produced by the BPF toolchain, installs its map
//! and program definitions into the kernel, and pins the resulting handles
//! into the BPF filesystem so that unrelated processes can attach or read
//! them later.
//!
//! The pipeline for one object is strictly linear: parse the ELF image,
//! classify code sections, create or reuse pinned maps, patch map file
//! descriptors into the instruction streams, then submit each program to the
//! kernel verifier and pin it. Pinned objects that already exist are reused,
//! never overwritten; a reused map whose live attributes diverge from the
//! desired ones fails the load instead.
//!
//! This crate only loads and pins. Enumerating object files, attaching
//! programs to their hooks, and installing a [`log`] sink are the callers'
//! business.

#![deny(clippy::all)]

mod bindings;
mod maps;
mod obj;
mod programs;
mod sys;
mod util;

use std::{
    fs, io,
    os::fd::AsRawFd as _,
    path::{Path, PathBuf},
};

use log::{debug, info};
use thiserror::Error;

pub use crate::{
    bindings::bpf_prog_type,
    maps::MapError,
    obj::{bpf_map_def, bpf_prog_def, read_section_u32, ParseError},
    programs::ProgramError,
    sys::SyscallError,
    util::KernelVersion,
};
use crate::obj::Object;

const BPF_FS_PATH: &str = "/sys/fs/bpf/";

/// Where and what a load is allowed to install.
#[derive(Debug, Clone, Copy)]
pub struct Location<'a> {
    /// Prepended verbatim to every pin filename; may be empty.
    pub prefix: &'a str,
    /// Program types permitted here; `None` allows anything recognized.
    /// [`bpf_prog_type::BPF_PROG_TYPE_UNSPEC`] is a sentinel matching the
    /// dynamically resolved fuse program type.
    pub allowed_prog_types: Option<&'a [bpf_prog_type]>,
}

/// Loads one eBPF object file and pins its maps and programs.
///
/// The first element of the returned pair reports whether the object carries
/// a `critical` section, which is determined even when the load itself
/// fails; the invoking driver decides what a failed critical object means
/// for the boot.
pub fn load(path: &Path, location: &Location<'_>) -> (bool, Result<(), LoadError>) {
    let kvers = KernelVersion::current().map(|v| v.code()).unwrap_or(0);
    let mut is_critical = false;
    let result = load_object(
        path,
        location,
        Path::new(BPF_FS_PATH),
        kvers,
        &mut is_critical,
    );
    (is_critical, result)
}

fn load_object(
    path: &Path,
    location: &Location<'_>,
    bpffs: &Path,
    kvers: u32,
    is_critical: &mut bool,
) -> Result<(), LoadError> {
    let data = fs::read(path).map_err(|error| LoadError::OpenFailed {
        path: path.into(),
        error,
    })?;

    // criticality must be reported even when a later stage fails
    *is_critical = obj::read_critical_section(&data).is_some();

    let mut object = Object::parse(&path_to_object_name(path), &data)?;

    // the banner fires for every object with a license, including ones the
    // classification below goes on to reject
    match &object.critical {
        Some(label) => info!(
            "loading critical for {} ELF object {} with license {}",
            label.to_string_lossy(),
            path.display(),
            object.license.to_string_lossy()
        ),
        None => info!(
            "loading optional ELF object {} with license {}",
            path.display(),
            object.license.to_string_lossy()
        ),
    }

    object.read_code_sections(&data, location.allowed_prog_types)?;

    let maps = maps::install_maps(&object, location.prefix, bpffs, kvers)?;

    let map_fds = maps
        .iter()
        .map(|map| map.as_ref().map(|m| m.fd.as_raw_fd()).unwrap_or(-1))
        .collect::<Vec<_>>();
    for (i, map) in maps.iter().enumerate() {
        match map {
            Some(map) => debug!(
                "map_fd found at {i} is {} (reused: {}) in {}",
                map.fd.as_raw_fd(),
                map.reused,
                path.display()
            ),
            None => debug!("map_fd found at {i} is skipped in {}", path.display()),
        }
    }
    object.relocate_maps(&map_fds);

    programs::install_programs(&object, location.prefix, bpffs, kvers)?;

    Ok(())
}

/// Derives the canonical object name used in pin paths: the basename with
/// the extension stripped, and any `@tag` (used to ship version-gated
/// duplicates of an object) stripped as well. `foo@1.o` and `foo.o` both
/// yield `foo`.
fn path_to_object_name(path: &Path) -> String {
    let file_name = path
        .file_name()
        .map(|name| name.to_string_lossy().into_owned())
        .unwrap_or_default();
    let stem = file_name
        .rsplit_once('.')
        .map(|(stem, _)| stem)
        .unwrap_or(&file_name);
    let name = stem.rsplit_once('@').map(|(name, _)| name).unwrap_or(stem);
    name.to_owned()
}

/// The error type returned by [`load`].
#[derive(Debug, Error)]
pub enum LoadError {
    /// The object file could not be read.
    #[error("failed to read object file `{}`", path.display())]
    OpenFailed {
        /// The file path.
        path: PathBuf,
        #[source]
        /// The original [`io::Error`].
        error: io::Error,
    },

    /// The ELF structure of the object is broken.
    #[error("malformed object: {0}")]
    Parse(#[from] ParseError),

    /// The mandatory `license` section is absent.
    #[error("object has no `license` section")]
    MissingLicense,

    /// A code section resolved to a program type outside the location's
    /// allow-list.
    #[error("program type of section `{section}` is not permitted here")]
    DisallowedProgramType {
        /// The section name.
        section: String,
    },

    /// A code section has no matching record in the `progs` section.
    #[error("code section `{section}` has no matching program definition")]
    MissingProgramDef {
        /// The section name.
        section: String,
    },

    /// Installing a map failed.
    #[error(transparent)]
    Map(#[from] MapError),

    /// Installing a program failed.
    #[error(transparent)]
    Program(#[from] ProgramError),
}
