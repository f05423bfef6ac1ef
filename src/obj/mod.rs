//! Parsing of compiled eBPF object files.
//!
//! An object file carries its map and program definitions in the fixed-layout
//! `maps` and `progs` sections. Definitions are paired with their user-visible
//! names through the symbol table: the i-th record in a definition section
//! belongs to the i-th symbol of that section, with symbols ordered by
//! ascending `st_value`. Perturbing that order silently renames every map, so
//! it is preserved exactly.

pub(crate) mod relocation;

#[cfg(test)]
pub(crate) mod fixtures;

use std::{
    collections::HashMap,
    ffi::{CStr, CString},
    fs, mem, ptr,
};

use log::{debug, error};
use object::{
    read::File as ElfFile, Endianness, Object as ElfObject, ObjectSection, ObjectSymbol,
    RelocationTarget, SectionIndex, SymbolKind,
};
use thiserror::Error;

use crate::{
    bindings::{bpf_insn, BPF_ATTACH_TYPE_UNSPEC, bpf_prog_type},
    obj::relocation::Relocation,
    LoadError,
};

/// A map definition record from the `maps` section.
///
/// The layout is fixed; the compiler emits one record per map, packed. The
/// `zero` field is a structural integrity check and must be zero.
#[repr(C)]
#[derive(Debug, Copy, Clone, PartialEq, Eq, Default)]
pub struct bpf_map_def {
    pub map_type: u32,
    pub key_size: u32,
    pub value_size: u32,
    pub max_entries: u32,
    pub map_flags: u32,
    pub uid: u32,
    pub gid: u32,
    pub mode: u32,
    pub min_kver: u32,
    pub max_kver: u32,
    /// Non-zero when the map is shared across objects; the pin name then
    /// omits the object name.
    pub shared: u32,
    pub zero: u32,
}

/// A program definition record from the `progs` section, named
/// `<program symbol>_def` in the symbol table.
#[repr(C)]
#[derive(Debug, Copy, Clone, PartialEq, Eq, Default)]
pub struct bpf_prog_def {
    pub uid: u32,
    pub gid: u32,
    pub min_kver: u32,
    pub max_kver: u32,
    /// Non-zero when a verifier rejection of this program should not fail
    /// the whole object.
    pub optional: u32,
    pub zero: [u32; 3],
}

/// The parsed image of one eBPF object file.
#[derive(Debug)]
pub struct Object {
    /// Name derived from the file path: basename, `.o` and `@tag` stripped.
    pub name: String,
    pub license: CString,
    /// Contents of the `critical` section, when present.
    pub critical: Option<CString>,
    pub(crate) maps: Vec<MapSpec>,
    pub(crate) programs: Vec<CodeSection>,
    /// Names by symbol table index, for resolving relocation targets.
    pub(crate) symbol_names_by_index: HashMap<usize, String>,
}

#[derive(Debug, Clone)]
pub(crate) struct MapSpec {
    pub(crate) name: String,
    pub(crate) def: bpf_map_def,
}

/// One recognized program section, ready to relocate and submit.
#[derive(Debug, Clone)]
pub(crate) struct CodeSection {
    pub(crate) prog_type: u32,
    pub(crate) expected_attach_type: u32,
    /// Section name with slashes replaced by underscores.
    pub(crate) name: String,
    pub(crate) insns: Vec<bpf_insn>,
    pub(crate) relocations: Vec<Relocation>,
    pub(crate) def: bpf_prog_def,
}

struct SectionType {
    prefix: &'static str,
    prog_type: bpf_prog_type,
    expected_attach_type: u32,
}

/// Map of section name prefixes to program types. Section names are
/// `<prefix>/<name-of-program>`, e.g. `tracepoint/sched_switch`.
const SECTION_TYPES: &[SectionType] = &[
    SectionType {
        prefix: "kprobe/",
        prog_type: bpf_prog_type::BPF_PROG_TYPE_KPROBE,
        expected_attach_type: BPF_ATTACH_TYPE_UNSPEC,
    },
    SectionType {
        prefix: "kretprobe/",
        prog_type: bpf_prog_type::BPF_PROG_TYPE_KPROBE,
        expected_attach_type: BPF_ATTACH_TYPE_UNSPEC,
    },
    SectionType {
        prefix: "perf_event/",
        prog_type: bpf_prog_type::BPF_PROG_TYPE_PERF_EVENT,
        expected_attach_type: BPF_ATTACH_TYPE_UNSPEC,
    },
    SectionType {
        prefix: "skfilter/",
        prog_type: bpf_prog_type::BPF_PROG_TYPE_SOCKET_FILTER,
        expected_attach_type: BPF_ATTACH_TYPE_UNSPEC,
    },
    SectionType {
        prefix: "tracepoint/",
        prog_type: bpf_prog_type::BPF_PROG_TYPE_TRACEPOINT,
        expected_attach_type: BPF_ATTACH_TYPE_UNSPEC,
    },
    SectionType {
        prefix: "uprobe/",
        prog_type: bpf_prog_type::BPF_PROG_TYPE_KPROBE,
        expected_attach_type: BPF_ATTACH_TYPE_UNSPEC,
    },
    SectionType {
        prefix: "uretprobe/",
        prog_type: bpf_prog_type::BPF_PROG_TYPE_KPROBE,
        expected_attach_type: BPF_ATTACH_TYPE_UNSPEC,
    },
];

const FUSE_PROG_TYPE_PATH: &str = "/sys/fs/fuse/bpf_prog_type_fuse";

/// Fuse resolves its program type at runtime from sysfs; on kernels without
/// fuse-bpf the file is absent and `fuse/` sections are suppressed.
pub(crate) fn fuse_prog_type() -> u32 {
    fs::read_to_string(FUSE_PROG_TYPE_PATH)
        .ok()
        .and_then(|contents| contents.trim().parse().ok())
        .unwrap_or(bpf_prog_type::BPF_PROG_TYPE_UNSPEC as u32)
}

pub(crate) fn get_section_type(name: &str) -> u32 {
    for snt in SECTION_TYPES {
        if name.starts_with(snt.prefix) {
            return snt.prog_type as u32;
        }
    }
    if name.starts_with("fuse/") {
        return fuse_prog_type();
    }
    bpf_prog_type::BPF_PROG_TYPE_UNSPEC as u32
}

pub(crate) fn get_expected_attach_type(name: &str) -> u32 {
    for snt in SECTION_TYPES {
        if name.starts_with(snt.prefix) {
            return snt.expected_attach_type;
        }
    }
    BPF_ATTACH_TYPE_UNSPEC
}

/// The section name prefix of a program type, for diagnostics and for the
/// reverse direction of the prefix table.
pub(crate) fn get_section_prefix(prog_type: u32) -> Option<&'static str> {
    SECTION_TYPES
        .iter()
        .find(|snt| snt.prog_type as u32 == prog_type)
        .map(|snt| snt.prefix)
}

fn is_allowed(prog_type: u32, allowed: Option<&[bpf_prog_type]>) -> bool {
    let Some(allowed) = allowed else {
        return true;
    };
    allowed.iter().any(|a| match a {
        // the unspecified type is a sentinel for the dynamic fuse type
        bpf_prog_type::BPF_PROG_TYPE_UNSPEC => prog_type == fuse_prog_type(),
        a => prog_type == *a as u32,
    })
}

impl Object {
    /// Parses `data` as a 64-bit little-endian relocatable eBPF object:
    /// license, criticality, symbol table, and the map definitions paired
    /// with their symbol names.
    ///
    /// Code sections are classified afterwards by
    /// [`Object::read_code_sections`], so that the caller can report the
    /// object before the allow-list and definition checks can reject it.
    pub(crate) fn parse(name: &str, data: &[u8]) -> Result<Object, LoadError> {
        let file = ElfFile::parse(data).map_err(ParseError::Elf)?;
        if !file.is_64() || file.endianness() != Endianness::Little {
            return Err(ParseError::UnsupportedObject.into());
        }

        let license = match file.section_by_name("license") {
            Some(section) => parse_license(section_data(&section)?)?,
            None => return Err(LoadError::MissingLicense),
        };
        let critical = read_critical(&file);

        let mut symbol_names_by_index = HashMap::new();
        for sym in file.symbols() {
            if let Ok(name) = sym.name() {
                symbol_names_by_index.insert(sym.index().0, name.to_owned());
            }
        }

        let maps = match file.section_by_name("maps") {
            Some(section) => {
                let defs: Vec<bpf_map_def> = read_defs(section_data(&section)?, "maps")?;
                let names = section_symbol_names(&file, section.index(), None)?;
                if names.len() != defs.len() {
                    return Err(ParseError::SymbolCountMismatch {
                        section: "maps",
                        defs: defs.len(),
                        symbols: names.len(),
                    }
                    .into());
                }
                names
                    .into_iter()
                    .zip(defs)
                    .map(|(name, def)| MapSpec { name, def })
                    .collect()
            }
            None => Vec::new(),
        };

        Ok(Object {
            name: name.to_owned(),
            license,
            critical,
            maps,
            programs: Vec::new(),
            symbol_names_by_index,
        })
    }

    /// Classifies the object's code sections, enforcing the allow-list and
    /// pairing each section with its program definition.
    pub(crate) fn read_code_sections(
        &mut self,
        data: &[u8],
        allowed_prog_types: Option<&[bpf_prog_type]>,
    ) -> Result<(), LoadError> {
        let file = ElfFile::parse(data).map_err(ParseError::Elf)?;

        let (prog_defs, prog_def_names): (Vec<bpf_prog_def>, Vec<String>) =
            match file.section_by_name("progs") {
                Some(section) => {
                    let defs: Vec<bpf_prog_def> = read_defs(section_data(&section)?, "progs")?;
                    let names = section_symbol_names(&file, section.index(), None)?;
                    if names.len() != defs.len() {
                        return Err(ParseError::SymbolCountMismatch {
                            section: "progs",
                            defs: defs.len(),
                            symbols: names.len(),
                        }
                        .into());
                    }
                    (defs, names)
                }
                None => (Vec::new(), Vec::new()),
            };

        let mut programs = Vec::new();
        for section in file.sections() {
            let index = section.index().0;
            let section_name = section
                .name()
                .map_err(|source| ParseError::SectionError { index, source })?;

            let prog_type = get_section_type(section_name);
            if prog_type == bpf_prog_type::BPF_PROG_TYPE_UNSPEC as u32 {
                continue;
            }
            if !is_allowed(prog_type, allowed_prog_types) {
                error!(
                    "program type {} not permitted here",
                    get_section_prefix(prog_type).unwrap_or("(dynamic)")
                );
                return Err(LoadError::DisallowedProgramType {
                    section: section_name.to_owned(),
                });
            }

            // must be read before '/' is replaced with '_'
            let expected_attach_type = get_expected_attach_type(section_name);

            let data = section
                .data()
                .map_err(|source| ParseError::SectionError { index, source })?;
            if data.is_empty() {
                continue;
            }
            let insns = copy_instructions(data)?;

            let func_names =
                section_symbol_names(&file, section.index(), Some(SymbolKind::Text))?;
            let def = func_names.first().and_then(|func| {
                let def_name = format!("{func}_def");
                prog_def_names
                    .iter()
                    .position(|n| *n == def_name)
                    .map(|i| prog_defs[i])
            });
            let Some(def) = def else {
                return Err(LoadError::MissingProgramDef {
                    section: section_name.to_owned(),
                });
            };

            let mut relocations = Vec::new();
            for (offset, rel) in section.relocations() {
                match rel.target() {
                    RelocationTarget::Symbol(sym_index) => relocations.push(Relocation {
                        offset,
                        symbol_index: sym_index.0,
                    }),
                    _ => return Err(ParseError::UnsupportedRelocationTarget.into()),
                }
            }

            debug!("loaded code section {index} ({section_name})");
            programs.push(CodeSection {
                prog_type,
                expected_attach_type,
                name: section_name.replace('/', "_"),
                insns,
                relocations,
                def,
            });
        }

        self.programs = programs;
        Ok(())
    }
}

/// Whether the object carries a `critical` section, and its label. Read
/// leniently: criticality must be decided even for objects that fail to
/// load later.
pub(crate) fn read_critical_section(data: &[u8]) -> Option<CString> {
    let file = ElfFile::parse(data).ok()?;
    read_critical(&file)
}

fn read_critical(file: &ElfFile<'_>) -> Option<CString> {
    file.section_by_name("critical")
        .and_then(|section| section.data().ok())
        .and_then(|data| CStr::from_bytes_until_nul(data).ok())
        .map(CStr::to_owned)
}

/// Decodes the first 4 bytes of the named section as a little-endian u32,
/// falling back to `default` when the section is absent or too short. Used
/// for optional metadata sections.
pub fn read_section_u32(data: &[u8], name: &str, default: u32) -> u32 {
    let Ok(file) = ElfFile::parse(data) else {
        return default;
    };
    let Some(section) = file.section_by_name(name) else {
        debug!("couldn't find section {name} (defaulting to {default} [{default:#x}])");
        return default;
    };
    match section.data() {
        Ok(bytes) if bytes.len() >= 4 => {
            // alignment usually pads the section beyond 4 bytes
            let value = u32::from_le_bytes(bytes[..4].try_into().unwrap());
            debug!("section {name} value is {value} [{value:#x}]");
            value
        }
        _ => {
            error!("section {name} too short (defaulting to {default} [{default:#x}])");
            default
        }
    }
}

fn section_data<'data>(
    section: &object::read::Section<'data, '_>,
) -> Result<&'data [u8], ParseError> {
    section.data().map_err(|source| ParseError::SectionError {
        index: section.index().0,
        source,
    })
}

/// Names of the symbols defined in the given section, in ascending
/// `st_value` order. This order pairs definition records with their names.
fn section_symbol_names(
    file: &ElfFile<'_>,
    section_index: SectionIndex,
    kind: Option<SymbolKind>,
) -> Result<Vec<String>, ParseError> {
    let mut symbols = file
        .symbols()
        .filter(|sym| {
            sym.section_index() == Some(section_index)
                && kind.map_or(true, |kind| sym.kind() == kind)
        })
        .collect::<Vec<_>>();
    symbols.sort_by_key(|sym| sym.address());

    symbols
        .iter()
        .map(|sym| sym.name().map(String::from).map_err(ParseError::Elf))
        .collect()
}

fn read_defs<T: Copy>(data: &[u8], section: &'static str) -> Result<Vec<T>, ParseError> {
    let size = mem::size_of::<T>();
    if data.len() % size != 0 {
        error!(
            "improperly sized {section} section: {} % {size} != 0",
            data.len()
        );
        return Err(ParseError::InvalidDefinitionSize { section });
    }
    Ok(data
        .chunks_exact(size)
        .map(|chunk| unsafe { ptr::read_unaligned(chunk.as_ptr() as *const T) })
        .collect())
}

fn copy_instructions(data: &[u8]) -> Result<Vec<bpf_insn>, ParseError> {
    if data.len() % mem::size_of::<bpf_insn>() != 0 {
        return Err(ParseError::InvalidProgramCode);
    }
    Ok(data
        .chunks_exact(mem::size_of::<bpf_insn>())
        .map(|chunk| unsafe { ptr::read_unaligned(chunk.as_ptr() as *const bpf_insn) })
        .collect())
}

fn parse_license(data: &[u8]) -> Result<CString, ParseError> {
    if data.len() < 2 {
        return Err(ParseError::InvalidLicense {
            data: data.to_vec(),
        });
    }
    if data[data.len() - 1] != 0 {
        return Err(ParseError::MissingLicenseNullTerminator {
            data: data.to_vec(),
        });
    }

    Ok(CStr::from_bytes_with_nul(data)
        .map_err(|_| ParseError::InvalidLicense {
            data: data.to_vec(),
        })?
        .to_owned())
}

/// An error parsing the ELF structure of an object file.
#[derive(Debug, Error)]
pub enum ParseError {
    #[error("error parsing ELF data")]
    Elf(#[from] object::read::Error),

    #[error("object is not a 64-bit little-endian relocatable")]
    UnsupportedObject,

    #[error("error parsing section with index {index}")]
    SectionError {
        index: usize,
        #[source]
        source: object::read::Error,
    },

    #[error("invalid license `{data:?}`: missing NUL terminator")]
    MissingLicenseNullTerminator { data: Vec<u8> },

    #[error("invalid license `{data:?}`")]
    InvalidLicense { data: Vec<u8> },

    #[error("section `{section}` size is not a multiple of the definition record size")]
    InvalidDefinitionSize { section: &'static str },

    #[error("section `{section}` has {defs} definition records but {symbols} symbols")]
    SymbolCountMismatch {
        section: &'static str,
        defs: usize,
        symbols: usize,
    },

    #[error("invalid program code")]
    InvalidProgramCode,

    #[error("unsupported relocation target")]
    UnsupportedRelocationTarget,
}
