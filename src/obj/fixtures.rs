//! Hand-assembled 64-bit little-endian ELF relocatables for tests.
//!
//! Images are emitted byte by byte so that tests control the exact section,
//! symbol and relocation layout the loader sees.

use std::{mem, slice};

pub(crate) const STT_OBJECT: u8 = 1;
pub(crate) const STT_FUNC: u8 = 2;

const SHT_PROGBITS: u32 = 1;
const SHT_SYMTAB: u32 = 2;
const SHT_STRTAB: u32 = 3;
const SHT_REL: u32 = 9;

const EM_BPF: u16 = 247;

pub(crate) fn bytes_of<T>(val: &T) -> &[u8] {
    let size = mem::size_of::<T>();
    unsafe { slice::from_raw_parts(slice::from_ref(val).as_ptr().cast(), size) }
}

struct Section {
    name: String,
    data: Vec<u8>,
}

struct Sym {
    name: String,
    section: String,
    value: u64,
    size: u64,
    stt: u8,
}

struct Reloc {
    section: String,
    offset: u64,
    symbol: String,
}

#[derive(Default)]
pub(crate) struct ElfBuilder {
    sections: Vec<Section>,
    symbols: Vec<Sym>,
    relocations: Vec<Reloc>,
}

impl ElfBuilder {
    pub(crate) fn new() -> ElfBuilder {
        ElfBuilder::default()
    }

    pub(crate) fn section(mut self, name: &str, data: &[u8]) -> ElfBuilder {
        self.sections.push(Section {
            name: name.to_owned(),
            data: data.to_vec(),
        });
        self
    }

    pub(crate) fn symbol(
        mut self,
        name: &str,
        section: &str,
        value: u64,
        size: u64,
        stt: u8,
    ) -> ElfBuilder {
        self.symbols.push(Sym {
            name: name.to_owned(),
            section: section.to_owned(),
            value,
            size,
            stt,
        });
        self
    }

    pub(crate) fn rel(mut self, section: &str, offset: u64, symbol: &str) -> ElfBuilder {
        self.relocations.push(Reloc {
            section: section.to_owned(),
            offset,
            symbol: symbol.to_owned(),
        });
        self
    }

    pub(crate) fn build(self) -> Vec<u8> {
        // Section index order: null, user sections, .rel sections, .symtab,
        // .strtab, .shstrtab.
        let user_count = self.sections.len();
        let rel_targets: Vec<String> = {
            let mut targets = Vec::new();
            for reloc in &self.relocations {
                if !targets.contains(&reloc.section) {
                    targets.push(reloc.section.clone());
                }
            }
            targets
        };
        let symtab_index = 1 + user_count + rel_targets.len();
        let strtab_index = symtab_index + 1;
        let shstrtab_index = strtab_index + 1;
        let section_count = shstrtab_index + 1;

        let section_index = |name: &str| -> u16 {
            1 + self
                .sections
                .iter()
                .position(|s| s.name == name)
                .unwrap_or_else(|| panic!("unknown section {name}")) as u16
        };
        // symbol table index: the null symbol comes first
        let symbol_index = |name: &str| -> u64 {
            1 + self
                .symbols
                .iter()
                .position(|s| s.name == name)
                .unwrap_or_else(|| panic!("unknown symbol {name}")) as u64
        };

        // string table for symbol names
        let mut strtab = vec![0u8];
        let mut sym_name_offsets = Vec::new();
        for sym in &self.symbols {
            sym_name_offsets.push(strtab.len() as u32);
            strtab.extend_from_slice(sym.name.as_bytes());
            strtab.push(0);
        }

        // .symtab data: null entry then one per symbol
        let mut symtab = vec![0u8; 24];
        for (sym, name_offset) in self.symbols.iter().zip(&sym_name_offsets) {
            push_u32(&mut symtab, *name_offset);
            symtab.push((1 << 4) | sym.stt); // STB_GLOBAL
            symtab.push(0);
            push_u16(&mut symtab, section_index(&sym.section));
            push_u64(&mut symtab, sym.value);
            push_u64(&mut symtab, sym.size);
        }

        // .rel<name> data
        let mut rel_datas = Vec::new();
        for target in &rel_targets {
            let mut data = Vec::new();
            for reloc in self.relocations.iter().filter(|r| r.section == *target) {
                push_u64(&mut data, reloc.offset);
                // R_BPF_64_64
                push_u64(&mut data, symbol_index(&reloc.symbol) << 32 | 1);
            }
            rel_datas.push(data);
        }

        // section header string table and per-section name offsets
        let mut shstrtab = vec![0u8];
        let name_offset = |shstrtab: &mut Vec<u8>, name: &str| -> u32 {
            let offset = shstrtab.len() as u32;
            shstrtab.extend_from_slice(name.as_bytes());
            shstrtab.push(0);
            offset
        };
        let user_name_offsets: Vec<u32> = self
            .sections
            .iter()
            .map(|s| name_offset(&mut shstrtab, &s.name))
            .collect();
        let rel_name_offsets: Vec<u32> = rel_targets
            .iter()
            .map(|t| name_offset(&mut shstrtab, &format!(".rel{t}")))
            .collect();
        let symtab_name = name_offset(&mut shstrtab, ".symtab");
        let strtab_name = name_offset(&mut shstrtab, ".strtab");
        let shstrtab_name = name_offset(&mut shstrtab, ".shstrtab");

        // lay out section data after the ELF header, 8-aligned
        struct Header {
            name: u32,
            sh_type: u32,
            offset: u64,
            size: u64,
            link: u32,
            info: u32,
            entsize: u64,
        }
        let mut image = vec![0u8; 64];
        let mut headers = vec![Header {
            name: 0,
            sh_type: 0,
            offset: 0,
            size: 0,
            link: 0,
            info: 0,
            entsize: 0,
        }];
        let place = |image: &mut Vec<u8>, data: &[u8]| -> u64 {
            while image.len() % 8 != 0 {
                image.push(0);
            }
            let offset = image.len() as u64;
            image.extend_from_slice(data);
            offset
        };

        for (section, name) in self.sections.iter().zip(&user_name_offsets) {
            let offset = place(&mut image, &section.data);
            headers.push(Header {
                name: *name,
                sh_type: SHT_PROGBITS,
                offset,
                size: section.data.len() as u64,
                link: 0,
                info: 0,
                entsize: 0,
            });
        }
        for ((target, data), name) in rel_targets.iter().zip(&rel_datas).zip(&rel_name_offsets) {
            let offset = place(&mut image, data);
            headers.push(Header {
                name: *name,
                sh_type: SHT_REL,
                offset,
                size: data.len() as u64,
                link: symtab_index as u32,
                info: section_index(target) as u32,
                entsize: 16,
            });
        }
        let offset = place(&mut image, &symtab);
        headers.push(Header {
            name: symtab_name,
            sh_type: SHT_SYMTAB,
            offset,
            size: symtab.len() as u64,
            link: strtab_index as u32,
            info: 1,
            entsize: 24,
        });
        let offset = place(&mut image, &strtab);
        headers.push(Header {
            name: strtab_name,
            sh_type: SHT_STRTAB,
            offset,
            size: strtab.len() as u64,
            link: 0,
            info: 0,
            entsize: 0,
        });
        let offset = place(&mut image, &shstrtab);
        headers.push(Header {
            name: shstrtab_name,
            sh_type: SHT_STRTAB,
            offset,
            size: shstrtab.len() as u64,
            link: 0,
            info: 0,
            entsize: 0,
        });

        while image.len() % 8 != 0 {
            image.push(0);
        }
        let shoff = image.len() as u64;
        for header in &headers {
            push_u32(&mut image, header.name);
            push_u32(&mut image, header.sh_type);
            push_u64(&mut image, 0); // sh_flags
            push_u64(&mut image, 0); // sh_addr
            push_u64(&mut image, header.offset);
            push_u64(&mut image, header.size);
            push_u32(&mut image, header.link);
            push_u32(&mut image, header.info);
            push_u64(&mut image, 1); // sh_addralign
            push_u64(&mut image, header.entsize);
        }

        // ELF header
        image[0..4].copy_from_slice(&[0x7f, b'E', b'L', b'F']);
        image[4] = 2; // ELFCLASS64
        image[5] = 1; // ELFDATA2LSB
        image[6] = 1; // EV_CURRENT
        image[16..18].copy_from_slice(&1u16.to_le_bytes()); // ET_REL
        image[18..20].copy_from_slice(&EM_BPF.to_le_bytes());
        image[20..24].copy_from_slice(&1u32.to_le_bytes());
        image[40..48].copy_from_slice(&shoff.to_le_bytes());
        image[52..54].copy_from_slice(&64u16.to_le_bytes()); // e_ehsize
        image[58..60].copy_from_slice(&64u16.to_le_bytes()); // e_shentsize
        image[60..62].copy_from_slice(&(section_count as u16).to_le_bytes());
        image[62..64].copy_from_slice(&(shstrtab_index as u16).to_le_bytes());

        image
    }
}

fn push_u16(buf: &mut Vec<u8>, val: u16) {
    buf.extend_from_slice(&val.to_le_bytes());
}

fn push_u32(buf: &mut Vec<u8>, val: u32) {
    buf.extend_from_slice(&val.to_le_bytes());
}

fn push_u64(buf: &mut Vec<u8>, val: u64) {
    buf.extend_from_slice(&val.to_le_bytes());
}
