//! Patching of map references in program instruction streams.

use std::mem;

use log::{debug, error};

use crate::{
    bindings::{bpf_insn, BPF_DW, BPF_IMM, BPF_LD, BPF_PSEUDO_MAP_FD},
    obj::Object,
};

pub(crate) const INS_SIZE: usize = mem::size_of::<bpf_insn>();

/// One relocation entry of a code section.
#[derive(Debug, Copy, Clone)]
pub(crate) struct Relocation {
    /// Byte offset of the instruction to be relocated.
    pub(crate) offset: u64,
    /// Index of the symbol to relocate to.
    pub(crate) symbol_index: usize,
}

impl Object {
    /// Rewrites map references in every program, patching the 64-bit
    /// immediate load named by each relocation entry with the fd of the
    /// matching map. `map_fds[i]` pairs with `self.maps[i]`; a gated map
    /// contributes the invalid fd `-1`.
    ///
    /// Relocations against symbols that are not maps are left alone; symbols
    /// for other sections may legitimately share the symbol table.
    pub(crate) fn relocate_maps(&mut self, map_fds: &[i32]) {
        let maps = &self.maps;
        let symbol_names = &self.symbol_names_by_index;

        for cs in self.programs.iter_mut() {
            for rel in &cs.relocations {
                let Some(sym_name) = symbol_names.get(&rel.symbol_index) else {
                    debug!(
                        "relocation against unknown symbol index {} ignored",
                        rel.symbol_index
                    );
                    continue;
                };

                let Some(map_index) = maps.iter().position(|m| m.name == *sym_name) else {
                    continue;
                };

                let ins_index = rel.offset as usize / INS_SIZE;
                let Some(insn) = cs.insns.get_mut(ins_index) else {
                    error!(
                        "relocation offset {} out of bounds in section {}",
                        rel.offset, cs.name
                    );
                    continue;
                };
                if insn.code != (BPF_LD | BPF_IMM | BPF_DW) {
                    error!("invalid relo for insn {ins_index}: code {:#x}", insn.code);
                    continue;
                }

                insn.imm = map_fds[map_index];
                insn.set_src_reg(BPF_PSEUDO_MAP_FD);
            }
        }
    }
}
