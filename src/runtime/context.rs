//! The context record: one fixed-layout arena holding every memory region
//! the generated code touches.
//!
//! Generated code addresses the arena through the `CTX` base register plus
//! constant field offsets, so the layout must be computed identically by the
//! compiler (for emission) and the machine (for execution). Only offsets in
//! the prefix before `fmt_base` are ever baked into instructions; the
//! regions after it may shift when the constant-data size is known at link
//! time.

use crate::config::CompilerOptions;
use crate::instr::regs::NUM_REGS;
use crate::runtime::layout::{self, Word};

/// Slots in the recently-accessed-globals ring buffer
/// (`keep_variable_stack`).
pub const VARSTACK_SLOTS: u64 = 32;

/// Bytes in the scratch buffer used by foreign string returns and numeric
/// formatting.
pub const SCRATCH_BYTES: u64 = 512;

/// Byte offsets of every context field and region.
#[derive(Debug, Clone)]
pub struct ContextLayout {
    /// Saved general-purpose registers, one word per machine register.
    pub saved_regs: u64,
    pub alloc_ptr: u64,
    pub alloc_limit: u64,
    pub from_start: u64,
    pub from_end: u64,
    pub to_start: u64,
    pub to_end: u64,
    pub stack_top: u64,
    pub stack_save: u64,
    pub error_handler: u64,
    pub globals_end: u64,
    pub varstack_index: u64,
    pub locals: u64,
    pub globals: u64,
    pub varstack: u64,
    pub scratch: u64,
    /// Constant-data region (literal templates, format strings).
    pub fmt_base: u64,
    pub stack_base: u64,
    pub stack_end: u64,
    pub heap0: u64,
    pub heap1: u64,

    pub semispace_bytes: u64,
    pub locals_count: u32,
    pub globals_count: u32,
    pub total_bytes: u64,
}

impl ContextLayout {
    pub fn new(options: &CompilerOptions, data_bytes: u64) -> ContextLayout {
        let semispace = options.heap_semispace_bytes & !7;
        let mut off = (NUM_REGS as u64) * 8;
        let mut word = |o: &mut u64| {
            let at = *o;
            *o += 8;
            at
        };

        let alloc_ptr = word(&mut off);
        let alloc_limit = word(&mut off);
        let from_start = word(&mut off);
        let from_end = word(&mut off);
        let to_start = word(&mut off);
        let to_end = word(&mut off);
        let stack_top = word(&mut off);
        let stack_save = word(&mut off);
        let error_handler = word(&mut off);
        let globals_end = word(&mut off);
        let varstack_index = word(&mut off);

        let locals = off;
        off += (options.locals_count as u64) * 8;
        let globals = off;
        off += (options.globals_count as u64) * 8;
        let varstack = off;
        off += VARSTACK_SLOTS * 8;
        let scratch = off;
        off += SCRATCH_BYTES;
        let fmt_base = off;
        off += (data_bytes + 7) & !7;
        let stack_base = off;
        off += options.stack_bytes & !7;
        let stack_end = off;
        let heap0 = off;
        off += semispace;
        let heap1 = off;
        off += semispace;

        ContextLayout {
            saved_regs: 0,
            alloc_ptr,
            alloc_limit,
            from_start,
            from_end,
            to_start,
            to_end,
            stack_top,
            stack_save,
            error_handler,
            globals_end,
            varstack_index,
            locals,
            globals,
            varstack,
            scratch,
            fmt_base,
            stack_base,
            stack_end,
            heap0,
            heap1,
            semispace_bytes: semispace,
            locals_count: options.locals_count,
            globals_count: options.globals_count,
            total_bytes: off,
        }
    }

    /// Allocation-limit safety margin below the semispace end.
    pub fn heap_reserve_bytes(&self) -> u64 {
        self.semispace_bytes / layout::HEAP_RESERVE_DIVISOR
    }

    pub fn local_offset(&self, slot: u32) -> u64 {
        debug_assert!(slot < self.locals_count);
        self.locals + (slot as u64) * 8
    }

    pub fn global_offset(&self, slot: u32) -> u64 {
        debug_assert!(slot < self.globals_count);
        self.globals + (slot as u64) * 8
    }
}

/// The per-machine context: the arena plus its layout.
pub struct Context {
    pub mem: Vec<u8>,
    pub layout: ContextLayout,
}

impl Context {
    /// Build a fresh context. `globals_image` seeds the leading global
    /// slots (reserved sentinels for compile-time defines); the rest are
    /// unallocated.
    pub fn new(layout: ContextLayout, globals_image: &[u64]) -> Context {
        let mut ctx = Context {
            mem: vec![0u8; layout.total_bytes as usize],
            layout,
        };
        let l = ctx.layout.clone();

        ctx.write_u64(l.from_start, l.heap0);
        ctx.write_u64(l.from_end, l.heap0 + l.semispace_bytes);
        ctx.write_u64(l.to_start, l.heap1);
        ctx.write_u64(l.to_end, l.heap1 + l.semispace_bytes);
        ctx.write_u64(l.alloc_ptr, l.heap0);
        ctx.write_u64(l.alloc_limit, l.heap0 + l.semispace_bytes - l.heap_reserve_bytes());
        ctx.write_u64(l.stack_top, l.stack_base);
        ctx.write_u64(l.stack_save, l.stack_base);

        for slot in 0..l.locals_count {
            ctx.write_u64(l.local_offset(slot), Word::VOID.0);
        }
        for slot in 0..l.globals_count {
            ctx.write_u64(l.global_offset(slot), Word::UNALLOCATED.0);
        }
        for (slot, &init) in globals_image.iter().enumerate() {
            ctx.write_u64(l.global_offset(slot as u32), init);
        }
        ctx.write_u64(l.globals_end, l.globals + (globals_image.len() as u64) * 8);

        ctx
    }

    pub fn read_u64(&self, addr: u64) -> u64 {
        let at = addr as usize;
        let bytes: [u8; 8] = self.mem[at..at + 8].try_into().expect("aligned u64 read");
        u64::from_le_bytes(bytes)
    }

    pub fn write_u64(&mut self, addr: u64, value: u64) {
        let at = addr as usize;
        self.mem[at..at + 8].copy_from_slice(&value.to_le_bytes());
    }

    pub fn alloc_ptr(&self) -> u64 {
        self.read_u64(self.layout.alloc_ptr)
    }

    pub fn alloc_limit(&self) -> u64 {
        self.read_u64(self.layout.alloc_limit)
    }

    pub fn from_start(&self) -> u64 {
        self.read_u64(self.layout.from_start)
    }

    pub fn from_end(&self) -> u64 {
        self.read_u64(self.layout.from_end)
    }

    pub fn stack_top(&self) -> u64 {
        self.read_u64(self.layout.stack_top)
    }

    pub fn read_global(&self, slot: u32) -> Word {
        Word(self.read_u64(self.layout.global_offset(slot)))
    }

    pub fn read_local(&self, slot: u32) -> Word {
        Word(self.read_u64(self.layout.local_offset(slot)))
    }

    /// Read a block's header word.
    pub fn block_header(&self, ptr: Word) -> u64 {
        debug_assert!(ptr.is_block_ptr());
        self.read_u64(ptr.block_addr())
    }

    /// Read payload word `index` of a block.
    pub fn block_field(&self, ptr: Word, index: u64) -> Word {
        Word(self.read_u64(ptr.block_addr() + 8 * (index + 1)))
    }

    /// Decode a String or Symbol block's payload as a Rust string.
    pub fn block_text(&self, ptr: Word) -> String {
        let count = layout::header_count(self.block_header(ptr));
        (0..count)
            .filter_map(|i| char::from_u32(self.block_field(ptr, i).0 as u32))
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_layout_regions_are_disjoint_and_ordered() {
        let options = CompilerOptions::default();
        let l = ContextLayout::new(&options, 40);
        assert!(l.locals < l.globals);
        assert!(l.globals < l.varstack);
        assert!(l.varstack < l.scratch);
        assert!(l.scratch < l.fmt_base);
        assert!(l.fmt_base < l.stack_base);
        assert!(l.stack_base < l.heap0);
        assert_eq!(l.heap1 - l.heap0, l.semispace_bytes);
        assert_eq!(l.total_bytes, l.heap1 + l.semispace_bytes);
        assert_eq!(l.total_bytes % 8, 0);
    }

    #[test]
    fn test_new_context_heap_words() {
        let options = CompilerOptions::default();
        let l = ContextLayout::new(&options, 0);
        let ctx = Context::new(l.clone(), &[]);
        assert_eq!(ctx.alloc_ptr(), l.heap0);
        assert_eq!(ctx.from_start(), l.heap0);
        assert_eq!(ctx.from_end(), l.heap0 + l.semispace_bytes);
        assert_eq!(
            ctx.alloc_limit(),
            l.heap0 + l.semispace_bytes - l.heap_reserve_bytes()
        );
        assert_eq!(ctx.stack_top(), l.stack_base);
    }

    #[test]
    fn test_globals_seeded_with_sentinels() {
        let options = CompilerOptions::default();
        let l = ContextLayout::new(&options, 0);
        let ctx = Context::new(l, &[Word::RESERVED.0, Word::RESERVED.0]);
        assert_eq!(ctx.read_global(0), Word::RESERVED);
        assert_eq!(ctx.read_global(1), Word::RESERVED);
        assert_eq!(ctx.read_global(2), Word::UNALLOCATED);
        assert_eq!(
            ctx.read_u64(ctx.layout.globals_end),
            ctx.layout.globals + 16
        );
    }

    #[test]
    fn test_locals_initialized_to_void() {
        let options = CompilerOptions::default();
        let l = ContextLayout::new(&options, 0);
        let ctx = Context::new(l, &[]);
        assert_eq!(ctx.read_local(0), Word::VOID);
        assert_eq!(ctx.read_local(options.locals_count - 1), Word::VOID);
    }
}
