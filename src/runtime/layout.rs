//! Tagged-value encoding and heap block layout.
//!
//! Every Scheme value is a 64-bit word. The low bits select the variant:
//!
//! - bit 0 == 0: fixnum, value in bits 1..64 (signed, shifted left by one)
//! - low 3 bits == 0b001: block pointer, address in bits 3..64 (8-aligned)
//! - low 3 bits == 0b011: singleton immediate (`#f`, `#t`, `'()`, eof, ...)
//!   or an error value (immediate index >= [`ERROR_BASE`])
//! - low 3 bits == 0b101: character, code point in bits 3..35
//! - low 3 bits == 0b111: primitive procedure, entry address in bits 3..64
//!
//! Heap blocks start with a one-word header encoding the payload word count
//! and a block type. During collection a from-space header is overwritten
//! with a forwarding word `new_address | 0b010`; the 0b010 pattern never
//! occurs in a live header or in a tagged value, so it unambiguously marks a
//! forwarded block.

/// A tagged 64-bit Scheme value.
#[derive(Clone, Copy, PartialEq, Eq, Hash)]
#[repr(transparent)]
pub struct Word(pub u64);

pub const TAG_MASK: u64 = 0b111;
pub const PTR_TAG: u64 = 0b001;
pub const IMM_TAG: u64 = 0b011;
pub const CHAR_TAG: u64 = 0b101;
pub const PRIM_TAG: u64 = 0b111;
/// Low bits of a forwarding word. Only ever found where a block header used
/// to be, never in a root or payload slot.
pub const FORWARD_TAG: u64 = 0b010;

/// Singleton immediates, encoded `(index << 3) | IMM_TAG`.
const IMM_FALSE: u64 = 0;
const IMM_TRUE: u64 = 1;
const IMM_NIL: u64 = 2;
const IMM_EOF: u64 = 3;
const IMM_UNALLOCATED: u64 = 4;
const IMM_VOID: u64 = 5;
const IMM_RESERVED: u64 = 6;

/// Immediate indices at or above this encode runtime error codes.
pub const ERROR_BASE: u64 = 256;

/// Runtime error codes carried in error-tagged immediates and dispatched to
/// the single runtime error handler.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum ErrorCode {
    BadArgCount = 1,
    BadArgType = 2,
    IndexOutOfBounds = 3,
    DivisionByZero = 4,
    HeapOverflow = 5,
    HeapFull = 6,
    NotAProcedure = 7,
    InvalidTermination = 8,
    ForeignContract = 9,
}

impl ErrorCode {
    pub fn from_raw(raw: u64) -> Option<ErrorCode> {
        Some(match raw {
            1 => ErrorCode::BadArgCount,
            2 => ErrorCode::BadArgType,
            3 => ErrorCode::IndexOutOfBounds,
            4 => ErrorCode::DivisionByZero,
            5 => ErrorCode::HeapOverflow,
            6 => ErrorCode::HeapFull,
            7 => ErrorCode::NotAProcedure,
            8 => ErrorCode::InvalidTermination,
            9 => ErrorCode::ForeignContract,
            _ => return None,
        })
    }

    pub fn describe(self) -> &'static str {
        match self {
            ErrorCode::BadArgCount => "wrong number of arguments",
            ErrorCode::BadArgType => "argument has the wrong type",
            ErrorCode::IndexOutOfBounds => "index out of bounds",
            ErrorCode::DivisionByZero => "division by zero",
            ErrorCode::HeapOverflow => "heap overflow before allocation",
            ErrorCode::HeapFull => "heap full after collection",
            ErrorCode::NotAProcedure => "operator is not a procedure",
            ErrorCode::InvalidTermination => "invalid program termination",
            ErrorCode::ForeignContract => "foreign call contract violation",
        }
    }
}

impl Word {
    pub const FALSE: Word = Word((IMM_FALSE << 3) | IMM_TAG);
    pub const TRUE: Word = Word((IMM_TRUE << 3) | IMM_TAG);
    pub const NIL: Word = Word((IMM_NIL << 3) | IMM_TAG);
    pub const EOF: Word = Word((IMM_EOF << 3) | IMM_TAG);
    /// A global slot that has never been allocated. The collector skips it.
    pub const UNALLOCATED: Word = Word((IMM_UNALLOCATED << 3) | IMM_TAG);
    pub const VOID: Word = Word((IMM_VOID << 3) | IMM_TAG);
    /// A global slot allocated by a `define` but not yet assigned. Distinct
    /// from [`Word::UNALLOCATED`] so the collector can scan it safely.
    pub const RESERVED: Word = Word((IMM_RESERVED << 3) | IMM_TAG);

    pub const fn fixnum(n: i64) -> Word {
        Word((n as u64) << 1)
    }

    pub const fn boolean(b: bool) -> Word {
        if b { Word::TRUE } else { Word::FALSE }
    }

    pub const fn character(c: char) -> Word {
        Word(((c as u64) << 3) | CHAR_TAG)
    }

    pub const fn block_ptr(addr: u64) -> Word {
        debug_assert!(addr & TAG_MASK == 0);
        Word(addr | PTR_TAG)
    }

    pub const fn primitive(entry: u64) -> Word {
        Word((entry << 3) | PRIM_TAG)
    }

    pub const fn error(code: ErrorCode) -> Word {
        Word(((ERROR_BASE + code as u64) << 3) | IMM_TAG)
    }

    pub const fn is_fixnum(self) -> bool {
        self.0 & 1 == 0
    }

    pub const fn as_fixnum(self) -> i64 {
        (self.0 as i64) >> 1
    }

    pub const fn is_block_ptr(self) -> bool {
        self.0 & TAG_MASK == PTR_TAG
    }

    pub const fn block_addr(self) -> u64 {
        self.0 & !TAG_MASK
    }

    pub const fn is_char(self) -> bool {
        self.0 & TAG_MASK == CHAR_TAG
    }

    pub fn as_char(self) -> Option<char> {
        char::from_u32((self.0 >> 3) as u32)
    }

    pub const fn is_primitive(self) -> bool {
        self.0 & TAG_MASK == PRIM_TAG
    }

    pub const fn primitive_entry(self) -> u64 {
        self.0 >> 3
    }

    /// Decode an error immediate, if this word is one.
    pub fn error_code(self) -> Option<ErrorCode> {
        if self.0 & TAG_MASK == IMM_TAG {
            let index = self.0 >> 3;
            if index >= ERROR_BASE {
                return ErrorCode::from_raw(index - ERROR_BASE);
            }
        }
        None
    }
}

impl std::fmt::Debug for Word {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        if self.is_fixnum() {
            write!(f, "Fixnum({})", self.as_fixnum())
        } else if *self == Word::FALSE {
            write!(f, "#f")
        } else if *self == Word::TRUE {
            write!(f, "#t")
        } else if *self == Word::NIL {
            write!(f, "()")
        } else if *self == Word::VOID {
            write!(f, "#void")
        } else if *self == Word::EOF {
            write!(f, "#eof")
        } else if *self == Word::UNALLOCATED {
            write!(f, "#unallocated")
        } else if *self == Word::RESERVED {
            write!(f, "#reserved")
        } else if let Some(code) = self.error_code() {
            write!(f, "Error({:?})", code)
        } else if self.is_char() {
            write!(f, "Char({:?})", self.as_char())
        } else if self.is_block_ptr() {
            write!(f, "Block@{:#x}", self.block_addr())
        } else if self.is_primitive() {
            write!(f, "Prim@{:#x}", self.primitive_entry())
        } else {
            write!(f, "Word({:#x})", self.0)
        }
    }
}

// =============================================================================
// Block headers
// =============================================================================
//
// +--------------------------+------------------+--------+
// | payload word count       | block type (5)   | 0b000  |
// | bits 8..64               | bits 3..8        | low 3  |
// +--------------------------+------------------+--------+
//
// Forwarded block: `to_space_address | 0b010` in place of the header.

const HEADER_COUNT_SHIFT: u32 = 8;
const HEADER_TYPE_SHIFT: u32 = 3;
const HEADER_TYPE_MASK: u64 = 0b11111 << HEADER_TYPE_SHIFT;

/// Heap block types. The value doubles as the tag stored in block headers.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum BlockType {
    Flonum = 0,
    Pair = 1,
    Vector = 2,
    String = 3,
    Symbol = 4,
    Closure = 5,
    Port = 6,
    Promise = 7,
}

impl BlockType {
    pub fn from_bits(bits: u64) -> BlockType {
        match bits {
            0 => BlockType::Flonum,
            1 => BlockType::Pair,
            2 => BlockType::Vector,
            3 => BlockType::String,
            4 => BlockType::Symbol,
            5 => BlockType::Closure,
            6 => BlockType::Port,
            _ => BlockType::Promise,
        }
    }

    /// Whether the payload words are tagged values the collector must trace.
    /// Closure payloads are traced from word 1; word 0 is a code address.
    pub fn is_traced(self) -> bool {
        matches!(
            self,
            BlockType::Pair | BlockType::Vector | BlockType::Closure | BlockType::Promise
        )
    }
}

/// Encode a block header from payload word count and type.
pub const fn encode_header(count: u64, ty: BlockType) -> u64 {
    (count << HEADER_COUNT_SHIFT) | ((ty as u64) << HEADER_TYPE_SHIFT)
}

/// Decode the payload word count from a header word.
pub const fn header_count(header: u64) -> u64 {
    header >> HEADER_COUNT_SHIFT
}

/// Decode the block type from a header word.
pub fn header_type(header: u64) -> BlockType {
    BlockType::from_bits((header & HEADER_TYPE_MASK) >> HEADER_TYPE_SHIFT)
}

/// Whether a header slot has been replaced by a forwarding word.
pub const fn is_forwarded(header: u64) -> bool {
    header & TAG_MASK == FORWARD_TAG
}

/// The to-space address a forwarding word points at.
pub const fn forward_target(header: u64) -> u64 {
    header & !TAG_MASK
}

/// Encode a forwarding word.
pub const fn encode_forward(to_addr: u64) -> u64 {
    to_addr | FORWARD_TAG
}

/// Total block size in bytes (header + payload).
pub const fn block_size_bytes(count: u64) -> u64 {
    8 * (count + 1)
}

/// The fraction of a semispace reserved below its end as the allocation
/// limit safety margin.
pub const HEAP_RESERVE_DIVISOR: u64 = 8;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_fixnum_round_trip() {
        for n in [0i64, 1, -1, 42, -42, i64::MAX >> 1, i64::MIN >> 1] {
            let w = Word::fixnum(n);
            assert!(w.is_fixnum());
            assert_eq!(w.as_fixnum(), n);
        }
    }

    #[test]
    fn test_fixnum_order_preserved_when_tagged() {
        // Signed comparison on the tagged representation must agree with the
        // comparison on the untagged values; the code generator relies on it.
        let pairs = [(-5i64, 3i64), (0, 1), (-100, -99), (7, 7)];
        for (a, b) in pairs {
            let (wa, wb) = (Word::fixnum(a).0 as i64, Word::fixnum(b).0 as i64);
            assert_eq!(a.cmp(&b), wa.cmp(&wb));
        }
    }

    #[test]
    fn test_immediates_are_distinct() {
        let all = [
            Word::FALSE,
            Word::TRUE,
            Word::NIL,
            Word::EOF,
            Word::UNALLOCATED,
            Word::VOID,
            Word::RESERVED,
        ];
        for (i, a) in all.iter().enumerate() {
            assert!(!a.is_fixnum());
            assert!(!a.is_block_ptr());
            for b in &all[i + 1..] {
                assert_ne!(a, b);
            }
        }
    }

    #[test]
    fn test_char_encoding() {
        let w = Word::character('λ');
        assert!(w.is_char());
        assert_eq!(w.as_char(), Some('λ'));
        assert!(!w.is_fixnum());
    }

    #[test]
    fn test_block_ptr_tagging() {
        let w = Word::block_ptr(0x1000);
        assert!(w.is_block_ptr());
        assert_eq!(w.block_addr(), 0x1000);
    }

    #[test]
    fn test_error_words() {
        let w = Word::error(ErrorCode::IndexOutOfBounds);
        assert_eq!(w.error_code(), Some(ErrorCode::IndexOutOfBounds));
        assert_eq!(Word::FALSE.error_code(), None);
        assert_eq!(Word::fixnum(12345).error_code(), None);
    }

    #[test]
    fn test_header_round_trip() {
        let h = encode_header(17, BlockType::Vector);
        assert_eq!(header_count(h), 17);
        assert_eq!(header_type(h), BlockType::Vector);
        assert!(!is_forwarded(h));
    }

    #[test]
    fn test_forwarding_words() {
        let f = encode_forward(0x2000);
        assert!(is_forwarded(f));
        assert_eq!(forward_target(f), 0x2000);
        // A live header can never look forwarded.
        for ty in [BlockType::Flonum, BlockType::Closure, BlockType::Promise] {
            assert!(!is_forwarded(encode_header(3, ty)));
        }
    }
}
