//! The bitmask type lattice used by dynamic type propagation.
//!
//! Every observation about a register or memory cell sets the bit of a [`VariableType`] in a
//! 64-bit flag word. Flag words from connected operands are merged by OR, so a word is the set of
//! every constraint seen for a value; [`VariableType::resolve`] then picks the most specific type
//! that is consistent with all of them.
//!
//! The top four bits are not types but markers used while walking the chain graph, see
//! [`CHAIN_BIT`], [`BREAK_BIT`], [`ADDSUB_BIT`] and [`MUL_BIT`].

use crate::error::{Error, Result};

/// The value flows in unchanged from the previous instruction
pub const CHAIN_BIT: u64 = 0x8000_0000_0000_0000;
/// The value was (re)defined here; chain walking stops
pub const BREAK_BIT: u64 = 0x4000_0000_0000_0000;
/// The value takes part in an addition or subtraction
pub const ADDSUB_BIT: u64 = 0x2000_0000_0000_0000;
/// The value takes part in a multiplication, division or shift
pub const MUL_BIT: u64 = 0x1000_0000_0000_0000;
/// All bits that carry type information
pub const BIT_MASK: u64 = !0xF000_0000_0000_0000;
/// Bits that describe how a value is used in arithmetic
pub const ARITHMETIC_BITS: u64 = ADDSUB_BIT | MUL_BIT;

#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Debug)]
pub enum VariableType {
    GenericPointer,
    PointerI8,
    PointerI16,
    PointerI32,
    PointerI64,
    PointerU8,
    PointerU16,
    PointerU32,
    PointerU64,
    PointerS8,
    PointerS16,
    PointerS32,
    PointerS64,
    PointerF32,
    PointerF64,
    PointerFx16,
    PointerFx32,
    PointerCode,
    I8,
    I16,
    I32,
    I64,
    U8,
    U16,
    U32,
    U64,
    S8,
    S16,
    S32,
    S64,
    F32,
    F64,
    Fx16,
    Fx32,
    Pc,
    Sp,
    Flags,
    Conflict,
    Unknown,
}

use VariableType::*;

impl VariableType {
    /// Every type, in bit order
    pub const ALL: [VariableType; 39] = [
        GenericPointer,
        PointerI8,
        PointerI16,
        PointerI32,
        PointerI64,
        PointerU8,
        PointerU16,
        PointerU32,
        PointerU64,
        PointerS8,
        PointerS16,
        PointerS32,
        PointerS64,
        PointerF32,
        PointerF64,
        PointerFx16,
        PointerFx32,
        PointerCode,
        I8,
        I16,
        I32,
        I64,
        U8,
        U16,
        U32,
        U64,
        S8,
        S16,
        S32,
        S64,
        F32,
        F64,
        Fx16,
        Fx32,
        Pc,
        Sp,
        Flags,
        Conflict,
        Unknown,
    ];

    /// Bit position of this type in a flag word
    pub const fn bit(self) -> u32 {
        match self {
            Conflict => 58,
            Unknown => 59,
            // Everything else is laid out densely, in declaration order
            t => t as u32,
        }
    }

    pub const fn mask(self) -> u64 {
        1 << self.bit()
    }

    /// Whether `flags` carries this type's bit
    pub const fn test(self, flags: u64) -> bool {
        flags & self.mask() != 0
    }

    pub fn name(self) -> &'static str {
        match self {
            GenericPointer => "void*",
            PointerI8 => "I8*",
            PointerI16 => "I16*",
            PointerI32 => "I32*",
            PointerI64 => "I64*",
            PointerU8 => "U8*",
            PointerU16 => "U16*",
            PointerU32 => "U32*",
            PointerU64 => "U64*",
            PointerS8 => "S8*",
            PointerS16 => "S16*",
            PointerS32 => "S32*",
            PointerS64 => "S64*",
            PointerF32 => "F32*",
            PointerF64 => "F64*",
            PointerFx16 => "FX16*",
            PointerFx32 => "FX32*",
            PointerCode => "CODE*",
            I8 => "I8",
            I16 => "I16",
            I32 => "I32",
            I64 => "I64",
            U8 => "U8",
            U16 => "U16",
            U32 => "U32",
            U64 => "U64",
            S8 => "S8",
            S16 => "S16",
            S32 => "S32",
            S64 => "S64",
            F32 => "F32",
            F64 => "F64",
            Fx16 => "FX16",
            Fx32 => "FX32",
            Pc => "PC",
            Sp => "SP",
            Flags => "FLAGS",
            Conflict => "CONFLICT",
            Unknown => "UNKNOWN",
        }
    }

    /// Look a type up by its [`Self::name`], ignoring case
    pub fn from_name(name: &str) -> Option<VariableType> {
        Self::ALL
            .iter()
            .copied()
            .find(|t| t.name().eq_ignore_ascii_case(name))
    }

    /// Size of a value of this type in bytes
    pub fn size(self, pointer_size: usize) -> usize {
        match self {
            I8 | U8 | S8 | Conflict | Unknown => 1,
            I16 | U16 | S16 | Fx16 => 2,
            I32 | U32 | S32 | F32 | Fx32 => 4,
            I64 | U64 | S64 | F64 => 8,
            _ => pointer_size,
        }
    }

    pub fn is_pointer(self) -> bool {
        self.bit() <= PointerCode.bit()
    }

    /// The integer type a register of `size` bytes holds when nothing more is known about it
    pub fn native_integer(size: usize) -> Option<VariableType> {
        match size {
            1 => Some(I8),
            2 => Some(I16),
            4 => Some(I32),
            8 => Some(I64),
            _ => None,
        }
    }

    /// Pick the most specific type consistent with every constraint in `flags`, for an
    /// architecture with `pointer_size` byte pointers.
    ///
    /// Returns `None` if `flags` carries no type evidence at all, and [`Unknown`] if the
    /// evidence contradicts itself.
    ///
    /// Every integer width is a candidate, including 32 and 64-bit ones, not only 8 and 16-bit
    /// integers. An integer narrower than a pointer wins over anything else; an integer as
    /// wide as a pointer only wins when there is no pointer evidence.
    pub fn resolve(flags: u64, pointer_size: usize) -> Result<Option<VariableType>> {
        let bits = flags
            & BIT_MASK
            & !(Unknown.mask() | Conflict.mask() | Pc.mask() | Sp.mask());
        if bits == 0 {
            return Ok(None);
        }

        let addr_bits = match pointer_size {
            1 => I8.mask() | U8.mask() | S8.mask(),
            2 => I16.mask() | U16.mask() | S16.mask(),
            4 => I32.mask() | U32.mask() | S32.mask(),
            8 => I64.mask() | U64.mask() | S64.mask(),
            size => return Err(Error::UnsupportedPointerSize { size }),
        };
        let ptr_bits = mask_of(&Self::ALL[..=PointerCode as usize]);
        let only = |allowed: u64| bits & !allowed == 0;

        let int_bits = mask_of(&[I8, I16, I32, I64]);
        let uint_bits = mask_of(&[U8, U16, U32, U64]);
        let sint_bits = mask_of(&[S8, S16, S32, S64]);
        if (bits & int_bits).count_ones() > 1
            || (bits & uint_bits).count_ones() > 1
            || (bits & sint_bits).count_ones() > 1
        {
            return Ok(Some(Unknown));
        }

        // Integers, narrowest first. At the pointer width an integer may just as well be an
        // address, so pointer evidence takes precedence there.
        for (generic, unsigned, signed) in [
            (I8, U8, S8),
            (I16, U16, S16),
            (I32, U32, S32),
            (I64, U64, S64),
        ] {
            let width = generic.mask() | unsigned.mask() | signed.mask();
            if bits & width == 0 {
                continue;
            }
            if width == addr_bits && bits & ptr_bits != 0 {
                break;
            }
            let ty = if signed.test(bits) && unsigned.test(bits) {
                generic
            } else if signed.test(bits) {
                signed
            } else if unsigned.test(bits) {
                unsigned
            } else {
                generic
            };
            return Ok(Some(if only(width) { ty } else { Unknown }));
        }

        for ty in [F32, F64, Fx16, Fx32, Flags] {
            if bits == ty.mask() {
                return Ok(Some(ty));
            }
        }

        // Pointers with a precise pointee
        for ty in [PointerF32, PointerF64, PointerFx16, PointerFx32, PointerCode] {
            if ty.test(bits) && only(addr_bits | ty.mask()) {
                return Ok(Some(ty));
            }
        }
        for (ty, generic) in [
            (PointerU8, PointerI8),
            (PointerS8, PointerI8),
            (PointerU16, PointerI16),
            (PointerS16, PointerI16),
            (PointerU32, PointerI32),
            (PointerS32, PointerI32),
            (PointerU64, PointerI64),
            (PointerS64, PointerI64),
        ] {
            if ty.test(bits) && only(addr_bits | ty.mask() | generic.mask()) {
                return Ok(Some(ty));
            }
        }
        for (generic, unsigned, signed) in [
            (PointerI8, PointerU8, PointerS8),
            (PointerI16, PointerU16, PointerS16),
            (PointerI32, PointerU32, PointerS32),
            (PointerI64, PointerU64, PointerS64),
        ] {
            if generic.test(bits)
                && only(addr_bits | generic.mask() | unsigned.mask() | signed.mask())
            {
                return Ok(Some(generic));
            }
        }

        // Used as an address, or pointer evidence that disagrees on the pointee
        if only(addr_bits | ptr_bits) && bits & (addr_bits | ptr_bits) != 0 {
            return Ok(Some(GenericPointer));
        }

        Ok(Some(Unknown))
    }

    /// Render as a C-like type, for listings. Generic integers are shown as unsigned.
    pub fn to_c_type(self) -> Option<&'static str> {
        Some(match self {
            GenericPointer => "void*",
            PointerI8 | PointerU8 => "uint8_t*",
            PointerS8 => "int8_t*",
            PointerI16 | PointerU16 => "uint16_t*",
            PointerS16 => "int16_t*",
            PointerI32 | PointerU32 => "uint32_t*",
            PointerS32 => "int32_t*",
            PointerI64 | PointerU64 => "uint64_t*",
            PointerS64 => "int64_t*",
            PointerF32 => "float*",
            PointerF64 => "double*",
            PointerFx16 => "fx16_t*",
            PointerFx32 => "fx32_t*",
            PointerCode => "code*",
            I8 | U8 => "uint8_t",
            S8 => "int8_t",
            I16 | U16 => "uint16_t",
            S16 => "int16_t",
            I32 | U32 => "uint32_t",
            S32 => "int32_t",
            I64 | U64 => "uint64_t",
            S64 => "int64_t",
            F32 => "float",
            F64 => "double",
            Fx16 => "fx16_t",
            Fx32 => "fx32_t",
            Pc | Sp | Flags | Conflict | Unknown => return None,
        })
    }
}

impl std::fmt::Display for VariableType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.name())
    }
}

/// OR together the masks of `types`
pub fn mask_of(types: &[VariableType]) -> u64 {
    types.iter().fold(0, |m, t| m | t.mask())
}

/// Human readable rendering of a flag word, e.g. `I8|U8 [CHAIN]`
pub fn describe_flags(flags: u64) -> String {
    use itertools::Itertools;
    let types = VariableType::ALL
        .iter()
        .filter(|t| t.test(flags))
        .map(|t| t.name())
        .join("|");
    let markers = [
        (CHAIN_BIT, "CHAIN"),
        (BREAK_BIT, "BREAK"),
        (ADDSUB_BIT, "ADDSUB"),
        (MUL_BIT, "MUL"),
    ]
    .iter()
    .filter(|(bit, _)| flags & bit != 0)
    .map(|(_, name)| *name)
    .join(",");
    match (types.is_empty(), markers.is_empty()) {
        (true, true) => "-".to_string(),
        (false, true) => types,
        (true, false) => format!("[{}]", markers),
        (false, false) => format!("{} [{}]", types, markers),
    }
}
