//! Compile-time constant algebra.
//!
//! Operands of assembly lines are trees of [`Constant`]: numbers, symbol
//! addresses, byte selections and compound arithmetic, simplified into a
//! normal form by [`Constant::quick_simplify`]. Symbol references survive
//! every rewrite so that aliasing questions stay decidable.

use std::fmt;
use std::ops::{Add, Sub};

/// Operators of [`Constant::Compound`]. The `Decimal*` family interprets
/// its operands as packed BCD; the `*9` variants keep a ninth result bit
/// (the carry) and therefore always describe two bytes.
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub enum ConstantOp {
    Plus,
    Minus,
    Times,
    Shl,
    Shr,
    Shl9,
    Shr9,
    Plus9,
    DecimalPlus,
    DecimalMinus,
    DecimalTimes,
    DecimalShl,
    DecimalShl9,
    DecimalShr,
    DecimalPlus9,
    And,
    Or,
    Exor,
}

#[derive(Debug, Clone, Eq, PartialEq)]
pub enum Constant {
    /// A number with an explicit encoding width of 1, 2, 3 or 4 bytes.
    /// Width 1 keeps the value inside `-128..=255`.
    Numeric(i64, u8),
    /// Byte `index` of the base constant (0 = low byte).
    Subbyte(Box<Constant>, u8),
    /// The address of a named thing in memory; resolved by the assembler.
    MemoryAddress(String),
    Compound(ConstantOp, Box<Constant>, Box<Constant>),
    /// A name the environment has not resolved yet.
    Unexpanded(String, u8),
    /// Asserts that the wrapped constant fits in one byte.
    AssertByte(Box<Constant>),
}

fn size_for(value: i64) -> u8 {
    if (-128..=255).contains(&value) {
        1
    } else if (-32768..=65535).contains(&value) {
        2
    } else if (-(1 << 23)..=(1 << 24) - 1).contains(&value) {
        3
    } else {
        4
    }
}

fn mask(size: u8) -> i64 {
    match size {
        1 => 0xff,
        2 => 0xffff,
        3 => 0xff_ffff,
        _ => 0xffff_ffff,
    }
}

/// Packed BCD to its decimal reading: `$42` becomes 42.
fn bcd_to_int(value: i64) -> i64 {
    let mut result = 0;
    let mut scale = 1;
    let mut v = value;
    while v != 0 {
        result += (v & 0xf) * scale;
        scale *= 10;
        v >>= 4;
    }
    result
}

/// Decimal reading back to packed BCD: 42 becomes `$42`.
fn int_to_bcd(value: i64) -> i64 {
    let mut result = 0;
    let mut shift = 0;
    let mut v = value.max(0);
    while v != 0 {
        result |= (v % 10) << shift;
        shift += 4;
        v /= 10;
    }
    result
}

fn fold(op: ConstantOp, a: i64, sa: u8, b: i64, sb: u8) -> Constant {
    use ConstantOp::*;
    let joint = sa.max(sb);
    let (value, size) = match op {
        Plus => (a + b, joint),
        Minus => (a - b, joint),
        Times => (a * b, joint),
        Shl => (a << b.clamp(0, 32), joint),
        Shr => (((a & mask(sa)) as u64 >> b.clamp(0, 32)) as i64, joint),
        Shl9 => ((a << b.clamp(0, 9)) & 0x1ff, 2),
        Shr9 => (((a & 0x1ff) as u64 >> b.clamp(0, 9)) as i64, 2),
        Plus9 => ((a + b) & 0x1ff, 2),
        DecimalPlus => (
            int_to_bcd(bcd_to_int(a & mask(sa)) + bcd_to_int(b & mask(sb))) & mask(joint),
            joint,
        ),
        DecimalMinus => (
            int_to_bcd((bcd_to_int(a & mask(sa)) - bcd_to_int(b & mask(sb))).max(0)) & mask(joint),
            joint,
        ),
        DecimalTimes => (
            int_to_bcd(bcd_to_int(a & mask(sa)) * bcd_to_int(b & mask(sb))) & mask(joint),
            joint,
        ),
        DecimalShl => (
            int_to_bcd(bcd_to_int(a & mask(sa)) << b.clamp(0, 16)) & mask(joint),
            joint,
        ),
        DecimalShl9 => (
            int_to_bcd(bcd_to_int(a & 0xff) << b.clamp(0, 9)) & 0x1ff,
            2,
        ),
        DecimalShr => (
            int_to_bcd(bcd_to_int(a & mask(sa)) >> b.clamp(0, 16)) & mask(joint),
            joint,
        ),
        DecimalPlus9 => (
            int_to_bcd(bcd_to_int(a & 0xff) + bcd_to_int(b & 0xff)) & 0x1ff,
            2,
        ),
        And => (a & b & mask(joint), joint),
        Or => ((a | b) & mask(joint), joint),
        Exor => ((a ^ b) & mask(joint), joint),
    };
    // Multiplications and shifts may genuinely outgrow their operands.
    let size = if matches!(op, Times | Shl) {
        let mut size = size;
        while size < 4 && value >= (1i64 << (8 * size)) {
            size += 1;
        }
        size
    } else {
        size.max(size_for(value).min(4)).min(4)
    };
    Constant::Numeric(value, size)
}

impl Constant {
    /// A number in its narrowest encoding.
    pub fn num(value: i64) -> Constant {
        Constant::Numeric(value, size_for(value))
    }

    /// A number forced to two bytes.
    pub fn word(value: i64) -> Constant {
        Constant::Numeric(value, size_for(value).max(2))
    }

    pub fn zero() -> Constant {
        Constant::Numeric(0, 1)
    }

    pub fn addr(name: impl Into<String>) -> Constant {
        Constant::MemoryAddress(name.into())
    }

    /// Encoding width in bytes.
    pub fn size(&self) -> u8 {
        use ConstantOp::*;
        match self {
            Constant::Numeric(_, size) => *size,
            Constant::MemoryAddress(_) => 2,
            Constant::Subbyte(_, _) => 1,
            Constant::AssertByte(_) => 1,
            Constant::Unexpanded(_, size) => *size,
            Constant::Compound(op, lhs, rhs) => match op {
                Plus9 | Shl9 | DecimalPlus9 | DecimalShl9 | Shr9 => 2,
                _ => lhs.size().max(rhs.size()),
            },
        }
    }

    /// The normal form. Idempotent, meaning-preserving, and it never
    /// drops a [`Constant::MemoryAddress`] leaf.
    pub fn quick_simplify(&self) -> Constant {
        use Constant::*;
        use ConstantOp::*;
        match self {
            Compound(op, lhs, rhs) => {
                let l = lhs.quick_simplify();
                let r = rhs.quick_simplify();

                if let (Numeric(a, sa), Numeric(b, sb)) = (&l, &r) {
                    return fold(*op, *a, *sa, *b, *sb);
                }

                // Identity laws.
                match (op, &l, &r) {
                    (Plus | Or | Exor, _, Numeric(0, _)) => return l,
                    (Plus | Or | Exor, Numeric(0, _), _) => return r,
                    (Minus | Shl | Shr, _, Numeric(0, _)) => return l,
                    (Times, _, Numeric(0, _)) | (Times, Numeric(0, _), _) => {
                        return Numeric(0, 1)
                    }
                    (And, _, Numeric(0, _)) | (And, Numeric(0, _), _) => return Numeric(0, 1),
                    (Times, _, Numeric(1, _)) => return l,
                    (Times, Numeric(1, _), _) => return r,
                    _ => {}
                }

                // Hoist the numeric term of a commutative operator to the
                // right, so offset folding below only has one shape to see.
                if matches!(op, Plus | Times | And | Or | Exor) {
                    if let (Numeric(_, _), other) = (&l, &r) {
                        if !matches!(other, Numeric(_, _)) {
                            return Compound(*op, Box::new(r), Box::new(l)).quick_simplify();
                        }
                    }
                }

                // Fold chained constant offsets: ((a ± k1) ± k2).
                if let Numeric(k2, _) = r {
                    if let Compound(inner_op @ (Plus | Minus), a, k1) = &l {
                        if let Numeric(k1, _) = **k1 {
                            let k1 = if *inner_op == Minus { -k1 } else { k1 };
                            let k2 = if *op == Minus { -k2 } else { k2 };
                            if *op == Plus || *op == Minus {
                                let total = k1 + k2;
                                return if total == 0 {
                                    (**a).clone()
                                } else if total > 0 {
                                    Compound(Plus, a.clone(), Box::new(Constant::num(total)))
                                } else {
                                    Compound(Minus, a.clone(), Box::new(Constant::num(-total)))
                                };
                            }
                        }
                    }
                }

                // Byte reassembly: (hi(c) << 8) | lo(c) is c again, for
                // word-sized c.
                if matches!(op, Or | Plus) {
                    if let (Compound(Shl, shifted, eight), Subbyte(low, 0)) = (&l, &r) {
                        if matches!(**eight, Numeric(8, _)) {
                            if let Subbyte(high, 1) = &**shifted {
                                if high == low && low.size() <= 2 {
                                    return (**low).clone();
                                }
                            }
                        }
                    }
                }

                Compound(*op, Box::new(l), Box::new(r))
            }
            Subbyte(base, index) => {
                let base = base.quick_simplify();
                match base {
                    Numeric(value, _) => Numeric((value >> (8 * *index)) & 0xff, 1),
                    _ if *index == 0 && base.size() == 1 => base,
                    _ => Subbyte(Box::new(base), *index),
                }
            }
            AssertByte(inner) => {
                let inner = inner.quick_simplify();
                match inner {
                    Numeric(value, _) if (-128..=255).contains(&value) => Numeric(value, 1),
                    _ => AssertByte(Box::new(inner)),
                }
            }
            _ => self.clone(),
        }
    }

    /// Closed evaluation; `None` when symbols remain.
    pub fn eval(&self) -> Option<i64> {
        match self.quick_simplify() {
            Constant::Numeric(value, _) => Some(value),
            _ => None,
        }
    }

    pub fn subbyte(&self, index: u8) -> Constant {
        Constant::Subbyte(Box::new(self.clone()), index).quick_simplify()
    }

    pub fn lo_byte(&self) -> Constant {
        self.subbyte(0)
    }

    pub fn hi_byte(&self) -> Constant {
        self.subbyte(1)
    }

    /// The two-byte word starting at byte `index`.
    pub fn subword(&self, index: u8) -> Constant {
        Constant::Compound(
            ConstantOp::Or,
            Box::new(Constant::Compound(
                ConstantOp::Shl,
                Box::new(Constant::Subbyte(Box::new(self.clone()), index + 1)),
                Box::new(Constant::num(8)),
            )),
            Box::new(Constant::Subbyte(Box::new(self.clone()), index)),
        )
        .quick_simplify()
    }

    pub fn asl(&self, shift: i64) -> Constant {
        Constant::Compound(
            ConstantOp::Shl,
            Box::new(self.clone()),
            Box::new(Constant::num(shift)),
        )
        .quick_simplify()
    }

    pub fn is_provably_zero(&self) -> bool {
        matches!(self.quick_simplify(), Constant::Numeric(0, _))
    }

    pub fn is_provably_nonnegative(&self) -> bool {
        use Constant::*;
        match self {
            Numeric(value, _) => *value >= 0,
            MemoryAddress(_) => true,
            Subbyte(_, _) => true,
            AssertByte(inner) => inner.is_provably_nonnegative(),
            Unexpanded(_, _) => false,
            Compound(op, lhs, rhs) => {
                !matches!(op, ConstantOp::Minus | ConstantOp::DecimalMinus)
                    && lhs.is_provably_nonnegative()
                    && rhs.is_provably_nonnegative()
            }
        }
    }

    /// Whether this constant mentions the named thing anywhere. Rules use
    /// it to prove that two operands cannot alias.
    pub fn is_related_to(&self, name: &str) -> bool {
        use Constant::*;
        match self {
            Numeric(_, _) => false,
            MemoryAddress(n) | Unexpanded(n, _) => n == name,
            Subbyte(base, _) => base.is_related_to(name),
            AssertByte(inner) => inner.is_related_to(name),
            Compound(_, lhs, rhs) => lhs.is_related_to(name) || rhs.is_related_to(name),
        }
    }

    /// The first named symbol in the tree, if any. Operands built by the
    /// compiler have at most one.
    pub fn base_symbol(&self) -> Option<&str> {
        use Constant::*;
        match self {
            Numeric(_, _) => None,
            MemoryAddress(name) | Unexpanded(name, _) => Some(name),
            Subbyte(base, _) => base.base_symbol(),
            AssertByte(inner) => inner.base_symbol(),
            Compound(_, lhs, rhs) => lhs.base_symbol().or_else(|| rhs.base_symbol()),
        }
    }

    /// Every named symbol in the tree, for reference counting.
    pub fn collect_symbols<'a>(&'a self, out: &mut Vec<&'a str>) {
        use Constant::*;
        match self {
            Numeric(_, _) => {}
            MemoryAddress(name) | Unexpanded(name, _) => out.push(name),
            Subbyte(base, _) => base.collect_symbols(out),
            AssertByte(inner) => inner.collect_symbols(out),
            Compound(_, lhs, rhs) => {
                lhs.collect_symbols(out);
                rhs.collect_symbols(out);
            }
        }
    }

    pub fn fits_into_byte(&self) -> bool {
        match self.quick_simplify() {
            Constant::Numeric(value, _) => (-128..=255).contains(&value),
            other => other.size() == 1,
        }
    }
}

impl From<i64> for Constant {
    fn from(value: i64) -> Constant {
        Constant::num(value)
    }
}

impl Add<i64> for Constant {
    type Output = Constant;

    fn add(self, rhs: i64) -> Constant {
        Constant::Compound(ConstantOp::Plus, Box::new(self), Box::new(Constant::num(rhs)))
            .quick_simplify()
    }
}

impl Sub<i64> for Constant {
    type Output = Constant;

    fn sub(self, rhs: i64) -> Constant {
        Constant::Compound(ConstantOp::Minus, Box::new(self), Box::new(Constant::num(rhs)))
            .quick_simplify()
    }
}

impl Add for Constant {
    type Output = Constant;

    fn add(self, rhs: Constant) -> Constant {
        Constant::Compound(ConstantOp::Plus, Box::new(self), Box::new(rhs)).quick_simplify()
    }
}

impl fmt::Display for Constant {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        use Constant::*;
        match self {
            Numeric(value, 1) => write!(f, "${:02X}", value & 0xff),
            Numeric(value, _) => write!(f, "${:04X}", value & 0xffff),
            MemoryAddress(name) => write!(f, "{}", name),
            Subbyte(base, 0) => write!(f, "lo({})", base),
            Subbyte(base, 1) => write!(f, "hi({})", base),
            Subbyte(base, index) => write!(f, "byte{}({})", index, base),
            Unexpanded(name, _) => write!(f, "{}?", name),
            AssertByte(inner) => write!(f, "byte({})", inner),
            Compound(op, lhs, rhs) => {
                use ConstantOp::*;
                let symbol = match op {
                    Plus => "+",
                    Minus => "-",
                    Times => "*",
                    Shl => "<<",
                    Shr => ">>",
                    Shl9 => "<<9",
                    Shr9 => ">>9",
                    Plus9 => "+9",
                    DecimalPlus => "+'",
                    DecimalMinus => "-'",
                    DecimalTimes => "*'",
                    DecimalShl => "<<'",
                    DecimalShl9 => "<<'9",
                    DecimalShr => ">>'",
                    DecimalPlus9 => "+'9",
                    And => "&",
                    Or => "|",
                    Exor => "^",
                };
                write!(f, "({} {} {})", lhs, symbol, rhs)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use yare::parameterized;

    use super::*;

    fn compound(op: ConstantOp, lhs: Constant, rhs: Constant) -> Constant {
        Constant::Compound(op, Box::new(lhs), Box::new(rhs))
    }

    #[parameterized(
        plus = { ConstantOp::Plus, 40, 2, 42 },
        minus = { ConstantOp::Minus, 50, 8, 42 },
        times = { ConstantOp::Times, 6, 7, 42 },
        shl = { ConstantOp::Shl, 21, 1, 42 },
        shr = { ConstantOp::Shr, 84, 1, 42 },
        and = { ConstantOp::And, 0b1110_1010, 0b0110_1111, 0b0110_1010 },
        or = { ConstantOp::Or, 0b1000_0000, 0b0010_1010, 0b1010_1010 },
        exor = { ConstantOp::Exor, 0b1111_0000, 0b1010_1010, 0b0101_1010 },
    )]
    fn numeric_compounds_fold(op: ConstantOp, a: i64, b: i64, expected: i64) {
        let folded = compound(op, Constant::num(a), Constant::num(b)).quick_simplify();
        assert_eq!(folded, Constant::num(expected));
    }

    #[parameterized(
        decimal_plus = { ConstantOp::DecimalPlus, 0x19, 0x03, 0x22 },
        decimal_minus = { ConstantOp::DecimalMinus, 0x42, 0x13, 0x29 },
        decimal_times = { ConstantOp::DecimalTimes, 0x12, 0x04, 0x48 },
        decimal_shl = { ConstantOp::DecimalShl, 0x26, 1, 0x52 },
        decimal_shr = { ConstantOp::DecimalShr, 0x52, 1, 0x26 },
    )]
    fn decimal_compounds_fold_in_bcd(op: ConstantOp, a: i64, b: i64, expected: i64) {
        let folded = compound(op, Constant::num(a), Constant::num(b)).quick_simplify();
        assert_eq!(folded.eval(), Some(expected));
    }

    #[test]
    fn decimal_plus9_keeps_the_ninth_bit() {
        let folded =
            compound(ConstantOp::DecimalPlus9, Constant::num(0x99), Constant::num(0x02))
                .quick_simplify();
        assert_eq!(folded, Constant::Numeric(0x101, 2));
    }

    #[test]
    fn adding_zero_is_identity() {
        let base = Constant::addr("counter");
        let sum = compound(ConstantOp::Plus, base.clone(), Constant::zero()).quick_simplify();
        assert_eq!(sum, base);
    }

    #[test]
    fn chained_offsets_collapse() {
        let addr = Constant::addr("table") + 3 + 4;
        assert_eq!(
            addr,
            compound(ConstantOp::Plus, Constant::addr("table"), Constant::num(7))
        );
        let back = addr - 7;
        assert_eq!(back, Constant::addr("table"));
    }

    #[test]
    fn byte_reassembly_restores_the_word() {
        let word = Constant::addr("screen");
        let rebuilt = compound(
            ConstantOp::Or,
            compound(ConstantOp::Shl, word.hi_byte(), Constant::num(8)),
            word.lo_byte(),
        )
        .quick_simplify();
        assert_eq!(rebuilt, word);
    }

    #[test]
    fn subword_of_hi_lo_round_trips() {
        let c = Constant::Numeric(0x1234, 2);
        assert_eq!(c.subword(0), c);
        let addr = Constant::addr("buffer");
        assert_eq!(addr.subword(0), addr);
    }

    #[parameterized(
        numeric = { Constant::num(300) },
        address_offset = { Constant::addr("x") + 5 },
        subbyte = { Constant::addr("x").hi_byte() },
        nested = { compound(ConstantOp::Times, Constant::addr("x") + 1, Constant::num(2)) },
        assert_byte = { Constant::AssertByte(Box::new(Constant::addr("x").lo_byte())) },
    )]
    fn quick_simplify_is_idempotent(c: Constant) {
        let once = c.quick_simplify();
        assert_eq!(once.quick_simplify(), once);
    }

    #[test]
    fn simplification_never_loses_symbol_references() {
        let c = compound(
            ConstantOp::Plus,
            compound(ConstantOp::Minus, Constant::addr("sprite"), Constant::num(2)),
            Constant::num(2),
        );
        let simplified = c.quick_simplify();
        assert!(simplified.is_related_to("sprite"));
        assert!(!simplified.is_related_to("other"));
    }

    #[test]
    fn narrow_numbers_get_size_one() {
        assert_eq!(Constant::num(255).size(), 1);
        assert_eq!(Constant::num(-128).size(), 1);
        assert_eq!(Constant::num(256).size(), 2);
        assert_eq!(Constant::num(0x1_0000).size(), 3);
    }

    #[test]
    fn times_grows_the_result_size() {
        let folded =
            compound(ConstantOp::Times, Constant::num(200), Constant::num(200)).quick_simplify();
        assert_eq!(folded, Constant::Numeric(40000, 2));
    }
}
