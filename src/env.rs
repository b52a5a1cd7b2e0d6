//! The environment: what lives where in memory.
//!
//! The compiler proper treats things in memory opaquely except for their
//! names; storage classification (zero page, absolute, stack) drives
//! addressing-mode selection, and array lengths drive bounds checks.

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicU32, Ordering};

use crate::ast::ParamConvention;
use crate::constant::Constant;

/// The name of the zero-page pseudoregister block.
pub const ZP_REGISTER: &str = "__reg";

#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub enum Type {
    Byte,
    Word,
    Pointer,
}

impl Type {
    pub fn size(self) -> u16 {
        match self {
            Type::Byte => 1,
            Type::Word | Type::Pointer => 2,
        }
    }
}

#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub enum VariableStorage {
    ZeroPage(u8),
    Absolute(u16),
    /// Offset into the function's software stack frame.
    Stack(u8),
}

#[derive(Debug, Clone)]
pub enum ThingKind {
    Variable(Type),
    Array {
        length: Option<u16>,
    },
    Function {
        interrupt: bool,
        params: Vec<String>,
        convention: ParamConvention,
    },
    ConstantAlias(Constant),
}

#[derive(Debug, Clone)]
pub struct ThingInMemory {
    pub name: String,
    pub bank: String,
    pub kind: ThingKind,
    pub storage: Option<VariableStorage>,
}

/// Process-wide generator of unique local label names. Lives on the job
/// context; parallel workers share one counter, so names never collide.
#[derive(Debug, Default)]
pub struct LabelGenerator {
    counter: AtomicU32,
}

impl LabelGenerator {
    pub fn next(&self, prefix: &str) -> String {
        let n = self.counter.fetch_add(1, Ordering::SeqCst);
        format!(".{}_{:04}", prefix, n)
    }

    /// Rewinds the counter; test setup only.
    pub fn reset(&self) {
        self.counter.store(0, Ordering::SeqCst);
    }
}

#[derive(Debug)]
pub struct Environment {
    things: BTreeMap<String, ThingInMemory>,
    default_bank: String,
    zp_cursor: u8,
    ram_cursor: u16,
}

impl Environment {
    /// An environment with allocation cursors at the platform's free
    /// zero-page and RAM starts, and the pseudoregister block already
    /// reserved.
    pub fn new(zp_start: u8, ram_start: u16, zp_register_size: u8, default_bank: &str) -> Self {
        let mut env = Environment {
            things: BTreeMap::new(),
            default_bank: default_bank.to_string(),
            zp_cursor: zp_start,
            ram_cursor: ram_start,
        };
        if zp_register_size > 0 {
            let base = env.take_zero_page(zp_register_size);
            env.insert(ThingInMemory {
                name: ZP_REGISTER.to_string(),
                bank: env.default_bank.clone(),
                kind: ThingKind::Variable(Type::Byte),
                storage: Some(VariableStorage::ZeroPage(base)),
            });
        }
        env
    }

    fn insert(&mut self, thing: ThingInMemory) {
        self.things.insert(thing.name.clone(), thing);
    }

    fn take_zero_page(&mut self, size: u8) -> u8 {
        let base = self.zp_cursor;
        self.zp_cursor = self.zp_cursor.wrapping_add(size);
        base
    }

    pub fn declare_variable(&mut self, name: &str, ty: Type, zero_page: bool) {
        let storage = if zero_page {
            VariableStorage::ZeroPage(self.take_zero_page(ty.size() as u8))
        } else {
            let address = self.ram_cursor;
            self.ram_cursor += ty.size();
            VariableStorage::Absolute(address)
        };
        self.insert(ThingInMemory {
            name: name.to_string(),
            bank: self.default_bank.clone(),
            kind: ThingKind::Variable(ty),
            storage: Some(storage),
        });
    }

    pub fn declare_variable_at(&mut self, name: &str, ty: Type, address: u16) {
        let storage = if address < 0x100 {
            VariableStorage::ZeroPage(address as u8)
        } else {
            VariableStorage::Absolute(address)
        };
        self.insert(ThingInMemory {
            name: name.to_string(),
            bank: self.default_bank.clone(),
            kind: ThingKind::Variable(ty),
            storage: Some(storage),
        });
    }

    pub fn declare_array(&mut self, name: &str, length: Option<u16>, address: Option<u16>) {
        let storage = match address {
            Some(address) if address < 0x100 => Some(VariableStorage::ZeroPage(address as u8)),
            Some(address) => Some(VariableStorage::Absolute(address)),
            None => {
                let address = self.ram_cursor;
                self.ram_cursor += length.unwrap_or(1);
                Some(VariableStorage::Absolute(address))
            }
        };
        self.insert(ThingInMemory {
            name: name.to_string(),
            bank: self.default_bank.clone(),
            kind: ThingKind::Array { length },
            storage,
        });
    }

    pub fn declare_function(
        &mut self,
        name: &str,
        interrupt: bool,
        params: Vec<String>,
        convention: ParamConvention,
    ) {
        self.insert(ThingInMemory {
            name: name.to_string(),
            bank: self.default_bank.clone(),
            kind: ThingKind::Function {
                interrupt,
                params,
                convention,
            },
            storage: None,
        });
    }

    pub fn declare_constant(&mut self, name: &str, value: Constant) {
        self.insert(ThingInMemory {
            name: name.to_string(),
            bank: self.default_bank.clone(),
            kind: ThingKind::ConstantAlias(value),
            storage: None,
        });
    }

    pub fn get(&self, name: &str) -> Option<&ThingInMemory> {
        self.things.get(name)
    }

    pub fn things(&self) -> impl Iterator<Item = &ThingInMemory> {
        self.things.values()
    }

    /// Whether the named thing has a zero-page home, which unlocks the
    /// short addressing modes.
    pub fn is_zero_page(&self, name: &str) -> bool {
        matches!(
            self.get(name).and_then(|thing| thing.storage),
            Some(VariableStorage::ZeroPage(_))
        )
    }

    pub fn array_length(&self, name: &str) -> Option<u16> {
        match self.get(name)?.kind {
            ThingKind::Array { length } => length,
            _ => None,
        }
    }

    /// The resolved numeric address, when storage is already fixed.
    pub fn address_of(&self, name: &str) -> Option<u16> {
        match self.get(name)?.storage? {
            VariableStorage::ZeroPage(address) => Some(u16::from(address)),
            VariableStorage::Absolute(address) => Some(address),
            VariableStorage::Stack(_) => None,
        }
    }

    /// The address of byte `offset` of the pseudoregister block.
    pub fn zp_register(&self, offset: u8) -> Constant {
        Constant::addr(ZP_REGISTER) + i64::from(offset)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn zero_page_allocation_moves_the_cursor() {
        let mut env = Environment::new(0x02, 0xc000, 4, "default");
        env.declare_variable("a", Type::Byte, true);
        env.declare_variable("w", Type::Word, true);
        // __reg took $02..$05, so a lands at $06 and w at $07.
        assert_eq!(env.address_of(ZP_REGISTER), Some(0x02));
        assert_eq!(env.address_of("a"), Some(0x06));
        assert_eq!(env.address_of("w"), Some(0x07));
        assert!(env.is_zero_page("a"));
    }

    #[test]
    fn fixed_addresses_are_honored() {
        let mut env = Environment::new(0x02, 0x0400, 0, "default");
        env.declare_array("output", Some(256), Some(0xc000));
        assert_eq!(env.address_of("output"), Some(0xc000));
        assert!(!env.is_zero_page("output"));
        assert_eq!(env.array_length("output"), Some(256));
    }

    #[test]
    fn label_names_are_unique_and_zero_padded() {
        let labels = LabelGenerator::default();
        assert_eq!(labels.next("wh"), ".wh_0000");
        assert_eq!(labels.next("wh"), ".wh_0001");
        assert_eq!(labels.next("if"), ".if_0002");
        labels.reset();
        assert_eq!(labels.next("wh"), ".wh_0000");
    }
}
