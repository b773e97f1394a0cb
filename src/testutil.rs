//! A minimal in-memory target for unit tests: a sparse byte map and
//! fixed answers for everything symbolic. The integration suite carries
//! a full simulator; this one only backs the leaf modules.

use std::collections::BTreeMap;

use crate::error::{self, Error};
use crate::target::{Module, Symbol, Target};

pub(crate) struct FakeTarget {
    bytes: BTreeMap<u64, u8>,
    teb: u64,
    peb: u64,
}

impl FakeTarget {
    pub fn new32() -> FakeTarget {
        FakeTarget {
            bytes: BTreeMap::new(),
            teb: 0x7ffd_e000,
            peb: 0x7ffd_f000,
        }
    }

    pub fn put_bytes(&mut self, address: u64, bytes: &[u8]) {
        for (index, byte) in bytes.iter().enumerate() {
            self.bytes.insert(address + index as u64, *byte);
        }
    }

    pub fn put_u16(&mut self, address: u64, value: u16) {
        self.put_bytes(address, &value.to_le_bytes());
    }

    pub fn put_u32(&mut self, address: u64, value: u32) {
        self.put_bytes(address, &value.to_le_bytes());
    }
}

impl Target for FakeTarget {
    fn read_bytes(&self, address: u64, len: usize) -> error::Result<Vec<u8>> {
        let mut buf = Vec::with_capacity(len);
        for index in 0..len as u64 {
            match self.bytes.get(&(address + index)) {
                Some(byte) => buf.push(*byte),
                None => return Err(Error::NotReadable(address, len)),
            }
        }
        Ok(buf)
    }

    fn field_offset(&self, type_name: &str, field: &str) -> error::Result<u64> {
        Err(Error::UnknownField(
            type_name.to_string(),
            field.to_string(),
        ))
    }

    fn type_size(&self, type_name: &str) -> error::Result<u64> {
        Err(Error::UnknownSymbol(type_name.to_string()))
    }

    fn resolve_expression(&self, expr: &str) -> error::Result<u64> {
        let literal = expr.strip_prefix("0x").unwrap_or(expr);
        u64::from_str_radix(literal, 16).map_err(|_| Error::UnknownSymbol(expr.to_string()))
    }

    fn symbolize(&self, _address: u64) -> Option<Symbol> {
        None
    }

    fn modules(&self) -> error::Result<Vec<Module>> {
        Ok(Vec::new())
    }

    fn teb_address(&self) -> error::Result<u64> {
        Ok(self.teb)
    }

    fn peb_address(&self) -> error::Result<u64> {
        Ok(self.peb)
    }

    fn is_pointer_64(&self) -> bool {
        false
    }
}
