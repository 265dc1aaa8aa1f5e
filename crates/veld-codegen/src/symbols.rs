//! Data-symbol table.
//!
//! Symbols are created during codegen with an indeterminate address,
//! assigned one by the layout engine, and never moved. Read-only and
//! writable symbols live in distinct sections; rodata precedes data.
//!
//! Identical rodata contents are deduplicated, and a SHA-256 digest of
//! the full symbol set backs the cross-pass audit: pass two must
//! discover exactly the set pass one did.

use crate::error::{CompileError, CompileResult};
use rustc_hash::FxHashMap;
use sha2::{Digest, Sha256};

/// Index into the symbol table.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SymId(pub u32);

#[derive(Debug, Clone)]
pub struct DataSym {
    pub name: String,
    pub bytes: Vec<u8>,
    pub writable: bool,
    pub addr: Option<u64>,
}

/// All rodata/data symbols of one compilation pass.
#[derive(Debug, Default)]
pub struct DataSymbols {
    syms: Vec<DataSym>,
    /// Content-keyed dedup for read-only symbols.
    rodata_dedup: FxHashMap<Vec<u8>, SymId>,
    counter: u32,
}

impl DataSymbols {
    pub fn new() -> Self {
        Self::default()
    }

    /// Intern read-only bytes; identical contents share one symbol.
    pub fn add_rodata(&mut self, bytes: Vec<u8>) -> SymId {
        if let Some(id) = self.rodata_dedup.get(&bytes) {
            return *id;
        }
        let id = SymId(self.syms.len() as u32);
        let name = format!("str{}", self.counter);
        self.counter += 1;
        self.rodata_dedup.insert(bytes.clone(), id);
        self.syms.push(DataSym {
            name,
            bytes,
            writable: false,
            addr: None,
        });
        id
    }

    /// Add a writable symbol (helper scratch buffers).
    pub fn add_data(&mut self, name: &str, bytes: Vec<u8>) -> SymId {
        let id = SymId(self.syms.len() as u32);
        self.syms.push(DataSym {
            name: name.to_string(),
            bytes,
            writable: true,
            addr: None,
        });
        id
    }

    pub fn get(&self, id: SymId) -> &DataSym {
        &self.syms[id.0 as usize]
    }

    /// Address of a placed symbol; an unplaced symbol at patch time is
    /// a compiler bug.
    pub fn addr(&self, id: SymId) -> CompileResult<u64> {
        self.get(id)
            .addr
            .ok_or_else(|| CompileError::internal(format!("symbol {:?} has no address", self.get(id).name)))
    }

    /// Find a writable symbol by name.
    pub fn lookup(&self, name: &str) -> Option<SymId> {
        self.syms
            .iter()
            .position(|s| s.name == name)
            .map(|i| SymId(i as u32))
    }

    /// Total rodata/data sizes (each symbol 8-aligned).
    pub fn section_sizes(&self) -> (u64, u64) {
        let mut ro = 0u64;
        let mut rw = 0u64;
        for s in &self.syms {
            let len = (s.bytes.len() as u64).div_ceil(8) * 8;
            if s.writable {
                rw += len;
            } else {
                ro += len;
            }
        }
        (ro.max(8), rw.max(8))
    }

    /// Assign final addresses given the placed section bases. Symbols
    /// keep their creation order within each section.
    pub fn assign_addresses(&mut self, rodata_vaddr: u64, data_vaddr: u64) {
        let mut ro = rodata_vaddr;
        let mut rw = data_vaddr;
        for s in &mut self.syms {
            let len = (s.bytes.len() as u64).div_ceil(8) * 8;
            if s.writable {
                s.addr = Some(rw);
                rw += len;
            } else {
                s.addr = Some(ro);
                ro += len;
            }
        }
    }

    /// Serialized section contents, in address order.
    pub fn section_bytes(&self) -> (Vec<u8>, Vec<u8>) {
        let mut ro = Vec::new();
        let mut rw = Vec::new();
        for s in &self.syms {
            let out = if s.writable { &mut rw } else { &mut ro };
            out.extend_from_slice(&s.bytes);
            while out.len() % 8 != 0 {
                out.push(0);
            }
        }
        (ro, rw)
    }

    /// Digest of the full symbol set for the cross-pass audit.
    pub fn digest(&self) -> [u8; 32] {
        let mut hasher = Sha256::new();
        for s in &self.syms {
            hasher.update(s.name.as_bytes());
            hasher.update([u8::from(s.writable)]);
            hasher.update((s.bytes.len() as u64).to_le_bytes());
            hasher.update(&s.bytes);
        }
        hasher.finalize().into()
    }

    pub fn iter(&self) -> impl Iterator<Item = &DataSym> {
        self.syms.iter()
    }

    pub fn len(&self) -> usize {
        self.syms.len()
    }

    pub fn is_empty(&self) -> bool {
        self.syms.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_rodata_dedup() {
        let mut syms = DataSymbols::new();
        let a = syms.add_rodata(b"hello\n".to_vec());
        let b = syms.add_rodata(b"hello\n".to_vec());
        let c = syms.add_rodata(b"world\n".to_vec());
        assert_eq!(a, b);
        assert_ne!(a, c);
        assert_eq!(syms.len(), 2);
    }

    #[test]
    fn test_addresses_follow_creation_order() {
        let mut syms = DataSymbols::new();
        let a = syms.add_rodata(b"aaaaaaaa".to_vec());
        let b = syms.add_rodata(b"b".to_vec());
        let buf = syms.add_data("nbuf", vec![0; 40]);
        syms.assign_addresses(0x1000, 0x2000);
        assert_eq!(syms.addr(a).unwrap(), 0x1000);
        assert_eq!(syms.addr(b).unwrap(), 0x1008);
        assert_eq!(syms.addr(buf).unwrap(), 0x2000);
    }

    #[test]
    fn test_digest_is_order_sensitive() {
        let mut one = DataSymbols::new();
        one.add_rodata(b"x".to_vec());
        one.add_rodata(b"y".to_vec());
        let mut two = DataSymbols::new();
        two.add_rodata(b"y".to_vec());
        two.add_rodata(b"x".to_vec());
        assert_ne!(one.digest(), two.digest());
    }

    #[test]
    fn test_identical_passes_share_digest() {
        let build = || {
            let mut s = DataSymbols::new();
            s.add_rodata(b"Hello, World!\n".to_vec());
            s.add_data("nbuf", vec![0; 40]);
            s
        };
        assert_eq!(build().digest(), build().digest());
    }

    #[test]
    fn test_unplaced_symbol_address_is_internal_error() {
        let mut syms = DataSymbols::new();
        let id = syms.add_rodata(b"x".to_vec());
        assert!(syms.addr(id).is_err());
    }
}
