use std::collections::{HashMap, HashSet};

use thiserror::Error;

/// Symbols a code may be built from: lowercase ASCII letters plus digits.
pub const CODE_ALPHABET: &[u8; 36] = b"abcdefghijklmnopqrstuvwxyz0123456789";

/// Upper bound on the configured code length; the allocator materializes
/// the full keyspace, so 36^length must stay reasonable.
pub const MAX_CODE_LENGTH: usize = 4;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum CodeError {
    #[error("code must be {expected} lowercase letters or digits")]
    InvalidFormat { expected: usize },
    #[error("code is already bound to an entry")]
    AlreadyInUse,
    #[error("all codes are in use")]
    Exhausted,
}

/// Bookkeeping for the finite space of short codes.
///
/// Every possible code is either *free* or *live*. `allocate` draws
/// uniformly among the free codes, so assigned codes stay unguessable even
/// as the keyspace fills up; a sequential or generate-and-retry scheme would
/// skew toward whatever is left. Released codes become eligible again.
pub struct CodeAllocator {
    length: usize,
    free: Vec<String>,
    // position of each free code inside `free`, for O(1) reserve
    free_index: HashMap<String, usize>,
    live: HashSet<String>,
}

impl CodeAllocator {
    /// Build an allocator with every code of the given length free.
    pub fn new(length: usize) -> Self {
        assert!(
            (1..=MAX_CODE_LENGTH).contains(&length),
            "code length out of range"
        );

        let mut free = Vec::with_capacity(CODE_ALPHABET.len().pow(length as u32));
        let mut current = vec![0usize; length];
        loop {
            free.push(
                current
                    .iter()
                    .map(|&i| CODE_ALPHABET[i] as char)
                    .collect::<String>(),
            );

            // advance the odometer; done once every position wraps
            let mut pos = length;
            loop {
                if pos == 0 {
                    break;
                }
                pos -= 1;
                current[pos] += 1;
                if current[pos] < CODE_ALPHABET.len() {
                    break;
                }
                current[pos] = 0;
            }
            if current.iter().all(|&i| i == 0) {
                break;
            }
        }

        let free_index = free
            .iter()
            .enumerate()
            .map(|(index, code)| (code.clone(), index))
            .collect();

        Self {
            length,
            free,
            free_index,
            live: HashSet::new(),
        }
    }

    /// Length every valid code must have.
    pub fn code_length(&self) -> usize {
        self.length
    }

    /// Whether the string is a well-formed code for this keyspace.
    pub fn is_valid_format(&self, code: &str) -> bool {
        code.len() == self.length
            && code
                .bytes()
                .all(|b| b.is_ascii_lowercase() || b.is_ascii_digit())
    }

    /// Whether the code is currently bound to an entry.
    pub fn is_live(&self, code: &str) -> bool {
        self.live.contains(code)
    }

    /// Number of codes currently free.
    pub fn available(&self) -> usize {
        self.free.len()
    }

    /// Draw a uniformly random free code and mark it live.
    pub fn allocate(&mut self) -> Result<String, CodeError> {
        if self.free.is_empty() {
            return Err(CodeError::Exhausted);
        }

        let index = fastrand::usize(..self.free.len());
        Ok(self.take_free_at(index))
    }

    /// Mark a caller-chosen code live. Format is checked before occupancy.
    pub fn reserve(&mut self, code: &str) -> Result<(), CodeError> {
        if !self.is_valid_format(code) {
            return Err(CodeError::InvalidFormat {
                expected: self.length,
            });
        }
        if self.live.contains(code) {
            return Err(CodeError::AlreadyInUse);
        }

        let index = *self
            .free_index
            .get(code)
            .ok_or(CodeError::AlreadyInUse)?;
        self.take_free_at(index);
        Ok(())
    }

    /// Return a live code to the free pool. No-op for codes that are not live.
    pub fn release(&mut self, code: &str) {
        if !self.live.remove(code) {
            return;
        }
        self.free_index.insert(code.to_string(), self.free.len());
        self.free.push(code.to_string());
    }

    fn take_free_at(&mut self, index: usize) -> String {
        let code = self.free.swap_remove(index);
        self.free_index.remove(&code);
        if let Some(moved) = self.free.get(index) {
            self.free_index.insert(moved.clone(), index);
        }
        self.live.insert(code.clone());
        code
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashSet;

    #[test]
    fn keyspace_is_fully_enumerated() {
        let allocator = CodeAllocator::new(1);
        assert_eq!(allocator.available(), 36);

        let allocator = CodeAllocator::new(2);
        assert_eq!(allocator.available(), 36 * 36);
    }

    #[test]
    fn allocated_codes_are_unique_until_exhaustion() {
        let mut allocator = CodeAllocator::new(1);
        let mut seen = HashSet::new();

        for _ in 0..36 {
            let code = allocator.allocate().unwrap();
            assert!(allocator.is_valid_format(&code));
            assert!(seen.insert(code));
        }

        assert_eq!(allocator.allocate(), Err(CodeError::Exhausted));
    }

    #[test]
    fn released_codes_become_eligible_again() {
        let mut allocator = CodeAllocator::new(1);
        let codes: Vec<String> = (0..36).map(|_| allocator.allocate().unwrap()).collect();
        assert_eq!(allocator.allocate(), Err(CodeError::Exhausted));

        allocator.release(&codes[7]);
        assert_eq!(allocator.available(), 1);
        assert_eq!(allocator.allocate().unwrap(), codes[7]);
    }

    #[test]
    fn reserve_validates_format_before_occupancy() {
        let mut allocator = CodeAllocator::new(2);

        assert_eq!(
            allocator.reserve("ABC"),
            Err(CodeError::InvalidFormat { expected: 2 })
        );
        assert_eq!(
            allocator.reserve("a!"),
            Err(CodeError::InvalidFormat { expected: 2 })
        );

        allocator.reserve("a9").unwrap();
        assert!(allocator.is_live("a9"));
        assert_eq!(allocator.reserve("a9"), Err(CodeError::AlreadyInUse));
    }

    #[test]
    fn release_of_unknown_code_is_a_no_op() {
        let mut allocator = CodeAllocator::new(2);
        allocator.release("zz");
        assert_eq!(allocator.available(), 36 * 36);
    }
}
