//! Record boundary bookkeeping for bytes arriving from the transport.
//!
//! The provider decides where records end. The assembler only keeps the
//! bytes it has not consumed yet and remembers how many more bytes the
//! provider asked for before it is worth calling again.

use platls_types::TlsError;
use tracing::{trace, warn};

/// How much of the pending input a provider call consumed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Consumption {
    /// Everything was consumed.
    All,
    /// The last `n` bytes were not consumed and must be offered again.
    Extra(usize),
    /// The input ends inside a record; at least `missing` more bytes are needed.
    Incomplete { missing: usize },
}

/// Accumulates transport bytes between provider calls.
#[derive(Debug, Default)]
pub struct RecordAssembler {
    pending: Vec<u8>,
    /// Bytes still owed before the in-flight record can complete.
    missing: usize,
    /// Upper bound on `pending`; 0 means unlimited.
    max_pending: usize,
}

impl RecordAssembler {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_limit(max_pending: usize) -> Self {
        Self {
            max_pending,
            ..Self::default()
        }
    }

    /// Append bytes read from the transport.
    pub fn append(&mut self, bytes: &[u8]) -> Result<(), TlsError> {
        if bytes.is_empty() {
            return Ok(());
        }
        if self.max_pending != 0 && self.pending.len() + bytes.len() > self.max_pending {
            return Err(TlsError::ResourceError(format!(
                "pending input would exceed {} bytes",
                self.max_pending
            )));
        }
        self.pending.extend_from_slice(bytes);
        self.missing = self.missing.saturating_sub(bytes.len());
        Ok(())
    }

    pub fn pending(&self) -> &[u8] {
        &self.pending
    }

    pub fn len(&self) -> usize {
        self.pending.len()
    }

    pub fn is_empty(&self) -> bool {
        self.pending.is_empty()
    }

    /// Bytes still missing from the in-flight record (0 if none).
    pub fn missing(&self) -> usize {
        self.missing
    }

    /// Whether a provider call could make progress.
    pub fn is_ready(&self) -> bool {
        !self.pending.is_empty() && self.missing == 0
    }

    /// Offer the pending bytes to `step` and apply the reported consumption.
    ///
    /// Returns `None` without calling `step` while the buffer is empty or
    /// the bytes owed by an earlier incomplete record have not arrived.
    pub fn consume_for_step<R, F>(&mut self, step: F) -> Option<R>
    where
        F: FnOnce(&[u8]) -> (Consumption, R),
    {
        if !self.is_ready() {
            trace!(
                pending = self.pending.len(),
                missing = self.missing,
                "no progress possible"
            );
            return None;
        }

        let (consumption, result) = step(&self.pending);
        match consumption {
            Consumption::All => self.pending.clear(),
            Consumption::Extra(n) => {
                if n > self.pending.len() {
                    warn!(
                        extra = n,
                        pending = self.pending.len(),
                        "provider reported more extra bytes than offered"
                    );
                }
                let keep = n.min(self.pending.len());
                let start = self.pending.len() - keep;
                self.pending.drain(..start);
            }
            Consumption::Incomplete { missing } => {
                self.missing = missing.max(1);
            }
        }
        Some(result)
    }

    /// Drop all pending bytes and the missing count.
    pub fn clear(&mut self) {
        self.pending.clear();
        self.missing = 0;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_all_clears_buffer() {
        let mut a = RecordAssembler::new();
        a.append(b"hello").unwrap();
        let seen = a.consume_for_step(|input| (Consumption::All, input.to_vec()));
        assert_eq!(seen.as_deref(), Some(&b"hello"[..]));
        assert!(a.is_empty());
    }

    #[test]
    fn test_extra_retains_exact_suffix() {
        let mut a = RecordAssembler::new();
        a.append(b"recordTAIL").unwrap();
        a.consume_for_step(|_| (Consumption::Extra(4), ()));
        assert_eq!(a.pending(), b"TAIL");
    }

    #[test]
    fn test_extra_zero_behaves_like_all() {
        let mut a = RecordAssembler::new();
        a.append(b"abc").unwrap();
        a.consume_for_step(|_| (Consumption::Extra(0), ()));
        assert!(a.is_empty());
    }

    #[test]
    fn test_extra_larger_than_input_keeps_everything() {
        let mut a = RecordAssembler::new();
        a.append(b"abc").unwrap();
        a.consume_for_step(|_| (Consumption::Extra(10), ()));
        assert_eq!(a.pending(), b"abc");
    }

    #[test]
    fn test_incomplete_blocks_until_missing_bytes_arrive() {
        let mut a = RecordAssembler::new();
        a.append(&[0x17, 0x00]).unwrap();
        a.consume_for_step(|_| (Consumption::Incomplete { missing: 3 }, ()));
        assert_eq!(a.missing(), 3);
        assert_eq!(a.len(), 2);

        // Zero growth: no call.
        a.append(&[]).unwrap();
        assert!(a.consume_for_step(|_| (Consumption::All, ())).is_none());

        a.append(&[1, 2]).unwrap();
        assert_eq!(a.missing(), 1);
        assert!(a.consume_for_step(|_| (Consumption::All, ())).is_none());

        a.append(&[3]).unwrap();
        assert_eq!(a.missing(), 0);
        let input = a.consume_for_step(|input| (Consumption::All, input.len()));
        assert_eq!(input, Some(5));
    }

    #[test]
    fn test_incomplete_zero_counts_as_one() {
        let mut a = RecordAssembler::new();
        a.append(&[1]).unwrap();
        a.consume_for_step(|_| (Consumption::Incomplete { missing: 0 }, ()));
        assert_eq!(a.missing(), 1);
        assert!(!a.is_ready());
    }

    #[test]
    fn test_empty_buffer_never_calls_step() {
        let mut a = RecordAssembler::new();
        let called = a.consume_for_step(|_| -> (Consumption, ()) {
            panic!("step must not run on an empty buffer")
        });
        assert!(called.is_none());
    }

    #[test]
    fn test_limit_rejects_growth() {
        let mut a = RecordAssembler::with_limit(4);
        a.append(b"abcd").unwrap();
        let err = a.append(b"e").unwrap_err();
        assert!(matches!(err, TlsError::ResourceError(_)));
        assert_eq!(a.len(), 4);
    }

    #[test]
    fn test_clear_resets_missing() {
        let mut a = RecordAssembler::new();
        a.append(b"x").unwrap();
        a.consume_for_step(|_| (Consumption::Incomplete { missing: 9 }, ()));
        a.clear();
        assert_eq!(a.missing(), 0);
        assert!(a.is_empty());
    }
}
