// Bitmap management for block and inode allocation

use super::types::*;

/// What a bitmap tracks; only used for error reporting and logging
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BitmapKind {
    Block,
    Inode,
    Generic,
}

/// Dense bit array over the inclusive range `[start, end]`.
///
/// Storage covers `[start, real_end]`; bits between `end` and `real_end` are
/// addressable padding that a later `resize` may expose.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Bitmap {
    kind: BitmapKind,
    start: u64,
    end: u64,
    real_end: u64,
    data: Vec<u8>,
}

fn storage_bytes(start: u64, real_end: u64) -> usize {
    ((real_end - start) / 8 + 1) as usize
}

impl Bitmap {
    /// Create a zeroed bitmap
    pub fn new(kind: BitmapKind, start: u64, end: u64, real_end: u64) -> ExtResult<Self> {
        if end < start || real_end < end {
            return Err(ExtError::InvalidArgument(format!(
                "bitmap range start {} end {} real_end {}",
                start, end, real_end
            )));
        }
        Ok(Self {
            kind,
            start,
            end,
            real_end,
            data: vec![0u8; storage_bytes(start, real_end)],
        })
    }

    pub fn kind(&self) -> BitmapKind {
        self.kind
    }

    pub fn start(&self) -> u64 {
        self.start
    }

    pub fn end(&self) -> u64 {
        self.end
    }

    pub fn real_end(&self) -> u64 {
        self.real_end
    }

    fn check(&self, pos: u64) -> ExtResult<usize> {
        if pos < self.start || pos > self.real_end {
            return Err(ExtError::BitmapOutOfRange {
                pos,
                start: self.start,
                end: self.real_end,
            });
        }
        Ok((pos - self.start) as usize)
    }

    fn check_range(&self, pos: u64, count: u64) -> ExtResult<usize> {
        if count == 0 {
            return self.check(pos);
        }
        self.check(pos)?;
        self.check(pos + count - 1)?;
        Ok((pos - self.start) as usize)
    }

    fn get_bit(&self, idx: usize) -> bool {
        self.data[idx / 8] & (1 << (idx % 8)) != 0
    }

    fn put_bit(&mut self, idx: usize, value: bool) {
        if value {
            self.data[idx / 8] |= 1 << (idx % 8);
        } else {
            self.data[idx / 8] &= !(1 << (idx % 8));
        }
    }

    /// Set a bit, returning its previous value
    pub fn mark(&mut self, pos: u64) -> ExtResult<bool> {
        let idx = self.check(pos)?;
        let old = self.get_bit(idx);
        self.put_bit(idx, true);
        Ok(old)
    }

    /// Clear a bit, returning its previous value
    pub fn unmark(&mut self, pos: u64) -> ExtResult<bool> {
        let idx = self.check(pos)?;
        let old = self.get_bit(idx);
        self.put_bit(idx, false);
        Ok(old)
    }

    pub fn test(&self, pos: u64) -> ExtResult<bool> {
        let idx = self.check(pos)?;
        Ok(self.get_bit(idx))
    }

    pub fn mark_range(&mut self, pos: u64, count: u64) -> ExtResult<()> {
        let first = self.check_range(pos, count)?;
        for idx in first..first + count as usize {
            self.put_bit(idx, true);
        }
        Ok(())
    }

    pub fn unmark_range(&mut self, pos: u64, count: u64) -> ExtResult<()> {
        let first = self.check_range(pos, count)?;
        for idx in first..first + count as usize {
            self.put_bit(idx, false);
        }
        Ok(())
    }

    /// True when every bit in `[pos, pos + count)` is clear
    pub fn test_clear_range(&self, pos: u64, count: u64) -> ExtResult<bool> {
        let first = self.check_range(pos, count)?;
        Ok((first..first + count as usize).all(|idx| !self.get_bit(idx)))
    }

    /// Load `count` bits starting at `pos` from a packed little-endian-bit
    /// buffer (bit 0 of byte 0 is `pos`)
    pub fn set_range(&mut self, pos: u64, count: u64, bytes: &[u8]) -> ExtResult<()> {
        let first = self.check_range(pos, count)?;
        let needed = ((count + 7) / 8) as usize;
        if bytes.len() < needed {
            return Err(ExtError::InvalidArgument(format!(
                "{} bytes cannot supply {} bits",
                bytes.len(),
                count
            )));
        }
        if first % 8 == 0 && count % 8 == 0 {
            let byte = first / 8;
            self.data[byte..byte + needed].copy_from_slice(&bytes[..needed]);
            return Ok(());
        }
        for i in 0..count as usize {
            let value = bytes[i / 8] & (1 << (i % 8)) != 0;
            self.put_bit(first + i, value);
        }
        Ok(())
    }

    /// Store `count` bits starting at `pos` into a packed buffer
    pub fn get_range(&self, pos: u64, count: u64, out: &mut [u8]) -> ExtResult<()> {
        let first = self.check_range(pos, count)?;
        let needed = ((count + 7) / 8) as usize;
        if out.len() < needed {
            return Err(ExtError::InvalidArgument(format!(
                "{} bytes cannot hold {} bits",
                out.len(),
                count
            )));
        }
        if first % 8 == 0 && count % 8 == 0 {
            let byte = first / 8;
            out[..needed].copy_from_slice(&self.data[byte..byte + needed]);
            return Ok(());
        }
        out[..needed].fill(0);
        for i in 0..count as usize {
            if self.get_bit(first + i) {
                out[i / 8] |= 1 << (i % 8);
            }
        }
        Ok(())
    }

    /// Change the logical end and the storage end.
    ///
    /// Growing `end` clears the newly exposed bits that were already backed
    /// by storage; growing storage zero-fills it. Shrinking storage releases
    /// the memory.
    pub fn resize(&mut self, new_end: u64, new_real_end: u64) -> ExtResult<()> {
        if new_end < self.start || new_real_end < new_end {
            return Err(ExtError::InvalidArgument(format!(
                "bitmap resize to end {} real_end {}",
                new_end, new_real_end
            )));
        }
        if new_end > self.end {
            let top = self.real_end.min(new_end);
            let mut bit = top;
            while bit > self.end {
                self.put_bit((bit - self.start) as usize, false);
                bit -= 1;
            }
        }
        if new_real_end == self.real_end {
            self.end = new_end;
            return Ok(());
        }
        let new_size = storage_bytes(self.start, new_real_end);
        if new_size != self.data.len() {
            self.data.resize(new_size, 0);
            self.data.shrink_to_fit();
        }
        self.end = new_end;
        self.real_end = new_real_end;
        Ok(())
    }

    /// Clear every bit
    pub fn clear(&mut self) {
        self.data.fill(0);
    }

    /// First clear bit in `[from, to]`
    pub fn find_first_zero(&self, from: u64, to: u64) -> ExtResult<Option<u64>> {
        let first = self.check(from)?;
        let last = self.check(to)?;
        Ok((first..=last)
            .find(|&idx| !self.get_bit(idx))
            .map(|idx| idx as u64 + self.start))
    }

    /// First set bit in `[from, to]`
    pub fn find_first_set(&self, from: u64, to: u64) -> ExtResult<Option<u64>> {
        let first = self.check(from)?;
        let last = self.check(to)?;
        Ok((first..=last)
            .find(|&idx| self.get_bit(idx))
            .map(|idx| idx as u64 + self.start))
    }

    /// Number of set bits in `[from, to]`
    pub fn count_set(&self, from: u64, to: u64) -> ExtResult<u64> {
        let first = self.check(from)?;
        let last = self.check(to)?;
        Ok((first..=last).filter(|&idx| self.get_bit(idx)).count() as u64)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_mark_unmark_test() {
        let mut bitmap = Bitmap::new(BitmapKind::Block, 1, 100, 104).unwrap();
        for pos in 1..=104 {
            assert!(!bitmap.mark(pos).unwrap());
            assert!(bitmap.test(pos).unwrap());
            assert!(bitmap.unmark(pos).unwrap());
            assert!(!bitmap.test(pos).unwrap());
        }
        assert!(matches!(bitmap.test(0), Err(ExtError::BitmapOutOfRange { pos: 0, .. })));
        assert!(bitmap.mark(105).is_err());
    }

    #[test]
    fn test_set_get_range() {
        let mut bitmap = Bitmap::new(BitmapKind::Inode, 1, 64, 64).unwrap();
        let bytes = [0xA5u8, 0x0F];
        bitmap.set_range(9, 16, &bytes).unwrap();
        let mut out = [0u8; 2];
        bitmap.get_range(9, 16, &mut out).unwrap();
        assert_eq!(out, bytes);
        assert!(bitmap.test(9).unwrap());
        assert!(!bitmap.test(10).unwrap());

        // Unaligned
        bitmap.set_range(3, 5, &[0b10101]).unwrap();
        let mut out = [0u8; 1];
        bitmap.get_range(3, 5, &mut out).unwrap();
        assert_eq!(out[0], 0b10101);
        assert!(bitmap.set_range(60, 8, &[0xFF]).is_err());
    }

    #[test]
    fn test_resize_grow_clears_padding() {
        let mut bitmap = Bitmap::new(BitmapKind::Block, 0, 9, 15).unwrap();
        bitmap.mark_range(0, 16).unwrap();
        bitmap.resize(12, 15).unwrap();
        assert_eq!(bitmap.end(), 12);
        assert!(bitmap.test(9).unwrap());
        for pos in 10..=12 {
            assert!(!bitmap.test(pos).unwrap());
        }
        assert!(bitmap.test(13).unwrap());

        bitmap.resize(40, 47).unwrap();
        assert!(!bitmap.test(13).unwrap());
        assert!(!bitmap.test(47).unwrap());
        assert_eq!(bitmap.count_set(0, 47).unwrap(), 10);
    }

    #[test]
    fn test_resize_shrink_truncates() {
        let mut bitmap = Bitmap::new(BitmapKind::Block, 0, 63, 63).unwrap();
        bitmap.mark(50).unwrap();
        bitmap.resize(15, 15).unwrap();
        assert!(bitmap.test(50).is_err());
        bitmap.resize(63, 63).unwrap();
        assert!(!bitmap.test(50).unwrap());
    }

    #[test]
    fn test_find_first() {
        let mut bitmap = Bitmap::new(BitmapKind::Generic, 10, 40, 40).unwrap();
        bitmap.mark_range(10, 5).unwrap();
        assert_eq!(bitmap.find_first_zero(10, 40).unwrap(), Some(15));
        assert_eq!(bitmap.find_first_set(15, 40).unwrap(), None);
        assert!(bitmap.test_clear_range(15, 26).unwrap());
        assert!(!bitmap.test_clear_range(14, 2).unwrap());
    }
}
