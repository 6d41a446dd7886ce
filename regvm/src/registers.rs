use crate::{ObjectRef, Throwable};

/// Registers of one frame. Each register is a 64-bit word holding either a
/// sign-extended `i32` or a raw object reference.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RegisterFile {
    regs: Box<[u64]>,
}

fn out_of_range(index: usize, len: usize) -> Throwable {
    Throwable::verify_error(format!("register v{index} out of range ({len} registers)"))
}

impl RegisterFile {
    pub fn new(count: usize) -> Self {
        Self {
            regs: vec![0; count].into_boxed_slice(),
        }
    }

    #[inline]
    pub fn len(&self) -> usize {
        self.regs.len()
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.regs.is_empty()
    }

    #[inline]
    pub fn get(&self, index: usize) -> Result<u64, Throwable> {
        self.regs
            .get(index)
            .copied()
            .ok_or_else(|| out_of_range(index, self.regs.len()))
    }

    #[inline]
    pub fn set(&mut self, index: usize, value: u64) -> Result<(), Throwable> {
        let len = self.regs.len();
        let reg = self
            .regs
            .get_mut(index)
            .ok_or_else(|| out_of_range(index, len))?;
        *reg = value;
        Ok(())
    }

    #[inline]
    pub fn get_i32(&self, index: usize) -> Result<i32, Throwable> {
        self.get(index).map(|v| v as i32)
    }

    #[inline]
    pub fn set_i32(&mut self, index: usize, value: i32) -> Result<(), Throwable> {
        self.set(index, value as i64 as u64)
    }

    /// Read a reference register. `Ok(None)` is null.
    #[inline]
    pub fn get_ref(&self, index: usize) -> Result<Option<ObjectRef>, Throwable> {
        let raw = self.get(index)?;
        if raw == 0 {
            return Ok(None);
        }
        ObjectRef::from_raw(raw).map(Some).ok_or_else(|| {
            Throwable::verify_error(format!("v{index} does not hold a reference"))
        })
    }

    #[inline]
    pub fn set_ref(&mut self, index: usize, obj: Option<ObjectRef>) -> Result<(), Throwable> {
        self.set(index, obj.map_or(0, ObjectRef::raw))
    }

    /// The `count` registers starting at `first`.
    pub fn range(&self, first: usize, count: usize) -> Result<&[u64], Throwable> {
        let end = first
            .checked_add(count)
            .ok_or_else(|| out_of_range(first, self.regs.len()))?;
        self.regs
            .get(first..end)
            .ok_or_else(|| out_of_range(end.saturating_sub(1), self.regs.len()))
    }

    /// Load `args` into the last `args.len()` registers.
    pub fn load_args(&mut self, args: &[u64]) -> Result<(), Throwable> {
        let len = self.regs.len();
        let start = len.checked_sub(args.len()).ok_or_else(|| {
            Throwable::verify_error(format!("{} arguments for {len} registers", args.len()))
        })?;
        self.regs[start..].copy_from_slice(args);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ThrowableKind;

    #[test]
    fn ints_are_sign_extended() {
        let mut regs = RegisterFile::new(2);
        regs.set_i32(0, -5).unwrap();
        assert_eq!(regs.get(0).unwrap(), u64::MAX - 4);
        assert_eq!(regs.get_i32(0).unwrap(), -5);
    }

    #[test]
    fn out_of_range_is_a_verify_error() {
        let mut regs = RegisterFile::new(2);
        assert_eq!(regs.get(2).unwrap_err().kind, ThrowableKind::VerifyError);
        assert!(regs.set(5, 1).is_err());
        assert!(regs.range(1, 2).is_err());
        assert_eq!(regs.range(0, 2).unwrap(), &[0, 0]);
    }

    #[test]
    fn references_and_null() {
        let mut regs = RegisterFile::new(1);
        assert_eq!(regs.get_ref(0).unwrap(), None);
        let obj = ObjectRef::from_raw(7).unwrap();
        regs.set_ref(0, Some(obj)).unwrap();
        assert_eq!(regs.get_ref(0).unwrap(), Some(obj));
        regs.set_i32(0, -1).unwrap();
        assert!(regs.get_ref(0).is_err());
    }

    #[test]
    fn args_fill_the_top_registers() {
        let mut regs = RegisterFile::new(4);
        regs.load_args(&[8, 9]).unwrap();
        assert_eq!(regs.range(0, 4).unwrap(), &[0, 0, 8, 9]);
        assert!(regs.load_args(&[1; 5]).is_err());
    }
}
