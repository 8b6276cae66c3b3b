use std::collections::TryReserveError;

use super::ExceptionCode;

/// Number of addressable entries in every bank.
pub const REGISTER_SPACE: usize = 0x1_0000;

/// Single-bit banks
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BitBank {
    Coils,
    DiscreteInputs,
}

/// 16-bit banks
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WordBank {
    Holding,
    Input,
}

/// In-memory register image of the emulated device.
///
/// Every bank covers the full Modbus address space and starts zeroed.
/// The map is owned by exactly one transport runtime, so none of the
/// accessors lock.
#[derive(Clone)]
pub struct RegisterMap {
    coils: Vec<bool>,
    discrete_inputs: Vec<bool>,
    holding: Vec<u16>,
    input: Vec<u16>,
}

impl std::fmt::Debug for RegisterMap {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RegisterMap")
            .field("size", &REGISTER_SPACE)
            .finish_non_exhaustive()
    }
}

impl Default for RegisterMap {
    fn default() -> Self {
        Self::new()
    }
}

impl RegisterMap {
    pub fn new() -> Self {
        Self {
            coils: vec![false; REGISTER_SPACE],
            discrete_inputs: vec![false; REGISTER_SPACE],
            holding: vec![0; REGISTER_SPACE],
            input: vec![0; REGISTER_SPACE],
        }
    }

    /// Allocate the four banks without aborting the process on OOM.
    pub fn try_new() -> Result<Self, TryReserveError> {
        Ok(Self {
            coils: zeroed(false)?,
            discrete_inputs: zeroed(false)?,
            holding: zeroed(0)?,
            input: zeroed(0)?,
        })
    }

    pub fn read_bits(
        &self,
        bank: BitBank,
        address: u16,
        count: u16,
    ) -> Result<&[bool], ExceptionCode> {
        let range = checked_range(address, count)?;
        Ok(&self.bits(bank)[range])
    }

    pub fn read_words(
        &self,
        bank: WordBank,
        address: u16,
        count: u16,
    ) -> Result<&[u16], ExceptionCode> {
        let range = checked_range(address, count)?;
        Ok(&self.words(bank)[range])
    }

    pub fn write_word(
        &mut self,
        bank: WordBank,
        address: u16,
        value: u16,
    ) -> Result<(), ExceptionCode> {
        let range = checked_range(address, 1)?;
        let words = match bank {
            WordBank::Holding => &mut self.holding,
            WordBank::Input => &mut self.input,
        };
        words[range.start] = value;
        Ok(())
    }

    pub fn write_bit(
        &mut self,
        bank: BitBank,
        address: u16,
        value: bool,
    ) -> Result<(), ExceptionCode> {
        let range = checked_range(address, 1)?;
        let bits = match bank {
            BitBank::Coils => &mut self.coils,
            BitBank::DiscreteInputs => &mut self.discrete_inputs,
        };
        bits[range.start] = value;
        Ok(())
    }

    fn bits(&self, bank: BitBank) -> &[bool] {
        match bank {
            BitBank::Coils => &self.coils,
            BitBank::DiscreteInputs => &self.discrete_inputs,
        }
    }

    fn words(&self, bank: WordBank) -> &[u16] {
        match bank {
            WordBank::Holding => &self.holding,
            WordBank::Input => &self.input,
        }
    }
}

/// `address + count` may reach the end of the space but never pass it.
fn checked_range(address: u16, count: u16) -> Result<std::ops::Range<usize>, ExceptionCode> {
    let start = usize::from(address);
    let end = start + usize::from(count);
    if end > REGISTER_SPACE {
        return Err(ExceptionCode::IllegalDataAddress);
    }
    Ok(start..end)
}

fn zeroed<T: Clone>(value: T) -> Result<Vec<T>, TryReserveError> {
    let mut bank = Vec::new();
    bank.try_reserve_exact(REGISTER_SPACE)?;
    bank.resize(REGISTER_SPACE, value);
    Ok(bank)
}
