//! Secure randomness seam.
//!
//! Session ids, hush challenges, and proximity codes all need
//! unpredictable 32-bit values. The engine reaches randomness only through
//! this trait so embedded targets can route to their hardware RNG.

use rand::RngCore;

use crate::error::AlarmError;

/// Source of cryptographically secure random bytes.
pub trait RandomSource {
    /// Fills `out` with random bytes.
    ///
    /// # Errors
    ///
    /// [`AlarmError::RandomDataUnavailable`] when entropy cannot be
    /// obtained; callers treat the output as unusable.
    fn fill(&mut self, out: &mut [u8]) -> Result<(), AlarmError>;

    /// Draws a random `u32`.
    fn random_u32(&mut self) -> Result<u32, AlarmError> {
        let mut bytes = [0u8; 4];
        self.fill(&mut bytes)?;
        Ok(u32::from_le_bytes(bytes))
    }
}

/// Operating-system RNG.
#[derive(Debug, Default, Clone, Copy)]
pub struct OsRandom;

impl RandomSource for OsRandom {
    fn fill(&mut self, out: &mut [u8]) -> Result<(), AlarmError> {
        rand::rngs::OsRng
            .try_fill_bytes(out)
            .map_err(|_| AlarmError::RandomDataUnavailable)
    }
}

#[cfg(test)]
pub(crate) mod testing {
    use super::*;

    /// Deterministic source for tests: returns queued values, then fails.
    pub struct ScriptedRandom {
        pub values: Vec<u32>,
    }

    impl RandomSource for ScriptedRandom {
        fn fill(&mut self, out: &mut [u8]) -> Result<(), AlarmError> {
            if self.values.is_empty() {
                return Err(AlarmError::RandomDataUnavailable);
            }
            let value = self.values.remove(0);
            for (i, b) in out.iter_mut().enumerate() {
                *b = value.to_le_bytes()[i % 4];
            }
            Ok(())
        }
    }
}

#[cfg(test)]
mod tests {
    use super::testing::ScriptedRandom;
    use super::*;

    #[test]
    fn test_os_random_fills() {
        let mut source = OsRandom;
        let mut a = [0u8; 16];
        let mut b = [0u8; 16];
        source.fill(&mut a).unwrap();
        source.fill(&mut b).unwrap();
        assert_ne!(a, b);
    }

    #[test]
    fn test_scripted_random_exhaustion() {
        let mut source = ScriptedRandom {
            values: vec![0xDEAD_BEEF],
        };
        assert_eq!(source.random_u32().unwrap(), 0xDEAD_BEEF);
        assert_eq!(
            source.random_u32(),
            Err(AlarmError::RandomDataUnavailable)
        );
    }
}
