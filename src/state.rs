//! Versioned, ordered serialization of primitive hardware state.
//!
//! A [`StateStream`] is the transport for `do_state`: the same sequence of
//! `do_*` calls either appends fields to the stream (save) or restores
//! them in order (load). Fields are fixed-width little-endian, so a
//! save/load pair reproduces register state bit for bit.

use crate::error::VideoError;

/// Bumped whenever the field order or width of any `do_state` changes.
pub const STATE_VERSION: u32 = 1;

#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub enum StateMode {
    Save,
    Load,
}

pub struct StateStream {
    mode: StateMode,
    buf: Vec<u8>,
    pos: usize,
}

impl StateStream {
    /// Open a stream for saving. The version header is written up front.
    pub fn for_save() -> Self {
        let mut stream = Self {
            mode: StateMode::Save,
            buf: Vec::new(),
            pos: 0,
        };
        stream.buf.extend_from_slice(&STATE_VERSION.to_le_bytes());
        stream
    }

    /// Open a previously saved stream for loading. Rejects a stream whose
    /// version header does not match this crate.
    pub fn for_load(bytes: Vec<u8>) -> Result<Self, VideoError> {
        if bytes.len() < 4 {
            return Err(VideoError::StateTruncated(0));
        }
        let found = u32::from_le_bytes(bytes[0..4].try_into().expect("length checked"));
        if found != STATE_VERSION {
            return Err(VideoError::StateVersion {
                found,
                expected: STATE_VERSION,
            });
        }
        Ok(Self {
            mode: StateMode::Load,
            buf: bytes,
            pos: 4,
        })
    }

    pub fn mode(&self) -> StateMode {
        self.mode
    }

    pub fn into_bytes(self) -> Vec<u8> {
        self.buf
    }

    fn take(&mut self, len: usize) -> Result<&[u8], VideoError> {
        if self.pos + len > self.buf.len() {
            return Err(VideoError::StateTruncated(self.pos));
        }
        let slice = &self.buf[self.pos..self.pos + len];
        self.pos += len;
        Ok(slice)
    }

    pub fn do_u32(&mut self, value: &mut u32) -> Result<(), VideoError> {
        match self.mode {
            StateMode::Save => self.buf.extend_from_slice(&value.to_le_bytes()),
            StateMode::Load => {
                *value = u32::from_le_bytes(self.take(4)?.try_into().expect("length checked"));
            }
        }
        Ok(())
    }

    pub fn do_u16(&mut self, value: &mut u16) -> Result<(), VideoError> {
        match self.mode {
            StateMode::Save => self.buf.extend_from_slice(&value.to_le_bytes()),
            StateMode::Load => {
                *value = u16::from_le_bytes(self.take(2)?.try_into().expect("length checked"));
            }
        }
        Ok(())
    }

    pub fn do_u8(&mut self, value: &mut u8) -> Result<(), VideoError> {
        match self.mode {
            StateMode::Save => self.buf.push(*value),
            StateMode::Load => *value = self.take(1)?[0],
        }
        Ok(())
    }

    pub fn do_bool(&mut self, value: &mut bool) -> Result<(), VideoError> {
        let mut raw = *value as u8;
        self.do_u8(&mut raw)?;
        *value = raw != 0;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn round_trips_primitives_in_order() {
        let mut save = StateStream::for_save();
        let mut a = 0xDEAD_BEEFu32;
        let mut b = 0x1234u16;
        let mut c = true;
        save.do_u32(&mut a).unwrap();
        save.do_u16(&mut b).unwrap();
        save.do_bool(&mut c).unwrap();

        let mut load = StateStream::for_load(save.into_bytes()).unwrap();
        let (mut a2, mut b2, mut c2) = (0u32, 0u16, false);
        load.do_u32(&mut a2).unwrap();
        load.do_u16(&mut b2).unwrap();
        load.do_bool(&mut c2).unwrap();
        assert_eq!((a2, b2, c2), (0xDEAD_BEEF, 0x1234, true));
    }

    #[test]
    fn rejects_wrong_version() {
        let mut bytes = (STATE_VERSION + 1).to_le_bytes().to_vec();
        bytes.extend_from_slice(&[0; 8]);
        assert!(matches!(
            StateStream::for_load(bytes),
            Err(VideoError::StateVersion { .. })
        ));
    }

    #[test]
    fn reports_truncation() {
        let bytes = STATE_VERSION.to_le_bytes().to_vec();
        let mut load = StateStream::for_load(bytes).unwrap();
        let mut v = 0u32;
        assert!(matches!(
            load.do_u32(&mut v),
            Err(VideoError::StateTruncated(4))
        ));
    }
}
