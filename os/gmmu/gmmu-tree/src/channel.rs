//! # In-band command streams
//!
//! A [`CommandChannel`] accepts `(subchannel, method offset, value)` triples
//! that the GPU executes later, in order. [`CopyEngine`] encodes the three
//! copy-engine operations the mirror needs on [`CopyEngine::SUBCHANNEL`]:
//!
//! - physical-to-physical copy,
//! - constant fill (32-bit pattern),
//! - 4-byte patch (a one-element fill, used to rewrite page-table entries).
//!
//! Work queued on a channel is only visible once the channel drains. Nothing
//! here waits for that.
//!
//! [`CeDecoder`] is the inverse of the encoder, for channel implementations
//! that execute the stream in software.

use crate::MmuError;
use gmmu_addresses::{Aperture, PhysicalAddress};

/// Sink for GPU methods.
pub trait CommandChannel {
    /// Open the bracket around one logical operation.
    fn begin(&mut self);
    fn method(&mut self, subchannel: u32, offset: u32, value: u32);
    /// Close the bracket opened by [`begin`](Self::begin).
    fn end(&mut self);
}

/// Copy-engine method offsets.
pub mod methods {
    pub const SET_SRC_PHYS_MODE: u32 = 0x0260;
    pub const SET_DST_PHYS_MODE: u32 = 0x0264;
    pub const LAUNCH_DMA: u32 = 0x0300;
    pub const OFFSET_IN_UPPER: u32 = 0x0400;
    pub const OFFSET_IN_LOWER: u32 = 0x0404;
    pub const OFFSET_OUT_UPPER: u32 = 0x0408;
    pub const OFFSET_OUT_LOWER: u32 = 0x040C;
    pub const LINE_LENGTH_IN: u32 = 0x0418;
    pub const SET_REMAP_CONST_A: u32 = 0x0700;
    pub const SET_REMAP_COMPONENTS: u32 = 0x0708;

    /// `LAUNCH_DMA` fields.
    pub mod launch {
        pub const DATA_TRANSFER_NON_PIPELINED: u32 = 2;
        pub const FLUSH_ENABLE: u32 = 1 << 2;
        pub const REMAP_ENABLE: u32 = 1 << 10;
        pub const SRC_PHYSICAL: u32 = 1 << 12;
        pub const DST_PHYSICAL: u32 = 1 << 13;
    }

    /// `SET_REMAP_COMPONENTS` value: one 4-byte component taken from `CONST_A`.
    pub const REMAP_CONST_A_ONE_4B: u32 = 4 | (3 << 16);
}

/// Physical operand of a copy-engine operation.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub struct PhysTarget {
    pub aperture: Aperture,
    pub address: PhysicalAddress,
}

impl PhysTarget {
    #[must_use]
    pub const fn new(aperture: Aperture, address: PhysicalAddress) -> Self {
        Self { aperture, address }
    }
}

const fn phys_mode(aperture: Aperture) -> Option<u32> {
    match aperture {
        Aperture::Video => Some(0),
        Aperture::SysCoherent => Some(1),
        Aperture::SysNonCoherent => Some(2),
        Aperture::Peer => Some(3),
        Aperture::Invalid => None,
    }
}

const fn phys_mode_aperture(mode: u32) -> Aperture {
    match mode {
        0 => Aperture::Video,
        1 => Aperture::SysCoherent,
        2 => Aperture::SysNonCoherent,
        3 => Aperture::Peer,
        _ => Aperture::Invalid,
    }
}

/// Longest line one launch moves.
const MAX_LINE: u64 = 1 << 30;

/// Method encoder for the copy engine.
pub struct CopyEngine;

impl CopyEngine {
    pub const SUBCHANNEL: u32 = 4;

    /// Queue a copy of `len` bytes.
    ///
    /// # Errors
    /// [`MmuError::BadParameter`] for an operand without aperture.
    pub fn copy(
        channel: &mut dyn CommandChannel,
        src: PhysTarget,
        dst: PhysTarget,
        len: u64,
    ) -> Result<(), MmuError> {
        let src_mode = phys_mode(src.aperture)
            .ok_or(MmuError::BadParameter("copy source has no aperture"))?;
        let dst_mode = phys_mode(dst.aperture)
            .ok_or(MmuError::BadParameter("copy destination has no aperture"))?;

        log::trace!("CE copy {len:#x} bytes {src:?} -> {dst:?}");
        channel.begin();
        let mut done = 0;
        while done < len {
            let line = (len - done).min(MAX_LINE);
            Self::emit(channel, methods::SET_SRC_PHYS_MODE, src_mode);
            Self::emit(channel, methods::SET_DST_PHYS_MODE, dst_mode);
            Self::emit_address(channel, methods::OFFSET_IN_UPPER, src.address + done);
            Self::emit_address(channel, methods::OFFSET_OUT_UPPER, dst.address + done);
            Self::emit(channel, methods::LINE_LENGTH_IN, line_u32(line));
            Self::emit(
                channel,
                methods::LAUNCH_DMA,
                methods::launch::DATA_TRANSFER_NON_PIPELINED
                    | methods::launch::FLUSH_ENABLE
                    | methods::launch::SRC_PHYSICAL
                    | methods::launch::DST_PHYSICAL,
            );
            done += line;
        }
        channel.end();
        Ok(())
    }

    /// Queue a fill of `len` bytes with the little-endian 32-bit `pattern`.
    ///
    /// # Errors
    /// [`MmuError::BadParameter`] if `len` is not a multiple of 4 or the
    /// destination has no aperture.
    pub fn fill(
        channel: &mut dyn CommandChannel,
        dst: PhysTarget,
        len: u64,
        pattern: u32,
    ) -> Result<(), MmuError> {
        if !len.is_multiple_of(4) {
            return Err(MmuError::BadParameter("fill length must be a multiple of 4"));
        }
        let dst_mode = phys_mode(dst.aperture)
            .ok_or(MmuError::BadParameter("fill destination has no aperture"))?;

        log::trace!("CE fill {len:#x} bytes at {dst:?} with {pattern:#010x}");
        channel.begin();
        let mut done = 0;
        while done < len {
            let line = (len - done).min(MAX_LINE);
            Self::emit(channel, methods::SET_DST_PHYS_MODE, dst_mode);
            Self::emit(channel, methods::SET_REMAP_CONST_A, pattern);
            Self::emit(channel, methods::SET_REMAP_COMPONENTS, methods::REMAP_CONST_A_ONE_4B);
            Self::emit_address(channel, methods::OFFSET_OUT_UPPER, dst.address + done);
            Self::emit(channel, methods::LINE_LENGTH_IN, line_u32(line / 4));
            Self::emit(
                channel,
                methods::LAUNCH_DMA,
                methods::launch::DATA_TRANSFER_NON_PIPELINED
                    | methods::launch::FLUSH_ENABLE
                    | methods::launch::REMAP_ENABLE
                    | methods::launch::DST_PHYSICAL,
            );
            done += line;
        }
        channel.end();
        Ok(())
    }

    /// Queue a 4-byte write, the unit of in-band page-table updates.
    ///
    /// # Errors
    /// See [`fill`](Self::fill).
    pub fn patch_u32(
        channel: &mut dyn CommandChannel,
        dst: PhysTarget,
        value: u32,
    ) -> Result<(), MmuError> {
        Self::fill(channel, dst, 4, value)
    }

    fn emit(channel: &mut dyn CommandChannel, offset: u32, value: u32) {
        channel.method(Self::SUBCHANNEL, offset, value);
    }

    /// Upper then lower half, at `upper` and `upper + 4`.
    fn emit_address(channel: &mut dyn CommandChannel, upper: u32, address: PhysicalAddress) {
        let (hi, lo) = split_u64(address.as_u64());
        Self::emit(channel, upper, hi);
        Self::emit(channel, upper + 4, lo);
    }
}

#[allow(clippy::cast_possible_truncation)]
const fn split_u64(v: u64) -> (u32, u32) {
    ((v >> 32) as u32, v as u32)
}

#[allow(clippy::cast_possible_truncation)]
const fn line_u32(v: u64) -> u32 {
    debug_assert!(v <= MAX_LINE);
    v as u32
}

/// A decoded copy-engine launch.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum CeOp {
    Copy { src: PhysTarget, dst: PhysTarget, len: u64 },
    Fill { dst: PhysTarget, len: u64, pattern: u32 },
}

/// Reassembles [`CeOp`]s from a copy-engine method stream.
#[derive(Clone, Debug, Default)]
pub struct CeDecoder {
    src_mode: u32,
    dst_mode: u32,
    src: u64,
    dst: u64,
    line: u32,
    const_a: u32,
}

impl CeDecoder {
    #[must_use]
    pub const fn new() -> Self {
        Self {
            src_mode: 0,
            dst_mode: 0,
            src: 0,
            dst: 0,
            line: 0,
            const_a: 0,
        }
    }

    /// Feed one method. Returns the operation a `LAUNCH_DMA` triggers.
    /// Methods on other subchannels are ignored.
    pub const fn method(&mut self, subchannel: u32, offset: u32, value: u32) -> Option<CeOp> {
        if subchannel != CopyEngine::SUBCHANNEL {
            return None;
        }
        match offset {
            methods::SET_SRC_PHYS_MODE => self.src_mode = value,
            methods::SET_DST_PHYS_MODE => self.dst_mode = value,
            methods::OFFSET_IN_UPPER => {
                self.src = (self.src & 0xFFFF_FFFF) | ((value as u64) << 32);
            }
            methods::OFFSET_IN_LOWER => self.src = (self.src & !0xFFFF_FFFF) | value as u64,
            methods::OFFSET_OUT_UPPER => {
                self.dst = (self.dst & 0xFFFF_FFFF) | ((value as u64) << 32);
            }
            methods::OFFSET_OUT_LOWER => self.dst = (self.dst & !0xFFFF_FFFF) | value as u64,
            methods::LINE_LENGTH_IN => self.line = value,
            methods::SET_REMAP_CONST_A => self.const_a = value,
            methods::LAUNCH_DMA => return Some(self.launch(value)),
            _ => {}
        }
        None
    }

    const fn launch(&self, flags: u32) -> CeOp {
        let dst = PhysTarget::new(
            phys_mode_aperture(self.dst_mode),
            PhysicalAddress::new(self.dst),
        );
        if flags & methods::launch::REMAP_ENABLE != 0 {
            CeOp::Fill {
                dst,
                len: self.line as u64 * 4,
                pattern: self.const_a,
            }
        } else {
            CeOp::Copy {
                src: PhysTarget::new(
                    phys_mode_aperture(self.src_mode),
                    PhysicalAddress::new(self.src),
                ),
                dst,
                len: self.line as u64,
            }
        }
    }
}
