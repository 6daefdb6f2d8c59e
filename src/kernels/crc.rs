//! X-Modem CRC-16 (polynomial 0x1021), one checksum per core
//!
//! The designated unit builds the byte lookup table and the bit-reversal
//! table in shared memory. Thread 0 of every core then stages a private copy
//! of the message line, computes the string CRC `i1`, appends it to the line
//! and computes the packet CRC `i2`, which is zero for a correct packet. Core
//! `c` stores `i2` at slot `2c` and `i1` at slot `2c + 1`.
//!
//! Bytes are addressed from index 1: index 0 of the line is never read.

use crate::backend::UnitContext;
use crate::datasets::CRC_MESSAGE;
use crate::error::{ForgeResult, NpuForgeError};
use crate::grid::Grid;
use crate::kernels::{KernelOutput, PhasedKernel};
use crate::memory::SharedBuffer;
use crate::problem_error;
use crate::publish::{PublishReport, ResultPublisher};
use crate::sync::{PhaseId, PhasePlan};

pub const POLYNOMIAL: u16 = 0x1021;

/// Bytes in the message line
pub const LINE_LEN: usize = 256;

/// Result slots, two per core
pub const RESULT_SLOTS: usize = 16;

/// Checksummed length of the message
const MESSAGE_LEN: usize = 40;

const BUILD_TABLE: PhaseId = PhaseId(0);
const CHECKSUM: PhaseId = PhaseId(1);

const LINE: &str = "line";

/// Nibble bit-reversal
const NIBBLE_REV: [u8; 16] = [0, 8, 4, 12, 2, 10, 6, 14, 1, 9, 5, 13, 3, 11, 7, 15];

/// Shift one byte through the CRC register
pub fn icrc1(crc: u16, byte: u8) -> u16 {
    let mut ans = crc ^ (u16::from(byte) << 8);
    for _ in 0..8 {
        ans = if ans & 0x8000 != 0 {
            (ans << 1) ^ POLYNOMIAL
        } else {
            ans << 1
        };
    }
    ans
}

fn reverse_byte(byte: u8) -> u8 {
    NIBBLE_REV[usize::from(byte & 0xF)] << 4 | NIBBLE_REV[usize::from(byte >> 4)]
}

fn hi(word: u16) -> u8 {
    (word >> 8) as u8
}

fn lo(word: u16) -> u8 {
    (word & 0xFF) as u8
}

pub struct CrcKernel {
    grid: Grid,
    message: SharedBuffer<u32>,
    table: SharedBuffer<u32>,
    reversed: SharedBuffer<u32>,
    result: SharedBuffer<u32>,
    plan: PhasePlan,
    publisher: ResultPublisher<u32>,
}

impl CrcKernel {
    /// `message` must fit the line with room for the appended checksum
    pub fn new(grid: Grid, message: &[u8]) -> ForgeResult<Self> {
        if grid.core_count() * 2 > RESULT_SLOTS {
            return Err(problem_error!(
                "{} cores need {} result slots, only {} exist",
                grid.core_count(),
                grid.core_count() * 2,
                RESULT_SLOTS
            ));
        }
        if message.len() > MESSAGE_LEN + 1 {
            return Err(problem_error!(
                "message of {} bytes exceeds {} bytes",
                message.len(),
                MESSAGE_LEN + 1
            ));
        }

        let mut line = vec![0u32; LINE_LEN];
        for (slot, byte) in line.iter_mut().zip(message) {
            *slot = u32::from(*byte);
        }

        Ok(CrcKernel {
            grid,
            message: SharedBuffer::from_slice(&line),
            table: SharedBuffer::zeroed(256),
            reversed: SharedBuffer::zeroed(256),
            result: SharedBuffer::zeroed(RESULT_SLOTS),
            plan: PhasePlan::builder()
                .phase("build_table", 42)
                .phase("checksum", 43)
                .build()?,
            publisher: ResultPublisher::new(RESULT_SLOTS),
        })
    }

    pub fn with_default_data(grid: Grid) -> ForgeResult<Self> {
        Self::new(grid, CRC_MESSAGE)
    }

    fn build_tables(&self) {
        for j in 0..=255u8 {
            self.table.set(usize::from(j), u32::from(icrc1(u16::from(j) << 8, 0)));
            self.reversed.set(usize::from(j), u32::from(reverse_byte(j)));
        }
    }

    fn table(&self, index: u8) -> u16 {
        self.table.get(usize::from(index)) as u16
    }

    fn rev(&self, byte: u8) -> u16 {
        self.reversed.get(usize::from(byte)) as u16
    }

    /// CRC of `line[1..=len]`
    ///
    /// `jinit >= 0` seeds the register with that byte repeated; otherwise
    /// `crc` is used. `jrev < 0` processes bit-reversed bytes and returns a
    /// bit-reversed result.
    fn icrc(&self, line: &[u32], crc: u16, len: usize, jinit: i16, jrev: i32) -> u16 {
        let mut cword = crc;
        if jinit >= 0 {
            let seed = u16::from(jinit as u8);
            cword = seed | seed << 8;
        } else if jrev < 0 {
            cword = self.rev(hi(cword)) | self.rev(lo(cword)) << 8;
        }

        for &byte in &line[1..=len] {
            let byte = byte as u8;
            let index = if jrev < 0 {
                self.rev(byte) as u8 ^ hi(cword)
            } else {
                byte ^ hi(cword)
            };
            cword = self.table(index) ^ u16::from(lo(cword)) << 8;
        }

        if jrev >= 0 {
            cword
        } else {
            self.rev(hi(cword)) | self.rev(lo(cword)) << 8
        }
    }

    fn checksum(&self, ctx: &mut UnitContext<'_>) -> ForgeResult<()> {
        let core = ctx.unit().core_id;
        let mut scratch = ctx.scratch_mut().scoped(LINE);
        let line = scratch.stage_in(LINE, &self.message, 0, LINE_LEN)?;

        line[MESSAGE_LEN + 1] = 0;
        let i1 = self.icrc(line.as_slice(), 0, MESSAGE_LEN, 0, 1);
        line[MESSAGE_LEN + 1] = u32::from(hi(i1));
        line[MESSAGE_LEN + 2] = u32::from(lo(i1));
        let i2 = self.icrc(line.as_slice(), i1, MESSAGE_LEN + 2, 0, 1);

        self.result.set(core * 2, u32::from(i2));
        self.result.set(core * 2 + 1, u32::from(i1));
        tracing::debug!(core, i1, i2, "core checksum");
        Ok(())
    }
}

impl PhasedKernel for CrcKernel {
    fn name(&self) -> &'static str {
        "crc"
    }

    fn grid(&self) -> Grid {
        self.grid
    }

    fn plan(&self) -> &PhasePlan {
        &self.plan
    }

    fn reset(&self) {
        self.table.reset();
        self.reversed.reset();
        self.result.reset();
        self.publisher.reset();
    }

    fn run_phase(&self, phase: PhaseId, ctx: &mut UnitContext<'_>) -> ForgeResult<()> {
        match phase {
            BUILD_TABLE => {
                if ctx.is_designated() {
                    self.build_tables();
                }
                Ok(())
            }
            CHECKSUM => {
                if ctx.unit().is_core_leader() {
                    self.checksum(ctx)?;
                }
                Ok(())
            }
            other => Err(NpuForgeError::UnknownPhase(other.0)),
        }
    }

    fn publish(&self, ctx: &mut UnitContext<'_>) -> ForgeResult<PublishReport> {
        self.publisher.publish(ctx, &self.result)
    }

    fn output(&self) -> KernelOutput {
        KernelOutput::from(self.result.committed_prefix(self.publisher.element_count()))
    }
}
