//! Software transports: a bit-true TAP chain simulator plus a few trivial
//! cables for exercising templates without hardware.
//!
//! [`VirtualChain`] models N daisy-chained TAPs sharing TMS: capture,
//! shift and update of both registers, IDCODE-or-BYPASS selection out of
//! reset, and bypass fallback for unknown instructions. It is the test
//! bed for chain discovery, and doubles as a worked example of the
//! [`Transport`] contract.

use crate::states::TapState;
use crate::transport::Transport;
use crate::xstring::{BitString, TemplateStrings, XBit, XString};
use crate::JtagError;

/// Echoes TDI straight back as TDO.
pub struct Loopback;

impl Transport for Loopback {
    type Compiled = ();

    fn make_template(&mut self, _strings: &TemplateStrings) -> Result<(), JtagError> {
        Ok(())
    }

    fn apply_template(&mut self, _compiled: &(), tdi: &BitString) -> Result<BitString, JtagError> {
        Ok(tdi.clone())
    }
}

/// TDO wired to a constant level, as seen on a broken or absent chain.
pub struct Stuck(pub bool);

impl Transport for Stuck {
    type Compiled = ();

    fn make_template(&mut self, _strings: &TemplateStrings) -> Result<(), JtagError> {
        Ok(())
    }

    fn apply_template(&mut self, _compiled: &(), tdi: &BitString) -> Result<BitString, JtagError> {
        Ok(BitString::repeat(self.0, tdi.len()))
    }
}

/// A loopback that exercises the driver customization hook: one command
/// bit is spliced ahead of every eight data clocks on TDI, with matching
/// spacer positions on TDO, the way real protocol engines interleave
/// command bytes with shift data.
#[derive(Default)]
pub struct Framed;

impl Transport for Framed {
    type Compiled = ();

    fn customize_template(&mut self, tdi: XString, tdo: XString) -> (XString, XString) {
        // Work in time order, then flip back to wire order.
        let mut out_tdi: Vec<XBit> = Vec::with_capacity(tdi.len() + tdi.len() / 8 + 1);
        let mut out_tdo: Vec<XBit> = Vec::with_capacity(out_tdi.capacity());
        let chrono_tdi: Vec<XBit> = tdi.bits().iter().rev().copied().collect();
        let chrono_tdo: Vec<XBit> = tdo.bits().iter().rev().copied().collect();
        for (chunk_tdi, chunk_tdo) in chrono_tdi.chunks(8).zip(chrono_tdo.chunks(8)) {
            out_tdi.push(XBit::Zero);
            out_tdo.push(XBit::DontCare);
            out_tdi.extend_from_slice(chunk_tdi);
            out_tdo.extend_from_slice(chunk_tdo);
        }
        (
            out_tdi.into_iter().rev().collect(),
            out_tdo.into_iter().rev().collect(),
        )
    }

    fn make_template(&mut self, _strings: &TemplateStrings) -> Result<(), JtagError> {
        Ok(())
    }

    fn apply_template(&mut self, _compiled: &(), tdi: &BitString) -> Result<BitString, JtagError> {
        Ok(tdi.clone())
    }
}

/// Configuration of one simulated TAP.
#[derive(Debug, Clone, Copy)]
pub struct VirtualTap {
    /// `None` models a part that powers up in bypass with no IDCODE.
    pub idcode: Option<u32>,
    pub ir_length: usize,
    /// Value loaded into the IR on Capture-IR (IEEE requires `...01`).
    pub ir_capture: u32,
    /// Length of the scratch data register selected by any instruction
    /// other than all-ones BYPASS.
    pub dr_length: usize,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum DrSelect {
    Idcode,
    Bypass,
    Data,
}

#[derive(Debug)]
struct TapModel {
    config: VirtualTap,
    ir_shift: Vec<bool>,
    instruction: Vec<bool>,
    selected: DrSelect,
    dr_shift: Vec<bool>,
    data: Vec<bool>,
    updated_dr: Option<Vec<bool>>,
}

impl TapModel {
    fn new(config: VirtualTap) -> TapModel {
        TapModel {
            config,
            ir_shift: vec![false; config.ir_length],
            instruction: vec![true; config.ir_length],
            selected: DrSelect::Bypass,
            dr_shift: vec![false],
            data: vec![false; config.dr_length],
            updated_dr: None,
        }
    }

    fn reset(&mut self) {
        self.instruction = vec![true; self.config.ir_length];
        self.selected = if self.config.idcode.is_some() {
            DrSelect::Idcode
        } else {
            DrSelect::Bypass
        };
    }

    fn capture_ir(&mut self) {
        self.ir_shift = word_to_bits(self.config.ir_capture as u128, self.config.ir_length);
    }

    fn capture_dr(&mut self) {
        self.dr_shift = match self.selected {
            DrSelect::Idcode => match self.config.idcode {
                Some(code) => word_to_bits(code as u128, 32),
                None => vec![false],
            },
            DrSelect::Bypass => vec![false],
            DrSelect::Data => self.data.clone(),
        };
    }

    fn update_ir(&mut self) {
        self.instruction = self.ir_shift.clone();
        // Anything that is not the all-ones BYPASS opcode selects the
        // scratch data register; decoding real opcodes is not modelled.
        self.selected = if self.instruction.iter().all(|&b| b) {
            DrSelect::Bypass
        } else {
            DrSelect::Data
        };
    }

    fn update_dr(&mut self) {
        self.updated_dr = Some(self.dr_shift.clone());
        if self.selected == DrSelect::Data {
            self.data = self.dr_shift.clone();
        }
    }
}

fn word_to_bits(value: u128, len: usize) -> Vec<bool> {
    (0..len).map(|k| k < 128 && value >> k & 1 == 1).collect()
}

fn bits_to_word(bits: &[bool]) -> u128 {
    bits.iter()
        .enumerate()
        .take(128)
        .fold(0, |acc, (k, &b)| acc | (u128::from(b) << k))
}

/// A daisy chain of simulated TAPs. Index 0 sits nearest TDI; TDO comes
/// off the last TAP.
#[derive(Debug)]
pub struct VirtualChain {
    taps: Vec<TapModel>,
    state: TapState,
}

impl VirtualChain {
    pub fn new(taps: &[VirtualTap]) -> VirtualChain {
        VirtualChain {
            taps: taps.iter().copied().map(TapModel::new).collect(),
            // Power-up state is arbitrary; templates reset first.
            state: TapState::PauseDr,
        }
    }

    pub fn state(&self) -> TapState {
        self.state
    }

    /// The latched instruction of one TAP, LSB first.
    pub fn instruction(&self, tap: usize) -> u128 {
        bits_to_word(&self.taps[tap].instruction)
    }

    /// What the TAP latched at the last Update-DR, if any.
    pub fn updated_dr(&self, tap: usize) -> Option<u128> {
        self.taps[tap].updated_dr.as_deref().map(bits_to_word)
    }

    /// Advance the whole chain by one TCK cycle.
    ///
    /// Register actions fire in the state the controller occupies during
    /// the cycle; the TMS level picks the next state. Shifting moves every
    /// register one position toward TDO, each TAP handing its pre-shift
    /// low bit to its neighbor.
    fn clock(&mut self, tms: bool, tdi: bool) -> bool {
        match self.state {
            TapState::Reset => {
                for tap in &mut self.taps {
                    tap.reset();
                }
            }
            TapState::CaptureIr => {
                for tap in &mut self.taps {
                    tap.capture_ir();
                }
            }
            TapState::CaptureDr => {
                for tap in &mut self.taps {
                    tap.capture_dr();
                }
            }
            TapState::UpdateIr => {
                for tap in &mut self.taps {
                    tap.update_ir();
                }
            }
            TapState::UpdateDr => {
                for tap in &mut self.taps {
                    tap.update_dr();
                }
            }
            _ => {}
        }
        let out = match self.state {
            TapState::ShiftIr => self.shift(tdi, true),
            TapState::ShiftDr => self.shift(tdi, false),
            _ => false,
        };
        self.state = self.state.step(tms);
        out
    }

    fn shift(&mut self, tdi: bool, instruction: bool) -> bool {
        let mut in_bit = tdi;
        for tap in &mut self.taps {
            let reg = if instruction {
                &mut tap.ir_shift
            } else {
                &mut tap.dr_shift
            };
            if reg.is_empty() {
                continue;
            }
            let out = reg.remove(0);
            reg.push(in_bit);
            in_bit = out;
        }
        in_bit
    }
}

impl Transport for VirtualChain {
    /// The wire-order TMS string; TDI arrives per invocation.
    type Compiled = BitString;

    fn make_template(&mut self, strings: &TemplateStrings) -> Result<BitString, JtagError> {
        Ok(strings.tms().clone())
    }

    fn apply_template(
        &mut self,
        tms: &BitString,
        tdi: &BitString,
    ) -> Result<BitString, JtagError> {
        assert_eq!(
            tms.len(),
            tdi.len(),
            "TMS and TDI string lengths disagree"
        );
        let mut out = BitString::repeat(false, tms.len());
        // Wire order is reversed time order; replay right to left.
        for i in (0..tms.len()).rev() {
            let tdo = self.clock(tms[i], tdi[i]);
            out.set(i, tdo);
        }
        Ok(out)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::template::{JtagTemplate, Tdi};
    use bitvec::prelude::*;
    use std::sync::{Arc, Mutex};

    fn single_tap() -> Arc<Mutex<VirtualChain>> {
        Arc::new(Mutex::new(VirtualChain::new(&[VirtualTap {
            idcode: Some(0x1234_5003),
            ir_length: 4,
            ir_capture: 0b0001,
            dr_length: 8,
        }])))
    }

    #[test]
    fn idcode_comes_out_after_reset() {
        let transport = single_tap();
        let mut t = JtagTemplate::new(transport);
        t.read_dr(33, Tdi::Word(1), true).unwrap();
        let words = t.run(&[]).unwrap();
        // 32 bits of IDCODE, then the flush marker we shifted in.
        assert_eq!(words[0].load_le::<u64>(), 0x1_1234_5003);
    }

    #[test]
    fn instruction_register_captures_its_pattern() {
        let transport = single_tap();
        let mut t = JtagTemplate::new(transport);
        t.read_ir(6, Tdi::Word(1), true).unwrap();
        let words = t.run(&[]).unwrap();
        // 4 capture bits, then the marker.
        assert_eq!(words[0].load_le::<u64>(), 0b01_0001);
    }

    #[test]
    fn written_instruction_is_latched() {
        let transport = single_tap();
        let mut t = JtagTemplate::new(transport.clone());
        t.write_ir(4, Tdi::Word(0b1010), true).unwrap();
        t.run(&[]).unwrap();
        assert_eq!(transport.lock().unwrap().instruction(0), 0b1010);
    }

    #[test]
    fn data_register_roundtrips_through_update() {
        let transport = single_tap();
        let mut t = JtagTemplate::new(transport.clone());
        t.write_ir(4, Tdi::Word(0b0010), true).unwrap();
        t.write_dr(8, Tdi::Word(0x5A), true).unwrap();
        t.run(&[]).unwrap();
        {
            let sim = transport.lock().unwrap();
            assert_eq!(sim.updated_dr(0), Some(0x5A));
        }
        // A fresh read of the selected register sees the updated value.
        let mut t = JtagTemplate::new(transport.clone());
        t.write_ir(4, Tdi::Word(0b0010), true).unwrap();
        t.read_dr(8, Tdi::Word(0), true).unwrap();
        let words = t.run(&[]).unwrap();
        assert_eq!(words[0].load_le::<u64>(), 0x5A);
    }

    #[test]
    fn reset_reselects_idcode() {
        let transport = single_tap();
        let mut t = JtagTemplate::new(transport.clone());
        t.write_ir(4, Tdi::Word(0b1111), true).unwrap();
        t.run(&[]).unwrap();
        // In bypass the DR is one zero bit; the marker comes straight out.
        let mut t = JtagTemplate::with_start(transport.clone(), TapState::SelectDr);
        t.read_dr(2, Tdi::Word(1), true).unwrap();
        let words = t.run(&[]).unwrap();
        assert_eq!(words[0].load_le::<u64>(), 0b10);
        // A full reset puts the IDCODE register back.
        let mut t = JtagTemplate::new(transport);
        t.read_dr(33, Tdi::Word(1), true).unwrap();
        let words = t.run(&[]).unwrap();
        assert_eq!(words[0].load_le::<u64>(), 0x1_1234_5003);
    }
}
