//! Scan-chain discovery: identify every device on a JTAG chain from raw
//! data-register and instruction-register scans.
//!
//! Both scans shift a lone `1` marker followed by zeros through the chain.
//! The marker delimits the flushed chain contents: ID decode walks the
//! captured bits until only the marker remains, and the marker's position
//! in the instruction-register scan is the total IR length. Candidate
//! per-device IR boundaries are the remaining set bits (IEEE 1149.1 pins
//! every capture to `...01`), searched combinatorially and narrowed by the
//! part database until exactly one partition survives.

use std::fmt;
use std::ops::Deref;
use std::sync::{Arc, Mutex};

use bitvec::prelude::*;
use itertools::Itertools;

use crate::partdb::PartDb;
use crate::template::{JtagTemplate, Tdi};
use crate::transport::Transport;
use crate::xstring::BitString;
use crate::JtagError;

/// A 32-bit JTAG IDCODE. Bit 0 is always 1 for a device that drives an
/// IDCODE; devices without one present a single 0 bypass bit instead.
#[bitfield_struct::bitfield(u32, order = Lsb)]
#[derive(PartialEq, Eq)]
pub struct IdCode {
    pub marker: bool,
    #[bits(11)]
    pub manufacturer: u16,
    #[bits(16)]
    pub part_number: u16,
    #[bits(4)]
    pub version: u8,
}

impl IdCode {
    /// JEP106 manufacturer name, when the 11-bit field decodes to one.
    pub fn manufacturer_name(self) -> Option<&'static str> {
        let field = self.manufacturer();
        jep106::JEP106Code::new((field >> 7) as u8, (field & 0x7f) as u8).get()
    }
}

impl fmt::Display for IdCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let bits = format!("{:032b}", self.into_bits());
        write!(
            f,
            "{}_{}_{}_{}",
            &bits[0..4],
            &bits[4..20],
            &bits[20..31],
            &bits[31..32]
        )
    }
}

/// Filler bit counts locating one part inside a shared shift register.
///
/// `prev_*` bits are shifted after a part's own payload and `next_*` bits
/// before it (the chain is numbered from TDI, and the far end's bits enter
/// first). Instruction filler is all ones (BYPASS); data filler is all
/// zeros (a bypass register is one 0 bit).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct BypassInfo {
    pub prev_ir: usize,
    pub prev_dr: usize,
    pub next_ir: usize,
    pub next_dr: usize,
}

/// One discovered device.
#[derive(Debug, Clone)]
pub struct Part {
    /// `None` for a device sitting in bypass with no IDCODE.
    pub idcode: Option<IdCode>,
    pub name: String,
    pub manufacturer: String,
    pub ir_length: usize,
    /// The value this part's IR captured during the scan.
    pub ir_capture: u32,
    pub bypass: BypassInfo,
}

impl fmt::Display for Part {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let idcode = match self.idcode {
            Some(code) => code.to_string(),
            None => "(none)".to_string(),
        };
        write!(
            f,
            "{} {} (ir_capture = {:0width$b}, idcode = {})",
            self.manufacturer,
            self.name,
            self.ir_capture,
            idcode,
            width = self.ir_length
        )
    }
}

/// Discovery tuning knobs; the defaults match common hardware.
#[derive(Debug, Clone, Copy)]
pub struct ChainParams {
    /// Starting assumption for the number of IDCODE-capable devices; the
    /// scan length grows from here.
    pub min_idcode_devs: usize,
    pub max_idcode_devs: usize,
    /// Extra room for devices that only present a bypass bit.
    pub max_bypass_devs: usize,
    /// Per-device instruction register length bounds. Two is the IEEE
    /// minimum (BYPASS, EXTEST, SAMPLE need two bits of opcode space).
    pub max_ir_bits: usize,
    pub min_ir_bits: usize,
    /// How many times each scan is repeated and cross-checked.
    pub repeat_count: usize,
}

impl Default for ChainParams {
    fn default() -> ChainParams {
        ChainParams {
            min_idcode_devs: 2,
            max_idcode_devs: 32,
            max_bypass_devs: 32,
            max_ir_bits: 10,
            min_ir_bits: 2,
            repeat_count: 4,
        }
    }
}

/// An ordered, read-only description of one physical scan chain.
///
/// Index 0 is the device nearest TDI; the scan itself captures the
/// TDO-nearest device first, so the list is reversed after discovery.
#[derive(Debug)]
pub struct Chain {
    parts: Vec<Part>,
}

impl Deref for Chain {
    type Target = [Part];

    fn deref(&self) -> &[Part] {
        &self.parts
    }
}

impl fmt::Display for Chain {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f)?;
        writeln!(f, "JTAG Chain information")?;
        writeln!(f)?;
        for (i, part) in self.parts.iter().enumerate() {
            writeln!(f, "   #{i} - {part}")?;
        }
        writeln!(f)
    }
}

impl Chain {
    /// Scan the chain behind `transport` and identify every device.
    ///
    /// Physical misbehavior (stuck lines, irreproducible reads) and
    /// unresolvable instruction-register layouts abort with a descriptive
    /// error; discovery never guesses. A part whose resolved capture
    /// disagrees with the database's expectation only logs a warning.
    pub fn discover<T: Transport>(
        transport: Arc<Mutex<T>>,
        db: &PartDb,
        params: ChainParams,
    ) -> Result<Chain, JtagError> {
        Discovery {
            transport,
            db,
            assumed_idcode_devs: params.min_idcode_devs,
            params,
        }
        .run()
    }
}

struct Discovery<'a, T: Transport> {
    transport: Arc<Mutex<T>>,
    db: &'a PartDb,
    params: ChainParams,
    /// Grows as ID scans overflow; kept across repeat reads so every
    /// repeat uses the same scan length.
    assumed_idcode_devs: usize,
}

impl<T: Transport> Discovery<'_, T> {
    fn run(mut self) -> Result<Chain, JtagError> {
        let idcodes = self.read_consistent(false, 0)?;
        let dev_ids = self.find_ids(&idcodes)?;
        let numdevs = dev_ids.len();
        log::info!("found {numdevs} devices on the scan chain");

        let ir = self.read_consistent(true, numdevs)?;
        let mut partitions = self.find_ilengths(&ir, numdevs)?;
        if partitions.len() > 1 && dev_ids.iter().unique().count() != dev_ids.len() {
            strip_duplicate_mismatches(&mut partitions, &dev_ids);
        }
        let mut captures: Vec<Vec<(usize, u32)>> = partitions
            .iter()
            .map(|lengths| icapture_values(&ir, lengths))
            .collect();
        captures.sort();
        captures.dedup();
        self.constrain_captures(&mut captures, &dev_ids);
        if captures.len() != 1 {
            log::error!(
                "cannot resolve the instruction register layout; raw reads: idcode {}, ir {}",
                binary(&idcodes),
                binary(&ir)
            );
            for candidate in &captures {
                log::error!("  surviving candidate: {candidate:?}");
            }
            return Err(JtagError::AmbiguousIr {
                candidates: captures.len(),
            });
        }
        let capture = captures.remove(0);

        let mut parts: Vec<Part> = dev_ids
            .iter()
            .zip(&capture)
            .map(|(&id, &(ir_length, ir_capture))| {
                let name = match self.db.lookup(id) {
                    Some(p) => p.name.clone(),
                    None => "(unknown part)".to_string(),
                };
                let idcode = (id != 0).then(|| IdCode::from_bits(id));
                let manufacturer = idcode
                    .and_then(IdCode::manufacturer_name)
                    .unwrap_or("(unknown manufacturer)")
                    .to_string();
                Part {
                    idcode,
                    name,
                    manufacturer,
                    ir_length,
                    ir_capture,
                    bypass: BypassInfo::default(),
                }
            })
            .collect();
        // Scan order is TDO-first; present the chain from TDI.
        parts.reverse();

        for (index, part) in parts.iter().enumerate() {
            if let Some(code) = part.idcode {
                if let Some(known) = self.db.lookup(code.into_bits()) {
                    if !known.ir_capture.is_empty()
                        && !known
                            .possible_ir()
                            .contains(&(part.ir_length, part.ir_capture))
                    {
                        log::warn!(
                            "expected IR capture {} for part at chain index {index}: {part}",
                            known.ir_capture
                        );
                    }
                }
            }
        }

        let mut prev_ir = 0;
        let mut prev_dr = 0;
        let mut next_ir: usize = parts.iter().map(|p| p.ir_length).sum();
        let mut next_dr = parts.len();
        for part in parts.iter_mut() {
            next_ir -= part.ir_length;
            next_dr -= 1;
            part.bypass = BypassInfo {
                prev_ir,
                prev_dr,
                next_ir,
                next_dr,
            };
            prev_ir += part.ir_length;
            prev_dr += 1;
        }
        for part in &parts {
            log::info!("{part}");
        }
        Ok(Chain { parts })
    }

    /// Repeat a scan and insist the reads agree.
    ///
    /// IR reads get one concession: undriven capture bits can sample
    /// differently run to run, so when the OR of all reads is less than
    /// twice their AND (the disagreement is confined to low bits) the AND
    /// is taken as the answer.
    fn read_consistent(&mut self, is_ir: bool, numdevs: usize) -> Result<BitString, JtagError> {
        let op = if is_ir { "IR" } else { "IDCODE/BYPASS" };
        let mut reads: Vec<BitString> = Vec::new();
        for _ in 0..self.params.repeat_count.max(1) {
            let read = if is_ir {
                self.read_ir_once(numdevs)?
            } else {
                self.read_ids_once()?
            };
            if !reads.contains(&read) {
                reads.push(read);
            }
        }
        if reads.len() > 1 {
            let dump = {
                let mut lines: Vec<String> = reads.iter().map(|r| binary(r)).collect();
                lines.sort();
                lines.join("\n    ")
            };
            if is_ir {
                let mut lo = reads[0].clone();
                let mut hi = reads[0].clone();
                for read in &reads[1..] {
                    lo = bit_and(&lo, read);
                    hi = bit_or(&hi, read);
                }
                if numeric_lt(&hi, &shifted_left(&lo)) {
                    return Ok(lo);
                }
            }
            return Err(JtagError::InconsistentReads { op, dump });
        }
        reads.pop().ok_or(JtagError::EmptyChain("no reads"))
    }

    /// One data-register scan long enough for the assumed chain, grown
    /// exponentially until the capture fits.
    fn read_ids_once(&mut self) -> Result<BitString, JtagError> {
        loop {
            let maxlen = 32 * self.assumed_idcode_devs + self.params.max_bypass_devs + 1;
            let mut template =
                JtagTemplate::new(self.transport.clone()).named("idcode scan");
            template.read_dr(maxlen + 33, Tdi::Word(1), true)?;
            let code = trimmed(template.run(&[])?.into_iter().next().unwrap_or_default());
            if self.checkread(&code, maxlen, "IDCODE/BYPASS")? {
                return Ok(code);
            }
            if self.assumed_idcode_devs >= self.params.max_idcode_devs {
                return Err(JtagError::TooManyDevices(self.params.max_idcode_devs));
            }
            self.assumed_idcode_devs =
                (self.assumed_idcode_devs * 2).min(self.params.max_idcode_devs);
            log::debug!(
                "idcode scan overflowed; retrying with room for {} devices",
                self.assumed_idcode_devs
            );
        }
    }

    fn read_ir_once(&mut self, numdevs: usize) -> Result<BitString, JtagError> {
        let maxlen = numdevs * self.params.max_ir_bits + 1;
        let mut template =
            JtagTemplate::new(self.transport.clone()).named("instruction scan");
        template.read_ir(maxlen + self.params.max_ir_bits + 1, Tdi::Word(1), true)?;
        let ir = trimmed(template.run(&[])?.into_iter().next().unwrap_or_default());
        if !self.checkread(&ir, maxlen, "IR")? {
            return Err(JtagError::OverlongIr(binary(&ir)));
        }
        Ok(ir)
    }

    /// Stuck-line detection plus the does-it-fit verdict.
    fn checkread(&self, code: &BitString, maxlen: usize, op: &'static str) -> Result<bool, JtagError> {
        if code.not_any() {
            return Err(JtagError::ChainStuck { level: 0, op });
        }
        if code.len() >= maxlen && code[..maxlen].all() {
            return Err(JtagError::ChainStuck { level: 1, op });
        }
        Ok(code.len() <= maxlen)
    }

    /// Walk the captured data-register stream: a 0 bit is a bypassed
    /// device, a 1 bit starts a 32-bit IDCODE. Stops when only the flush
    /// marker is left. Device IDs come out in scan order (TDO end first).
    fn find_ids(&self, bits: &BitString) -> Result<Vec<u32>, JtagError> {
        let mut devices: Vec<u32> = Vec::new();
        let mut cursor = 0;
        while bits[cursor..].count_ones() > 1 {
            if !bits[cursor] {
                devices.push(0);
                cursor += 1;
            } else {
                if cursor + 32 > bits.len() {
                    return Err(JtagError::TruncatedIdcode);
                }
                let mut value = 0u32;
                for k in 0..32 {
                    if bits[cursor + k] {
                        value |= 1 << k;
                    }
                }
                devices.push(value);
                cursor += 32;
            }
            if bits[cursor..].not_any() {
                return Err(JtagError::TruncatedIdcode);
            }
        }
        if devices.is_empty() {
            return Err(JtagError::EmptyChain("data"));
        }
        Ok(devices)
    }

    /// Enumerate every plausible per-device split of the instruction
    /// register. The marker's position is the total length; internal set
    /// bits are candidate device boundaries.
    fn find_ilengths(
        &self,
        ir: &BitString,
        numdevs: usize,
    ) -> Result<Vec<Vec<usize>>, JtagError> {
        let mut ones: Vec<usize> = ir.iter_ones().collect();
        let total = match ones.pop() {
            Some(total) => total,
            None => return Err(JtagError::EmptyChain("instruction")),
        };
        if ones.is_empty() {
            return Err(JtagError::EmptyChain("instruction"));
        }
        if ones[0] != 0 {
            return Err(JtagError::IllegalLastDevice(binary(ir)));
        }
        if ones.len() < numdevs {
            return Err(JtagError::BrokenIr {
                devices: numdevs,
                capture: binary(ir),
            });
        }
        if numdevs == 1 {
            return Ok(vec![vec![total]]);
        }
        let mut partitions = Vec::new();
        for combo in ones[1..].iter().copied().combinations(numdevs - 1) {
            let mut bounds = Vec::with_capacity(numdevs + 1);
            bounds.push(0);
            bounds.extend(combo.iter().copied());
            bounds.push(total);
            let lengths: Vec<usize> = bounds.windows(2).map(|w| w[1] - w[0]).collect();
            if lengths.iter().min().copied().unwrap_or(0) >= self.params.min_ir_bits {
                partitions.push(lengths);
            }
        }
        Ok(partitions)
    }

    /// Drop candidates that contradict the database's expected capture
    /// patterns for known parts.
    fn constrain_captures(&self, captures: &mut Vec<Vec<(usize, u32)>>, dev_ids: &[u32]) {
        for (index, &id) in dev_ids.iter().enumerate() {
            if captures.len() <= 1 {
                break;
            }
            let possible = match self.db.lookup(id) {
                Some(params) => params.possible_ir(),
                None => continue,
            };
            if possible.is_empty() {
                continue;
            }
            captures.retain(|candidate| possible.contains(&candidate[index]));
        }
    }
}

/// Identical parts must have identical instruction lengths; drop any
/// partition that says otherwise.
fn strip_duplicate_mismatches(partitions: &mut Vec<Vec<usize>>, dev_ids: &[u32]) {
    let mut groups: std::collections::HashMap<u32, Vec<usize>> = std::collections::HashMap::new();
    for (i, &id) in dev_ids.iter().enumerate() {
        if id != 0 {
            groups.entry(id).or_default().push(i);
        }
    }
    let dups: Vec<Vec<usize>> = groups.into_values().filter(|g| g.len() > 1).collect();
    partitions.retain(|partition| {
        dups.iter()
            .all(|group| group.iter().map(|&i| partition[i]).all_equal())
    });
}

/// Split a partition's lengths into per-device (length, capture) pairs.
fn icapture_values(ir: &BitString, lengths: &[usize]) -> Vec<(usize, u32)> {
    let mut shift = 0;
    let mut out = Vec::with_capacity(lengths.len());
    for &len in lengths {
        let mut value = 0u32;
        for k in 0..len {
            if shift + k < ir.len() && ir[shift + k] {
                value |= 1 << k;
            }
        }
        out.push((len, value));
        shift += len;
    }
    out
}

/// Drop high zero bits so reads compare as integers.
fn trimmed(mut bits: BitString) -> BitString {
    while bits.last().map(|b| !*b).unwrap_or(false) {
        bits.pop();
    }
    bits
}

fn bit_and(a: &BitString, b: &BitString) -> BitString {
    let len = a.len().min(b.len());
    let mut out = BitString::with_capacity(len);
    for i in 0..len {
        out.push(a[i] && b[i]);
    }
    trimmed(out)
}

fn bit_or(a: &BitString, b: &BitString) -> BitString {
    let (longer, shorter) = if a.len() >= b.len() { (a, b) } else { (b, a) };
    let mut out = longer.clone();
    for i in 0..shorter.len() {
        let bit = out[i] || shorter[i];
        out.set(i, bit);
    }
    out
}

/// Numeric comparison of trimmed little-endian bit strings.
fn numeric_lt(a: &BitString, b: &BitString) -> bool {
    if a.len() != b.len() {
        return a.len() < b.len();
    }
    for i in (0..a.len()).rev() {
        if a[i] != b[i] {
            return !a[i];
        }
    }
    false
}

fn shifted_left(a: &BitString) -> BitString {
    let mut out = BitString::with_capacity(a.len() + 1);
    out.push(false);
    out.extend_from_bitslice(a);
    trimmed(out)
}

/// MSB-first rendering, matching `{:b}` on an integer.
fn binary(bits: &BitString) -> String {
    if bits.is_empty() {
        return "0".to_string();
    }
    bits.iter().by_vals().rev().map(|b| if b { '1' } else { '0' }).collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::partdb::PartParams;
    use crate::sim::{Stuck, VirtualChain, VirtualTap};
    use crate::template::{JtagTemplate, Tdi};

    fn three_device_chain() -> Arc<Mutex<VirtualChain>> {
        Arc::new(Mutex::new(VirtualChain::new(&[
            VirtualTap {
                idcode: Some(0xABCD_0001),
                ir_length: 4,
                ir_capture: 0b0001,
                dr_length: 8,
            },
            VirtualTap {
                idcode: Some(0x1234_5003),
                ir_length: 6,
                ir_capture: 0b00_0001,
                dr_length: 8,
            },
            VirtualTap {
                idcode: None,
                ir_length: 2,
                ir_capture: 0b01,
                dr_length: 8,
            },
        ])))
    }

    #[test]
    fn discovers_a_three_device_chain() {
        let transport = three_device_chain();
        let chain = Chain::discover(transport, &PartDb::new(), ChainParams::default()).unwrap();
        assert_eq!(chain.len(), 3);
        // Chain order runs from TDI.
        assert_eq!(chain[0].idcode.map(IdCode::into_bits), Some(0xABCD_0001));
        assert_eq!(chain[1].idcode.map(IdCode::into_bits), Some(0x1234_5003));
        assert_eq!(chain[2].idcode, None);
        assert_eq!(
            chain.iter().map(|p| p.ir_length).collect::<Vec<_>>(),
            vec![4, 6, 2]
        );
        assert_eq!(
            chain.iter().map(|p| p.ir_capture).collect::<Vec<_>>(),
            vec![0b0001, 0b000001, 0b01]
        );
        assert_eq!(
            chain[1].bypass,
            BypassInfo {
                prev_ir: 4,
                prev_dr: 1,
                next_ir: 2,
                next_dr: 1
            }
        );
        assert_eq!(chain[0].bypass.next_ir, 8);
        assert_eq!(chain[2].bypass.prev_ir, 10);
    }

    #[test]
    fn addressing_the_middle_device_leaves_neighbors_alone() {
        let transport = three_device_chain();
        let chain =
            Chain::discover(transport.clone(), &PartDb::new(), ChainParams::default()).unwrap();

        let mut template = JtagTemplate::with_bypass(transport.clone(), chain[1].bypass);
        template.write_ir(6, Tdi::Word(0b101001), true).unwrap();
        template.write_dr(8, Tdi::Word(0xA5), true).unwrap();
        template.run(&[]).unwrap();

        let sim = transport.lock().unwrap();
        // Neighbors got the all-ones BYPASS opcode; the target got ours.
        assert_eq!(sim.instruction(0), 0b1111);
        assert_eq!(sim.instruction(1), 0b101001);
        assert_eq!(sim.instruction(2), 0b11);
        // The data shift landed in the middle device; the bypassed
        // neighbors latched their single zero filler bit.
        assert_eq!(sim.updated_dr(1), Some(0xA5));
        assert_eq!(sim.updated_dr(0), Some(0));
        assert_eq!(sim.updated_dr(2), Some(0));
    }

    #[test]
    fn stuck_lines_abort_discovery() {
        for (level, stuck) in [(0u8, Stuck(false)), (1u8, Stuck(true))] {
            let transport = Arc::new(Mutex::new(stuck));
            let err = Chain::discover(transport, &PartDb::new(), ChainParams::default())
                .unwrap_err();
            match err {
                JtagError::ChainStuck { level: got, .. } => assert_eq!(got, level),
                other => panic!("expected a stuck-chain error, got {other}"),
            }
        }
    }

    #[test]
    fn duplicate_parts_disambiguate_the_ir_layout() {
        // Two identical devices whose captures leave the split ambiguous;
        // identical parts must get identical lengths, which settles it.
        let transport = Arc::new(Mutex::new(VirtualChain::new(&[
            VirtualTap {
                idcode: Some(0xABCD_0001),
                ir_length: 4,
                ir_capture: 0b0101,
                dr_length: 4,
            },
            VirtualTap {
                idcode: Some(0xABCD_0001),
                ir_length: 4,
                ir_capture: 0b0101,
                dr_length: 4,
            },
        ])));
        let chain = Chain::discover(transport, &PartDb::new(), ChainParams::default()).unwrap();
        assert_eq!(
            chain.iter().map(|p| p.ir_length).collect::<Vec<_>>(),
            vec![4, 4]
        );
    }

    #[test]
    fn database_pattern_settles_an_ambiguous_layout() {
        let taps = [
            VirtualTap {
                idcode: Some(0xABCD_0001),
                ir_length: 4,
                ir_capture: 0b0101,
                dr_length: 4,
            },
            VirtualTap {
                idcode: Some(0x1234_5003),
                ir_length: 4,
                ir_capture: 0b0101,
                dr_length: 4,
            },
        ];
        // Without database help the three candidate splits survive.
        let transport = Arc::new(Mutex::new(VirtualChain::new(&taps)));
        let err = Chain::discover(transport, &PartDb::new(), ChainParams::default()).unwrap_err();
        assert!(matches!(err, JtagError::AmbiguousIr { candidates: 3 }));

        // A known capture pattern for one part settles the split.
        let mut db = PartDb::new();
        db.insert(PartParams::new(
            "xxxx0010001101000101000000000011",
            "0101",
            "known part",
        ));
        let transport = Arc::new(Mutex::new(VirtualChain::new(&taps)));
        let chain = Chain::discover(transport, &db, ChainParams::default()).unwrap();
        assert_eq!(
            chain.iter().map(|p| p.ir_length).collect::<Vec<_>>(),
            vec![4, 4]
        );
        assert_eq!(chain[1].name, "known part");
    }

    #[test]
    fn helper_arithmetic() {
        let five = trimmed([true, false, true, false].iter().copied().collect());
        let ten = shifted_left(&five);
        assert!(numeric_lt(&five, &ten));
        assert!(!numeric_lt(&ten, &five));
        assert_eq!(binary(&ten), "1010");
        let three = trimmed([true, true, false].iter().copied().collect());
        assert_eq!(binary(&bit_and(&five, &three)), "1");
        assert_eq!(binary(&bit_or(&five, &three)), "111");
    }
}
