//! Template walkthrough against the loopback transport.
//!
//! Builds a reusable data-register read template, runs it with a few
//! different payloads, and shows the compose operators at work. No
//! hardware needed.
//!
//! ```bash
//! RUST_LOG=debug cargo run --example loopback
//! ```

use std::sync::{Arc, Mutex};

use bitvec::field::BitField;
use jtag_tools::sim::Loopback;
use jtag_tools::{JtagTemplate, TapState, Tdi};

fn main() -> anyhow::Result<()> {
    env_logger::init();

    let transport = Arc::new(Mutex::new(Loopback));

    // One 16-bit data register read; compiled on the first run and reused.
    let mut read16 = JtagTemplate::new(transport.clone()).named("read16");
    read16.read_dr(16, Tdi::var(), true)?;
    for value in [0x0000u128, 0xBEEF, 0x1234] {
        let words = read16.run(&[&[value]])?;
        println!("wrote {value:#06x}, read back {:#06x}", words[0].load_le::<u128>());
    }

    // The same shape, four times over, via the repeat operator.
    let mut burst = JtagTemplate::with_start(transport, TapState::SelectDr).named("burst");
    burst.read_dr(8, Tdi::var(), true)?;
    let mut burst = burst.repeat(4)?;
    let words = burst.run(&[&[1, 2, 3, 4]])?;
    let got: Vec<u128> = words.iter().map(|w| w.load_le::<u128>()).collect();
    println!("burst read back {got:?}");

    Ok(())
}
