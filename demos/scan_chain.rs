//! Chain discovery against the simulated three-device chain.
//!
//! Discovers the chain, prints the report, then uses the middle device's
//! bypass info to address it without disturbing its neighbors.
//!
//! ```bash
//! RUST_LOG=info cargo run --example scan_chain
//! ```

use std::sync::{Arc, Mutex};

use jtag_tools::sim::{VirtualChain, VirtualTap};
use jtag_tools::{Chain, ChainParams, JtagTemplate, PartDb, PartParams, Tdi};

fn main() -> anyhow::Result<()> {
    env_logger::init();

    let transport = Arc::new(Mutex::new(VirtualChain::new(&[
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
    ])));

    let mut db = PartDb::new();
    db.insert(PartParams::new(
        "xxxx0010001101000101000000000011",
        "xxxx01",
        "demo soc",
    ));

    let chain = Chain::discover(transport.clone(), &db, ChainParams::default())?;
    print!("{chain}");

    // Talk to the middle device through the shared shift register.
    let middle = &chain[1];
    let mut write = JtagTemplate::with_bypass(transport.clone(), middle.bypass).named("poke");
    write.write_ir(middle.ir_length, Tdi::Word(0b10_0010), true)?;
    write.write_dr(8, Tdi::var(), true)?;
    write.run(&[&[0xC3]])?;

    let sim = transport.lock().unwrap();
    println!("middle device latched {:#x}", sim.updated_dr(1).unwrap_or(0));
    Ok(())
}
