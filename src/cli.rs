//! This module implements the CLI interface.
//!
//! The binary decodes a raw MSI capability image, as it can be read from the PCI Configuration
//! Space of a device, and checks whether it would be admitted for remapping.
use std::num::ParseIntError;

use clap::Parser;

#[derive(Parser, Debug)]
#[command(
    name = env!("CARGO_PKG_NAME"),
    version = env!("CARGO_PKG_VERSION"),
    about = env!("CARGO_PKG_DESCRIPTION"),
    long_about = None
)]
pub struct Cli {
    /// Enable verbose logging. Can be specified multiple times to
    /// increase verbosity.
    #[arg(short, long, action = clap::ArgAction::Count)]
    pub verbose: u8,

    /// Decode the capability without attaching it to a device record.
    ///
    /// Such descriptors never pass validation.
    #[arg(long)]
    pub unowned: bool,

    /// The four dwords of the MSI capability: control, address low,
    /// address high and data. Values are hexadecimal with a `0x`
    /// prefix or decimal.
    #[arg(value_name = "WORD", num_args = 4, required = true, value_parser = parse_word)]
    pub words: Vec<u32>,
}

fn parse_word(value: &str) -> Result<u32, ParseIntError> {
    match value
        .strip_prefix("0x")
        .or_else(|| value.strip_prefix("0X"))
    {
        Some(hex) => u32::from_str_radix(&hex.replace('_', ""), 16),
        None => value.parse(),
    }
}

impl Cli {
    /// The capability image as given on the command line.
    pub fn capability(&self) -> [u32; 4] {
        // Clap enforces exactly four values.
        [self.words[0], self.words[1], self.words[2], self.words[3]]
    }
}
