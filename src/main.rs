mod cli;

use anyhow::{Context, Result};
use clap::Parser;
use cli::Cli;
use msiremap::device::{
    arena::{DescriptorRef, DeviceArena},
    pci::{
        constants::config_space::capability_id,
        msi_codec,
        msi_descriptor::{MsiDescriptor, MsiWord},
        validate::validate,
    },
};
use tracing::{debug, info, warn, Level};
use tracing_subscriber::FmtSubscriber;

fn print_descriptor(desc: &MsiDescriptor) {
    println!("enabled:            {}", desc.is_enabled());
    println!("64-bit address:     {}", desc.is_64bit());
    println!("per-vector masking: {}", desc.per_vector_masking());
    println!("messages capable:   {}", desc.nr_msg_capable());
    println!("messages enabled:   {}", desc.nr_msg_enabled());
    println!("address:            {:#018x}", desc.addr());
    println!("destination id:     {:#04x}", desc.destid());
    println!("destination mode:   {:?}", desc.dest_mode());
    println!("redirection hint:   {}", desc.redir_hint());
    println!("data:               {:#010x}", desc.data());
    println!("vector:             {:#04x}", desc.vector());
    println!("delivery mode:      {}", desc.deliv_mode());
    println!("trigger mode:       {:?}", desc.trigger_mode());
    println!("trigger level:      {}", desc.trigger_level());
}

fn main() -> Result<()> {
    let args = Cli::parse();

    let subscriber = FmtSubscriber::builder()
        .with_max_level(match args.verbose {
            0 => Level::INFO,
            1 => Level::DEBUG,
            _ => Level::TRACE,
        })
        .finish();

    tracing::subscriber::set_global_default(subscriber)
        .context("Failed to set global tracing subscriber")?;

    let words = args.capability();
    if msi_codec::capability_id(words[0]) != capability_id::MSI {
        warn!(
            "Capability ID {:#04x} is not the MSI capability ID",
            msi_codec::capability_id(words[0])
        );
    }

    let desc = if args.unowned {
        MsiDescriptor::from_words(words, None)
    } else {
        let arena = DeviceArena::new();
        let device = arena
            .add_device("command line", 1)
            .context("Failed to create device record")?;

        *arena
            .update(DescriptorRef::new(device, 0), |desc| {
                for (word, value) in MsiWord::ALL.into_iter().zip(words) {
                    desc.write(word, value);
                }
            })
            .context("Failed to program MSI descriptor")?
    };

    debug!("Decoding MSI capability {words:08x?}");
    print_descriptor(&desc);

    validate(&desc).context("MSI descriptor would be rejected")?;
    info!("MSI descriptor is admissible for remapping");

    Ok(())
}
