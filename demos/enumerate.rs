//! Lists the audio endpoints, their default formats, and the formats a shared and an exclusive
//! stream would negotiate for them.

use clap::Parser;
use wasapi_engine::host::simulated::SimulatedBackend;
use wasapi_engine::{FormatRequest, Host, SampleFormat, ShareMode};

#[derive(Parser, Debug)]
#[command(version, about = "wasapi-engine enumerate example", long_about = None)]
struct Opt {
    /// Use the in-process simulated devices instead of the system's
    #[arg(long)]
    simulated: bool,
}

fn main() -> anyhow::Result<()> {
    env_logger::init();
    let opt = Opt::parse();
    let host = if opt.simulated {
        Host::with_backend(SimulatedBackend::with_default_devices())?
    } else {
        Host::new()?
    };

    println!("Host: {}", host.name());
    println!("  Default input device: {:?}", host.default_input_device());
    println!("  Default output device: {:?}", host.default_output_device());

    for index in 0..host.devices().len() {
        let info = host.device_info(index)?;
        println!("{index}. {info}");
        println!("    Default format: {}", host.default_format_for_device(index)?);

        for share_mode in [ShareMode::Shared, ShareMode::Exclusive] {
            let request = FormatRequest::new(
                info.max_channels,
                info.default_sample_rate,
                SampleFormat::F32,
            );
            match host.negotiate(index, &request, share_mode) {
                Ok(format) => println!("    {share_mode:?} f32 request: {format}"),
                Err(err) => println!("    {share_mode:?} f32 request: {err}"),
            }
        }
    }

    Ok(())
}
