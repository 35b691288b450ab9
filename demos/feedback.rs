//! Feeds the default input device back into the default output device.
//!
//! The two directions run as separate streams joined by a ring buffer, primed with `--latency`
//! milliseconds of silence in case the devices are not precisely synchronised.

use clap::Parser;
use ringbuf::traits::{Consumer, Producer, Split};
use ringbuf::HeapRb;
use wasapi_engine::host::simulated::SimulatedBackend;
use wasapi_engine::{
    Callbacks, Host, SampleFormat, StreamConfig, StreamMode, StreamParameters,
};

#[derive(Parser, Debug)]
#[command(version, about = "wasapi-engine feedback example", long_about = None)]
struct Opt {
    /// Delay between input and output in milliseconds
    #[arg(short, long, value_name = "DELAY_MS", default_value_t = 150.0)]
    latency: f32,

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

    let input = host
        .default_input_device()
        .ok_or_else(|| anyhow::anyhow!("no input device available"))?;
    let output = host
        .default_output_device()
        .ok_or_else(|| anyhow::anyhow!("no output device available"))?;
    let info = host.device_info(input)?;
    println!("Using input device: \"{}\"", info.name);
    println!("Using output device: \"{}\"", host.device_info(output)?.name);

    // Both streams use the input's layout.
    let channels = info.max_channels;
    let sample_rate = info.default_sample_rate;

    let latency_frames = (opt.latency / 1_000.0) * sample_rate.0 as f32;
    let latency_samples = latency_frames as usize * usize::from(channels);
    let ring = HeapRb::<f32>::new((latency_samples * 2).max(1));
    let (mut producer, mut consumer) = ring.split();
    for _ in 0..latency_samples {
        // The ring buffer has twice as much space as necessary to add latency here,
        // so this should never fail
        producer.try_push(0.0).ok();
    }

    let input_callbacks = Callbacks::new()
        .on_input(move |data: &[f32], _| {
            if producer.push_slice(data) < data.len() {
                eprintln!("output stream fell behind: try increasing latency");
            }
        })
        .on_error(|err| eprintln!("an error occurred on the input stream: {err}"));
    let output_callbacks = Callbacks::new()
        .on_output(move |data: &mut [f32], _| {
            let filled = consumer.pop_slice(data);
            if filled < data.len() {
                data[filled..].fill(0.0);
                eprintln!("input stream fell behind: try increasing latency");
            }
        })
        .on_error(|err| eprintln!("an error occurred on the output stream: {err}"));

    let input_params = StreamParameters::new(input, channels, SampleFormat::F32);
    let output_params = StreamParameters::new(output, channels, SampleFormat::F32);
    let input_stream = host.open_stream(
        StreamConfig::input(input_params, sample_rate),
        StreamMode::Callback(input_callbacks),
    )?;
    let output_stream = host.open_stream(
        StreamConfig::output(output_params, sample_rate),
        StreamMode::Callback(output_callbacks),
    )?;
    println!("Successfully built streams.");

    println!(
        "Starting the input and output streams with `{}` milliseconds of latency.",
        opt.latency
    );
    input_stream.start()?;
    output_stream.start()?;

    println!("Playing for 3 seconds... ");
    std::thread::sleep(std::time::Duration::from_secs(3));
    drop(input_stream);
    drop(output_stream);
    println!("Done!");
    Ok(())
}
