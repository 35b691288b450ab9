//! Plays a sine tone on the default output device.

use clap::Parser;
use wasapi_engine::host::simulated::SimulatedBackend;
use wasapi_engine::{
    Callbacks, Host, SampleFormat, SampleRate, StreamConfig, StreamMode, StreamParameters,
    WasapiOptions,
};

#[derive(Parser, Debug)]
#[command(version, about = "wasapi-engine beep example", long_about = None)]
struct Opt {
    /// Index of the output device, the default output device if omitted
    #[arg(short, long, value_name = "INDEX")]
    device: Option<usize>,

    /// Open the device in exclusive mode
    #[arg(long)]
    exclusive: bool,

    /// Use the polling engine instead of buffer events
    #[arg(long)]
    polling: bool,

    /// Write the tone with blocking calls instead of a callback
    #[arg(long)]
    blocking: bool,

    /// Use the in-process simulated devices instead of the system's
    #[arg(long)]
    simulated: bool,

    /// Tone frequency in Hz
    #[arg(short, long, default_value_t = 440.0)]
    frequency: f32,
}

/// A sine oscillator that writes the same sample to every channel of a frame.
struct Tone {
    phase: f32,
    step: f32,
}

impl Tone {
    fn new(frequency: f32, sample_rate: SampleRate) -> Self {
        Tone {
            phase: 0.0,
            step: frequency / sample_rate.0 as f32,
        }
    }

    fn fill(&mut self, data: &mut [f32], channels: usize) {
        for frame in data.chunks_mut(channels) {
            let value = (self.phase * std::f32::consts::TAU).sin() * 0.2;
            frame.fill(value);
            self.phase = (self.phase + self.step).fract();
        }
    }
}

fn main() -> anyhow::Result<()> {
    env_logger::init();
    let opt = Opt::parse();
    let host = if opt.simulated {
        Host::with_backend(SimulatedBackend::with_default_devices())?
    } else {
        Host::new()?
    };

    let device = match opt.device {
        Some(index) => index,
        None => host
            .default_output_device()
            .ok_or_else(|| anyhow::anyhow!("no output device available"))?,
    };
    let info = host.device_info(device)?;
    println!("Output device: {}", info.name);

    let channels = info.max_channels;
    let sample_rate = info.default_sample_rate;
    let params = StreamParameters::new(device, channels, SampleFormat::F32).with_options(
        WasapiOptions {
            exclusive: opt.exclusive,
            force_polling: opt.polling,
            ..Default::default()
        },
    );
    let config = StreamConfig::output(params, sample_rate);
    let mut tone = Tone::new(opt.frequency, sample_rate);

    if opt.blocking {
        let stream = host.open_stream(config, StreamMode::Blocking)?;
        println!("Stream: {:?}", stream.info().output);
        stream.start()?;
        let cycle = stream.info().output.map_or(480, |o| o.frames_per_cycle) as usize;
        let mut buffer = vec![0.0f32; cycle * usize::from(channels)];
        for _ in 0..(sample_rate.0 as usize * 3 / cycle) {
            tone.fill(&mut buffer, usize::from(channels));
            stream.write(&buffer)?;
        }
        stream.stop()?;
    } else {
        let callbacks = Callbacks::new()
            .on_output(move |data: &mut [f32], _| tone.fill(data, usize::from(channels)))
            .on_error(|err| eprintln!("an error occurred on stream: {err}"));
        let stream = host.open_stream(config, StreamMode::Callback(callbacks))?;
        println!("Stream: {:?}", stream.info().output);
        stream.start()?;
        std::thread::sleep(std::time::Duration::from_secs(3));
        stream.stop()?;
    }

    Ok(())
}
