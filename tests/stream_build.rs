use wasapi_engine::host::simulated::{DeviceSpec, SimulatedBackend};
use wasapi_engine::timing::{is_packet_aligned, ReferenceTime};
use wasapi_engine::{
    BuildStreamError, Callbacks, ClientError, DeliveryMode, Host, SampleFormat, SampleRate,
    ShareMode, StreamConfig, StreamMode, StreamParameters, WasapiOptions, MAX_CHANNELS,
};

const RATE: SampleRate = SampleRate(48_000);

fn exclusive() -> WasapiOptions {
    WasapiOptions {
        exclusive: true,
        ..Default::default()
    }
}

fn silence() -> StreamMode {
    StreamMode::Callback(
        Callbacks::new()
            .on_output(|data: &mut [f32], _| data.fill(0.0))
            .on_input(|_: &[f32], _| {}),
    )
}

fn backend_with(speakers: DeviceSpec) -> SimulatedBackend {
    SimulatedBackend::new()
        .with_device(speakers.as_default())
        .with_device(DeviceSpec::capture("mic", "Microphone").as_default())
}

#[test]
fn full_duplex_event_stream_shares_one_cycle() {
    let host = Host::with_backend(SimulatedBackend::with_default_devices()).unwrap();
    let input = StreamParameters::new(host.default_input_device().unwrap(), 2, SampleFormat::F32);
    let output = StreamParameters::new(host.default_output_device().unwrap(), 2, SampleFormat::F32);
    let stream = host
        .open_stream(StreamConfig::duplex(input, output, RATE), silence())
        .unwrap();

    let info = stream.info();
    let (input, output) = (info.input.unwrap(), info.output.unwrap());
    assert_eq!(input.frames_per_cycle, output.frames_per_cycle);
    assert_eq!(input.frames_per_cycle, 480);
    assert_eq!(input.period, output.period);
    assert_eq!(input.delivery, DeliveryMode::Event);
    assert_eq!(input.share_mode, ShareMode::Shared);
}

#[test]
fn full_duplex_with_different_device_periods_is_refused() {
    let speakers = DeviceSpec::render("spk", "Speakers")
        .with_periods(ReferenceTime::from_millis(20), ReferenceTime::from_millis(3));
    let backend = backend_with(speakers);
    let host = Host::with_backend(backend.clone()).unwrap();
    let input = StreamParameters::new(host.default_input_device().unwrap(), 2, SampleFormat::F32);
    let output = StreamParameters::new(host.default_output_device().unwrap(), 2, SampleFormat::F32);

    match host.open_stream(StreamConfig::duplex(input, output, RATE), silence()) {
        Err(BuildStreamError::PeriodMismatch {
            input_frames,
            output_frames,
        }) => assert_eq!((input_frames, output_frames), (480, 960)),
        other => panic!("unexpected result: {other:?}"),
    }
    // The refused stream released the clients it had initialized without starting them.
    assert_eq!(backend.stats("mic").unwrap().starts, 0);
    assert_eq!(backend.stats("spk").unwrap().starts, 0);
}

#[test]
fn exclusive_buffers_are_packet_aligned() {
    let host = Host::with_backend(SimulatedBackend::with_default_devices()).unwrap();
    let params = StreamParameters::new(0, 2, SampleFormat::I16).with_options(exclusive());
    let config = StreamConfig::output(params, RATE).with_frames_per_buffer(479);
    let stream = host.open_stream(config, silence()).unwrap();

    let output = stream.info().output.unwrap();
    assert_eq!(output.format.sample_format(), Some(SampleFormat::I16));
    assert_eq!(output.share_mode, ShareMode::Exclusive);
    assert_eq!(output.buffer_frames, 448);
    assert!(output.buffer_frames <= 480);
    assert!(is_packet_aligned(output.buffer_frames, output.format.block_align()));
    assert_eq!(output.frames_per_cycle, output.buffer_frames);
}

#[test]
fn misaligned_buffer_is_retried_once_with_the_reported_size() {
    let mut speakers = DeviceSpec::render("spk", "Speakers");
    speakers.faults.unaligned_inits = 1;
    let backend = backend_with(speakers);
    let host = Host::with_backend(backend.clone()).unwrap();
    let params = StreamParameters::new(0, 2, SampleFormat::I16).with_options(exclusive());
    let config = StreamConfig::output(params, RATE).with_frames_per_buffer(480);
    let stream = host.open_stream(config, silence()).unwrap();

    let stats = backend.stats("spk").unwrap();
    assert_eq!(stats.activations, 2);
    assert_eq!(stats.initializations.len(), 2);
    let (first, second) = (&stats.initializations[0], &stats.initializations[1]);
    assert_eq!(first.result, Err(ClientError::BufferSizeNotAligned));
    assert_eq!(second.result, Ok(()));
    assert_eq!(second.format, first.format);
    assert_eq!(second.init.buffer_duration, ReferenceTime::from_frames(512, RATE));
    assert_eq!(stream.info().output.unwrap().buffer_frames, 512);
}

#[test]
fn second_misalignment_fails_the_open() {
    let mut speakers = DeviceSpec::render("spk", "Speakers");
    speakers.faults.unaligned_inits = 2;
    let host = Host::with_backend(backend_with(speakers)).unwrap();
    let params = StreamParameters::new(0, 2, SampleFormat::I16).with_options(exclusive());
    let config = StreamConfig::output(params, RATE).with_frames_per_buffer(480);
    assert!(matches!(
        host.open_stream(config, silence()),
        Err(BuildStreamError::AlignmentRetryExhausted(ClientError::BufferSizeNotAligned))
    ));
}

#[test]
fn out_of_memory_steps_the_period_down() {
    let mut speakers = DeviceSpec::render("spk", "Speakers");
    speakers.faults.out_of_memory_above = Some(ReferenceTime::from_millis(150));
    let backend = backend_with(speakers);
    let host = Host::with_backend(backend.clone()).unwrap();
    let params = StreamParameters::new(0, 2, SampleFormat::F32).with_options(exclusive());
    let config = StreamConfig::output(params, RATE).with_frames_per_buffer(24_000);
    let stream = host.open_stream(config, StreamMode::Blocking).unwrap();

    let output = stream.info().output.unwrap();
    assert_eq!(output.delivery, DeliveryMode::Poll);
    assert_eq!(output.period, ReferenceTime::from_millis(100));
    assert_eq!(output.buffer_frames, 4_800);

    let inits = backend.stats("spk").unwrap().initializations;
    assert_eq!(inits.len(), 10);
    let (last, failed) = inits.split_last().unwrap();
    assert!(failed.iter().all(|r| r.result == Err(ClientError::OutOfMemory)));
    assert!(failed
        .windows(2)
        .all(|pair| pair[0].init.buffer_duration > pair[1].init.buffer_duration));
    assert_eq!(last.result, Ok(()));
}

#[test]
fn refused_buffer_duration_falls_back_to_the_default_period() {
    let mut speakers = DeviceSpec::render("spk", "Speakers");
    speakers.faults.buffer_size_error_above = Some(ReferenceTime::from_millis(20));
    let backend = backend_with(speakers);
    let host = Host::with_backend(backend.clone()).unwrap();
    let params = StreamParameters::new(0, 2, SampleFormat::F32).with_options(exclusive());
    let config = StreamConfig::output(params, RATE).with_frames_per_buffer(1_920);
    let stream = host.open_stream(config, silence()).unwrap();

    let output = stream.info().output.unwrap();
    assert_eq!(output.period, ReferenceTime::from_millis(10));
    assert_eq!(output.buffer_frames, 480);
    assert_eq!(backend.stats("spk").unwrap().initializations.len(), 2);
}

#[test]
fn busy_device_is_unavailable() {
    let mut speakers = DeviceSpec::render("spk", "Speakers");
    speakers.faults.busy = true;
    let host = Host::with_backend(backend_with(speakers)).unwrap();
    let params = StreamParameters::new(0, 2, SampleFormat::F32).with_options(exclusive());
    assert!(matches!(
        host.open_stream(StreamConfig::output(params, RATE), silence()),
        Err(BuildStreamError::DeviceUnavailable)
    ));
}

#[test]
fn blocking_streams_are_polled_with_two_user_buffers() {
    let host = Host::with_backend(SimulatedBackend::with_default_devices()).unwrap();
    let params = StreamParameters::new(0, 2, SampleFormat::F32);
    let stream = host
        .open_stream(StreamConfig::output(params, RATE), StreamMode::Blocking)
        .unwrap();
    let output = stream.info().output.unwrap();
    assert_eq!(output.delivery, DeliveryMode::Poll);
    assert_eq!(output.buffer_frames, 960);
    assert_eq!(output.frames_per_cycle, 480);
    assert!(output.latency >= std::time::Duration::from_millis(20));
}

#[test]
fn invalid_configurations_are_rejected() {
    let host = Host::with_backend(SimulatedBackend::with_default_devices()).unwrap();
    let speakers = StreamParameters::new(0, 2, SampleFormat::F32);
    let microphone = StreamParameters::new(1, 2, SampleFormat::F32);
    let invalid = |config: StreamConfig, mode: StreamMode| {
        matches!(
            host.open_stream(config, mode),
            Err(BuildStreamError::InvalidArgument(_))
        )
    };

    let empty = StreamConfig {
        input: None,
        output: None,
        sample_rate: RATE,
        frames_per_buffer: None,
    };
    assert!(invalid(empty, silence()));
    assert!(invalid(StreamConfig::output(speakers, SampleRate(0)), silence()));
    assert!(invalid(StreamConfig::output(microphone, RATE), silence()));
    assert!(invalid(StreamConfig::input(speakers, RATE), silence()));
    assert!(invalid(
        StreamConfig::output(StreamParameters::new(7, 2, SampleFormat::F32), RATE),
        silence()
    ));
    assert!(invalid(
        StreamConfig::output(StreamParameters::new(0, 0, SampleFormat::F32), RATE),
        silence()
    ));
    // Far past what a wire format's block alignment can describe.
    assert!(invalid(
        StreamConfig::output(StreamParameters::new(0, 20_000, SampleFormat::F32), RATE),
        silence()
    ));
    assert!(invalid(
        StreamConfig::output(
            StreamParameters::new(0, MAX_CHANNELS + 1, SampleFormat::F32),
            RATE
        ),
        silence()
    ));

    let polled = speakers.with_options(WasapiOptions {
        force_polling: true,
        ..Default::default()
    });
    assert!(invalid(StreamConfig::duplex(microphone, polled, RATE), silence()));

    let input_only = StreamMode::Callback(Callbacks::new().on_input(|_: &[f32], _| {}));
    assert!(invalid(StreamConfig::output(speakers, RATE), input_only));
}

#[test]
fn format_checks_match_what_opening_would_do() {
    let host = Host::with_backend(SimulatedBackend::with_default_devices()).unwrap();
    let speakers = StreamParameters::new(0, 2, SampleFormat::F32);
    assert!(host
        .is_format_supported(&StreamConfig::output(speakers, RATE))
        .is_ok());
    assert!(matches!(
        host.is_format_supported(&StreamConfig::output(speakers, SampleRate(44_100))),
        Err(BuildStreamError::UnsupportedFormat(_))
    ));
    let exclusive = speakers.with_options(exclusive());
    assert!(host
        .is_format_supported(&StreamConfig::output(exclusive, SampleRate(44_100)))
        .is_ok());
}
