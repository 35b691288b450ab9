use std::thread;
use std::time::{Duration, Instant};

use wasapi_engine::host::simulated::{DeviceSpec, SimulatedBackend};
use wasapi_engine::timing::frames_to_duration;
use wasapi_engine::{
    Callbacks, Direction, Host, SampleFormat, SampleRate, StreamConfig, StreamError, StreamMode,
    StreamParameters,
};

const RATE: SampleRate = SampleRate(48_000);

fn output_stream(host: &Host) -> wasapi_engine::Stream {
    let params = StreamParameters::new(host.default_output_device().unwrap(), 2, SampleFormat::F32);
    host.open_stream(StreamConfig::output(params, RATE), StreamMode::Blocking)
        .unwrap()
}

fn input_stream(host: &Host) -> wasapi_engine::Stream {
    let params = StreamParameters::new(host.default_input_device().unwrap(), 2, SampleFormat::F32);
    host.open_stream(StreamConfig::input(params, RATE), StreamMode::Blocking)
        .unwrap()
}

#[test]
fn writes_are_split_into_paced_cycles() {
    let backend = SimulatedBackend::with_default_devices();
    let host = Host::with_backend(backend.clone()).unwrap();
    let stream = output_stream(&host);
    let cycle = stream.info().output.unwrap().frames_per_cycle;
    assert_eq!(cycle, 480);
    stream.start().unwrap();

    let frames = cycle * 3 + 7;
    let data = vec![0.5f32; frames as usize * 2];
    assert_eq!(stream.write(&data).unwrap(), frames);
    stream.stop().unwrap();

    let transfers = backend.stats("speakers").unwrap().render_transfers;
    assert!(transfers.len() >= 4);
    assert!(transfers.iter().all(|t| t.frames <= cycle));
    assert_eq!(transfers.iter().map(|t| t.frames).sum::<u32>(), frames);
    assert!(transfers.iter().all(|t| t.peak == 0.5));
    for pair in transfers.windows(2) {
        let gap = pair[1].at.duration_since(pair[0].at);
        assert!(gap >= frames_to_duration(pair[0].frames, RATE) / 2, "{gap:?}");
    }
}

#[test]
fn reads_fill_the_whole_buffer() {
    let host = Host::with_backend(SimulatedBackend::with_default_devices()).unwrap();
    let stream = input_stream(&host);
    stream.start().unwrap();

    let mut buffer = vec![0.0f32; 1_000 * 2];
    assert_eq!(stream.read(&mut buffer).unwrap(), 1_000);
    assert!(buffer.iter().all(|&sample| sample == 0.25));
    // The rest of the last packet is kept for the next read.
    assert!(stream.read_available().unwrap() > 0);
    stream.stop().unwrap();
}

#[test]
fn stop_interrupts_a_starved_read() {
    let mut microphone = DeviceSpec::capture("mic", "Microphone").as_default();
    microphone.faults.capture_starved = true;
    let host = Host::with_backend(SimulatedBackend::new().with_device(microphone)).unwrap();
    let stream = input_stream(&host);
    stream.start().unwrap();

    thread::scope(|scope| {
        let reader = scope.spawn(|| {
            let mut buffer = vec![0.0f32; 4_800 * 2];
            let started = Instant::now();
            let frames = stream.read(&mut buffer);
            (frames, started.elapsed())
        });
        thread::sleep(Duration::from_millis(50));
        let stopping = Instant::now();
        stream.stop().unwrap();
        assert!(stopping.elapsed() < Duration::from_secs(2));

        let (frames, elapsed) = reader.join().unwrap();
        // A reader that only got going after the stop is refused instead.
        assert!(matches!(frames, Ok(0) | Err(StreamError::StreamNotRunning)));
        assert!(elapsed < Duration::from_secs(3));
    });
    assert!(!stream.is_active());
}

#[test]
fn close_interrupts_a_write_in_progress() {
    let host = Host::with_backend(SimulatedBackend::with_default_devices()).unwrap();
    let stream = output_stream(&host);
    stream.start().unwrap();

    thread::scope(|scope| {
        let writer = scope.spawn(|| {
            // Two seconds of audio, far more than the hardware buffer holds.
            let data = vec![0.0f32; 96_000 * 2];
            stream.write(&data)
        });
        thread::sleep(Duration::from_millis(50));
        let closing = Instant::now();
        stream.close().unwrap();
        assert!(closing.elapsed() < Duration::from_secs(2));

        match writer.join().unwrap() {
            Ok(written) => assert!(written < 96_000),
            Err(err) => assert!(matches!(
                err,
                StreamError::StreamClosed | StreamError::StreamNotRunning
            )),
        }
    });
    assert!(matches!(
        stream.write(&[0.0; 2]),
        Err(StreamError::StreamClosed | StreamError::StreamNotRunning)
    ));
}

#[test]
fn transfers_need_a_running_blocking_stream_with_that_direction() {
    let host = Host::with_backend(SimulatedBackend::with_default_devices()).unwrap();
    let output = output_stream(&host);

    assert!(matches!(
        output.write(&[0.0; 2]),
        Err(StreamError::StreamNotRunning)
    ));
    assert!(matches!(
        output.write_available(),
        Err(StreamError::StreamNotRunning)
    ));
    assert!(matches!(
        output.read(&mut [0.0; 2]),
        Err(StreamError::NoSuchDirection(Direction::Input))
    ));
    assert!(matches!(
        output.read_available(),
        Err(StreamError::NoSuchDirection(Direction::Input))
    ));

    output.start().unwrap();
    assert_eq!(output.write_available().unwrap(), 960);
    output.stop().unwrap();
    assert!(matches!(
        output.write(&[0.0; 2]),
        Err(StreamError::StreamNotRunning)
    ));

    let params = StreamParameters::new(host.default_output_device().unwrap(), 2, SampleFormat::F32);
    let callbacks = Callbacks::new().on_output(|data: &mut [f32], _| data.fill(0.0));
    let callback_stream = host
        .open_stream(
            StreamConfig::output(params, RATE),
            StreamMode::Callback(callbacks),
        )
        .unwrap();
    assert!(matches!(
        callback_stream.write(&[0.0; 2]),
        Err(StreamError::NotBlocking)
    ));
}

#[test]
fn blocking_duplex_streams_carry_both_directions() {
    let host = Host::with_backend(SimulatedBackend::with_default_devices()).unwrap();
    let input = StreamParameters::new(host.default_input_device().unwrap(), 2, SampleFormat::F32);
    let output = StreamParameters::new(host.default_output_device().unwrap(), 2, SampleFormat::F32);
    let stream = host
        .open_stream(StreamConfig::duplex(input, output, RATE), StreamMode::Blocking)
        .unwrap();
    stream.start().unwrap();

    let mut buffer = vec![0.0f32; 480 * 2];
    for _ in 0..3 {
        assert_eq!(stream.read(&mut buffer).unwrap(), 480);
        assert_eq!(stream.write(&buffer).unwrap(), 480);
    }
    stream.stop().unwrap();
}

#[test]
fn availability_answers_during_a_long_write() {
    let host = Host::with_backend(SimulatedBackend::with_default_devices()).unwrap();
    let stream = output_stream(&host);
    stream.start().unwrap();

    thread::scope(|scope| {
        let writer = scope.spawn(|| {
            // One second of audio, far more than the hardware buffer holds.
            let data = vec![0.0f32; 48_000 * 2];
            stream.write(&data)
        });
        thread::sleep(Duration::from_millis(50));
        let asking = Instant::now();
        let available = stream.write_available().unwrap();
        assert!(asking.elapsed() < Duration::from_millis(200), "{:?}", asking.elapsed());
        assert!(available <= 960);
        assert!(!writer.is_finished());

        assert_eq!(writer.join().unwrap().unwrap(), 48_000);
    });
    stream.stop().unwrap();
}

#[test]
fn read_availability_answers_during_a_starved_read() {
    let mut microphone = DeviceSpec::capture("mic", "Microphone").as_default();
    microphone.faults.capture_starved = true;
    let host = Host::with_backend(SimulatedBackend::new().with_device(microphone)).unwrap();
    let stream = input_stream(&host);
    stream.start().unwrap();

    thread::scope(|scope| {
        let reader = scope.spawn(|| {
            let mut buffer = vec![0.0f32; 480 * 2];
            stream.read(&mut buffer)
        });
        thread::sleep(Duration::from_millis(50));
        let asking = Instant::now();
        assert_eq!(stream.read_available().unwrap(), 0);
        assert!(asking.elapsed() < Duration::from_millis(200));
        stream.stop().unwrap();
        assert!(matches!(
            reader.join().unwrap(),
            Ok(0) | Err(StreamError::StreamNotRunning)
        ));
    });
}

#[test]
fn stop_plays_queued_output_before_stopping() {
    let backend = SimulatedBackend::with_default_devices();
    let host = Host::with_backend(backend.clone()).unwrap();
    let stream = output_stream(&host);
    let buffer_frames = stream.info().output.unwrap().buffer_frames;
    let data = vec![0.5f32; buffer_frames as usize * 2];

    stream.start().unwrap();
    assert_eq!(stream.write(&data).unwrap(), buffer_frames);
    stream.stop().unwrap();
    // The clock plays one 480 frame period every 10 ms while the stop waits.
    stream.start().unwrap();
    assert!(stream.write_available().unwrap() >= 480);
    stream.abort().unwrap();

    let stats = backend.stats("speakers").unwrap();
    assert_eq!((stats.starts, stats.stops), (2, 2));
}

#[test]
fn writes_retry_a_refused_buffer() {
    let mut speakers = DeviceSpec::render("speakers", "Speakers").as_default();
    speakers.faults.too_large_render = 4;
    let backend = SimulatedBackend::new().with_device(speakers);
    let host = Host::with_backend(backend.clone()).unwrap();
    let stream = output_stream(&host);
    stream.start().unwrap();

    let data = vec![0.5f32; 960 * 2];
    assert_eq!(stream.write(&data).unwrap(), 960);
    stream.stop().unwrap();

    let transfers = backend.stats("speakers").unwrap().render_transfers;
    assert_eq!(transfers.iter().map(|t| t.frames).sum::<u32>(), 960);
    assert!(transfers.iter().all(|t| t.peak == 0.5));
}
