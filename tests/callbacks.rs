use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::thread;
use std::time::{Duration, Instant};

use wasapi_engine::host::simulated::SimulatedBackend;
use wasapi_engine::traits::{ElevatedThread, ElevationRequest, RealtimeScheduler};
use wasapi_engine::host::simulated::DeviceSpec;
use wasapi_engine::{
    boost_current_thread, BackendSpecificError, Callbacks, ChannelMask, DeliveryMode, Host,
    SampleFormat, SampleRate, ShareMode, StreamConfig, StreamError, StreamMode, StreamParameters,
    StreamState, ThreadPriority, WasapiOptions,
};

const RATE: SampleRate = SampleRate(48_000);

/// Polls `condition` until it holds or `timeout` passes.
fn wait_until(timeout: Duration, mut condition: impl FnMut() -> bool) -> bool {
    let deadline = Instant::now() + timeout;
    while Instant::now() < deadline {
        if condition() {
            return true;
        }
        thread::sleep(Duration::from_millis(5));
    }
    condition()
}

fn speakers(host: &Host) -> StreamParameters {
    StreamParameters::new(host.default_output_device().unwrap(), 2, SampleFormat::F32)
}

fn microphone(host: &Host) -> StreamParameters {
    StreamParameters::new(host.default_input_device().unwrap(), 2, SampleFormat::F32)
}

fn constant_output(level: f32) -> Callbacks {
    Callbacks::new().on_output(move |data: &mut [f32], _| data.fill(level))
}

#[test]
fn output_callback_reaches_the_device() {
    let backend = SimulatedBackend::with_default_devices();
    let host = Host::with_backend(backend.clone()).unwrap();
    let stream = host
        .open_stream(
            StreamConfig::output(speakers(&host), RATE),
            StreamMode::Callback(constant_output(0.5)),
        )
        .unwrap();
    assert_eq!(stream.state(), StreamState::Built);
    stream.start().unwrap();
    assert!(stream.is_active());

    assert!(wait_until(Duration::from_secs(5), || {
        backend.stats("speakers").unwrap().render_transfers.len() >= 3
    }));
    stream.stop().unwrap();

    let stats = backend.stats("speakers").unwrap();
    assert!(stats.render_transfers.iter().all(|t| t.frames <= 480));
    assert!(stats.render_transfers.iter().any(|t| t.peak == 0.5));
    assert_eq!((stats.starts, stats.stops), (1, 1));
}

#[test]
fn polled_output_callback_reaches_the_device() {
    let backend = SimulatedBackend::with_default_devices();
    let host = Host::with_backend(backend.clone()).unwrap();
    let params = speakers(&host).with_options(WasapiOptions {
        force_polling: true,
        ..Default::default()
    });
    let stream = host
        .open_stream(
            StreamConfig::output(params, RATE),
            StreamMode::Callback(constant_output(0.25)),
        )
        .unwrap();
    stream.start().unwrap();
    assert!(wait_until(Duration::from_secs(5), || {
        backend.stats("speakers").unwrap().render_transfers.len() >= 3
    }));
    stream.stop().unwrap();
    let stats = backend.stats("speakers").unwrap();
    assert!(stats.render_transfers.iter().any(|t| t.peak == 0.25));
}

#[test]
fn input_callback_receives_converted_samples() {
    let backend = SimulatedBackend::with_default_devices();
    let host = Host::with_backend(backend).unwrap();
    let received = Arc::new(Mutex::new(Vec::new()));
    let sink = received.clone();
    let callbacks = Callbacks::new().on_input(move |data: &[f32], info| {
        assert_eq!(data.len(), info.frames() as usize * 2);
        sink.lock().unwrap().extend_from_slice(data);
    });
    let stream = host
        .open_stream(
            StreamConfig::input(microphone(&host), RATE),
            StreamMode::Callback(callbacks),
        )
        .unwrap();
    stream.start().unwrap();
    assert!(wait_until(Duration::from_secs(5), || {
        received.lock().unwrap().len() >= 960
    }));
    stream.stop().unwrap();

    let received = received.lock().unwrap();
    assert!(received.iter().all(|&sample| sample == 0.25));
}

#[test]
fn full_duplex_runs_both_callbacks() {
    let backend = SimulatedBackend::with_default_devices();
    let host = Host::with_backend(backend.clone()).unwrap();
    let inputs = Arc::new(AtomicUsize::new(0));
    let counter = inputs.clone();
    let callbacks = constant_output(0.5).on_input(move |_: &[f32], _| {
        counter.fetch_add(1, Ordering::SeqCst);
    });
    let stream = host
        .open_stream(
            StreamConfig::duplex(microphone(&host), speakers(&host), RATE),
            StreamMode::Callback(callbacks),
        )
        .unwrap();
    stream.start().unwrap();
    assert!(wait_until(Duration::from_secs(5), || {
        inputs.load(Ordering::SeqCst) >= 3
            && backend.stats("speakers").unwrap().render_transfers.len() >= 3
    }));
    stream.stop().unwrap();
    assert_eq!(backend.stats("microphone").unwrap().stops, 1);
    assert_eq!(backend.stats("speakers").unwrap().stops, 1);
}

#[test]
fn stop_is_idempotent_and_the_stream_restarts() {
    let backend = SimulatedBackend::with_default_devices();
    let host = Host::with_backend(backend.clone()).unwrap();
    let finished = Arc::new(AtomicUsize::new(0));
    let counter = finished.clone();
    let callbacks = constant_output(0.0).on_finished(move || {
        counter.fetch_add(1, Ordering::SeqCst);
    });
    let stream = host
        .open_stream(
            StreamConfig::output(speakers(&host), RATE),
            StreamMode::Callback(callbacks),
        )
        .unwrap();

    stream.stop().unwrap();
    stream.start().unwrap();
    stream.start().unwrap();
    stream.stop().unwrap();
    stream.stop().unwrap();
    assert_eq!(finished.load(Ordering::SeqCst), 1);
    assert_eq!(stream.state(), StreamState::Stopped);
    assert!(!stream.is_active());

    stream.start().unwrap();
    assert!(stream.is_active());
    stream.abort().unwrap();
    assert_eq!(finished.load(Ordering::SeqCst), 2);

    let stats = backend.stats("speakers").unwrap();
    assert_eq!((stats.starts, stats.stops), (2, 2));
}

#[test]
fn removed_device_reports_an_error_and_stops() {
    let backend = SimulatedBackend::with_default_devices();
    let host = Host::with_backend(backend.clone()).unwrap();
    let errors = Arc::new(Mutex::new(Vec::new()));
    let sink = errors.clone();
    let finished = Arc::new(AtomicUsize::new(0));
    let counter = finished.clone();
    let callbacks = constant_output(0.0)
        .on_error(move |err| sink.lock().unwrap().push(err))
        .on_finished(move || {
            counter.fetch_add(1, Ordering::SeqCst);
        });
    let stream = host
        .open_stream(
            StreamConfig::output(speakers(&host), RATE),
            StreamMode::Callback(callbacks),
        )
        .unwrap();
    stream.start().unwrap();
    assert!(backend.unplug("speakers"));

    assert!(wait_until(Duration::from_secs(5), || !stream.is_active()));
    assert_eq!(stream.state(), StreamState::Stopped);
    assert!(wait_until(Duration::from_secs(5), || {
        finished.load(Ordering::SeqCst) == 1
    }));
    let errors = errors.lock().unwrap();
    assert_eq!(errors.len(), 1);
    assert!(matches!(errors[0], StreamError::DeviceUnavailable));
    drop(errors);

    // Starting again fails on the missing device instead of hanging.
    assert!(matches!(stream.start(), Err(StreamError::DeviceUnavailable)));
    stream.close().unwrap();
}

#[test]
fn failed_start_is_reported_to_the_caller() {
    let mut spec = wasapi_engine::host::simulated::DeviceSpec::render("spk", "Speakers");
    spec.faults.start_fails = true;
    let backend = SimulatedBackend::new().with_device(spec.as_default());
    let host = Host::with_backend(backend.clone()).unwrap();
    let stream = host
        .open_stream(
            StreamConfig::output(speakers(&host), RATE),
            StreamMode::Callback(constant_output(0.0)),
        )
        .unwrap();
    assert!(matches!(stream.start(), Err(StreamError::BackendSpecific(_))));
    assert!(!stream.is_active());
    assert_ne!(stream.state(), StreamState::Running);
}

#[test]
fn close_is_bounded_and_final() {
    let host = Host::with_backend(SimulatedBackend::with_default_devices()).unwrap();
    let running = host
        .open_stream(
            StreamConfig::output(speakers(&host), RATE),
            StreamMode::Callback(constant_output(0.0)),
        )
        .unwrap();
    running.start().unwrap();
    let started = Instant::now();
    running.close().unwrap();
    assert!(started.elapsed() < Duration::from_secs(2));
    assert_eq!(running.state(), StreamState::Closed);
    running.close().unwrap();
    assert!(matches!(running.start(), Err(StreamError::StreamClosed)));
    assert!(matches!(running.stop(), Err(StreamError::StreamClosed)));

    let idle = host
        .open_stream(
            StreamConfig::output(speakers(&host), RATE),
            StreamMode::Callback(constant_output(0.0)),
        )
        .unwrap();
    let started = Instant::now();
    idle.close().unwrap();
    assert!(started.elapsed() < Duration::from_secs(1));
}

#[test]
fn streams_can_be_controlled_from_other_threads() {
    fn assert_send_sync<T: Send + Sync>() {}
    assert_send_sync::<wasapi_engine::Stream>();

    let host = Host::with_backend(SimulatedBackend::with_default_devices()).unwrap();
    let stream = Arc::new(
        host.open_stream(
            StreamConfig::output(speakers(&host), RATE),
            StreamMode::Callback(constant_output(0.0)),
        )
        .unwrap(),
    );
    stream.start().unwrap();
    let remote = stream.clone();
    thread::spawn(move || remote.stop().unwrap()).join().unwrap();
    assert!(!stream.is_active());
}

#[derive(Default)]
struct RecordingScheduler {
    elevated: Mutex<Vec<ElevationRequest>>,
    reverted: Arc<AtomicUsize>,
}

struct RecordedTask(Arc<AtomicUsize>);

impl RealtimeScheduler for RecordingScheduler {
    fn elevate(
        &self,
        request: &ElevationRequest,
    ) -> Result<Box<dyn ElevatedThread>, BackendSpecificError> {
        self.elevated.lock().unwrap().push(*request);
        Ok(Box::new(RecordedTask(self.reverted.clone())))
    }
}

impl ElevatedThread for RecordedTask {
    fn revert(self: Box<Self>) -> Result<(), BackendSpecificError> {
        self.0.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}

#[test]
fn delivery_thread_is_elevated_while_it_runs() {
    let scheduler = Arc::new(RecordingScheduler::default());
    let host = Host::with_backend(SimulatedBackend::with_default_devices())
        .unwrap()
        .with_scheduler(scheduler.clone());
    let params = speakers(&host).with_options(WasapiOptions {
        exclusive: true,
        ..Default::default()
    });
    let stream = host
        .open_stream(
            StreamConfig::output(params, RATE),
            StreamMode::Callback(constant_output(0.0)),
        )
        .unwrap();
    assert_eq!(stream.info().thread_priority, ThreadPriority::ProAudio);

    stream.start().unwrap();
    {
        let elevated = scheduler.elevated.lock().unwrap();
        assert_eq!(elevated.len(), 1);
        assert_eq!(elevated[0].priority, ThreadPriority::ProAudio);
        assert_eq!(elevated[0].sample_rate, RATE);
        assert_eq!(
            elevated[0].buffer_frames,
            stream.info().output.unwrap().frames_per_cycle
        );
    }
    assert_eq!(scheduler.reverted.load(Ordering::SeqCst), 0);
    stream.stop().unwrap();
    assert_eq!(scheduler.reverted.load(Ordering::SeqCst), 1);
}

#[test]
fn unelevated_boost_is_a_no_op() {
    let boost = boost_current_thread(ThreadPriority::None).unwrap();
    assert!(!boost.is_elevated());
    assert_eq!(boost.priority(), ThreadPriority::None);
    boost.revert().unwrap();
}

#[cfg(not(windows))]
#[test]
fn platform_host_is_unavailable_off_windows() {
    assert!(matches!(
        Host::new(),
        Err(wasapi_engine::EnumerationError::HostUnavailable)
    ));
}

fn raw() -> WasapiOptions {
    WasapiOptions {
        redirect_raw_processor: true,
        ..Default::default()
    }
}

#[test]
fn raw_callbacks_exchange_wire_bytes() {
    let backend = SimulatedBackend::with_default_devices();
    let host = Host::with_backend(backend.clone()).unwrap();
    let captured = Arc::new(Mutex::new(Vec::new()));
    let sink = captured.clone();
    let callbacks = Callbacks::new()
        .on_raw_output(|data: &mut [u8], info| {
            // Stereo f32 on the wire.
            assert_eq!(data.len(), info.frames() as usize * 8);
            for sample in data.chunks_exact_mut(4) {
                sample.copy_from_slice(&0.5f32.to_le_bytes());
            }
        })
        .on_raw_input(move |data: &[u8], info| {
            assert_eq!(data.len(), info.frames() as usize * 8);
            sink.lock().unwrap().extend(
                data.chunks_exact(4)
                    .map(|b| f32::from_le_bytes([b[0], b[1], b[2], b[3]])),
            );
        });
    let stream = host
        .open_stream(
            StreamConfig::duplex(
                microphone(&host).with_options(raw()),
                speakers(&host).with_options(raw()),
                RATE,
            ),
            StreamMode::Callback(callbacks),
        )
        .unwrap();
    stream.start().unwrap();
    assert!(wait_until(Duration::from_secs(5), || {
        captured.lock().unwrap().len() >= 960
            && backend.stats("speakers").unwrap().render_transfers.len() >= 3
    }));
    stream.stop().unwrap();

    assert!(captured.lock().unwrap().iter().all(|&sample| sample == 0.25));
    let stats = backend.stats("speakers").unwrap();
    assert!(stats.render_transfers.iter().all(|t| t.peak == 0.5));
}

#[test]
fn raw_option_needs_the_raw_callback() {
    let host = Host::with_backend(SimulatedBackend::with_default_devices()).unwrap();
    let result = host.open_stream(
        StreamConfig::output(speakers(&host).with_options(raw()), RATE),
        StreamMode::Callback(constant_output(0.5)),
    );
    assert!(result.is_err());
}

#[test]
fn refused_render_buffers_skip_a_cycle() {
    let mut speakers_spec = DeviceSpec::render("speakers", "Speakers").as_default();
    speakers_spec.faults.too_large_render = 3;
    let backend = SimulatedBackend::new().with_device(speakers_spec);
    let host = Host::with_backend(backend.clone()).unwrap();
    let errors = Arc::new(AtomicUsize::new(0));
    let counter = errors.clone();
    let callbacks = constant_output(0.5).on_error(move |_| {
        counter.fetch_add(1, Ordering::SeqCst);
    });
    let stream = host
        .open_stream(
            StreamConfig::output(speakers(&host), RATE),
            StreamMode::Callback(callbacks),
        )
        .unwrap();
    stream.start().unwrap();

    assert!(wait_until(Duration::from_secs(5), || {
        backend.stats("speakers").unwrap().render_transfers.len() >= 3
    }));
    assert!(stream.is_active());
    stream.stop().unwrap();
    assert_eq!(errors.load(Ordering::SeqCst), 0);
    let stats = backend.stats("speakers").unwrap();
    assert!(stats.render_transfers.iter().all(|t| t.peak == 0.5));
}

#[test]
fn explicit_channel_mask_reaches_the_device() {
    let backend = SimulatedBackend::with_default_devices();
    let host = Host::with_backend(backend.clone()).unwrap();
    let sides = ChannelMask::SIDE_LEFT | ChannelMask::SIDE_RIGHT;
    let params = speakers(&host).with_options(WasapiOptions {
        exclusive: true,
        channel_mask: Some(sides),
        ..Default::default()
    });
    let stream = host
        .open_stream(
            StreamConfig::output(params, RATE),
            StreamMode::Callback(constant_output(0.5)),
        )
        .unwrap();

    let format = stream.info().output.unwrap().format;
    assert!(format.extensible);
    assert_eq!(format.channel_mask, sides);
    let stats = backend.stats("speakers").unwrap();
    let accepted = stats
        .initializations
        .iter()
        .find(|record| record.result.is_ok())
        .unwrap();
    assert_eq!(accepted.format.channel_mask, sides);

    stream.start().unwrap();
    assert!(wait_until(Duration::from_secs(5), || {
        backend.stats("speakers").unwrap().render_transfers.len() >= 2
    }));
    stream.stop().unwrap();
}

#[test]
fn exclusive_duplex_waits_for_both_directions() {
    let backend = SimulatedBackend::with_default_devices();
    let host = Host::with_backend(backend.clone()).unwrap();
    let options = WasapiOptions {
        exclusive: true,
        ..Default::default()
    };
    let inputs = Arc::new(AtomicUsize::new(0));
    let outputs = Arc::new(AtomicUsize::new(0));
    let (input_count, output_count) = (inputs.clone(), outputs.clone());
    let callbacks = Callbacks::new()
        .on_input(move |_: &[f32], _| {
            input_count.fetch_add(1, Ordering::SeqCst);
        })
        .on_output(move |data: &mut [f32], _| {
            output_count.fetch_add(1, Ordering::SeqCst);
            data.fill(0.5);
        });
    let stream = host
        .open_stream(
            StreamConfig::duplex(
                microphone(&host).with_options(options),
                speakers(&host).with_options(options),
                RATE,
            ),
            StreamMode::Callback(callbacks),
        )
        .unwrap();
    let info = stream.info();
    for side in [info.input.unwrap(), info.output.unwrap()] {
        assert_eq!(side.share_mode, ShareMode::Exclusive);
        assert_eq!(side.delivery, DeliveryMode::Event);
    }
    assert_eq!(
        info.input.unwrap().frames_per_cycle,
        info.output.unwrap().frames_per_cycle
    );

    stream.start().unwrap();
    assert!(wait_until(Duration::from_secs(5), || {
        inputs.load(Ordering::SeqCst) >= 3 && outputs.load(Ordering::SeqCst) >= 4
    }));
    stream.stop().unwrap();

    let cycle = info.output.unwrap().frames_per_cycle;
    let transfers = backend.stats("speakers").unwrap().render_transfers;
    assert!(transfers.iter().all(|t| t.frames == cycle));
}
