//! End-to-end tests for the duplex engine.
//!
//! Everything here runs without audio hardware: the callback engine is
//! driven by the loopback driver, the blocking archetype by the in-memory
//! transport, and file-only paths by the null port.

use std::sync::Arc;
use std::time::{Duration, Instant};

use modem_audio::{
    BlockingIo, BlockingPort, CallbackPort, DeviceSettings, Dir, DirMask, LoopbackDriver,
    LoopbackIo, NullPort, SampleRateSetting, SharedSettings, SoundError, SoundIo,
};

fn sine(freq: f64, rate: f64, count: usize, amplitude: f64) -> Vec<f64> {
    (0..count)
        .map(|i| amplitude * (2.0 * std::f64::consts::PI * freq * i as f64 / rate).sin())
        .collect()
}

fn loopback_port(
    device: DeviceSettings,
) -> (CallbackPort<LoopbackDriver>, Arc<SharedSettings>) {
    let settings = Arc::new(SharedSettings::new());
    let driver = LoopbackDriver::new().with_block_frames(64);
    let port = CallbackPort::with_driver(driver, settings.clone(), device);
    (port, settings)
}

#[test]
fn test_null_port_paces_writes_to_real_time() {
    let mut port = NullPort::new(Arc::new(SharedSettings::new()));
    port.open(DirMask::BOTH, 8000).unwrap();

    let block = vec![0.1f64; 8000];
    let start = Instant::now();
    assert_eq!(port.write_mono(&block).unwrap(), 8000);
    let elapsed = start.elapsed().as_secs_f64();
    assert!(elapsed >= 1.0, "one second of audio returned in {elapsed}s");
    assert!(elapsed <= 1.4, "pacing overslept: {elapsed}s");
}

#[test]
fn test_identity_loopback_reproduces_signal() {
    // Modem and device both at 48 kHz, ppm 0: the resampler stays out of
    // the path and the round trip is exact up to f32 conversion.
    let (mut port, _settings) = loopback_port(DeviceSettings::default());
    port.open(DirMask::BOTH, 48000).unwrap();

    // A unit marker followed by the test tone; the marker survives the
    // trip exactly and locates the tone inside the looped-back stream.
    let tone = sine(1000.0, 48000.0, 4800, 0.8);
    let mut signal = vec![1.0f64];
    signal.extend_from_slice(&tone);

    let mut received = Vec::new();
    let mut sent = 0usize;
    let mut scratch = vec![0.0f64; 480];
    let deadline = Instant::now() + Duration::from_secs(10);

    // Interleave writes and reads the way a modem does, so neither ring
    // overruns while the other side waits.
    loop {
        if sent < signal.len() {
            let n = (signal.len() - sent).min(480);
            assert_eq!(port.write_mono(&signal[sent..sent + n]).unwrap(), n);
            sent += n;
        }
        let got = port.read_mono(&mut scratch).unwrap();
        received.extend_from_slice(&scratch[..got]);

        if let Some(marker) = received.iter().position(|&s| s == 1.0) {
            if received.len() >= marker + 1 + 4800 {
                let echoed = &received[marker + 1..marker + 1 + 4800];
                let peak_err = echoed
                    .iter()
                    .zip(&tone)
                    .map(|(a, b)| (a - b).abs())
                    .fold(0.0f64, f64::max);
                assert!(peak_err <= 1e-6, "peak error {peak_err}");
                break;
            }
        }
        assert!(Instant::now() < deadline, "signal never came back");
    }

    port.close(DirMask::BOTH);
}

#[test]
fn test_resampled_loopback_preserves_ramp_shape() {
    // Modem at 8 kHz against a 48 kHz device: x6 up on transmit, /6 down
    // on receive. A non-decreasing ramp must stay non-decreasing.
    let device = DeviceSettings {
        in_sample_rate: SampleRateSetting::Hz(48000),
        out_sample_rate: SampleRateSetting::Hz(48000),
        ..DeviceSettings::default()
    };
    let (mut port, _settings) = loopback_port(device);
    port.open(DirMask::BOTH, 8000).unwrap();
    assert_eq!(port.dev_sample_rate(Dir::Input), 48000.0);

    let total = 4800usize;
    let ramp: Vec<f64> = (0..total).map(|i| i as f64 / total as f64).collect();

    let mut received = Vec::new();
    let mut sent = 0usize;
    let mut scratch = vec![0.0f64; 480];
    let deadline = Instant::now() + Duration::from_secs(15);

    while received.len() < total - 16 {
        if sent < total {
            let n = (total - sent).min(480);
            port.write_mono(&ramp[sent..sent + n]).unwrap();
            sent += n;
        }
        let got = port.read_mono(&mut scratch).unwrap();
        received.extend_from_slice(&scratch[..got]);
        assert!(Instant::now() < deadline, "ramp never came back");
    }

    // Window out the silence the capture side saw before the first
    // transmitted frame and after the last one: check the ramp between its
    // first nonzero sample and its peak.
    let start = received
        .iter()
        .position(|&s| s > 1e-6)
        .expect("no signal received");
    let peak_at = (0..received.len())
        .max_by(|&a, &b| received[a].total_cmp(&received[b]))
        .unwrap();
    assert!(peak_at > start, "peak before signal start");
    let ramp_part = &received[start..=peak_at];
    for pair in ramp_part.windows(2) {
        assert!(
            pair[1] >= pair[0] - 1e-3,
            "ramp regressed: {} -> {}",
            pair[0],
            pair[1]
        );
    }
    // Tail of the ramp must have made it through at close to full scale.
    assert!(
        received[peak_at] > 0.9,
        "ramp peak only reached {}",
        received[peak_at]
    );

    port.close(DirMask::BOTH);
}

#[test]
fn test_flush_drains_queued_output() {
    let driver = LoopbackDriver::new().with_block_frames(64);
    let pause = driver.pause_switch();
    let mut port = CallbackPort::with_driver(
        driver,
        Arc::new(SharedSettings::new()),
        DeviceSettings::default(),
    );
    port.open(DirMask::OUTPUT, 8000).unwrap();

    // Freeze the device clock and stage half a ring of output.
    pause.store(true, std::sync::atomic::Ordering::Relaxed);
    port.write_mono(&vec![0.5f64; 512]).unwrap();
    assert!(port.queued_frames(Dir::Output) >= 512);

    pause.store(false, std::sync::atomic::Ordering::Relaxed);
    let start = Instant::now();
    port.flush(DirMask::OUTPUT);
    assert!(start.elapsed() < Duration::from_secs(2));
    assert_eq!(port.queued_frames(Dir::Output), 0);
    assert!(port.is_active(Dir::Output), "flush must not stop the stream");
}

#[test]
fn test_close_plays_out_queued_frames() {
    let driver = LoopbackDriver::new().with_block_frames(64);
    let pause = driver.pause_switch();
    let mut port = CallbackPort::with_driver(
        driver,
        Arc::new(SharedSettings::new()),
        DeviceSettings::default(),
    );
    port.open(DirMask::OUTPUT, 8000).unwrap();

    pause.store(true, std::sync::atomic::Ordering::Relaxed);
    port.write_mono(&vec![0.5f64; 512]).unwrap();
    pause.store(false, std::sync::atomic::Ordering::Relaxed);

    let start = Instant::now();
    port.close(DirMask::OUTPUT);
    assert!(start.elapsed() <= Duration::from_secs(2));
    assert!(!port.is_active(Dir::Output));
    assert_eq!(port.queued_frames(Dir::Output), 0);
}

#[test]
fn test_write_times_out_against_stalled_device() {
    let driver = LoopbackDriver::new().with_block_frames(64);
    let pause = driver.pause_switch();
    let mut port = CallbackPort::with_driver(
        driver,
        Arc::new(SharedSettings::new()),
        DeviceSettings::default(),
    );
    port.open(DirMask::OUTPUT, 8000).unwrap();

    pause.store(true, std::sync::atomic::Ordering::Relaxed);
    // The output ring holds 1024 frames; pushing twice that against a
    // stalled device has to hit the data timeout.
    let result = port.write_mono(&vec![0.3f64; 2048]);
    match result {
        Err(SoundError::Timeout { dir, .. }) => assert_eq!(dir, Dir::Output),
        other => panic!("expected Timeout, got {other:?}"),
    }
}

#[test]
fn test_overrun_is_counted_and_data_stays_ordered() {
    let (mut port, _settings) = loopback_port(DeviceSettings::default());
    port.open(DirMask::BOTH, 8000).unwrap();

    // Transmit a ramp, then stop reading long enough for the capture ring
    // (4096 frames at 8 kHz, about half a second) to overflow.
    let ramp: Vec<f64> = (0..3000).map(|i| i as f64 / 3000.0).collect();
    port.write_mono(&ramp).unwrap();
    std::thread::sleep(Duration::from_millis(900));

    let mut buf = vec![0.0f64; 1024];
    let mut first_signal = None;
    for _ in 0..8 {
        let got = port.read_mono(&mut buf).unwrap();
        if first_signal.is_none() {
            first_signal = buf[..got].iter().copied().find(|&s| s > 1e-6);
        }
        if first_signal.is_some() && port.stats().overruns > 0 {
            break;
        }
    }

    assert!(port.stats().overruns > 0, "overrun must be observable");
    // The oldest surviving samples come from the front of the ramp.
    let first = first_signal.expect("ramp data was lost entirely");
    assert!(first < 0.2, "expected oldest data first, saw {first}");

    port.close(DirMask::BOTH);
}

#[test]
fn test_oversized_read_is_split_and_completes() {
    let (mut port, _settings) = loopback_port(DeviceSettings::default());
    port.open(DirMask::INPUT, 8000).unwrap();

    // 6000 frames exceed the 4096-frame capture ring, so the read must
    // split internally and still return the full request.
    let mut buf = vec![0.0f64; 6000];
    let start = Instant::now();
    let got = port.read_mono(&mut buf).unwrap();
    assert_eq!(got, 6000);
    // Paced capture: six thousand frames take ~750 ms to exist at all.
    assert!(start.elapsed() >= Duration::from_millis(500));

    port.close(DirMask::INPUT);
}

#[test]
fn test_ppm_change_retunes_between_reads() {
    let (mut port, settings) = loopback_port(DeviceSettings::default());
    port.open(DirMask::BOTH, 8000).unwrap();

    let mut buf = vec![0.0f64; 256];
    port.read_mono(&mut buf).unwrap();
    assert_eq!(port.converter_ratio(Dir::Input), 1.0);

    settings.set_rx_ppm(-300);
    port.read_mono(&mut buf).unwrap();
    let retuned = port.converter_ratio(Dir::Input);
    assert!((retuned - 1.0 / (1.0 - 300e-6)).abs() < 1e-9);

    port.close(DirMask::BOTH);
}

#[test]
fn test_capture_file_accounts_every_returned_frame() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("session.wav");

    let mut port = NullPort::new(Arc::new(SharedSettings::new()));
    port.open(DirMask::INPUT, 8000).unwrap();
    port.tee_mut().capture_to(&path).unwrap();

    let mut total = 0usize;
    let mut buf = vec![0.0f64; 512];
    for _ in 0..3 {
        total += port.read_mono(&mut buf).unwrap();
    }
    assert_eq!(port.tee_mut().capture_frames(), total as u64);
    port.tee_mut().capture_off();

    let reader = hound::WavReader::open(&path).unwrap();
    assert_eq!(reader.len() as usize, total);
}

#[test]
fn test_captured_file_replays_sample_for_sample() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("roundtrip.wav");

    // Record a tone through the blocking loopback with the capture tee on.
    {
        let device = DeviceSettings {
            in_sample_rate: SampleRateSetting::Hz(8000),
            out_sample_rate: SampleRateSetting::Hz(8000),
            ..DeviceSettings::default()
        };
        let mut port =
            BlockingPort::new(LoopbackIo::new(), Arc::new(SharedSettings::new()), device);
        port.open(DirMask::BOTH, 8000).unwrap();
        port.tee_mut().capture_to(&path).unwrap();

        let tone = sine(700.0, 8000.0, 1600, 0.6);
        port.write_mono(&tone).unwrap();
        let mut buf = vec![0.0f64; 1600];
        port.read_mono(&mut buf).unwrap();
        port.tee_mut().capture_off();
    }

    // The file's own samples are the reference.
    let reference: Vec<i16> = hound::WavReader::open(&path)
        .unwrap()
        .into_samples()
        .map(Result::unwrap)
        .collect();
    assert_eq!(reference.len(), 1600);

    // Replay through the playback path and compare exactly.
    let mut port = NullPort::new(Arc::new(SharedSettings::new()));
    port.open(DirMask::INPUT, 8000).unwrap();
    port.tee_mut().playback_from(&path).unwrap();

    let mut buf = vec![0.0f64; 1600];
    assert_eq!(port.read_mono(&mut buf).unwrap(), 1600);
    for (got, want) in buf.iter().zip(&reference) {
        let exact = f64::from(*want) / 32768.0;
        assert_eq!(*got, exact, "playback must reproduce the file bit-exactly");
    }
}

#[test]
fn test_playback_loops_at_end_of_file() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("short.wav");

    // Author a 100-frame file through the null port's capture tee.
    {
        let settings = Arc::new(SharedSettings::new());
        let mut port = NullPort::new(settings);
        port.open(DirMask::BOTH, 8000).unwrap();
        port.tee_mut().generate_to(&path).unwrap();
        let tone = sine(500.0, 8000.0, 100, 0.5);
        port.write_mono(&tone).unwrap();
        port.tee_mut().generate_off();
    }

    let mut port = NullPort::new(Arc::new(SharedSettings::new()));
    port.open(DirMask::INPUT, 8000).unwrap();
    port.tee_mut().playback_from(&path).unwrap();

    let mut buf = vec![0.0f64; 250];
    assert_eq!(port.read_mono(&mut buf).unwrap(), 250);
    // Frame 0 and frame 100 are the same source sample: the file looped.
    assert_eq!(buf[0], buf[100]);
    assert_eq!(buf[37], buf[137]);
}

#[test]
fn test_blocking_port_requires_full_reopen() {
    let device = DeviceSettings {
        in_sample_rate: SampleRateSetting::Hz(8000),
        out_sample_rate: SampleRateSetting::Hz(8000),
        ..DeviceSettings::default()
    };
    let mut port = BlockingPort::new(LoopbackIo::new(), Arc::new(SharedSettings::new()), device);
    assert!(port.must_close());
    port.open(DirMask::BOTH, 8000).unwrap();
    port.close(DirMask::BOTH);
    assert!(!port.io().is_open(Dir::Input));

    // A fresh open brings both directions back.
    port.open(DirMask::BOTH, 8000).unwrap();
    assert!(port.io().is_open(Dir::Input));
    assert!(port.io().is_open(Dir::Output));
}

#[test]
fn test_callback_port_survives_rate_reopen() {
    let (mut port, _settings) = loopback_port(DeviceSettings::default());
    port.open(DirMask::BOTH, 8000).unwrap();
    port.open(DirMask::BOTH, 48000).unwrap();
    assert!(port.is_active(Dir::Input));
    assert!(port.is_active(Dir::Output));
    assert_eq!(port.dev_sample_rate(Dir::Output), 48000.0);

    // The engine still moves data after the rebuild.
    port.write_mono(&vec![0.2f64; 480]).unwrap();
    let mut buf = vec![0.0f64; 480];
    assert_eq!(port.read_mono(&mut buf).unwrap(), 480);

    port.close(DirMask::BOTH);
}
