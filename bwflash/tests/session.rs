//! End-to-end flash lifecycle scenarios over the simulated device.
//!
//! These exercise the full stack — image parsing, protocol codecs,
//! challenge signing, retry policy and the session state machine —
//! against the fake device, including deterministic fault injection.

use std::time::Duration;

use bwflash::{
    BrightwayFlasher, CancelToken, DeviceHealth, Error, FaultPlan, FirmwareImage, FirmwareKind,
    FlashEvent, FlashState, LeqiFlasher, RetryPolicy, SimulatedDevice, run_flash, select_flasher,
};

/// Minimal valid Brightway image: signature at 0x800, unique signing
/// marker at 0x1100, deterministic auth tables at the marker-relative
/// offsets.
fn brightway_image_bytes(len: usize) -> Vec<u8> {
    let marker = 0x1100;
    assert!(len >= marker + 0xAA02 + 11);
    let mut data = vec![0u8; len];
    data[0x800..0x808].copy_from_slice(b"DEPRD5C\x00");
    data[marker..marker + 2].copy_from_slice(&[0x63, 0x7C]);
    data[marker + 2..marker + 4].copy_from_slice(&[0x01, 0x02]);
    for i in 0..256 {
        data[marker + 0xA802 + i] = ((i * 7 + 3) & 0xFF) as u8;
    }
    for i in 1..11 {
        data[marker + 0xAA02 + i] = ((i * 31 + 5) & 0xFF) as u8;
    }
    data
}

/// Minimal valid Leqi image: dense AA A2 vector region, `payload`
/// content bytes, 0xAA padding trailer.
fn leqi_image_bytes(payload: usize) -> Vec<u8> {
    let mut data = vec![0u8; 0x80];
    for _ in 0..32 {
        data.extend_from_slice(&[0xAA, 0xA2, 0x00, 0xAA]);
    }
    data.resize(0x400, 0x00);
    data.resize(0x400 + payload, 0x5C);
    data.extend(std::iter::repeat_n(0xAA, 600));
    data
}

fn retry() -> RetryPolicy {
    RetryPolicy::immediate(3)
}

#[test]
fn brightway_full_session_reaches_complete() {
    // 64 KiB image: 32 pages of 0x800 bytes.
    let image = FirmwareImage::from_bytes(brightway_image_bytes(0x10000)).unwrap();
    assert_eq!(image.kind(), FirmwareKind::Brightway);

    let sim = SimulatedDevice::new(FirmwareKind::Brightway, &image).unwrap();
    let probe = sim.probe();
    let flasher = select_flasher(&image, sim, retry()).unwrap();

    let mut states = Vec::new();
    let mut last_block = None;
    let summary = run_flash(
        flasher,
        &mut |event| match event {
            FlashEvent::StateChanged { to, .. } => states.push(to),
            FlashEvent::BlockWritten { index, total } => last_block = Some((index, total)),
        },
        CancelToken::new(),
    )
    .expect("session should complete");

    assert_eq!(summary.total_blocks, 32);
    assert_eq!(summary.blocks_written, summary.total_blocks);
    assert_eq!(last_block, Some((31, 32)));
    assert_eq!(summary.identity.kind, FirmwareKind::Brightway);
    assert_eq!(summary.identity.uid, Some(*b"foobarfoobar1337"));

    // Full lifecycle was traversed in order.
    let expected_order = [
        FlashState::Detecting,
        FlashState::Handshaking,
        FlashState::Erasing,
        FlashState::Writing(0),
    ];
    assert_eq!(&states[..4], &expected_order);
    assert_eq!(states.last(), Some(&FlashState::Complete));

    // The device saw a byte-exact copy of the image.
    assert!(probe.transfer_complete());
    assert_eq!(probe.finalize_queries(), 1);
}

#[test]
fn leqi_full_session_reaches_complete() {
    let image = FirmwareImage::from_bytes(leqi_image_bytes(0x1000)).unwrap();
    assert_eq!(image.kind(), FirmwareKind::Leqi);

    let sim = SimulatedDevice::new(FirmwareKind::Leqi, &image).unwrap();
    let probe = sim.probe();
    let flasher = Box::new(
        LeqiFlasher::new(sim, &image, retry())
            .unwrap()
            .with_chunk_delay(Duration::ZERO),
    );

    let summary = run_flash(flasher, &mut |_| {}, CancelToken::new())
        .expect("session should complete");

    assert_eq!(summary.total_blocks, image.declared_size() / 128);
    assert!(probe.erase_seen());
    assert!(probe.transfer_complete());
}

#[test]
fn finalize_ack_drop_is_recovered_without_block_resend() {
    let image = FirmwareImage::from_bytes(brightway_image_bytes(0x10000)).unwrap();
    let sim = SimulatedDevice::new(FirmwareKind::Brightway, &image)
        .unwrap()
        .with_faults(FaultPlan {
            drop_finalize_acks: 1,
            ..FaultPlan::default()
        });
    let probe = sim.probe();
    let flasher = select_flasher(&image, sim, retry()).unwrap();

    run_flash(flasher, &mut |_| {}, CancelToken::new())
        .expect("session should recover from a lost finalize ack");

    // The query was retried...
    assert_eq!(probe.finalize_queries(), 2);
    // ...but no data block was sent twice: every page saw exactly its
    // 16 chunks.
    for block in 0..32 {
        assert_eq!(
            probe.data_frames_for_block(block),
            16,
            "block {block} must not be resent during finalize recovery"
        );
    }
    assert!(probe.transfer_complete());
}

#[test]
fn leqi_image_against_brightway_device_fails_before_erase() {
    let image = FirmwareImage::from_bytes(leqi_image_bytes(0x1000)).unwrap();

    // The simulator identifies itself as a Brightway device.
    let sim = SimulatedDevice::new(FirmwareKind::Brightway, &image).unwrap();
    let probe = sim.probe();
    let flasher = Box::new(
        LeqiFlasher::new(sim, &image, retry())
            .unwrap()
            .with_chunk_delay(Duration::ZERO),
    );

    let err = run_flash(flasher, &mut |_| {}, CancelToken::new()).unwrap_err();

    assert!(
        matches!(
            err.error,
            Error::DeviceMismatch {
                image: FirmwareKind::Leqi,
                device: FirmwareKind::Brightway,
            }
        ),
        "expected a device mismatch, got: {}",
        err.error
    );
    assert_eq!(err.state, FlashState::Detecting);
    assert_eq!(err.device, DeviceHealth::Bootable);
    // No erase command ever reached the device.
    assert!(!probe.erase_seen());
    assert_eq!(probe.total_data_frames(), 0);
}

#[test]
fn brightway_image_against_leqi_device_fails_before_erase() {
    let image = FirmwareImage::from_bytes(brightway_image_bytes(0x10000)).unwrap();
    let sim = SimulatedDevice::new(FirmwareKind::Leqi, &image).unwrap();
    let probe = sim.probe();
    let flasher = Box::new(BrightwayFlasher::new(sim, &image, retry()).unwrap());

    let err = run_flash(flasher, &mut |_| {}, CancelToken::new()).unwrap_err();

    assert!(matches!(
        err.error,
        Error::DeviceMismatch {
            image: FirmwareKind::Brightway,
            device: FirmwareKind::Leqi,
        }
    ));
    assert!(!probe.erase_seen());
}

#[test]
fn unknown_image_is_rejected_before_any_transport_exists() {
    let garbage = vec![0x13u8; 0x2000];
    assert_eq!(bwflash::detect(&garbage), FirmwareKind::Unknown);

    // Parsing is the gate: no flasher, no session, no transport.
    let err = FirmwareImage::parse(garbage, FirmwareKind::Unknown).unwrap_err();
    assert!(matches!(err, Error::UnsupportedImage));
}

#[test]
fn silent_device_exhausts_retries_and_stays_bootable() {
    let image = FirmwareImage::from_bytes(brightway_image_bytes(0x10000)).unwrap();
    let sim = SimulatedDevice::new(FirmwareKind::Brightway, &image)
        .unwrap()
        .with_faults(FaultPlan {
            silent: true,
            ..FaultPlan::default()
        });
    let flasher = select_flasher(&image, sim, retry()).unwrap();

    let err = run_flash(flasher, &mut |_| {}, CancelToken::new()).unwrap_err();

    assert!(matches!(err.error, Error::DeviceNotFound));
    assert_eq!(err.state, FlashState::Detecting);
    assert_eq!(err.device, DeviceHealth::Bootable);
}

#[test]
fn dropped_data_acks_fail_the_exact_block_after_bounded_resends() {
    let image = FirmwareImage::from_bytes(leqi_image_bytes(0x1000)).unwrap();
    let failing_block = 5;
    let policy = retry();

    let sim = SimulatedDevice::new(FirmwareKind::Leqi, &image)
        .unwrap()
        .with_faults(FaultPlan {
            drop_data_acks_at: Some(failing_block),
            ..FaultPlan::default()
        });
    let probe = sim.probe();
    let flasher = Box::new(
        LeqiFlasher::new(sim, &image, policy)
            .unwrap()
            .with_chunk_delay(Duration::ZERO),
    );

    let err = run_flash(flasher, &mut |_| {}, CancelToken::new()).unwrap_err();

    assert!(matches!(
        err.error,
        Error::WriteFailed { block: 5, attempts: 3 }
    ));
    assert_eq!(err.state, FlashState::Writing(failing_block));
    assert_eq!(err.block, Some(failing_block));
    assert_eq!(err.attempts, policy.max_attempts);
    // Post-erase failure: the device may be left non-bootable.
    assert_eq!(err.device, DeviceHealth::Unknown);

    // The same block was resent exactly max_attempts times, earlier
    // blocks exactly once.
    assert_eq!(
        probe.data_frames_for_block(failing_block),
        policy.max_attempts as usize
    );
    for block in 0..failing_block {
        assert_eq!(probe.data_frames_for_block(block), 1);
    }
}

#[test]
fn corrupted_acks_never_false_accept() {
    let image = FirmwareImage::from_bytes(leqi_image_bytes(0x1000)).unwrap();
    let sim = SimulatedDevice::new(FirmwareKind::Leqi, &image)
        .unwrap()
        .with_faults(FaultPlan {
            corrupt_responses: true,
            ..FaultPlan::default()
        });
    let flasher = Box::new(
        LeqiFlasher::new(sim, &image, retry())
            .unwrap()
            .with_chunk_delay(Duration::ZERO),
    );

    // Every ack has a bad trailer; the session must give up cleanly
    // instead of proceeding on corrupt confirmations.
    let err = run_flash(flasher, &mut |_| {}, CancelToken::new()).unwrap_err();
    assert!(matches!(err.error, Error::DeviceNotFound));
    assert_eq!(err.state, FlashState::Detecting);
}

#[test]
fn cancellation_between_blocks_stops_the_transfer() {
    let image = FirmwareImage::from_bytes(leqi_image_bytes(0x1000)).unwrap();
    let sim = SimulatedDevice::new(FirmwareKind::Leqi, &image).unwrap();
    let probe = sim.probe();
    let flasher = Box::new(
        LeqiFlasher::new(sim, &image, retry())
            .unwrap()
            .with_chunk_delay(Duration::ZERO),
    );

    let cancel = CancelToken::new();
    let observer_cancel = cancel.clone();
    let err = run_flash(
        flasher,
        &mut |event| {
            if let FlashEvent::BlockWritten { index: 2, .. } = event {
                observer_cancel.cancel();
            }
        },
        cancel,
    )
    .unwrap_err();

    assert!(matches!(err.error, Error::Cancelled));
    assert_eq!(err.state, FlashState::Writing(3));
    // Blocks 0..=2 were sent; nothing after the cancellation boundary.
    assert_eq!(probe.total_data_frames(), 3);
    assert_eq!(probe.finalize_queries(), 0);
}
