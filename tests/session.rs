//! Session behaviour against a scripted charger

mod common;

use common::*;
use isdt_lib::capability::{Command, Mode, Model, QuietOpcode};
use isdt_lib::codec::{CodecConfig, Frame, FrameError};
use isdt_lib::exchange::Reply;
use isdt_lib::firmware::FlashRegion;
use isdt_lib::protocol::{ChannelMode, Request, Response, TransitionOutcome};
use isdt_lib::{DecodeError, Error, Stage};
use std::sync::Arc;
use std::thread;

#[test]
fn unsupported_command_never_reaches_the_wire() {
    let mock = MockCharger::default();
    let charger = session_as(&mock, Model::A4, Mode::App);

    let err = charger.sensors().unwrap_err();
    assert_eq!(err.stage(), Stage::Capability);
    match err {
        Error::Unsupported {
            command,
            model,
            mode,
            supported_in,
        } => {
            assert_eq!(command, Command::Sensors);
            assert_eq!(model, Model::A4);
            assert_eq!(mode, Mode::App);
            assert!(supported_in.contains(&(Model::C4, Mode::App)));
        }
        other => panic!("Expected Unsupported, got {other:?}"),
    }
    assert_eq!(mock.writes(), 0);
}

#[test]
fn sync_echo_marker_depends_on_model() {
    let mock = MockCharger::default();
    mock.reply(0xAB, &[0x12, 0x34, 0xDE]);
    let c4 = session_as(&mock, Model::C4, Mode::App);
    let echo = c4.sync_echo(&[0x12, 0x34]).unwrap();
    assert_eq!(echo.echoed, vec![0x12, 0x34]);
    assert_eq!(echo.marker, 0xDE);
    assert_eq!(echo.marker_matches_model, Some(true));
    assert_eq!(mock.requests()[0], Frame::request(0xAA, &[0x12, 0x34]));

    let mock = MockCharger::default();
    mock.reply(0xAB, &[0x12, 0x34, 0x00]);
    let a4 = session_as(&mock, Model::A4, Mode::App);
    let echo = a4.sync_echo(&[0x12, 0x34]).unwrap();
    assert_eq!(echo.echoed, vec![0x12, 0x34]);
    assert_eq!(echo.marker, 0x00);
    assert_eq!(echo.marker_matches_model, Some(true));
}

#[test]
fn a4_reboot_outcomes() {
    let mock = MockCharger::default();
    mock.reply(0xF1, &[0x00]);
    let charger = session_as(&mock, Model::A4, Mode::App);
    let transition = charger.reboot_to_bootloader().unwrap();
    assert_eq!(transition.target, Mode::Bootloader);
    assert_eq!(transition.outcome, TransitionOutcome::Confirmed);
    assert_eq!(charger.identity().unwrap().mode, Mode::Bootloader);
    assert_eq!(mock.requests()[0].payload, vec![0xAC]);

    let mock = MockCharger::default();
    mock.reply(0xF1, &[0x02]);
    let charger = session_as(&mock, Model::A4, Mode::App);
    assert_eq!(
        charger.reboot_to_bootloader().unwrap().outcome,
        TransitionOutcome::RefusedWhileCharging
    );
    assert_eq!(charger.identity().unwrap().mode, Mode::App);

    let mock = MockCharger::default();
    mock.reply(0xF1, &[0x05]);
    let charger = session_as(&mock, Model::A4, Mode::App);
    let err = charger.reboot_to_bootloader().unwrap_err();
    assert_eq!(err.stage(), Stage::Decode);
    assert!(matches!(
        err,
        Error::Decode {
            command: Command::RebootToBootloader,
            source: DecodeError::UnknownOutcome {
                opcode: 0xF1,
                value: 0x05
            }
        }
    ));
}

#[test]
fn confirmed_transition_changes_what_is_allowed() {
    let mock = MockCharger::default();
    mock.reply(0xF1, &[0x00]).reply(0xF7, &[0x35, 0x00]);
    let charger = session_as(&mock, Model::C4, Mode::App);
    charger.reboot_to_bootloader().unwrap();

    assert!(matches!(
        charger.sensors(),
        Err(Error::Unsupported {
            mode: Mode::Bootloader,
            ..
        })
    ));
    let verification = charger
        .verify_firmware(FlashRegion {
            offset: 0x0800_4000,
            size: 0x100,
            checksum: 0x1234,
        })
        .unwrap();
    assert!(verification.matches);
    assert_eq!(mock.opcodes(), vec![0xF0, 0xF6]);
}

#[test]
fn timeout_writes_exactly_once() {
    let mock = MockCharger::default();
    mock.ignore();
    let charger = session_as(&mock, Model::C4, Mode::App);

    let err = charger.metrics(0).unwrap_err();
    assert_eq!(err.stage(), Stage::Timeout);
    assert!(matches!(
        err,
        Error::Timeout {
            command: Command::ChannelMetrics,
            ..
        }
    ));
    assert_eq!(mock.writes(), 1);
}

#[test]
fn cell_voltages_keep_the_firmware_shift() {
    let mock = MockCharger::default();
    mock.reply(0xFB, &[0x00, 0x00, 0x12, 0x34, 0x56, 0x78, 0x00, 0x00]);
    let charger = session_as(&mock, Model::C4, Mode::App);

    let voltages = charger.cell_voltages().unwrap();
    assert!(voltages.shifted);
    assert_eq!(voltages.channels.len(), 4);
    assert_eq!(voltages.channels[0].charging, 0);
    assert_eq!(voltages.channels[3].cell, None);
}

#[test]
fn probe_reads_version_when_link_test_has_no_name() {
    let mock = MockCharger::default();
    mock.reply(0x01, &[0x01, 0x00, 0x00])
        .reply(0xE1, &version_payload("C4"));
    let charger = session(&mock);

    let identity = charger.probe().unwrap();
    assert_eq!(identity.model, Model::C4);
    assert_eq!(identity.mode, Mode::App);
    assert_eq!(identity.model_name.as_deref(), Some("C4"));
    assert_eq!(charger.identity(), Some(identity));
    assert_eq!(mock.opcodes(), vec![0x00, 0xE0]);
}

#[test]
fn first_command_probes_lazily() {
    let mock = MockCharger::default();
    mock.reply(0x01, &named_link_test(Mode::App, "A4"))
        .reply(0xDF, &metrics_payload(1));
    let charger = session(&mock);
    assert_eq!(charger.identity(), None);

    let metrics = charger.metrics(1).unwrap().unwrap();
    assert_eq!(metrics.channel, 1);
    assert_eq!(metrics.mode, ChannelMode::Charging);
    assert_eq!(metrics.voltage, 4100);
    assert!(!metrics.malformed);
    assert_eq!(charger.identity().unwrap().model, Model::A4);
    assert_eq!(mock.opcodes(), vec![0x00, 0xDE]);
}

#[test]
fn unsupported_after_lazy_probe() {
    let mock = MockCharger::default();
    mock.reply(0x01, &named_link_test(Mode::App, "A4"));
    let charger = session(&mock);

    assert!(matches!(
        charger.cell_voltages(),
        Err(Error::Unsupported {
            model: Model::A4,
            ..
        })
    ));
    assert_eq!(mock.opcodes(), vec![0x00]);
}

#[test]
fn missing_channel_and_foreign_channel() {
    let mock = MockCharger::default();
    mock.reply(0xDF, &[]).reply(0xDF, &metrics_payload(2));
    let charger = session_as(&mock, Model::C4, Mode::App);

    assert_eq!(charger.metrics(5).unwrap(), None);
    let metrics = charger.metrics(3).unwrap().unwrap();
    assert_eq!(metrics.channel, 2);
    assert!(metrics.malformed);
}

#[test]
fn stale_reports_are_dropped_before_the_request() {
    let mock = MockCharger::default();
    mock.stale(response(0xDF, &metrics_payload(0)))
        .reply(0xC9, &(1..=12).collect::<Vec<u8>>());
    let charger = session_as(&mock, Model::C4, Mode::App);

    let id = charger.unique_id().unwrap();
    assert_eq!(id.id[11], 12);
    assert_eq!(mock.pending_reports(), 0);
}

#[test]
fn wrong_response_opcode_is_a_frame_error() {
    let mock = MockCharger::default();
    mock.reply(0xDF, &metrics_payload(0));
    let charger = session_as(&mock, Model::C4, Mode::App);

    let err = charger.unique_id().unwrap_err();
    assert_eq!(err.stage(), Stage::Frame);
    assert!(matches!(
        err,
        Error::OpcodeMismatch {
            expected: 0xC9,
            received: 0xDF,
            ..
        }
    ));
}

#[test]
fn multi_packet_responses_are_reassembled() {
    let payload = (0u8..150).map(|b| b | 0x80).collect::<Vec<_>>();
    let mock = MockCharger::default();
    mock.reply(0xED, &payload);
    let charger = session_as(&mock, Model::C4, Mode::App);

    assert!(response(0xED, &payload).len() > 1);
    let echo = charger.plain_echo(&payload).unwrap();
    assert_eq!(echo.echoed, payload);
    assert_eq!(mock.requests()[0].payload, payload);
}

#[test]
fn missing_continuation_is_reported() {
    let payload = vec![0xAA; 100];
    let mut reports = response(0xED, &payload);
    assert!(reports.len() > 1);
    reports.truncate(1);

    let mock = MockCharger::default();
    mock.reply_reports(reports);
    let charger = session_as(&mock, Model::C4, Mode::App);

    let err = charger.plain_echo(&[1]).unwrap_err();
    assert_eq!(err.stage(), Stage::Frame);
    assert!(matches!(
        err,
        Error::Frame {
            source: FrameError::Truncated(1),
            ..
        }
    ));
}

#[test]
fn resend_repeats_the_last_frame() {
    let mock = MockCharger::default();
    mock.reply(0xED, &[1, 2])
        .reply(0xED, &[1, 2])
        .reply(0xED, &[3]);
    let charger = session_as(&mock, Model::C4, Mode::App);

    charger.plain_echo(&[1, 2]).unwrap();
    let resent = charger.resend_last().unwrap();
    assert_eq!(resent, Frame::response(0xED, &[1, 2]));

    let err = charger.resend_last().unwrap_err();
    assert!(matches!(
        err,
        Error::ResendMismatch {
            command: Command::ResendLast
        }
    ));
    assert_eq!(err.stage(), Stage::Frame);
    assert_eq!(mock.opcodes(), vec![0xEC, 0xA1, 0xA1]);
}

#[test]
fn quiet_opcodes_do_not_wait() {
    let mock = MockCharger::default();
    let charger = session_as(&mock, Model::C4, Mode::App);

    charger.quiet(QuietOpcode::E2, &[0x01]).unwrap();
    assert_eq!(mock.requests(), vec![Frame::request(0xE2, &[0x01])]);

    let c4_evo = session_as(&mock, Model::C4Evo, Mode::App);
    assert!(matches!(
        c4_evo.quiet(QuietOpcode::A4, &[]),
        Err(Error::Unsupported { .. })
    ));
    assert_eq!(mock.writes(), 1);
}

#[test]
fn invalid_parameters_never_reach_the_wire() {
    let mock = MockCharger::default();
    let charger = session_as(&mock, Model::C4, Mode::App);

    let err = charger.rename("much too long").unwrap_err();
    assert_eq!(err.stage(), Stage::Encode);
    assert!(matches!(
        err,
        Error::InvalidParameter {
            command: Command::Rename,
            ..
        }
    ));
    assert!(matches!(
        charger.set_serial("0123456789abcdefXYZ"),
        Err(Error::InvalidParameter { .. })
    ));
    assert_eq!(mock.writes(), 0);
}

#[test]
fn rename_forgets_the_identity() {
    let mock = MockCharger::default();
    mock.reply(0xC1, &[0x00]);
    let charger = session_as(&mock, Model::C4, Mode::App);

    let ack = charger.rename("Garage").unwrap();
    assert_eq!(ack.status, Some(0x00));
    assert_eq!(charger.identity(), None);
    assert_eq!(mock.requests()[0].payload, b"Garage\0\0".to_vec());
}

#[test]
fn serial_number_comes_back_raw() {
    let mut body = vec![0xAD];
    body.extend_from_slice(b"230101120000");
    body.extend_from_slice(&42u32.to_le_bytes());
    let mock = MockCharger::default();
    mock.reply_reports(raw_report(&body));
    let charger = session_as(&mock, Model::A4, Mode::App);

    let record = charger.set_serial("230101120000").unwrap();
    assert_eq!(record.response_opcode, 0xAD);
    assert_eq!(record.timestamp, "230101120000");
    assert_eq!(record.user_id, 42);
}

#[test]
fn channel_detail_beyond_range_reads_channel_zero() {
    let mock = MockCharger::default();
    mock.reply(0xE5, &[0x00, 0x34, 0x12]);
    let charger = session_as(&mock, Model::C4, Mode::App);

    let detail = charger.channel_detail(7).unwrap();
    assert_eq!(detail.channel, 0);
    assert_eq!(detail.words, vec![0x1234]);
    assert_eq!(mock.requests()[0].payload, vec![0x00]);
}

#[test]
fn unchecked_requests_skip_the_table() {
    let mock = MockCharger::default();
    mock.reply(0x43, &[0x09]).reply(0xF9, &[0; 28]);
    let charger = session_as(&mock, Model::A4, Mode::App);

    match charger.invoke_unchecked(0x42, &[0x01]).unwrap() {
        Response::Unparsed(Reply::Frame(frame)) => {
            assert_eq!(frame.opcode, 0x43);
            assert_eq!(frame.payload, vec![0x09]);
        }
        other => panic!("Expected an unparsed frame, got {other:?}"),
    }
    assert!(matches!(
        charger.invoke_unchecked(0xF8, &[]).unwrap(),
        Response::Sensors(_)
    ));
    assert_eq!(mock.opcodes(), vec![0x42, 0xF8]);
}

#[test]
fn invoke_with_requests() {
    let mock = MockCharger::default();
    mock.reply(0x01, &named_link_test(Mode::Bootloader, "C4"));
    let charger = session(&mock);

    let response = charger.invoke(Request::LinkTest).unwrap();
    match response {
        Response::LinkTest(link) => {
            assert_eq!(link.mode, Mode::Bootloader);
            assert_eq!(link.model(), Some(Model::C4));
        }
        other => panic!("Expected a link test, got {other:?}"),
    }
    assert_eq!(
        charger.identity(),
        Some(identity(Model::C4, Mode::Bootloader))
    );
}

#[test]
fn framing_follows_the_boot_mode() {
    let mock = MockCharger::default();
    mock.reply(0xF1, &[0x00]).reply(0xFD, &[]);
    let charger = session_as(&mock, Model::C4, Mode::App);
    assert_eq!(charger.codec(), CodecConfig::APPLICATION);

    charger.reboot_to_bootloader().unwrap();
    assert_eq!(charger.codec(), CodecConfig::BOOTLOADER);
    charger.reboot_to_app().unwrap();
    assert_eq!(charger.codec(), CodecConfig::APPLICATION);
}

#[test]
fn probe_in_bootloader_switches_framing() {
    let mock = MockCharger::default();
    mock.reply(0x01, &named_link_test(Mode::Bootloader, "A4"));
    let charger = session(&mock);

    let identity = charger.probe().unwrap();
    assert_eq!(identity.mode, Mode::Bootloader);
    assert_eq!(charger.codec(), CodecConfig::BOOTLOADER);
}

#[test]
fn unchecked_reboot_updates_the_identity() {
    let mock = MockCharger::default();
    mock.reply(0xF1, &[0x00]);
    let charger = session_as(&mock, Model::C4, Mode::App);

    assert!(matches!(
        charger.invoke_unchecked(0xF0, &[0xAC]).unwrap(),
        Response::ModeTransition(_)
    ));
    assert_eq!(charger.identity().unwrap().mode, Mode::Bootloader);
    assert_eq!(charger.codec(), CodecConfig::BOOTLOADER);
}

#[test]
fn concurrent_callers_take_turns() {
    let mock = MockCharger::default();
    for _ in 0..8 {
        mock.reply(0xE1, &version_payload("C4"));
    }
    let charger = Arc::new(session_as(&mock, Model::C4, Mode::App));

    let workers = (0..2)
        .map(|_| {
            let charger = Arc::clone(&charger);
            thread::spawn(move || {
                for _ in 0..4 {
                    charger.version().unwrap();
                }
            })
        })
        .collect::<Vec<_>>();
    for worker in workers {
        worker.join().unwrap();
    }

    assert_eq!(mock.opcodes(), vec![0xE0; 8]);
    assert_eq!(mock.overlaps(), 0);
    assert_eq!(mock.pending_reports(), 0);
}
