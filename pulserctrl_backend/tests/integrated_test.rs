use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use pulsecompiler_backend::dds::{DdsSetting, DdsWord};
use pulsecompiler_backend::{
    CollectionMode, DdsChannelConfig, DdsPulse, Error, Frequency, HardwareConfig, Power,
    PulserHandle, Range, RangeKind, RemoteChannel, Time, TtlChannelConfig, ADVANCE_DDS, RESET_DDS,
};
use pulserctrl_backend::*;

const TIMEOUT: Option<Duration> = Some(Duration::from_secs(2));

fn server() -> (PulserServer<SimulatedBoard>, BoardLog) {
    let config = HardwareConfig::default_pulser().unwrap();
    let board = SimulatedBoard::new(config.time_resolution());
    let log = board.log();
    (PulserServer::new(board, config).unwrap(), log)
}

fn ttl_sequence(client: &mut PulserClient<SimulatedBoard>) {
    client.new_sequence().unwrap();
    client
        .add_ttl_pulse("chan1", Time::from_us(1.), Time::from_us(10.))
        .unwrap();
}

fn dds_pulse(channel: &str) -> DdsPulse {
    DdsPulse::new(
        channel,
        Time::from_us(1.),
        Time::from_us(2.),
        Frequency::new(100.),
        Power::new(-25.),
    )
}

#[test]
fn initializes_ttl_and_dds() {
    let (_server, log) = server();
    let calls = log.calls();
    assert_eq!(
        calls[..4],
        [
            BoardCall::SetAuto(0, false),
            BoardCall::SetAuto(18, false),
            BoardCall::SetAuto(19, false),
            BoardCall::InitializeDds,
        ]
    );
    // every DDS board gets its initial word
    assert_eq!(calls.len(), 4 + 4 * 3);
    assert_eq!(calls[5], BoardCall::SetDdsChannel(0));
    assert!(matches!(&calls[6], BoardCall::ProgramDds(word) if word.len() == 16));
}

#[test]
fn manual_ttl_initialization() {
    let mut chan1 = TtlChannelConfig::new(3);
    chan1.is_manual = true;
    chan1.manual_state = true;
    chan1.manual_inversion = true;
    let mut chan2 = TtlChannelConfig::new(4);
    chan2.auto_inversion = true;
    let config = HardwareConfig::builder()
        .ttl_channel("chan1", chan1)
        .ttl_channel("chan2", chan2)
        .build()
        .unwrap();
    let board = SimulatedBoard::new(config.time_resolution());
    let log = board.log();
    let _server = PulserServer::new(board, config).unwrap();
    assert_eq!(
        log.calls(),
        vec![
            BoardCall::SetManual(3, false),
            BoardCall::SetAuto(4, true),
            BoardCall::InitializeDds,
        ]
    );
}

#[test]
fn run_single_sequence() {
    let (server, log) = server();
    let mut client = server.client();
    ttl_sequence(&mut client);
    log.clear();
    client.program_sequence().unwrap();
    let compiled = server.programmed_sequence().unwrap();
    assert_eq!(
        log.calls(),
        vec![BoardCall::ProgramBoard(compiled.ttl_program_bytes())]
    );

    client.start_single().unwrap();
    assert_eq!(server.sequence_type(), Some(SequenceType::Single));
    assert!(client.wait_sequence_done(TIMEOUT).unwrap());
    assert_eq!(client.repetitions_completed().unwrap(), 1);

    log.clear();
    client.stop_sequence().unwrap();
    assert_eq!(log.calls(), vec![BoardCall::ResetRam, BoardCall::StopSingle]);
    assert_eq!(server.sequence_type(), None);
}

#[test]
fn start_requires_programmed_sequence() {
    let (server, _log) = server();
    let mut client = server.client();
    assert!(matches!(client.start_single(), Err(PulserError::NotProgrammed)));
    assert!(matches!(client.start_number(2), Err(PulserError::NotProgrammed)));
    assert!(matches!(client.complete_infinite(), Err(PulserError::NotInfinite)));
    assert!(matches!(
        client.human_readable_ttl(false),
        Err(PulserError::NoSequence)
    ));
    assert!(matches!(
        client.human_readable_ttl(true),
        Err(PulserError::NotProgrammed)
    ));
}

#[test]
fn pending_sequence_is_per_client() {
    let (server, _log) = server();
    let mut first = server.client();
    let second = server.client();
    ttl_sequence(&mut first);
    let rows = first.human_readable_ttl(false).unwrap();
    assert_eq!(rows.len(), 3);
    assert_eq!(rows[0].0, Time::ZERO);
    assert_eq!(rows[1].0, Time::from_us(1.));
    assert!(rows[1].1.starts_with('1'));
    assert!(matches!(
        second.human_readable_ttl(false),
        Err(PulserError::NoSequence)
    ));
}

#[test]
fn repetitions_are_bounded() {
    let (server, _log) = server();
    let mut client = server.client();
    ttl_sequence(&mut client);
    client.program_sequence().unwrap();
    assert!(matches!(
        client.start_number(0),
        Err(PulserError::InvalidRepetitions(0))
    ));
    assert!(matches!(
        client.start_number(MAX_REPETITIONS + 1),
        Err(PulserError::InvalidRepetitions(65536))
    ));

    client.start_number(3).unwrap();
    assert!(client.wait_sequence_done(TIMEOUT).unwrap());
    assert_eq!(client.repetitions_completed().unwrap(), 3);
    client.stop_sequence().unwrap();
}

#[test]
fn running_sequence_locks_access() {
    let (server, log) = server();
    let mut client = server.client();
    let mut other = server.client();
    ttl_sequence(&mut client);
    client.program_sequence().unwrap();
    client.start_infinite().unwrap();

    ttl_sequence(&mut other);
    assert!(matches!(
        other.program_sequence(),
        Err(PulserError::AccessLocked(_))
    ));
    assert!(matches!(other.start_single(), Err(PulserError::AccessLocked(_))));
    assert!(!client
        .wait_sequence_done(Some(Duration::from_millis(5)))
        .unwrap());

    client.complete_infinite().unwrap();
    assert!(client.wait_sequence_done(TIMEOUT).unwrap());
    assert!(client.repetitions_completed().unwrap() >= 1);
    other.program_sequence().unwrap();

    log.clear();
    client.stop_sequence().unwrap();
    assert_eq!(log.calls(), vec![BoardCall::ResetRam, BoardCall::StopLooped]);
}

#[test]
fn stop_ends_infinite_run() {
    let (server, _log) = server();
    let mut client = server.client();
    ttl_sequence(&mut client);
    client.program_sequence().unwrap();
    client.start_infinite().unwrap();
    client.stop_sequence().unwrap();
    assert!(client
        .wait_sequence_done(Some(Duration::from_millis(50)))
        .unwrap());
    // the board is free again even though the loop never completed
    client.program_sequence().unwrap();
    client.start_single().unwrap();
    assert!(client.wait_sequence_done(TIMEOUT).unwrap());
}

#[test]
fn dds_sequence_takes_dds_lock() {
    let (server, log) = server();
    let mut client = server.client();
    client.new_sequence().unwrap();
    client.add_dds_pulses(&[dds_pulse("DDS_0")]).unwrap();
    log.clear();
    client.program_sequence().unwrap();

    let programs: Vec<_> = log
        .calls()
        .into_iter()
        .filter_map(|call| match call {
            BoardCall::ProgramDds(program) => Some(program),
            _ => None,
        })
        .collect();
    assert_eq!(programs.len(), 4);
    // initial word, pulse on, pulse off and the terminator
    assert_eq!(programs[0].len(), 3 * 16 + 2);

    let compiled = server.programmed_sequence().unwrap();
    assert!(compiled.channel_states(ADVANCE_DDS).is_some());
    assert!(compiled.channel_states(RESET_DDS).is_some());

    assert!(matches!(
        client.amplitude("DDS_0", Some(Power::new(-10.))),
        Err(PulserError::AccessLocked(_))
    ));
    assert_eq!(client.amplitude("DDS_0", None).unwrap(), Power::new(-48.));
    client.clear_dds_lock();
    assert_eq!(
        client.amplitude("DDS_0", Some(Power::new(-10.))).unwrap(),
        Power::new(-10.)
    );
    assert_eq!(server.dds_state().get("DDS_0").unwrap().amplitude, Power::new(-10.));
}

#[test]
fn stop_releases_dds_lock() {
    let (server, _log) = server();
    let mut client = server.client();
    client.new_sequence().unwrap();
    client.add_dds_pulses(&[dds_pulse("DDS_0")]).unwrap();
    client.program_sequence().unwrap();
    assert!(client.frequency("DDS_0", Some(Frequency::new(90.))).is_err());
    client.stop_sequence().unwrap();
    assert_eq!(
        client.frequency("DDS_0", Some(Frequency::new(90.))).unwrap(),
        Frequency::new(90.)
    );
}

#[test]
fn dds_settings_respect_allowed_range() {
    let (server, _log) = server();
    let mut client = server.client();
    match client.frequency("DDS_1", Some(Frequency::new(200.))) {
        Err(PulserError::Compile(Error::OutOfRange {
            quantity: "Frequency",
            kind: RangeKind::Allowed,
            ..
        })) => {}
        other => panic!("expected a range error, got {:?}", other),
    }
    assert_eq!(client.frequency("DDS_1", None).unwrap(), Frequency::new(125.));
    assert_eq!(
        client.get_dds_amplitude_range("DDS_1").unwrap(),
        Range::new(-48., -20.)
    );
    assert!(client.amplitude("DDS_9", None).is_err());
}

#[test]
fn switched_off_dds_is_not_written() {
    let (server, log) = server();
    let mut client = server.client();
    let channel = server.config().get_dds_channel("DDS_2").unwrap().clone();

    log.clear();
    assert!(!client.output("DDS_2", Some(false)).unwrap());
    let off = DdsWord::encode(&channel, &DdsSetting::new(Frequency::new(0.), Power::new(-48.)));
    assert_eq!(
        log.calls(),
        vec![
            BoardCall::ResetAllDds,
            BoardCall::SetDdsChannel(2),
            BoardCall::ProgramDds(off.to_bytes().to_vec()),
        ]
    );

    log.clear();
    client.amplitude("DDS_2", Some(Power::new(-30.))).unwrap();
    assert!(log.calls().is_empty());

    assert!(client.output("DDS_2", Some(true)).unwrap());
    let on = DdsWord::encode(&channel, &DdsSetting::new(Frequency::new(125.), Power::new(-30.)));
    assert_eq!(
        log.calls().last(),
        Some(&BoardCall::ProgramDds(on.to_bytes().to_vec()))
    );
}

#[test]
fn ttl_switching() {
    let (server, log) = server();
    let mut client = server.client();
    log.clear();

    client.switch_manual("chan1", Some(true)).unwrap();
    assert_eq!(client.get_state("chan1").unwrap(), (true, true, false, false));
    client.switch_auto("chan1", Some(true)).unwrap();
    assert_eq!(client.get_state("chan1").unwrap(), (false, true, false, true));
    client.switch_manual("chan1", None).unwrap();
    assert_eq!(
        log.calls(),
        vec![
            BoardCall::SetManual(0, true),
            BoardCall::SetAuto(0, true),
            BoardCall::SetManual(0, true),
        ]
    );
    assert!(client.switch_auto("chan9", None).is_err());
    assert!(client
        .get_channels()
        .contains(&("chan1".to_string(), 0)));
}

#[derive(Clone, Default)]
struct RecordingLink {
    calls: Arc<Mutex<Vec<(String, Option<u8>, usize)>>>,
}

impl RemoteDds for RecordingLink {
    fn reset(&mut self, remote: &RemoteChannel) -> Result<(), PulserError> {
        self.calls.lock().push((remote.reset_setting.clone(), None, 0));
        Ok(())
    }
    fn program(
        &mut self,
        remote: &RemoteChannel,
        address: u8,
        program: &[u8],
    ) -> Result<(), PulserError> {
        self.calls
            .lock()
            .push((remote.program_setting.clone(), Some(address), program.len()));
        Ok(())
    }
}

fn remote_config() -> HardwareConfig {
    let mut channel = DdsChannelConfig::new(
        5,
        Range::new(0., 200.),
        Range::new(-48., 0.),
        Frequency::new(100.),
        Power::new(-20.),
    );
    channel.remote = Some("lab2".to_string());
    HardwareConfig::builder()
        .ttl_channel("chan1", TtlChannelConfig::new(0))
        .ttl_channel(ADVANCE_DDS, TtlChannelConfig::new(18))
        .ttl_channel(RESET_DDS, TtlChannelConfig::new(19))
        .dds_channel("remote", channel)
        .remote_channel("lab2", RemoteChannel::new("10.0.0.2", "dds_server"))
        .build()
        .unwrap()
}

#[test]
fn remote_dds_goes_through_link() {
    let config = remote_config();
    let board = SimulatedBoard::new(config.time_resolution());
    let log = board.log();
    let link = RecordingLink::default();
    let remotes: HashMap<String, Box<dyn RemoteDds>> =
        HashMap::from([("lab2".to_string(), Box::new(link.clone()) as Box<dyn RemoteDds>)]);
    let server = PulserServer::with_remotes(board, config, remotes).unwrap();
    assert_eq!(
        *link.calls.lock(),
        vec![
            ("reset_dds".to_string(), None, 0),
            ("program_dds".to_string(), Some(5), 16),
        ]
    );
    assert!(!log
        .calls()
        .iter()
        .any(|call| matches!(call, BoardCall::SetDdsChannel(_))));

    let mut client = server.client();
    client.new_sequence().unwrap();
    client.add_dds_pulses(&[dds_pulse("remote")]).unwrap();
    client.program_sequence().unwrap();
    assert_eq!(
        link.calls.lock().last(),
        Some(&("program_dds".to_string(), Some(5), 3 * 16 + 2))
    );
}

#[test]
fn missing_remote_link_is_skipped() {
    let config = remote_config();
    let board = SimulatedBoard::new(config.time_resolution());
    let server = PulserServer::new(board, config).unwrap();
    let mut client = server.client();
    client.new_sequence().unwrap();
    client.add_dds_pulses(&[dds_pulse("remote")]).unwrap();
    client.program_sequence().unwrap();
    assert!(server.programmed_sequence().unwrap().has_dds());
}

fn counting_server() -> (PulserServer<SimulatedBoard>, BoardLog, PhotonSource) {
    let config = HardwareConfig::default_pulser().unwrap();
    let board = SimulatedBoard::new(config.time_resolution());
    let (log, photons) = (board.log(), board.photons());
    let server = PulserServer::new(board, config).unwrap();
    log.clear();
    (server, log, photons)
}

#[test]
fn collection_mode_programs_board() {
    let (server, log, _photons) = counting_server();
    let mut client = server.client();
    assert_eq!(client.get_mode(), CollectionMode::Normal);

    client.set_mode(CollectionMode::Differential).unwrap();
    assert_eq!(client.get_mode(), CollectionMode::Differential);
    assert_eq!(log.calls(), vec![BoardCall::SetModeDifferential]);

    log.clear();
    client.set_mode(CollectionMode::Normal).unwrap();
    assert_eq!(
        log.calls(),
        vec![
            BoardCall::SetModeNormal,
            BoardCall::SetPmtCountRate(Duration::from_millis(100)),
        ]
    );
}

#[test]
fn collection_time_is_bounded() {
    let (server, log, _photons) = counting_server();
    let mut client = server.client();
    let range = client.get_collect_time_range();
    assert!(matches!(
        client.set_collect_time(range.max * 2., CollectionMode::Normal),
        Err(PulserError::InvalidCollectionTime { .. })
    ));
    assert!(log.calls().is_empty());

    client
        .set_collect_time(0.25, CollectionMode::Differential)
        .unwrap();
    // differential windows come from the sequence
    assert!(log.calls().is_empty());
    assert_eq!(client.get_collect_time(CollectionMode::Differential), 0.25);
    assert_eq!(client.get_collect_time(CollectionMode::Normal), 0.1);

    client.set_collect_time(0.5, CollectionMode::Normal).unwrap();
    assert_eq!(
        log.calls(),
        vec![BoardCall::SetPmtCountRate(Duration::from_millis(500))]
    );
}

#[test]
fn counts_settle_after_mode_change() {
    let (server, _log, photons) = counting_server();
    let mut client = server.client();
    client.set_mode(CollectionMode::Normal).unwrap();
    for count in [10, 20, 30, 400] {
        photons.push_count(count, false);
    }
    photons.push_count(800, true);

    let readings = client.get_all_counts().unwrap();
    assert_eq!(readings.len(), 2);
    // 400 counts in 100 ms
    assert!((readings[0].rate - 4.).abs() < 1e-9);
    assert_eq!(readings[0].repump, RepumpState::On);
    assert!((readings[1].rate - 8.).abs() < 1e-9);
    assert_eq!(readings[1].repump, RepumpState::Off);
    assert!((readings[1].time - readings[0].time - 0.1).abs() < 1e-9);

    photons.push_count(50, false);
    assert_eq!(client.get_all_counts().unwrap().len(), 1);
    assert!(client.get_all_counts().unwrap().is_empty());
}

#[test]
fn fifo_reset_discards_counts() {
    let (server, log, photons) = counting_server();
    let mut client = server.client();
    photons.push_count(10, false);
    photons.push_readout(7);
    photons.push_timetag(3);

    client.reset_fifo_normal().unwrap();
    client.reset_readout_counts().unwrap();
    client.reset_timetags().unwrap();
    assert_eq!(
        log.calls(),
        vec![
            BoardCall::ResetFifoNormal,
            BoardCall::ResetFifoReadout,
            BoardCall::ResetFifoResolved,
        ]
    );
    assert!(client.get_all_counts().unwrap().is_empty());
    assert!(client.get_readout_counts().unwrap().is_empty());
    assert!(client.get_timetags().unwrap().is_empty());
}

#[test]
fn readout_counts_and_timetags() {
    let (server, _log, photons) = counting_server();
    let mut client = server.client();
    photons.push_readout(12);
    photons.push_readout(70_000);
    assert_eq!(client.get_readout_counts().unwrap(), vec![12, 70_000]);

    assert_eq!(client.get_time_tag_resolution(), 10e-9);
    photons.push_timetag(100);
    photons.push_timetag(250_000);
    let tags = client.get_timetags().unwrap();
    assert_eq!(tags.len(), 2);
    assert!((tags[0] - 1e-6).abs() < 1e-15);
    assert!((tags[1] - 2.5e-3).abs() < 1e-12);
}

#[test]
fn counting_is_not_locked_by_running_sequence() {
    let (server, _log, photons) = counting_server();
    let mut client = server.client();
    ttl_sequence(&mut client);
    client.program_sequence().unwrap();
    client.start_infinite().unwrap();
    let mut other = server.client();
    photons.push_readout(5);
    assert_eq!(other.get_readout_counts().unwrap(), vec![5]);
    other.set_mode(CollectionMode::Differential).unwrap();
    client.stop_sequence().unwrap();
}

#[test]
fn line_trigger() {
    let (server, log, _photons) = counting_server();
    let mut client = server.client();
    assert!(!client.line_trigger_state(None).unwrap());
    let (min, max) = client.get_line_trigger_limits();
    assert_eq!((min, max), (Time::ZERO, Time::from_us(15_000.)));

    // a new delay is only sent while the trigger is enabled
    assert_eq!(
        client
            .line_trigger_duration(Some(Time::from_us(500.)))
            .unwrap(),
        Time::from_us(500.)
    );
    assert!(log.calls().is_empty());

    assert!(client.line_trigger_state(Some(true)).unwrap());
    client
        .line_trigger_duration(Some(Time::from_us(1200.)))
        .unwrap();
    assert!(matches!(
        client.line_trigger_duration(Some(max + Time::from_us(1.))),
        Err(PulserError::InvalidLineTriggerDelay { .. })
    ));
    assert_eq!(
        client.line_trigger_duration(None).unwrap(),
        Time::from_us(1200.)
    );
    assert!(!client.line_trigger_state(Some(false)).unwrap());
    assert_eq!(
        log.calls(),
        vec![
            BoardCall::EnableLineTrigger(500),
            BoardCall::EnableLineTrigger(1200),
            BoardCall::DisableLineTrigger,
        ]
    );
}
