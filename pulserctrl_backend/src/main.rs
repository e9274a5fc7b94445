use std::time::Duration;

use maplit::hashmap;
use pulsecompiler_backend::*;
use pulserctrl_backend::{PulserClient, PulserError, PulserServer, SimulatedBoard};

struct Repump;
impl PulseSequence for Repump {
    fn required_parameters() -> Vec<ParameterKey> {
        vec![
            ParameterKey::new("Repump", "duration"),
            ParameterKey::new("Repump", "frequency"),
        ]
    }
    fn sequence(seq: &mut SequenceBuilder) -> Result<()> {
        let duration = seq.time("Repump", "duration")?;
        let frequency = seq.frequency("Repump", "frequency")?;
        seq.add_dds(DdsPulse::new("DDS_0", seq.start(), duration, frequency, Power::new(-12.)))?;
        seq.add_ttl("chan1", seq.start(), duration)?;
        seq.add_ttl("chan1", seq.start() + duration + Time::from_us(5.), Time::from_us(5.))?;
        seq.advance_end(seq.start() + duration + Time::from_us(10.));
        Ok(())
    }
}

fn run(client: &mut PulserClient<SimulatedBoard>) -> std::result::Result<(), PulserError> {
    let params = parameter_map(hashmap! {
        "Repump.duration" => WithUnit::new(20., Unit::Us),
        "Repump.frequency" => WithUnit::new(105., Unit::MHz),
    })?;
    let seq = Sequence::build::<Repump>(&params)?;
    seq.program_sequence(client)?;

    for (time, states) in client.human_readable_ttl(true)? {
        println!("{:>12} {}", time.to_string(), states);
    }
    for (channel, frequency, amplitude) in client.human_readable_dds(true)? {
        println!("{} {} {}", channel, frequency, amplitude);
    }

    client.start_number(100)?;
    client.wait_sequence_done(Some(Duration::from_secs(1)))?;
    println!("{} repetitions completed", client.repetitions_completed()?);
    client.stop_sequence()
}

fn main() {
    pretty_env_logger::init();

    let server = HardwareConfig::default_pulser()
        .map_err(PulserError::from)
        .and_then(|config| {
            let board = SimulatedBoard::new(config.time_resolution());
            PulserServer::new(board, config)
        });
    let result = server.and_then(|server| run(&mut server.client()));
    if let Err(err) = result {
        log::error!("{}", err);
        std::process::exit(1);
    }
}
