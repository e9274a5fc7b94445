use maplit::hashmap;

use pulsecompiler_backend::*;

struct Pump;
impl PulseSequence for Pump {
    fn required_parameters() -> Vec<ParameterKey> {
        vec![
            ParameterKey::new("Pump", "duration"),
            ParameterKey::new("Pump", "frequency"),
            ParameterKey::new("Pump", "amplitude"),
        ]
    }

    fn sequence(seq: &mut SequenceBuilder) -> Result<()> {
        let duration = seq.time("Pump", "duration")?;
        let pulse = DdsPulse::new(
            "DDS_0",
            seq.start(),
            duration,
            seq.frequency("Pump", "frequency")?,
            seq.power("Pump", "amplitude")?,
        );
        seq.add_dds(pulse)?;
        seq.add_ttl("chan1", seq.start(), duration)?;
        seq.set_end(seq.start() + duration);
        Ok(())
    }
}

fn main() -> Result<()> {
    pretty_env_logger::init();

    let params = parameter_map(hashmap! {
        "Pump.duration" => WithUnit::new(10., Unit::Us),
        "Pump.frequency" => WithUnit::new(110., Unit::MHz),
        "Pump.amplitude" => WithUnit::new(-12., Unit::DBm),
    })?;
    let seq = Sequence::build::<Pump>(&params)?;
    let compiled = seq.compile(&HardwareConfig::default_pulser()?)?;

    println!("{} switches over {}", compiled.switch_count(), compiled.duration());
    for (t, states) in compiled.human_readable_ttl() {
        println!("{:>12} {}", t.to_string(), states);
    }
    for (name, freq, ampl) in compiled.human_readable_dds() {
        println!("{} {} {}", name, freq, ampl);
    }
    Ok(())
}
