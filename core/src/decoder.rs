//! Turns one raw dive payload into a [`DiveData`].
//!
//! Each decode creates a fresh engine parser, reads the header fields,
//! folds the sample stream into a profile and event list, and releases the
//! parser before returning, whether or not decoding succeeded.

use log::{debug, trace};

use crate::engine::{
    DecoKind, Descriptor, Engine, FieldType, FieldValue, Parser, RawDive, Sample,
    SampleEventKind, Status,
};
use crate::error::{DecodeError, DecodeStage};
use crate::models::{
    DecoModel, DiveData, DiveEvent, DiveEventKind, DiveMode, Fingerprint, GasMix, ProfilePoint,
    Salinity, Tank,
};

pub struct RecordDecoder<'a, E: Engine> {
    engine: &'a E,
    context: &'a E::Context,
    descriptor: &'a Descriptor,
}

impl<'a, E: Engine> RecordDecoder<'a, E> {
    pub fn new(engine: &'a E, context: &'a E::Context, descriptor: &'a Descriptor) -> Self {
        Self {
            engine,
            context,
            descriptor,
        }
    }

    /// Decode `raw` as dive `number` of this retrieval.
    pub fn decode(&self, number: u32, raw: RawDive<'_>) -> Result<DiveData, DecodeError> {
        let fingerprint = Fingerprint::new(raw.fingerprint);
        let fail = |stage: DecodeStage, status: Status| DecodeError {
            index: number,
            fingerprint: fingerprint.clone(),
            stage,
            status,
        };

        let mut parser = self
            .engine
            .parser(self.context, self.descriptor, raw.data)
            .map_err(|status| fail(DecodeStage::Create, status))?;

        let dive = project(&mut parser, number, &fingerprint).map_err(|(stage, status)| fail(stage, status));
        drop(parser);

        if let Ok(dive) = &dive {
            debug!(
                "decoded dive {number} ({fingerprint}): {} s, {:.1} m, {} samples",
                dive.duration_s,
                dive.max_depth_m,
                dive.profile.len()
            );
        }
        dive
    }
}

type StageResult<T> = Result<T, (DecodeStage, Status)>;

/// `Unsupported` means the family does not record this field.
fn optional_field<P: Parser>(parser: &P, field: FieldType) -> StageResult<Option<FieldValue>> {
    match parser.field(field) {
        Ok(value) => Ok(Some(value)),
        Err(Status::Unsupported) => Ok(None),
        Err(status) => Err((DecodeStage::Field, status)),
    }
}

fn mismatch<T>(field: FieldType, value: &FieldValue) -> StageResult<T> {
    debug!("field {field:?} returned unexpected value {value:?}");
    Err((DecodeStage::Field, Status::DataFormat))
}

fn seconds<P: Parser>(parser: &P, field: FieldType) -> StageResult<Option<u32>> {
    match optional_field(parser, field)? {
        None => Ok(None),
        Some(FieldValue::Seconds(s)) => Ok(Some(s)),
        Some(other) => mismatch(field, &other),
    }
}

fn meters<P: Parser>(parser: &P, field: FieldType) -> StageResult<Option<f64>> {
    match optional_field(parser, field)? {
        None => Ok(None),
        Some(FieldValue::Meters(m)) => Ok(Some(m)),
        Some(other) => mismatch(field, &other),
    }
}

fn celsius<P: Parser>(parser: &P, field: FieldType) -> StageResult<Option<f64>> {
    match optional_field(parser, field)? {
        None => Ok(None),
        Some(FieldValue::Celsius(c)) => Ok(Some(c)),
        Some(other) => mismatch(field, &other),
    }
}

fn count<P: Parser>(parser: &P, field: FieldType) -> StageResult<u32> {
    match optional_field(parser, field)? {
        None => Ok(0),
        Some(FieldValue::Count(n)) => Ok(n),
        Some(other) => mismatch(field, &other),
    }
}

fn gas_mixes<P: Parser>(parser: &P) -> StageResult<Vec<GasMix>> {
    let n = count(parser, FieldType::GasMixCount)?;
    let mut mixes = Vec::new();
    for i in 0..n {
        let field = FieldType::GasMix(i);
        match optional_field(parser, field)? {
            Some(FieldValue::GasMix(mix)) => mixes.push(mix),
            None => return Err((DecodeStage::Field, Status::DataFormat)),
            Some(other) => return mismatch(field, &other),
        }
    }
    Ok(mixes)
}

fn tanks<P: Parser>(parser: &P) -> StageResult<Vec<Tank>> {
    let n = count(parser, FieldType::TankCount)?;
    let mut tanks = Vec::new();
    for i in 0..n {
        let field = FieldType::Tank(i);
        match optional_field(parser, field)? {
            Some(FieldValue::Tank(tank)) => tanks.push(tank),
            None => return Err((DecodeStage::Field, Status::DataFormat)),
            Some(other) => return mismatch(field, &other),
        }
    }
    Ok(tanks)
}

fn project<P: Parser>(parser: &mut P, number: u32, fingerprint: &Fingerprint) -> StageResult<DiveData> {
    let timestamp_unix = match parser.datetime() {
        Ok(dt) => dt.unix_timestamp(),
        Err(Status::Unsupported) => 0,
        Err(status) => return Err((DecodeStage::DateTime, status)),
    };

    let duration = seconds(parser, FieldType::DiveTime)?;
    let max_depth = meters(parser, FieldType::MaxDepth)?;
    let avg_depth = meters(parser, FieldType::AvgDepth)?;
    let surface_temperature = celsius(parser, FieldType::TemperatureSurface)?;
    let min_temperature = celsius(parser, FieldType::TemperatureMinimum)?;
    let max_temperature = celsius(parser, FieldType::TemperatureMaximum)?;

    let atmospheric_bar = match optional_field(parser, FieldType::Atmospheric)? {
        None => None,
        Some(FieldValue::Bar(bar)) => Some(bar),
        Some(other) => return mismatch(FieldType::Atmospheric, &other),
    };
    let salinity: Option<Salinity> = match optional_field(parser, FieldType::Salinity)? {
        None => None,
        Some(FieldValue::Salinity(s)) => Some(s),
        Some(other) => return mismatch(FieldType::Salinity, &other),
    };
    let dive_mode: Option<DiveMode> = match optional_field(parser, FieldType::DiveMode)? {
        None => None,
        Some(FieldValue::DiveMode(m)) => Some(m),
        Some(other) => return mismatch(FieldType::DiveMode, &other),
    };
    let deco_model: Option<DecoModel> = match optional_field(parser, FieldType::DecoModel)? {
        None => None,
        Some(FieldValue::DecoModel(m)) => Some(m),
        Some(other) => return mismatch(FieldType::DecoModel, &other),
    };
    let gas_mixes = gas_mixes(parser)?;
    let tanks = tanks(parser)?;

    let mut builder = DiveBuilder::default();
    match parser.samples(&mut |sample| builder.push(sample)) {
        Ok(()) | Err(Status::Unsupported) => {}
        Err(status) => return Err((DecodeStage::Samples, status)),
    }
    let summary = builder.finish();

    Ok(DiveData {
        number,
        timestamp_unix,
        duration_s: duration.unwrap_or(summary.last_time_s),
        max_depth_m: max_depth.unwrap_or(summary.max_depth_m),
        avg_depth_m: avg_depth.or(summary.avg_depth_m),
        min_temperature_c: min_temperature.or(summary.min_temperature_c),
        max_temperature_c: max_temperature.or(summary.max_temperature_c),
        surface_temperature_c: surface_temperature,
        atmospheric_bar,
        salinity,
        dive_mode,
        deco_model,
        gas_mixes,
        tanks,
        profile: summary.profile,
        events: summary.events,
        fingerprint: fingerprint.as_bytes().to_vec(),
    })
}

/// What the sample stream contributes to a dive.
#[derive(Debug, Default)]
struct SampleSummary {
    profile: Vec<ProfilePoint>,
    events: Vec<DiveEvent>,
    last_time_s: u32,
    max_depth_m: f64,
    avg_depth_m: Option<f64>,
    min_temperature_c: Option<f64>,
    max_temperature_c: Option<f64>,
}

/// Folds samples into profile points. A `Time` sample closes the current
/// point and opens the next one.
#[derive(Debug, Default)]
struct DiveBuilder {
    profile: Vec<ProfilePoint>,
    current: Option<ProfilePoint>,
    events: Vec<DiveEvent>,
    time_s: u32,
    max_depth_m: f64,
    min_temperature_c: Option<f64>,
    max_temperature_c: Option<f64>,
    pressure_tank: Option<u32>,
    deco: Option<DecoKind>,
    gas_mix: Option<u32>,
}

fn point_at(time_s: u32) -> ProfilePoint {
    ProfilePoint {
        time_s,
        depth_m: 0.0,
        temperature_c: None,
        pressure_bar: None,
        ppo2_bar: None,
        ndl_s: None,
    }
}

impl DiveBuilder {
    fn point(&mut self) -> &mut ProfilePoint {
        let time_s = self.time_s;
        self.current.get_or_insert_with(|| point_at(time_s))
    }

    fn event(&mut self, kind: DiveEventKind, depth_m: Option<f64>, duration_s: Option<u32>, value: Option<u32>) {
        self.events.push(DiveEvent {
            time_s: self.time_s,
            kind,
            depth_m,
            duration_s,
            value,
        });
    }

    fn push(&mut self, sample: Sample) {
        trace!("sample {sample:?}");
        match sample {
            Sample::Time(ms) => {
                if let Some(point) = self.current.take() {
                    self.profile.push(point);
                }
                self.time_s = ms / 1000;
                self.current = Some(point_at(self.time_s));
            }
            Sample::Depth(depth) => {
                self.point().depth_m = depth;
                self.max_depth_m = self.max_depth_m.max(depth);
            }
            Sample::Temperature(t) => {
                self.point().temperature_c = Some(t);
                self.min_temperature_c = Some(self.min_temperature_c.map_or(t, |m| m.min(t)));
                self.max_temperature_c = Some(self.max_temperature_c.map_or(t, |m| m.max(t)));
            }
            Sample::Pressure { tank, bar } => {
                let tracked = *self.pressure_tank.get_or_insert(tank);
                if tracked == tank {
                    self.point().pressure_bar = Some(bar);
                }
            }
            Sample::Ppo2 { bar, .. } => {
                let point = self.point();
                if point.ppo2_bar.is_none() {
                    point.ppo2_bar = Some(bar);
                }
            }
            Sample::Deco { kind, time_s, depth_m } => {
                if kind == DecoKind::Ndl {
                    self.point().ndl_s = Some(time_s);
                } else if self.deco != Some(kind) {
                    let event_kind = match kind {
                        DecoKind::SafetyStop => DiveEventKind::SafetyStop,
                        DecoKind::DeepStop => DiveEventKind::DeepStop,
                        _ => DiveEventKind::DecoStop,
                    };
                    self.event(event_kind, Some(depth_m), Some(time_s), None);
                }
                self.deco = Some(kind);
            }
            Sample::GasMix(index) => {
                if self.gas_mix.is_some_and(|current| current != index) {
                    self.event(DiveEventKind::GasSwitch, None, None, Some(index));
                }
                self.gas_mix = Some(index);
            }
            Sample::Event { kind, time_s, value } => {
                let kind = match kind {
                    SampleEventKind::Ascent => DiveEventKind::Ascent,
                    SampleEventKind::Violation => DiveEventKind::Violation,
                    SampleEventKind::Bookmark => DiveEventKind::Bookmark,
                    SampleEventKind::Surface => DiveEventKind::Surface,
                    SampleEventKind::SafetyStop => DiveEventKind::SafetyStop,
                    SampleEventKind::DecoStop => DiveEventKind::DecoStop,
                    SampleEventKind::DeepStop => DiveEventKind::DeepStop,
                    SampleEventKind::GasChange => DiveEventKind::GasSwitch,
                    SampleEventKind::Other(_) => DiveEventKind::Other,
                };
                let duration = (time_s > 0).then_some(time_s);
                self.event(kind, None, duration, Some(value));
            }
            Sample::Setpoint(_) | Sample::Cns(_) | Sample::Heartbeat(_) | Sample::Bearing(_) => {}
        }
    }

    fn finish(mut self) -> SampleSummary {
        if let Some(point) = self.current.take() {
            self.profile.push(point);
        }
        let avg_depth_m = time_weighted_depth(&self.profile);
        SampleSummary {
            last_time_s: self.profile.last().map_or(0, |p| p.time_s),
            profile: self.profile,
            events: self.events,
            max_depth_m: self.max_depth_m,
            avg_depth_m,
            min_temperature_c: self.min_temperature_c,
            max_temperature_c: self.max_temperature_c,
        }
    }
}

fn time_weighted_depth(profile: &[ProfilePoint]) -> Option<f64> {
    let (first, last) = (profile.first()?, profile.last()?);
    let span = f64::from(last.time_s.saturating_sub(first.time_s));
    if span <= 0.0 {
        return None;
    }
    let area: f64 = profile
        .windows(2)
        .map(|w| f64::from(w[1].time_s.saturating_sub(w[0].time_s)) * (w[0].depth_m + w[1].depth_m) / 2.0)
        .sum();
    Some(area / span)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine_mock::{MockDive, MockEngine, MockEngineConfig};

    fn decode_one(dive: &MockDive, number: u32) -> (Result<DiveData, DecodeError>, MockEngine) {
        let engine = MockEngine::new(MockEngineConfig::default());
        let context = engine.new_context().unwrap();
        let descriptor = engine.descriptors()[0].clone();
        let payload = dive.to_payload();
        let result = {
            let decoder = RecordDecoder::new(&engine, &context, &descriptor);
            decoder.decode(
                number,
                RawDive {
                    data: &payload,
                    fingerprint: &dive.fingerprint,
                },
            )
        };
        (result, engine)
    }

    #[test]
    fn test_decode_header_and_profile() {
        let dive = MockDive::sample(vec![0xF5], 1_704_967_200);
        let (result, engine) = decode_one(&dive, 1);
        let data = result.unwrap();

        assert_eq!(data.number, 1);
        assert_eq!(data.timestamp_unix, 1_704_967_200);
        assert_eq!(data.duration_s, dive.duration_s);
        assert_eq!(data.max_depth_m, dive.max_depth_m);
        assert_eq!(data.fingerprint, vec![0xF5]);
        assert_eq!(data.gas_mixes.len(), 2);
        assert_eq!(data.profile.len(), dive.depths.len());
        assert_eq!(data.profile[1].time_s, 10);
        assert_eq!(engine.counters().parsers_live(), 0);
    }

    #[test]
    fn test_running_temperature_extremes() {
        let mut dive = MockDive::sample(vec![1], 0);
        dive.temperatures = vec![24.0, 21.5, 19.0, 20.5];
        dive.header_temperatures = false;
        let (result, _) = decode_one(&dive, 1);
        let data = result.unwrap();

        assert_eq!(data.min_temperature_c, Some(19.0));
        assert_eq!(data.max_temperature_c, Some(24.0));
    }

    #[test]
    fn test_stop_events_emitted_on_entry() {
        let mut dive = MockDive::sample(vec![1], 0);
        dive.deco = vec![
            (2, DecoKind::Ndl, 600, 0.0),
            (3, DecoKind::SafetyStop, 180, 5.0),
            (4, DecoKind::SafetyStop, 120, 5.0),
        ];
        let (result, _) = decode_one(&dive, 1);
        let data = result.unwrap();

        let stops: Vec<_> = data
            .events
            .iter()
            .filter(|e| e.kind == DiveEventKind::SafetyStop)
            .collect();
        assert_eq!(stops.len(), 1);
        assert_eq!(stops[0].depth_m, Some(5.0));
        assert_eq!(data.profile[2].ndl_s, Some(600));
    }

    #[test]
    fn test_gas_switch_events() {
        let mut dive = MockDive::sample(vec![1], 0);
        dive.gas_switches = vec![(0, 0), (2, 1), (3, 1)];
        let (result, _) = decode_one(&dive, 1);
        let data = result.unwrap();

        let switches: Vec<_> = data
            .events
            .iter()
            .filter(|e| e.kind == DiveEventKind::GasSwitch)
            .collect();
        assert_eq!(switches.len(), 1);
        assert_eq!(switches[0].value, Some(1));
        assert_eq!(switches[0].time_s, 20);
    }

    #[test]
    fn test_sample_failure_names_dive() {
        let mut dive = MockDive::sample(vec![0xF4], 0);
        dive.fail_samples = true;
        let (result, engine) = decode_one(&dive, 2);
        let err = result.unwrap_err();

        assert_eq!(err.index, 2);
        assert_eq!(err.fingerprint, Fingerprint::new(vec![0xF4]));
        assert_eq!(err.stage, DecodeStage::Samples);
        assert_eq!(err.status, Status::DataFormat);
        assert_eq!(engine.counters().parsers_live(), 0);
    }

    #[test]
    fn test_garbage_payload_fails_creation() {
        let engine = MockEngine::new(MockEngineConfig::default());
        let context = engine.new_context().unwrap();
        let descriptor = engine.descriptors()[0].clone();
        let decoder = RecordDecoder::new(&engine, &context, &descriptor);

        let err = decoder
            .decode(
                3,
                RawDive {
                    data: b"\x00\x01garbage",
                    fingerprint: &[0xAB],
                },
            )
            .unwrap_err();
        assert_eq!(err.stage, DecodeStage::Create);
        assert_eq!(err.status, Status::DataFormat);
    }

    #[test]
    fn test_time_weighted_average() {
        let profile: Vec<ProfilePoint> = [(0, 0.0), (10, 10.0), (20, 10.0), (30, 0.0)]
            .into_iter()
            .map(|(t, d)| ProfilePoint {
                depth_m: d,
                ..point_at(t)
            })
            .collect();
        let avg = time_weighted_depth(&profile).unwrap();
        assert!((avg - 20.0 / 3.0).abs() < 1e-9);
        assert_eq!(time_weighted_depth(&profile[..1]), None);
    }

    struct HugeCounts;

    impl Parser for HugeCounts {
        fn datetime(&self) -> Result<crate::engine::DiveDateTime, Status> {
            Err(Status::Unsupported)
        }

        fn field(&self, field: FieldType) -> Result<FieldValue, Status> {
            match field {
                FieldType::GasMixCount | FieldType::TankCount => Ok(FieldValue::Count(u32::MAX)),
                _ => Err(Status::Unsupported),
            }
        }

        fn samples(&mut self, _callback: &mut dyn FnMut(Sample)) -> Result<(), Status> {
            Err(Status::Unsupported)
        }
    }

    #[test]
    fn test_bogus_gas_mix_count_is_data_format() {
        let err = project(&mut HugeCounts, 1, &Fingerprint::new(vec![0x01])).unwrap_err();
        assert_eq!(err, (DecodeStage::Field, Status::DataFormat));
    }
}
