//! End-to-end protocol runs against the recording mock deck.

use async_trait::async_trait;
use parking_lot::Mutex;
use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;

use polartron::config::ProtocolConfig;
use polartron::hardware::mock::{CallKind, HardwareEvent, MockDeck};
use polartron::hardware::{Deck, FlowRates, LiquidHandler};
use polartron::labware::ChannelClass;
use polartron::narration::{AlertCue, AlertSink, NullAlertSink};
use polartron::pool::{TipRole, TipState};
use polartron::{ChoreoError, Choreographer, ProtocolStage};

fn setup(mock: &Arc<MockDeck>, config: ProtocolConfig) -> Choreographer {
    Choreographer::new(Deck::from_single(mock.clone()), config, Some("test".to_string()))
        .unwrap()
        .with_alert_sink(Arc::new(NullAlertSink))
}

/// Remembers every cue instead of playing it.
#[derive(Default)]
struct RecordingSink {
    played: Mutex<Vec<AlertCue>>,
}

#[async_trait]
impl AlertSink for RecordingSink {
    async fn play(&self, cue: AlertCue) {
        self.played.lock().push(cue);
    }
}

fn comments(mock: &MockDeck) -> Vec<String> {
    mock.events_of(CallKind::Comment)
        .into_iter()
        .filter_map(|event| match event {
            HardwareEvent::Comment(text) => Some(text),
            _ => None,
        })
        .collect()
}

#[tokio::test]
async fn test_full_run_four_lanes() {
    let mock = Arc::new(MockDeck::new());
    let mut choreo = setup(&mock, ProtocolConfig::default());

    let summary = choreo.run().await.unwrap();
    assert_eq!(summary.completed_stages, ProtocolStage::ALL.to_vec());
    assert_eq!(summary.lanes.len(), 4);
    assert_eq!(summary.experiment.as_deref(), Some("test"));

    // Every stage narrated before and after, in order
    let log = comments(&mock);
    let mut cursor = 0;
    for stage in ProtocolStage::ALL {
        for marker in [format!("{} started.", stage.title()), format!("{} complete.", stage.title())] {
            let offset = log[cursor..]
                .iter()
                .position(|line| *line == marker)
                .unwrap_or_else(|| panic!("missing narration '{}'", marker));
            cursor += offset + 1;
        }
    }
}

#[tokio::test]
async fn test_no_tip_shared_across_lanes() {
    let mock = Arc::new(MockDeck::new());
    let mut choreo = setup(&mock, ProtocolConfig::default());
    let summary = choreo.run().await.unwrap();

    let mut seen = HashSet::new();
    for lane in &summary.lanes {
        let mut roles = 0;
        for (_, tip) in lane.tips() {
            assert!(seen.insert(tip.slot.clone()), "tip {} bound twice", tip);
            roles += 1;
        }
        assert_eq!(roles, TipRole::HIGH_VOLUME.len() + TipRole::LOW_VOLUME.len());
    }
    assert_eq!(seen.len(), 60);

    // Supernatant tips are discarded, never returned for reuse
    for lane in choreo.pool().lanes() {
        for role in [
            TipRole::ViralBuffer1,
            TipRole::ViralBuffer2,
            TipRole::MagbeadBuffer1,
            TipRole::MagbeadBuffer2,
            TipRole::Ethanol1,
            TipRole::Ethanol2,
        ] {
            let tip = lane.tip(role).unwrap();
            assert_eq!(choreo.pool().tip_state(tip).unwrap(), TipState::Consumed);
        }
    }
    assert!(choreo.pool().current_tip(ChannelClass::HighVolume).is_none());
    assert!(choreo.pool().current_tip(ChannelClass::LowVolume).is_none());
    assert!(!mock.has_tip(ChannelClass::HighVolume));
    assert!(!mock.has_tip(ChannelClass::LowVolume));
}

#[tokio::test]
async fn test_magnet_strictly_alternates() {
    let mock = Arc::new(MockDeck::new());
    let mut choreo = setup(&mock, ProtocolConfig::default());
    choreo.run().await.unwrap();

    let magnet: Vec<CallKind> = mock
        .events()
        .iter()
        .map(HardwareEvent::kind)
        .filter(|kind| matches!(kind, CallKind::MagnetEngage | CallKind::MagnetDisengage))
        .collect();
    assert_eq!(magnet.first(), Some(&CallKind::MagnetEngage));
    for pair in magnet.windows(2) {
        assert_ne!(pair[0], pair[1], "magnet sequence {:?}", magnet);
    }
    // Precool, binding, four washes, elution
    assert_eq!(magnet.iter().filter(|k| **k == CallKind::MagnetEngage).count(), 7);
    assert!(!mock.magnet_engaged());
}

#[tokio::test]
async fn test_settle_times_and_thermal_program() {
    let mock = Arc::new(MockDeck::new());
    let mut choreo = setup(&mock, ProtocolConfig::default());
    choreo.run().await.unwrap();

    let delays: Vec<Duration> = mock
        .events_of(CallKind::Delay)
        .into_iter()
        .filter_map(|event| match event {
            HardwareEvent::Delay(d) => Some(d),
            _ => None,
        })
        .collect();
    let count = |secs: u64| delays.iter().filter(|d| **d == Duration::from_secs(secs)).count();
    // Binding settle
    assert_eq!(count(12 * 60), 1);
    // Two detergent settles plus bead drying
    assert_eq!(count(5 * 60), 3);
    // Two ethanol settles plus elution
    assert_eq!(count(3 * 60), 3);
    // Proteinase K and bead binding incubations
    assert_eq!(count(10 * 60), 2);

    let holds: Vec<(f64, Option<Duration>)> = mock
        .events_of(CallKind::BlockTemperature)
        .into_iter()
        .filter_map(|event| match event {
            HardwareEvent::BlockTemperature { celsius, hold, .. } => Some((celsius, hold)),
            _ => None,
        })
        .collect();
    assert_eq!(
        holds,
        vec![
            (4.0, None),
            (25.0, Some(Duration::from_secs(180))),
            (55.0, Some(Duration::from_secs(900))),
            (95.0, Some(Duration::from_secs(120))),
            (4.0, None),
        ]
    );

    let profiles = mock.events_of(CallKind::Profile);
    assert_eq!(profiles.len(), 1);
    match &profiles[0] {
        HardwareEvent::Profile {
            steps,
            repetitions,
            max_volume_ul,
        } => {
            assert_eq!(*repetitions, 30);
            assert_eq!(steps.len(), 2);
            assert_eq!(steps[1].temperature_c, 63.0);
            assert_eq!(*max_volume_ul, Some(50.0));
        }
        other => panic!("unexpected event {:?}", other),
    }
    assert_eq!(
        mock.events_of(CallKind::LidTemperature),
        vec![HardwareEvent::LidTemperature(105.0)]
    );
    assert!(!mock.lid_open());
}

#[tokio::test]
async fn test_flow_rates_restored_after_run() {
    let mock = Arc::new(MockDeck::new());
    let mut choreo = setup(&mock, ProtocolConfig::default());
    choreo.run().await.unwrap();

    assert_eq!(mock.flow_rates(ChannelClass::HighVolume), FlowRates::uniform(92.86));
    assert_eq!(mock.flow_rates(ChannelClass::LowVolume), FlowRates::uniform(7.56));

    // Premixes and slow blow-outs override the blow-out rate; each is undone
    let overrides = mock.events_of(CallKind::SetBlowOutRate);
    assert!(!overrides.is_empty());
    for pair in overrides.chunks(2) {
        assert!(matches!(pair[0], HardwareEvent::SetBlowOutRate { rate: Some(_), .. }));
        assert!(matches!(pair[1], HardwareEvent::SetBlowOutRate { rate: None, .. }));
    }
    assert_eq!(mock.blow_out_rate(ChannelClass::HighVolume), None);
    assert_eq!(mock.blow_out_rate(ChannelClass::LowVolume), None);
}

#[tokio::test]
async fn test_hardware_fault_stops_run() {
    let mock = Arc::new(MockDeck::new());
    // Precool and binding engage; the first detergent wash fails
    mock.fail_after(CallKind::MagnetEngage, 2);
    let sink = Arc::new(RecordingSink::default());
    let mut choreo = setup(&mock, ProtocolConfig::default()).with_alert_sink(sink.clone());

    let err = choreo.run().await.unwrap_err();
    // Load prompt, then the failure cue
    assert_eq!(*sink.played.lock(), vec![AlertCue::Alert, AlertCue::Stop]);
    assert!(matches!(err, ChoreoError::HardwareFault(_)), "got {:?}", err);
    assert_eq!(choreo.completed_stages(), &ProtocolStage::ALL[..5]);
    assert_eq!(mock.flow_rates(ChannelClass::HighVolume), FlowRates::uniform(92.86));
    assert!(mock.events_of(CallKind::Profile).is_empty());
    assert!(!comments(&mock).contains(&"MagBead buffer washes complete.".to_string()));
}

#[tokio::test]
async fn test_too_many_lanes_fails_before_motion() {
    let mock = Arc::new(MockDeck::new());
    let mut config = ProtocolConfig::default();
    config.samples.count = 5;

    let result = Choreographer::new(Deck::from_single(mock.clone()), config, None);
    match result {
        Err(ChoreoError::ResourceExhausted {
            requested,
            available,
            ..
        }) => {
            assert_eq!(requested, 15);
            assert_eq!(available, 12);
        }
        Err(other) => panic!("unexpected error {:?}", other),
        Ok(_) => panic!("five lanes should not fit the deck"),
    }
    assert!(mock.events().is_empty());
}

#[tokio::test]
async fn test_run_log_written_on_hardware() {
    let dir = tempfile::tempdir().unwrap();
    let mock = Arc::new(MockDeck::new().hardware_mode());
    let mut config = ProtocolConfig::default();
    config.samples.count = 1;
    config.application.run_log_dir = Some(dir.path().to_path_buf());
    let mut choreo = setup(&mock, config);

    let summary = choreo.run().await.unwrap();
    let path = dir
        .path()
        .join(format!("test_run_log__{}.txt", summary.run_id));
    let text = std::fs::read_to_string(path).unwrap();

    assert_eq!(text.lines().count(), comments(&mock).len());
    assert!(text.lines().last().unwrap().ends_with(" > RT-PCR complete."));
    assert!(text.contains(" > Place sample plate onto magnetic module"));
}

#[tokio::test]
async fn test_summary_serializes() {
    let mock = Arc::new(MockDeck::new());
    let mut config = ProtocolConfig::default();
    config.samples.count = 2;
    let mut choreo = setup(&mock, config);

    let summary = choreo.run().await.unwrap();
    let json = serde_json::to_value(&summary).unwrap();
    assert_eq!(json["completed_stages"][0], "module_precool");
    assert_eq!(json["lanes"].as_array().unwrap().len(), 2);
    assert!(json["lanes"][0]["wells"]["extraction"]["fill_ul"].is_number());
    assert_eq!(json["run_id"], summary.run_id.to_string());
}
