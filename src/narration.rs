//! Run narration: log lines, alerts and operator pauses.
//!
//! Narration is a side channel. File and audio failures are logged at `warn`
//! and swallowed so they never abort a run; only the operator pause (a real
//! control-surface call) can fail.
//!
//! Every message goes to:
//! 1. `tracing` at `info`
//! 2. the robot's run log via [`RobotControl::comment`]
//! 3. when running on hardware with a log directory configured, the append-only
//!    file `{experiment_}run_log__{run_id}.txt`, one `yy_mm_dd_HH_MM_SS > message`
//!    line per call

use async_trait::async_trait;
use chrono::Local;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::fs::{self, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::error::AppResult;
use crate::hardware::RobotControl;

/// Identifier generated once per run and threaded through narration.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct RunId(Uuid);

impl RunId {
    /// Fresh random identifier.
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }

    /// Underlying UUID.
    pub fn as_uuid(&self) -> &Uuid {
        &self.0
    }
}

impl Default for RunId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for RunId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

// =============================================================================
// Alerts
// =============================================================================

/// Named audio cue.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AlertCue {
    /// Operator attention needed
    Alert,
    /// Run aborted
    Stop,
}

impl AlertCue {
    /// Sound file played for this cue.
    pub fn file_name(&self) -> &'static str {
        match self {
            AlertCue::Alert => "alert_sound_1.mp3",
            AlertCue::Stop => "alert_sound_2.mp3",
        }
    }
}

/// Plays audio cues. Implementations must not fail the run.
#[async_trait]
pub trait AlertSink: Send + Sync {
    async fn play(&self, cue: AlertCue);
}

/// Silent sink for tests and dry runs.
#[derive(Debug, Default, Clone, Copy)]
pub struct NullAlertSink;

#[async_trait]
impl AlertSink for NullAlertSink {
    async fn play(&self, cue: AlertCue) {
        debug!(cue = ?cue, "alert suppressed");
    }
}

/// Plays cues through `mpg123` from a sounds directory, on hardware only.
#[derive(Debug, Clone)]
pub struct CommandAlertSink {
    sounds_dir: PathBuf,
    simulating: bool,
}

impl CommandAlertSink {
    /// Sink reading sounds from `sounds_dir`; silent when `simulating`.
    pub fn new(sounds_dir: impl Into<PathBuf>, simulating: bool) -> Self {
        Self {
            sounds_dir: sounds_dir.into(),
            simulating,
        }
    }
}

#[async_trait]
impl AlertSink for CommandAlertSink {
    async fn play(&self, cue: AlertCue) {
        if self.simulating {
            return;
        }
        let path = self.sounds_dir.join(cue.file_name());
        match tokio::process::Command::new("mpg123").arg(&path).output().await {
            Ok(output) if !output.status.success() => {
                warn!(path = %path.display(), status = %output.status, "Alert playback failed");
            }
            Ok(_) => {}
            Err(e) => warn!(path = %path.display(), "Could not run mpg123: {}", e),
        }
    }
}

// =============================================================================
// Narrator
// =============================================================================

/// Writes run narration to the tracing log, the host run log and, on
/// hardware, a per-run file.
pub struct Narrator {
    run_id: RunId,
    experiment: Option<String>,
    robot: Arc<dyn RobotControl>,
    log_dir: Option<PathBuf>,
    alerts: Arc<dyn AlertSink>,
}

impl Narrator {
    /// Blank experiment names are dropped.
    pub fn new(
        run_id: RunId,
        experiment: Option<String>,
        robot: Arc<dyn RobotControl>,
        log_dir: Option<PathBuf>,
        alerts: Arc<dyn AlertSink>,
    ) -> Self {
        let experiment = experiment.filter(|name| !name.trim().is_empty());
        Self {
            run_id,
            experiment,
            robot,
            log_dir,
            alerts,
        }
    }

    /// Replace the alert sink.
    pub fn with_alert_sink(mut self, alerts: Arc<dyn AlertSink>) -> Self {
        self.alerts = alerts;
        self
    }

    /// Identifier of this run.
    pub fn run_id(&self) -> RunId {
        self.run_id
    }

    /// Experiment name, if one was given.
    pub fn experiment(&self) -> Option<&str> {
        self.experiment.as_deref()
    }

    /// Run-log file name for this run.
    pub fn log_file_name(&self) -> String {
        match &self.experiment {
            Some(name) => format!("{}_run_log__{}.txt", name, self.run_id),
            None => format!("run_log__{}.txt", self.run_id),
        }
    }

    /// Path of the persisted run log, if one is written for this run.
    pub fn log_path(&self) -> Option<PathBuf> {
        if self.robot.is_simulating() {
            return None;
        }
        self.log_dir.as_ref().map(|dir| dir.join(self.log_file_name()))
    }

    /// Record one line of narration.
    pub fn narrate(&self, message: &str) {
        info!(run_id = %self.run_id, "{}", message);
        self.robot.comment(message);
        if let Some(path) = self.log_path() {
            append_line(&path, message);
        }
    }

    /// Play `cue` without pausing.
    pub async fn alert(&self, cue: AlertCue) {
        self.alerts.play(cue).await;
    }

    /// Play `cue` and wait for operator acknowledgement.
    pub async fn pause(&self, message: &str, cue: AlertCue) -> AppResult<()> {
        self.narrate(message);
        self.alert(cue).await;
        self.robot.pause(message).await?;
        Ok(())
    }
}

fn append_line(path: &Path, message: &str) {
    if let Some(dir) = path.parent() {
        if let Err(e) = fs::create_dir_all(dir) {
            warn!(dir = %dir.display(), "Could not create run-log directory: {}", e);
            return;
        }
    }
    let stamp = Local::now().format("%y_%m_%d_%H_%M_%S");
    let result = OpenOptions::new()
        .create(true)
        .append(true)
        .open(path)
        .and_then(|mut file| writeln!(file, "{} > {}", stamp, message));
    if let Err(e) = result {
        warn!(path = %path.display(), "Could not write run log: {}", e);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::hardware::mock::{CallKind, HardwareEvent, MockDeck};
    use parking_lot::Mutex;
    use tracing_test::traced_test;

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

    fn narrator(mock: Arc<MockDeck>, dir: Option<PathBuf>, experiment: Option<&str>) -> Narrator {
        Narrator::new(
            RunId::new(),
            experiment.map(str::to_string),
            mock,
            dir,
            Arc::new(NullAlertSink),
        )
    }

    #[test]
    fn test_log_file_name() {
        let mock = Arc::new(MockDeck::new());
        let with = narrator(mock.clone(), None, Some("plate7"));
        assert_eq!(with.log_file_name(), format!("plate7_run_log__{}.txt", with.run_id()));
        let blank = narrator(mock, None, Some("  "));
        assert_eq!(blank.log_file_name(), format!("run_log__{}.txt", blank.run_id()));
    }

    #[test]
    fn test_run_ids_are_unique() {
        assert_ne!(RunId::new(), RunId::new());
    }

    #[traced_test]
    #[test]
    fn test_narrate_traces_and_comments() {
        let mock = Arc::new(MockDeck::new());
        let n = narrator(mock.clone(), None, None);
        n.narrate("Cooling block");
        assert!(logs_contain("Cooling block"));
        assert_eq!(
            mock.events(),
            vec![HardwareEvent::Comment("Cooling block".to_string())]
        );
    }

    #[test]
    fn test_no_log_file_when_simulating() {
        let dir = tempfile::tempdir().unwrap();
        let n = narrator(Arc::new(MockDeck::new()), Some(dir.path().to_path_buf()), None);
        n.narrate("dry run");
        assert!(n.log_path().is_none());
        assert_eq!(fs::read_dir(dir.path()).unwrap().count(), 0);
    }

    #[test]
    fn test_log_file_appends_on_hardware() {
        let dir = tempfile::tempdir().unwrap();
        let log_dir = dir.path().join("run_logs");
        let n = narrator(
            Arc::new(MockDeck::new().hardware_mode()),
            Some(log_dir.clone()),
            Some("exp"),
        );
        n.narrate("first");
        n.narrate("second");

        let text = fs::read_to_string(log_dir.join(n.log_file_name())).unwrap();
        let lines: Vec<&str> = text.lines().collect();
        assert_eq!(lines.len(), 2);
        assert!(lines[0].ends_with(" > first"));
        assert!(lines[1].ends_with(" > second"));
        // yy_mm_dd_HH_MM_SS
        assert_eq!(lines[0].split(" > ").next().unwrap().len(), 17);
    }

    #[traced_test]
    #[test]
    fn test_unwritable_log_dir_is_swallowed() {
        let dir = tempfile::tempdir().unwrap();
        let blocker = dir.path().join("not_a_dir");
        fs::write(&blocker, "x").unwrap();
        let n = narrator(
            Arc::new(MockDeck::new().hardware_mode()),
            Some(blocker.join("logs")),
            None,
        );
        n.narrate("still runs");
        assert!(logs_contain("Could not create run-log directory"));
    }

    #[tokio::test]
    async fn test_pause_alerts_then_pauses() {
        let mock = Arc::new(MockDeck::new());
        let sink = Arc::new(RecordingSink::default());
        let n = Narrator::new(RunId::new(), None, mock.clone(), None, sink.clone());
        n.pause("Load samples", AlertCue::Alert).await.unwrap();

        assert_eq!(*sink.played.lock(), vec![AlertCue::Alert]);
        assert_eq!(
            mock.events_of(CallKind::Pause),
            vec![HardwareEvent::Pause("Load samples".to_string())]
        );
    }

    #[tokio::test]
    async fn test_command_sink_silent_when_simulating() {
        // Would fail loudly if it tried to spawn a player for a missing file.
        CommandAlertSink::new("/nonexistent", true).play(AlertCue::Stop).await;
    }
}
