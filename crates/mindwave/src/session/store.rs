//! Persistence for finished sessions: the [`SampleStore`] contract and the
//! stores shipped with the crate.

use std::fmt;
use std::fs::{self, File};
use std::io::{self, BufWriter, Write};
use std::path::{Path, PathBuf};

use chrono::{DateTime, SecondsFormat, Utc};

use super::config::{PhaseDurations, SessionConfig, TrialOrder};
use super::recording::{Recording, SampleRow};
use super::SessionEvent;
use crate::error::MindwaveResult;

/// Destination for saved sessions.
pub trait SampleStore {
    /// Persist `rows`, returning how many were written.
    ///
    /// # Errors
    /// Implementations report I/O failures as
    /// [`MindwaveError::Io`](crate::MindwaveError::Io).
    fn append(&mut self, rows: &[SampleRow]) -> MindwaveResult<usize>;

    /// Persist the session event log. Stores that only keep samples can
    /// rely on the default, which ignores it.
    ///
    /// # Errors
    /// Same as [`append`](Self::append).
    fn append_events(&mut self, events: &[SessionEvent]) -> MindwaveResult<()> {
        let _ = events;
        Ok(())
    }

    /// Persist who was recorded and how the session was set up. Ignored by
    /// default.
    ///
    /// # Errors
    /// Same as [`append`](Self::append).
    fn write_info(&mut self, info: &SessionInfo) -> MindwaveResult<()> {
        let _ = info;
        Ok(())
    }
}

// ─── Session info ───────────────────────────────────────────────────────

/// Subject and setup of a saved session.
///
/// The `Display` form is the `session.info` file written by
/// [`SessionDir`]: three `=`-ruled sections of `key: value` lines.
#[derive(Debug, Clone, PartialEq)]
pub struct SessionInfo {
    pub user_name: String,
    pub user_age: Option<u32>,
    pub user_gender: Option<String>,
    pub classes: Vec<String>,
    pub n_trials: u32,
    pub trial_order: TrialOrder,
    pub capture_blinks: bool,
    pub durations: PhaseDurations,
    pub seed: u64,
    pub started_at: DateTime<Utc>,
    pub ended_at: DateTime<Utc>,
    pub aborted: bool,
    pub samples: usize,
    pub events: usize,
}

impl SessionInfo {
    pub fn new(config: &SessionConfig, recording: &Recording) -> Self {
        Self {
            user_name: config.user_name().to_string(),
            user_age: config.user_age(),
            user_gender: config.user_gender().map(str::to_string),
            classes: config.classes().to_vec(),
            n_trials: config.n_trials(),
            trial_order: config.trial_order(),
            capture_blinks: config.capture_blinks(),
            durations: *config.durations(),
            seed: recording.seed,
            started_at: recording.started_at,
            ended_at: recording.ended_at,
            aborted: recording.aborted,
            samples: recording.samples.len(),
            events: recording.events.len(),
        }
    }
}

impl fmt::Display for SessionInfo {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fn or_unknown<T: fmt::Display>(value: Option<T>) -> String {
            value.map_or_else(|| "unknown".to_string(), |v| v.to_string())
        }

        writeln!(f, "{:=^40}", " User info ")?;
        writeln!(f, "user_name: {}", self.user_name)?;
        writeln!(f, "user_age: {}", or_unknown(self.user_age))?;
        writeln!(f, "user_gender: {}", or_unknown(self.user_gender.as_deref()))?;
        writeln!(f)?;

        writeln!(f, "{:=^40}", " Session info ")?;
        writeln!(f, "classes: {}", self.classes.join(", "))?;
        writeln!(f, "n_trials: {}", self.n_trials)?;
        writeln!(f, "trial_order: {}", self.trial_order)?;
        writeln!(f, "capture_blinks: {}", self.capture_blinks)?;
        writeln!(f, "seed: {}", self.seed)?;
        writeln!(f, "started_at: {}", stamp(&self.started_at))?;
        writeln!(f, "ended_at: {}", stamp(&self.ended_at))?;
        writeln!(f, "aborted: {}", self.aborted)?;
        writeln!(f, "samples: {}", self.samples)?;
        writeln!(f, "events: {}", self.events)?;
        writeln!(f)?;

        let d = &self.durations;
        writeln!(f, "{:=^40}", " Durations info ")?;
        for (name, value) in [
            ("transition", d.transition),
            ("rest", d.rest),
            ("ready", d.ready),
            ("cue", d.cue),
            ("motor", d.motor),
            ("motor_jitter", d.motor_jitter),
        ] {
            writeln!(f, "{name}_ms: {}", value.as_millis())?;
        }
        Ok(())
    }
}

// ─── Memory ─────────────────────────────────────────────────────────────

/// In-memory store, mostly for tests and embedding.
#[derive(Debug, Clone, Default)]
pub struct MemoryStore {
    pub rows: Vec<SampleRow>,
    pub events: Vec<SessionEvent>,
    pub info: Option<SessionInfo>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }
}

impl SampleStore for MemoryStore {
    fn append(&mut self, rows: &[SampleRow]) -> MindwaveResult<usize> {
        self.rows.extend_from_slice(rows);
        Ok(rows.len())
    }

    fn append_events(&mut self, events: &[SessionEvent]) -> MindwaveResult<()> {
        self.events.extend_from_slice(events);
        Ok(())
    }

    fn write_info(&mut self, info: &SessionInfo) -> MindwaveResult<()> {
        self.info = Some(info.clone());
        Ok(())
    }
}

// ─── CSV ────────────────────────────────────────────────────────────────

/// Column names written by [`CsvStore`].
pub const CSV_HEADER: [&str; 17] = [
    "trial_index",
    "class_label",
    "phase",
    "attention",
    "meditation",
    "blink_strength",
    "raw_sample",
    "signal_quality",
    "timestamp",
    "delta",
    "theta",
    "low_alpha",
    "high_alpha",
    "low_beta",
    "high_beta",
    "low_gamma",
    "high_gamma",
];

/// Column names of the `events.csv` file written by [`SessionDir`].
pub const EVENTS_CSV_HEADER: [&str; 5] =
    ["timestamp", "signal", "trial_index", "class_label", "aborted"];

/// RFC 4180 writer shared by the CSV stores. The header goes out with
/// the first batch, even an empty one.
#[derive(Debug)]
struct CsvWriter<W: Write> {
    writer: W,
    header: &'static [&'static str],
    header_written: bool,
}

impl<W: Write> CsvWriter<W> {
    fn new(writer: W, header: &'static [&'static str]) -> Self {
        Self {
            writer,
            header,
            header_written: false,
        }
    }

    fn write_batch<I, R, S>(&mut self, records: I) -> io::Result<()>
    where
        I: IntoIterator<Item = R>,
        R: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        if !self.header_written {
            write_record(&mut self.writer, self.header)?;
            self.header_written = true;
        }
        for record in records {
            write_record(&mut self.writer, record)?;
        }
        self.writer.flush()
    }
}

fn write_record<W, I, S>(writer: &mut W, fields: I) -> io::Result<()>
where
    W: Write,
    I: IntoIterator<Item = S>,
    S: AsRef<str>,
{
    let line = fields
        .into_iter()
        .map(|f| escape(f.as_ref()))
        .collect::<Vec<_>>()
        .join(",");
    writer.write_all(line.as_bytes())?;
    writer.write_all(b"\r\n")
}

/// Appends samples as CSV, writing the header before the first row.
///
/// Fields containing a comma, quote or line break are quoted, with
/// embedded quotes doubled. Missing values are empty fields. Only samples
/// go to this store; use [`SessionDir`] to keep the event log and session
/// info alongside them.
#[derive(Debug)]
pub struct CsvStore<W: Write> {
    inner: CsvWriter<W>,
}

impl<W: Write> CsvStore<W> {
    pub fn new(writer: W) -> Self {
        Self {
            inner: CsvWriter::new(writer, &CSV_HEADER),
        }
    }

    /// Give back the writer, flushed.
    ///
    /// # Errors
    /// Returns [`MindwaveError::Io`](crate::MindwaveError::Io) if the flush
    /// fails.
    pub fn into_inner(mut self) -> MindwaveResult<W> {
        self.inner.writer.flush()?;
        Ok(self.inner.writer)
    }
}

impl CsvStore<BufWriter<File>> {
    /// Create (or truncate) a CSV file at `path`.
    ///
    /// # Errors
    /// Returns [`MindwaveError::Io`](crate::MindwaveError::Io) if the file
    /// cannot be created.
    pub fn create(path: impl AsRef<Path>) -> MindwaveResult<Self> {
        let file = File::create(path)?;
        Ok(Self::new(BufWriter::new(file)))
    }
}

impl<W: Write> SampleStore for CsvStore<W> {
    fn append(&mut self, rows: &[SampleRow]) -> MindwaveResult<usize> {
        self.inner.write_batch(rows.iter().map(sample_fields))?;
        Ok(rows.len())
    }
}

fn opt<T: ToString>(value: Option<T>) -> String {
    value.map(|v| v.to_string()).unwrap_or_default()
}

fn stamp(timestamp: &DateTime<Utc>) -> String {
    timestamp.to_rfc3339_opts(SecondsFormat::Millis, true)
}

fn sample_fields(row: &SampleRow) -> Vec<String> {
    let mut fields = vec![
        opt(row.trial_index),
        row.class_label.clone().unwrap_or_default(),
        opt(row.phase),
        opt(row.attention),
        opt(row.meditation),
        opt(row.blink_strength),
        opt(row.raw_sample),
        row.signal_quality.to_string(),
        stamp(&row.timestamp),
    ];
    match row.band_powers {
        Some(b) => fields.extend(
            [
                b.delta,
                b.theta,
                b.low_alpha,
                b.high_alpha,
                b.low_beta,
                b.high_beta,
                b.low_gamma,
                b.high_gamma,
            ]
            .map(|v| v.to_string()),
        ),
        None => fields.resize(CSV_HEADER.len(), String::new()),
    }
    fields
}

fn event_fields(event: &SessionEvent) -> [String; 5] {
    [
        stamp(&event.timestamp),
        event.signal.to_string(),
        opt(event.trial.as_ref().map(|t| t.index)),
        event
            .trial
            .as_ref()
            .map(|t| t.class_label.clone())
            .unwrap_or_default(),
        event.aborted.to_string(),
    ]
}

fn escape(field: &str) -> String {
    if field.contains([',', '"', '\r', '\n']) {
        format!("\"{}\"", field.replace('"', "\"\""))
    } else {
        field.to_string()
    }
}

// ─── Session directory ──────────────────────────────────────────────────

/// One directory per saved session, holding `data.csv`, `events.csv` and
/// `session.info`.
#[derive(Debug)]
pub struct SessionDir {
    path: PathBuf,
    data: CsvStore<BufWriter<File>>,
    events: CsvWriter<BufWriter<File>>,
}

impl SessionDir {
    pub const DATA_FILE: &'static str = "data.csv";
    pub const EVENTS_FILE: &'static str = "events.csv";
    pub const INFO_FILE: &'static str = "session.info";

    /// Create the next free `<base>/<user_name>_NN` directory, counting up
    /// from `00`. `base` is created if missing. Path separators in
    /// `user_name` become `_`.
    ///
    /// # Errors
    /// Returns [`MindwaveError::Io`](crate::MindwaveError::Io) if a
    /// directory or file cannot be created.
    pub fn create_for_user(base: impl AsRef<Path>, user_name: &str) -> MindwaveResult<Self> {
        let base = base.as_ref();
        fs::create_dir_all(base)?;
        let stem = user_name.replace(['/', '\\'], "_");
        for n in 0u32.. {
            let path = base.join(format!("{stem}_{n:02}"));
            match fs::create_dir(&path) {
                Ok(()) => return Self::in_dir(path),
                Err(e) if e.kind() == io::ErrorKind::AlreadyExists => {}
                Err(e) => return Err(e.into()),
            }
        }
        Err(io::Error::new(io::ErrorKind::AlreadyExists, "no free session directory").into())
    }

    /// Use `path` as the session directory, creating it if needed.
    /// Existing files in it are truncated.
    ///
    /// # Errors
    /// Returns [`MindwaveError::Io`](crate::MindwaveError::Io) if the
    /// directory or its files cannot be created.
    pub fn open(path: impl Into<PathBuf>) -> MindwaveResult<Self> {
        let path = path.into();
        fs::create_dir_all(&path)?;
        Self::in_dir(path)
    }

    fn in_dir(path: PathBuf) -> MindwaveResult<Self> {
        let data = CsvStore::create(path.join(Self::DATA_FILE))?;
        let events = File::create(path.join(Self::EVENTS_FILE))?;
        tracing::debug!(path = %path.display(), "Session directory ready");
        Ok(Self {
            path,
            data,
            events: CsvWriter::new(BufWriter::new(events), &EVENTS_CSV_HEADER),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl SampleStore for SessionDir {
    fn append(&mut self, rows: &[SampleRow]) -> MindwaveResult<usize> {
        self.data.append(rows)
    }

    fn append_events(&mut self, events: &[SessionEvent]) -> MindwaveResult<()> {
        self.events.write_batch(events.iter().map(event_fields))?;
        Ok(())
    }

    fn write_info(&mut self, info: &SessionInfo) -> MindwaveResult<()> {
        fs::write(self.path.join(Self::INFO_FILE), info.to_string())?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::headset::{BandPowers, Reading};
    use crate::session::{RecordedSample, SessionSignal, Trial, TrialPhase, TrialTag};
    use chrono::TimeZone;
    use std::time::Duration;

    fn at(secs: u32) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 5, 1, 12, 0, secs).unwrap()
    }

    fn sample(tag: Option<TrialTag>, attention: Option<u8>) -> RecordedSample {
        let mut reading = Reading::empty();
        reading.attention = attention;
        reading.timestamp = at(0);
        RecordedSample {
            reading,
            tag,
            signal_quality: 100.0,
        }
    }

    fn event(signal: SessionSignal, trial: Option<Trial>, aborted: bool, secs: u32) -> SessionEvent {
        SessionEvent {
            signal,
            trial,
            aborted,
            timestamp: at(secs),
        }
    }

    fn recording() -> Recording {
        let trial = Trial {
            index: 0,
            class_label: "left, hand".into(),
        };
        let mut recording = Recording::new(vec![trial.clone()], 5);
        recording.samples = vec![sample(
            Some(TrialTag {
                trial_index: 0,
                class_label: trial.class_label.clone(),
                phase: TrialPhase::Cue,
            }),
            Some(61),
        )];
        recording.events = vec![
            event(SessionSignal::SessionStart, None, false, 0),
            event(SessionSignal::Cue, Some(trial), false, 1),
            event(SessionSignal::SessionEnd, None, true, 2),
        ];
        recording.started_at = at(0);
        recording.ended_at = at(2);
        recording.aborted = true;
        recording
    }

    fn config() -> SessionConfig {
        SessionConfig::builder("ada")
            .user_age(31)
            .classes(["left, hand", "right"])
            .n_trials(1)
            .trial_order(TrialOrder::Sequential)
            .seed(5)
            .build()
            .unwrap()
    }

    fn lines(bytes: &[u8]) -> Vec<String> {
        String::from_utf8(bytes.to_vec())
            .unwrap()
            .split("\r\n")
            .filter(|l| !l.is_empty())
            .map(str::to_string)
            .collect()
    }

    #[test]
    fn test_csv_store_writes_header_once_and_quotes() {
        let mut with_bands = sample(
            Some(TrialTag {
                trial_index: 3,
                class_label: "left, \"hand\"".into(),
                phase: TrialPhase::Motor,
            }),
            Some(55),
        );
        with_bands.reading.band_powers = Some(BandPowers {
            delta: 1,
            theta: 2,
            low_alpha: 3,
            high_alpha: 4,
            low_beta: 5,
            high_beta: 6,
            low_gamma: 7,
            high_gamma: 8,
        });
        let rows = [
            SampleRow::from(&with_bands),
            SampleRow::from(&sample(None, None)),
        ];

        let mut store = CsvStore::new(Vec::new());
        assert_eq!(store.append(&rows[..1]).unwrap(), 1);
        assert_eq!(store.append(&rows[1..]).unwrap(), 1);
        let lines = lines(&store.into_inner().unwrap());

        assert_eq!(lines.len(), 3);
        assert_eq!(lines[0], CSV_HEADER.join(","));
        assert_eq!(
            lines[1],
            "3,\"left, \"\"hand\"\"\",motor,55,,,,100,2024-05-01T12:00:00.000Z,1,2,3,4,5,6,7,8"
        );
        assert_eq!(lines[2], ",,,,,,,100,2024-05-01T12:00:00.000Z,,,,,,,,");
    }

    #[test]
    fn test_csv_store_ignores_events_and_info() {
        let recording = recording();
        let mut store = CsvStore::new(Vec::new());
        store.append_events(&recording.events).unwrap();
        store
            .write_info(&SessionInfo::new(&config(), &recording))
            .unwrap();
        assert!(store.into_inner().unwrap().is_empty());
    }

    #[test]
    fn test_session_info_lists_user_setup_and_durations() {
        let info = SessionInfo::new(&config(), &recording());
        let text = info.to_string();
        let lines: Vec<&str> = text.lines().collect();

        assert_eq!(lines[0], format!("{:=^40}", " User info "));
        assert_eq!(lines[0].len(), 40);
        for expected in [
            "user_name: ada",
            "user_age: 31",
            "user_gender: unknown",
            "classes: left, hand, right",
            "n_trials: 1",
            "trial_order: sequential",
            "capture_blinks: false",
            "seed: 5",
            "started_at: 2024-05-01T12:00:00.000Z",
            "aborted: true",
            "samples: 1",
            "events: 3",
            "rest_ms: 2000",
            "cue_ms: 1500",
            "motor_jitter_ms: 0",
        ] {
            assert!(lines.contains(&expected), "missing {expected:?} in\n{text}");
        }
        let sections: Vec<&&str> = lines.iter().filter(|l| l.starts_with("==")).collect();
        assert_eq!(sections.len(), 3);
        assert!(sections[2].contains(" Durations info "));
    }

    #[test]
    fn test_session_info_reports_custom_durations() {
        let config = SessionConfig::builder("ada")
            .classes(["a"])
            .user_gender("f")
            .durations(PhaseDurations {
                motor_jitter: Duration::from_millis(250),
                ..PhaseDurations::default()
            })
            .build()
            .unwrap();
        let text = SessionInfo::new(&config, &recording()).to_string();
        assert!(text.contains("user_gender: f\n"));
        assert!(text.contains("motor_jitter_ms: 250\n"));
    }

    #[test]
    fn test_session_dir_writes_data_events_and_info() {
        let base = tempfile::tempdir().unwrap();
        let recording = recording();
        let info = SessionInfo::new(&config(), &recording);

        let mut dir = SessionDir::create_for_user(base.path(), "ada").unwrap();
        assert_eq!(dir.path(), base.path().join("ada_00"));
        assert_eq!(dir.append(&recording.rows()).unwrap(), 1);
        dir.append_events(&recording.events).unwrap();
        dir.write_info(&info).unwrap();

        let data = fs::read(dir.path().join(SessionDir::DATA_FILE)).unwrap();
        let data = lines(&data);
        assert_eq!(data.len(), 2);
        assert!(data[1].starts_with("0,\"left, hand\",cue,61,"));

        let events = fs::read(dir.path().join(SessionDir::EVENTS_FILE)).unwrap();
        assert_eq!(
            lines(&events),
            vec![
                EVENTS_CSV_HEADER.join(","),
                "2024-05-01T12:00:00.000Z,session_start,,,false".to_string(),
                "2024-05-01T12:00:01.000Z,cue,0,\"left, hand\",false".to_string(),
                "2024-05-01T12:00:02.000Z,session_end,,,true".to_string(),
            ]
        );

        let written = fs::read_to_string(dir.path().join(SessionDir::INFO_FILE)).unwrap();
        assert_eq!(written, info.to_string());
    }

    #[test]
    fn test_session_dir_picks_the_next_free_name() {
        let base = tempfile::tempdir().unwrap();
        let first = SessionDir::create_for_user(base.path(), "ada").unwrap();
        let second = SessionDir::create_for_user(base.path(), "ada").unwrap();
        let other = SessionDir::create_for_user(base.path(), "team/bob").unwrap();

        assert_eq!(first.path(), base.path().join("ada_00"));
        assert_eq!(second.path(), base.path().join("ada_01"));
        assert_eq!(other.path(), base.path().join("team_bob_00"));
        assert!(second.path().join(SessionDir::EVENTS_FILE).is_file());
    }

    #[test]
    fn test_session_dir_open_truncates_existing_files() {
        let base = tempfile::tempdir().unwrap();
        let path = base.path().join("fixed");
        fs::create_dir_all(&path).unwrap();
        fs::write(path.join(SessionDir::DATA_FILE), "stale").unwrap();

        let mut dir = SessionDir::open(&path).unwrap();
        dir.append(&[]).unwrap();
        let data = fs::read(path.join(SessionDir::DATA_FILE)).unwrap();
        assert_eq!(lines(&data), vec![CSV_HEADER.join(",")]);
    }

    #[test]
    fn test_memory_store_keeps_info() {
        let recording = recording();
        let mut store = MemoryStore::new();
        store
            .write_info(&SessionInfo::new(&config(), &recording))
            .unwrap();
        assert_eq!(store.info.map(|i| i.seed), Some(5));
    }
}
