use std::sync::LazyLock;
use std::time::{Duration, SystemTime};

use regex::Regex;

static DURATION_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"Duration: (\d{2}):(\d{2}):(\d{2}\.\d{2})").unwrap());
static TIME_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"time=(\d{2}):(\d{2}):(\d{2}\.\d{2})").unwrap());
static SPEED_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"speed=\s*(\d+\.?\d*)x").unwrap());

/// Per-job accumulator for the engine's diagnostic stream. Reset (replaced)
/// at the start of each job; never persisted.
#[derive(Clone, Debug, Default)]
pub struct ProgressState {
    pub total_duration_seconds: Option<f64>,
    pub current_position_seconds: Option<f64>,
    pub speed_multiplier: Option<f64>,
}

/// Display emphasis for a diagnostic line. Presentation-only; carries no
/// control-flow consequence.
#[derive(Clone, Copy, Debug, PartialEq)]
pub enum LineCategory {
    Progress,
    Error,
    Warning,
    Plain,
}

/// Numeric progress extracted from a single `frame=...` line. Fields are
/// optional because the engine's duration and speed reports are independent
/// and either may be missing.
#[derive(Clone, Debug, PartialEq)]
pub struct ProgressSnapshot {
    pub position_seconds: f64,
    pub percent: Option<f64>,
    pub speed: Option<f64>,
    pub remaining_seconds: Option<f64>,
}

impl ProgressSnapshot {
    /// Estimated wall-clock completion time, when a remaining estimate exists.
    pub fn eta(&self) -> Option<SystemTime> {
        self.remaining_seconds
            .map(|secs| SystemTime::now() + Duration::from_secs_f64(secs))
    }
}

/// What the presentation layer should do with one observed line.
#[derive(Clone, Debug, PartialEq)]
pub struct DisplayUpdate {
    pub category: LineCategory,
    pub snapshot: Option<ProgressSnapshot>,
}

impl ProgressState {
    /// Interpret one diagnostic line from the engine. Malformed or truncated
    /// lines never fail; they fall through to a plain passthrough update.
    pub fn observe_line(&mut self, line: &str) -> DisplayUpdate {
        if let Some(position) = parse_progress_position(line) {
            self.current_position_seconds = Some(position);
            self.speed_multiplier = parse_speed(line).or(self.speed_multiplier);
            return DisplayUpdate {
                category: LineCategory::Progress,
                snapshot: Some(self.snapshot(position, parse_speed(line))),
            };
        }

        // The engine reports the total duration once, near the start of a
        // job; a value already recorded wins over any later match.
        if self.total_duration_seconds.is_none() {
            if let Some(total) = parse_duration(line) {
                self.total_duration_seconds = Some(total);
            }
        }

        DisplayUpdate {
            category: classify_line(line),
            snapshot: None,
        }
    }

    fn snapshot(&self, position: f64, speed: Option<f64>) -> ProgressSnapshot {
        let percent = match self.total_duration_seconds {
            Some(total) if total > 0.0 => Some((100.0 * position / total).clamp(0.0, 100.0)),
            _ => None,
        };
        let remaining_seconds = match (self.total_duration_seconds, speed) {
            (Some(total), Some(speed)) if total > 0.0 && speed > 0.0 => {
                Some(f64::max(0.0, total - position) / speed)
            },
            _ => None,
        };
        ProgressSnapshot {
            position_seconds: position,
            percent,
            speed,
            remaining_seconds,
        }
    }
}

/// Total duration from a `Duration: HH:MM:SS.ff` line.
pub fn parse_duration(line: &str) -> Option<f64> {
    DURATION_RE.captures(line).and_then(|caps| timecode_seconds(&caps))
}

/// Current position from a progress line. Requires both the `frame=` marker
/// and a `time=HH:MM:SS.ff` timecode, as the engine emits them together.
fn parse_progress_position(line: &str) -> Option<f64> {
    if !line.contains("frame=") {
        return None;
    }
    TIME_RE.captures(line).and_then(|caps| timecode_seconds(&caps))
}

fn parse_speed(line: &str) -> Option<f64> {
    SPEED_RE
        .captures(line)
        .and_then(|caps| caps.get(1))
        .and_then(|m| m.as_str().parse().ok())
}

fn timecode_seconds(caps: &regex::Captures) -> Option<f64> {
    let hours: f64 = caps.get(1)?.as_str().parse().ok()?;
    let minutes: f64 = caps.get(2)?.as_str().parse().ok()?;
    let seconds: f64 = caps.get(3)?.as_str().parse().ok()?;
    Some(hours * 3600.0 + minutes * 60.0 + seconds)
}

/// Classify a line for display emphasis, in precedence order: progress,
/// error, warning, plain.
pub fn classify_line(line: &str) -> LineCategory {
    if line.contains("frame=") && TIME_RE.is_match(line) {
        return LineCategory::Progress;
    }
    let lowered = line.to_lowercase();
    if lowered.contains("error") || lowered.contains("failed") {
        LineCategory::Error
    } else if lowered.contains("warning") {
        LineCategory::Warning
    } else {
        LineCategory::Plain
    }
}
