//! Progress Event type and the decoder for the executable's stdout records.
//!
//! The executable writes one JSON object per line with a `type` discriminator.
//! Its fields are loosely typed (`" 45.3%"`, `"N/A"`, `"01:05"`), so lines are
//! first read into a permissive wire record and then normalized into the
//! closed [`ProgressEvent`] type.

use crate::error::DecodeError;
use serde::{Deserialize, Serialize, Serializer};
use serde_json::Value;
use ts_rs::TS;

/// A decoded record describing job progress or its end.
///
/// Serialized `complete` records also carry `"success": true`, matching the
/// executable's own record shape.
#[derive(Debug, Clone, PartialEq, Deserialize, TS)]
#[ts(export, export_to = "../../../bindings/")]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum ProgressEvent {
    /// Informational, repeatable.
    #[serde(rename_all = "camelCase")]
    Progress {
        /// Completion in percent, clamped to `[0, 100]`
        percentage: f64,
        /// Human-readable transfer rate as reported by the executable
        #[ts(optional)]
        #[serde(default, skip_serializing_if = "Option::is_none")]
        speed: Option<String>,
        /// Estimated seconds remaining
        #[ts(optional, type = "number")]
        #[serde(default, skip_serializing_if = "Option::is_none")]
        eta_seconds: Option<u64>,
        /// Free-form phase note, e.g. "Converting..."
        #[ts(optional)]
        #[serde(default, skip_serializing_if = "Option::is_none")]
        status: Option<String>,
    },

    /// Terminal: the artifact was produced at `filename`.
    Complete {
        /// Path of the produced artifact
        filename: String,
        /// Title of the source, when reported
        #[ts(optional)]
        #[serde(default, skip_serializing_if = "Option::is_none")]
        title: Option<String>,
    },

    /// Terminal: the job failed.
    Error {
        /// Diagnostic text
        message: String,
    },
}

impl ProgressEvent {
    /// Whether this event ends the job's event stream.
    pub fn is_terminal(&self) -> bool {
        !matches!(self, ProgressEvent::Progress { .. })
    }

    /// Serialize as a single structured-text line (no trailing newline).
    pub fn to_line(&self) -> String {
        // Serializing a plain enum of strings and numbers cannot fail.
        serde_json::to_string(self).unwrap_or_default()
    }
}

impl Serialize for ProgressEvent {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        let record = match self {
            ProgressEvent::Progress {
                percentage,
                speed,
                eta_seconds,
                status,
            } => OutgoingRecord::Progress {
                percentage: *percentage,
                speed: speed.as_deref(),
                eta_seconds: *eta_seconds,
                status: status.as_deref(),
            },
            ProgressEvent::Complete { filename, title } => OutgoingRecord::Complete {
                success: true,
                filename,
                title: title.as_deref(),
            },
            ProgressEvent::Error { message } => OutgoingRecord::Error { message },
        };
        record.serialize(serializer)
    }
}

#[derive(Serialize)]
#[serde(tag = "type", rename_all = "lowercase")]
enum OutgoingRecord<'a> {
    #[serde(rename_all = "camelCase")]
    Progress {
        percentage: f64,
        #[serde(skip_serializing_if = "Option::is_none")]
        speed: Option<&'a str>,
        #[serde(skip_serializing_if = "Option::is_none")]
        eta_seconds: Option<u64>,
        #[serde(skip_serializing_if = "Option::is_none")]
        status: Option<&'a str>,
    },
    Complete {
        success: bool,
        filename: &'a str,
        #[serde(skip_serializing_if = "Option::is_none")]
        title: Option<&'a str>,
    },
    Error {
        message: &'a str,
    },
}

#[derive(Debug, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
enum WireRecord {
    Progress {
        percentage: Option<Value>,
        speed: Option<Value>,
        eta: Option<Value>,
        status: Option<String>,
    },
    Complete {
        success: Option<bool>,
        filename: Option<String>,
        title: Option<String>,
        #[serde(alias = "message")]
        error: Option<String>,
    },
    Error {
        #[serde(alias = "message")]
        error: Option<String>,
    },
}

/// Decode one stdout line into a Progress Event.
///
/// # Errors
///
/// Returns a [`DecodeError`] for blank lines, lines that are not a known
/// record, and records whose required fields cannot be interpreted. Callers
/// are expected to log and discard these.
pub fn decode_line(line: &str) -> Result<ProgressEvent, DecodeError> {
    let line = line.trim();
    if line.is_empty() {
        return Err(DecodeError::Empty);
    }

    let record: WireRecord = serde_json::from_str(line)?;

    match record {
        WireRecord::Progress {
            percentage,
            speed,
            eta,
            status,
        } => {
            let percentage = parse_percentage(percentage.as_ref())?;
            Ok(ProgressEvent::Progress {
                percentage,
                speed: speed.as_ref().and_then(parse_speed),
                eta_seconds: eta.as_ref().and_then(parse_eta),
                status: status.filter(|s| !s.trim().is_empty()),
            })
        }
        WireRecord::Complete {
            success,
            filename,
            title,
            error,
        } => {
            // Only an affirmative completion counts as one
            if success == Some(false) {
                return Ok(ProgressEvent::Error {
                    message: error
                        .unwrap_or_else(|| "executable reported an unsuccessful completion".into()),
                });
            }

            let filename = filename
                .filter(|f| !f.trim().is_empty())
                .ok_or(DecodeError::InvalidField {
                    field: "filename",
                    value: "<missing>".into(),
                })?;

            Ok(ProgressEvent::Complete { filename, title })
        }
        WireRecord::Error { error } => Ok(ProgressEvent::Error {
            message: error.unwrap_or_else(|| "unknown error".into()),
        }),
    }
}

fn parse_percentage(value: Option<&Value>) -> Result<f64, DecodeError> {
    let invalid = |value: String| DecodeError::InvalidField {
        field: "percentage",
        value,
    };

    let parsed = match value {
        Some(Value::Number(n)) => n.as_f64(),
        Some(Value::String(s)) => {
            let cleaned = strip_ansi(s);
            cleaned.trim().trim_end_matches('%').trim().parse::<f64>().ok()
        }
        Some(other) => return Err(invalid(other.to_string())),
        None => return Err(invalid("<missing>".into())),
    };

    match parsed {
        Some(p) if p.is_finite() => Ok(p.clamp(0.0, 100.0)),
        _ => Err(invalid(value.map(Value::to_string).unwrap_or_default())),
    }
}

fn parse_speed(value: &Value) -> Option<String> {
    let text = match value {
        Value::String(s) => strip_ansi(s).trim().to_string(),
        Value::Number(n) => n.to_string(),
        _ => return None,
    };

    if text.is_empty() || is_unknown(&text) {
        None
    } else {
        Some(text)
    }
}

fn parse_eta(value: &Value) -> Option<u64> {
    match value {
        Value::Number(n) => n.as_u64(),
        Value::String(s) => {
            let text = strip_ansi(s);
            let text = text.trim();
            if text.is_empty() || is_unknown(text) {
                return None;
            }

            // SS, MM:SS or HH:MM:SS
            let parts: Vec<&str> = text.split(':').collect();
            if parts.len() > 3 {
                return None;
            }
            parts.iter().try_fold(0u64, |acc, part| {
                let v = part.trim().parse::<u64>().ok()?;
                acc.checked_mul(60)?.checked_add(v)
            })
        }
        _ => None,
    }
}

fn is_unknown(text: &str) -> bool {
    text.eq_ignore_ascii_case("n/a") || text.eq_ignore_ascii_case("unknown")
}

/// Remove terminal colour sequences (`ESC [ ... letter`) that some
/// downloaders embed in their formatted strings.
fn strip_ansi(s: &str) -> String {
    let mut out = String::with_capacity(s.len());
    let mut chars = s.chars();

    while let Some(c) = chars.next() {
        if c == '\u{1b}' {
            for next in chars.by_ref() {
                if next.is_ascii_alphabetic() {
                    break;
                }
            }
            continue;
        }
        out.push(c);
    }

    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_decode_progress_string_fields() {
        let event = decode_line(
            r#"{"type": "progress", "percentage": " 45.3%", "speed": "1.20MiB/s", "eta": "01:05"}"#,
        )
        .unwrap();

        assert_eq!(
            event,
            ProgressEvent::Progress {
                percentage: 45.3,
                speed: Some("1.20MiB/s".to_string()),
                eta_seconds: Some(65),
                status: None,
            }
        );
        assert!(!event.is_terminal());
    }

    #[test]
    fn test_decode_progress_unknown_values() {
        let event =
            decode_line(r#"{"type":"progress","percentage":"0%","speed":"N/A","eta":"N/A"}"#)
                .unwrap();

        assert_eq!(
            event,
            ProgressEvent::Progress {
                percentage: 0.0,
                speed: None,
                eta_seconds: None,
                status: None,
            }
        );
    }

    #[test]
    fn test_decode_progress_converting_status() {
        let event =
            decode_line(r#"{"type":"progress","percentage":"100%","status":"Converting..."}"#)
                .unwrap();

        match event {
            ProgressEvent::Progress {
                percentage, status, ..
            } => {
                assert_eq!(percentage, 100.0);
                assert_eq!(status.as_deref(), Some("Converting..."));
            }
            other => panic!("unexpected event: {other:?}"),
        }
    }

    #[test]
    fn test_decode_progress_numeric_and_clamped() {
        let event = decode_line(r#"{"type":"progress","percentage":130,"eta":12}"#).unwrap();
        match event {
            ProgressEvent::Progress {
                percentage,
                eta_seconds,
                ..
            } => {
                assert_eq!(percentage, 100.0);
                assert_eq!(eta_seconds, Some(12));
            }
            other => panic!("unexpected event: {other:?}"),
        }
    }

    #[test]
    fn test_decode_progress_with_ansi_colour() {
        let event =
            decode_line("{\"type\":\"progress\",\"percentage\":\"\\u001b[0;94m 12.5%\\u001b[0m\"}")
                .unwrap();
        assert!(matches!(event, ProgressEvent::Progress { percentage, .. } if percentage == 12.5));
    }

    #[test]
    fn test_decode_eta_hours() {
        assert_eq!(parse_eta(&Value::String("1:02:03".into())), Some(3723));
        assert_eq!(parse_eta(&Value::String("42".into())), Some(42));
        assert_eq!(parse_eta(&Value::String("a:b".into())), None);
        assert_eq!(parse_eta(&Value::String("1:2:3:4".into())), None);
    }

    #[test]
    fn test_decode_eta_overflow_is_dropped() {
        assert_eq!(parse_eta(&Value::String("18446744073709551615:59".into())), None);
        assert_eq!(parse_eta(&Value::String("307445734561825861:0:0".into())), None);

        let event = decode_line(
            r#"{"type":"progress","percentage":1,"eta":"18446744073709551615:59"}"#,
        )
        .unwrap();
        assert_eq!(
            event,
            ProgressEvent::Progress {
                percentage: 1.0,
                speed: None,
                eta_seconds: None,
                status: None,
            }
        );
    }

    #[test]
    fn test_decode_complete() {
        let event = decode_line(
            r#"{"type":"complete","success":true,"title":"Song","filename":"/tmp/v1.mp3"}"#,
        )
        .unwrap();

        assert_eq!(
            event,
            ProgressEvent::Complete {
                filename: "/tmp/v1.mp3".to_string(),
                title: Some("Song".to_string()),
            }
        );
        assert!(event.is_terminal());
    }

    #[test]
    fn test_decode_unsuccessful_complete_is_error() {
        let event = decode_line(r#"{"type":"complete","success":false,"error":"boom"}"#).unwrap();
        assert_eq!(
            event,
            ProgressEvent::Error {
                message: "boom".to_string()
            }
        );
    }

    #[test]
    fn test_decode_complete_without_filename() {
        let result = decode_line(r#"{"type":"complete","success":true}"#);
        assert!(matches!(
            result,
            Err(DecodeError::InvalidField {
                field: "filename",
                ..
            })
        ));
    }

    #[test]
    fn test_decode_error_record() {
        let event =
            decode_line(r#"{"type":"error","success":false,"error":"Video unavailable"}"#).unwrap();
        assert_eq!(
            event,
            ProgressEvent::Error {
                message: "Video unavailable".to_string()
            }
        );

        let event = decode_line(r#"{"type":"error","message":"alt key"}"#).unwrap();
        assert_eq!(
            event,
            ProgressEvent::Error {
                message: "alt key".to_string()
            }
        );
    }

    #[test]
    fn test_decode_rejects_noise() {
        assert!(matches!(decode_line(""), Err(DecodeError::Empty)));
        assert!(matches!(decode_line("   "), Err(DecodeError::Empty)));
        assert!(matches!(
            decode_line("[youtube] abc: Downloading webpage"),
            Err(DecodeError::Malformed(_))
        ));
        assert!(matches!(
            decode_line(r#"{"type":"heartbeat"}"#),
            Err(DecodeError::Malformed(_))
        ));
        assert!(matches!(
            decode_line(r#"{"type":"progress","percentage":"lots"}"#),
            Err(DecodeError::InvalidField { .. })
        ));
        assert!(matches!(
            decode_line(r#"{"type":"progress"}"#),
            Err(DecodeError::InvalidField { .. })
        ));
    }

    #[test]
    fn test_outgoing_line_shape() {
        let event = ProgressEvent::Progress {
            percentage: 55.0,
            speed: None,
            eta_seconds: Some(3),
            status: None,
        };
        let line = event.to_line();
        assert!(line.contains("\"type\":\"progress\""));
        assert!(line.contains("\"etaSeconds\":3"));
        assert!(!line.contains("speed"));

        let parsed: ProgressEvent = serde_json::from_str(&line).unwrap();
        assert_eq!(parsed, event);
    }

    #[test]
    fn test_outgoing_complete_carries_success() {
        let event = ProgressEvent::Complete {
            filename: "v1.mp3".to_string(),
            title: None,
        };
        let value: Value = serde_json::from_str(&event.to_line()).unwrap();
        assert_eq!(
            value,
            serde_json::json!({"type": "complete", "success": true, "filename": "v1.mp3"})
        );

        // Still readable by the executable-record decoder
        assert_eq!(decode_line(&event.to_line()).unwrap(), event);
    }
}
