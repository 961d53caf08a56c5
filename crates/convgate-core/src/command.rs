//! Inbound command envelope.
//!
//! Every inbound frame is one JSON object with a `command` name, a `jobId`,
//! and command-specific string fields. The frame is parsed into a flat
//! string map; legacy snake_case key spellings are folded into their
//! canonical camelCase names through [`FIELD_ALIASES`].

use std::collections::BTreeMap;

use serde_json::Value;

use crate::errors::GatewayError;
use crate::ids::JobId;

pub const KEY_COMMAND: &str = "command";
pub const KEY_JOB_ID: &str = "jobId";
/// Source document (`.pln`) path.
pub const KEY_SOURCE_PATH: &str = "plnPath";
/// Compiled-format (`.ifc`) path.
pub const KEY_COMPILED_PATH: &str = "ifcPath";
pub const KEY_OUTPUT_PATH: &str = "outputPath";

/// Canonical key and the legacy alternate accepted for it.
/// The canonical key wins when both carry a non-empty value.
pub const FIELD_ALIASES: &[(&str, &str)] = &[
    (KEY_JOB_ID, "job_id"),
    (KEY_SOURCE_PATH, "pln_path"),
    (KEY_COMPILED_PATH, "ifc_path"),
    (KEY_OUTPUT_PATH, "output_path"),
];

/// Recognized command names.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum CommandKind {
    StartConversion,
    CancelJob,
    GetStatus,
    LoadIfc,
}

impl CommandKind {
    pub fn from_name(name: &str) -> Option<Self> {
        match name {
            "start_conversion" => Some(Self::StartConversion),
            "cancel_job" => Some(Self::CancelJob),
            "get_status" => Some(Self::GetStatus),
            "load_ifc" => Some(Self::LoadIfc),
            _ => None,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::StartConversion => "start_conversion",
            Self::CancelJob => "cancel_job",
            Self::GetStatus => "get_status",
            Self::LoadIfc => "load_ifc",
        }
    }
}

/// Conversion direction, inferred from which input path field is present.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum Direction {
    /// Source document to compiled format.
    PlnToIfc,
    /// Compiled format back to a source document.
    IfcToPln,
}

impl Direction {
    /// Envelope key holding the input path for this direction.
    pub fn input_key(&self) -> &'static str {
        match self {
            Self::PlnToIfc => KEY_SOURCE_PATH,
            Self::IfcToPln => KEY_COMPILED_PATH,
        }
    }
}

/// One decoded inbound frame.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct CommandEnvelope {
    pub command: String,
    pub job_id: JobId,
    pub payload: BTreeMap<String, String>,
}

impl CommandEnvelope {
    /// Decode a raw text frame.
    ///
    /// Fails with [`GatewayError::Protocol`] when the frame is not a JSON
    /// object or carries no non-empty `command`. A missing `jobId` is not an
    /// error; it decodes as the empty id.
    pub fn parse(raw: &str) -> Result<Self, GatewayError> {
        let value: Value = serde_json::from_str(raw)
            .map_err(|e| GatewayError::protocol(format!("invalid JSON: {e}")))?;
        let Value::Object(obj) = value else {
            return Err(GatewayError::protocol("frame is not a JSON object"));
        };

        let mut payload: BTreeMap<String, String> = obj
            .into_iter()
            .filter_map(|(key, value)| scalar_to_string(value).map(|s| (key, s)))
            .collect();
        normalize_aliases(&mut payload);

        let command = payload.remove(KEY_COMMAND).unwrap_or_default();
        if command.is_empty() {
            return Err(GatewayError::protocol("missing 'command' field"));
        }
        let job_id = JobId::from_raw(payload.remove(KEY_JOB_ID).unwrap_or_default());

        Ok(Self {
            command,
            job_id,
            payload,
        })
    }

    pub fn kind(&self) -> Option<CommandKind> {
        CommandKind::from_name(&self.command)
    }

    /// Value of a canonical field, or `""` when absent.
    pub fn field(&self, key: &str) -> &str {
        self.payload.get(key).map(String::as_str).unwrap_or("")
    }

    /// A source-document path implies [`Direction::PlnToIfc`]; otherwise a
    /// compiled-format path implies [`Direction::IfcToPln`].
    pub fn direction(&self) -> Option<Direction> {
        if !self.field(KEY_SOURCE_PATH).is_empty() {
            Some(Direction::PlnToIfc)
        } else if !self.field(KEY_COMPILED_PATH).is_empty() {
            Some(Direction::IfcToPln)
        } else {
            None
        }
    }

    pub fn output_path(&self) -> &str {
        self.field(KEY_OUTPUT_PATH)
    }
}

fn scalar_to_string(value: Value) -> Option<String> {
    match value {
        Value::String(s) => Some(s),
        Value::Number(n) => Some(n.to_string()),
        Value::Bool(b) => Some(b.to_string()),
        Value::Null | Value::Array(_) | Value::Object(_) => None,
    }
}

fn normalize_aliases(payload: &mut BTreeMap<String, String>) {
    for &(canonical, legacy) in FIELD_ALIASES {
        let Some(legacy_value) = payload.remove(legacy) else {
            continue;
        };
        let canonical_empty = payload.get(canonical).map_or(true, String::is_empty);
        if canonical_empty {
            payload.insert(canonical.to_string(), legacy_value);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_canonical_start() {
        let env = CommandEnvelope::parse(
            r#"{"command":"start_conversion","jobId":"J1","plnPath":"C:\\a.pln","outputPath":"C:\\a.ifc"}"#,
        )
        .unwrap();
        assert_eq!(env.kind(), Some(CommandKind::StartConversion));
        assert_eq!(env.job_id, "J1");
        assert_eq!(env.field(KEY_SOURCE_PATH), "C:\\a.pln");
        assert_eq!(env.output_path(), "C:\\a.ifc");
        assert_eq!(env.direction(), Some(Direction::PlnToIfc));
    }

    #[test]
    fn legacy_keys_are_folded() {
        let env = CommandEnvelope::parse(
            r#"{"command":"start_conversion","job_id":"J2","ifc_path":"/m.ifc","output_path":"/m.pln"}"#,
        )
        .unwrap();
        assert_eq!(env.job_id, "J2");
        assert_eq!(env.field(KEY_COMPILED_PATH), "/m.ifc");
        assert_eq!(env.output_path(), "/m.pln");
        assert_eq!(env.direction(), Some(Direction::IfcToPln));
        assert!(!env.payload.contains_key("ifc_path"));
    }

    #[test]
    fn canonical_key_wins_over_legacy() {
        let env = CommandEnvelope::parse(
            r#"{"command":"x","outputPath":"/canonical","output_path":"/legacy"}"#,
        )
        .unwrap();
        assert_eq!(env.output_path(), "/canonical");
    }

    #[test]
    fn empty_canonical_falls_back_to_legacy() {
        let env =
            CommandEnvelope::parse(r#"{"command":"x","plnPath":"","pln_path":"/legacy.pln"}"#)
                .unwrap();
        assert_eq!(env.field(KEY_SOURCE_PATH), "/legacy.pln");
    }

    #[test]
    fn source_path_takes_precedence_for_direction() {
        let env = CommandEnvelope::parse(
            r#"{"command":"start_conversion","plnPath":"/a.pln","ifcPath":"/b.ifc"}"#,
        )
        .unwrap();
        assert_eq!(env.direction(), Some(Direction::PlnToIfc));
    }

    #[test]
    fn absent_fields_read_as_empty() {
        let env = CommandEnvelope::parse(r#"{"command":"get_status"}"#).unwrap();
        assert!(env.job_id.is_empty());
        assert_eq!(env.output_path(), "");
        assert_eq!(env.direction(), None);
    }

    #[test]
    fn missing_command_is_protocol_error() {
        let err = CommandEnvelope::parse(r#"{"jobId":"J1"}"#).unwrap_err();
        assert_eq!(err.error_kind(), "protocol");
    }

    #[test]
    fn empty_command_is_protocol_error() {
        assert!(CommandEnvelope::parse(r#"{"command":""}"#).is_err());
    }

    #[test]
    fn non_object_frames_are_protocol_errors() {
        assert!(CommandEnvelope::parse("[1,2]").is_err());
        assert!(CommandEnvelope::parse("\"start_conversion\"").is_err());
        assert!(CommandEnvelope::parse("{not json").is_err());
    }

    #[test]
    fn scalars_are_stringified_and_structures_dropped() {
        let env = CommandEnvelope::parse(
            r#"{"command":"get_status","jobId":42,"flag":true,"nested":{"a":1},"list":[1],"none":null}"#,
        )
        .unwrap();
        assert_eq!(env.job_id, "42");
        assert_eq!(env.field("flag"), "true");
        assert!(!env.payload.contains_key("nested"));
        assert!(!env.payload.contains_key("list"));
        assert!(!env.payload.contains_key("none"));
    }

    #[test]
    fn unknown_command_parses_but_has_no_kind() {
        let env = CommandEnvelope::parse(r#"{"command":"explode"}"#).unwrap();
        assert_eq!(env.kind(), None);
    }

    #[test]
    fn command_names_round_trip() {
        for kind in [
            CommandKind::StartConversion,
            CommandKind::CancelJob,
            CommandKind::GetStatus,
            CommandKind::LoadIfc,
        ] {
            assert_eq!(CommandKind::from_name(kind.as_str()), Some(kind));
        }
    }
}
