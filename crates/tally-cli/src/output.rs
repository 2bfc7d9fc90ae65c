//! Shared output layer for pretty/text/JSON parity across commands.
//!
//! JSON output uses the envelopes in [`tally_core::api`], so `tally --json`
//! prints exactly what the HTTP surface would return.
//!
//! Mode precedence (highest wins):
//! 1. `--format`
//! 2. `--json`
//! 3. `FORMAT` env var, then the user config `output` key
//! 4. Pretty if stdout is a TTY, text if piped

use clap::ValueEnum;
use serde::Serialize;
use std::io::{self, Write};
use tally_core::LedgerError;
use tally_core::api::ErrorEnvelope;

/// Shared width for human pretty separators.
pub const PRETTY_RULE_WIDTH: usize = 72;

/// Write a horizontal separator used by pretty human output.
pub fn pretty_rule(w: &mut dyn Write) -> io::Result<()> {
    writeln!(w, "{:-<width$}", "", width = PRETTY_RULE_WIDTH)
}

/// Write a section heading followed by a separator.
pub fn pretty_section(w: &mut dyn Write, heading: &str) -> io::Result<()> {
    writeln!(w, "{heading}")?;
    pretty_rule(w)
}

/// Render a left-aligned key/value line in human output.
pub fn pretty_kv(w: &mut dyn Write, key: &str, value: impl AsRef<str>) -> io::Result<()> {
    writeln!(w, "{:<12} {}", format!("{key}:"), value.as_ref())
}

/// The three output modes supported by the CLI.
#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum OutputMode {
    /// Human-optimized output (sections, visual framing).
    Pretty,
    /// Token-efficient plain text for scripts and pipes.
    Text,
    /// The API JSON envelopes.
    Json,
}

impl OutputMode {
    /// Map an already-resolved config value (`pretty|text|json`).
    pub fn from_resolved(raw: &str) -> Self {
        match raw {
            "json" => Self::Json,
            "text" => Self::Text,
            _ => Self::Pretty,
        }
    }
}

/// Pick the mode: an explicit `--format` beats everything the config layer
/// resolved (which already folds in `--json`, `FORMAT`, user config and TTY).
pub fn resolve_output_mode(format_flag: Option<OutputMode>, resolved: &str) -> OutputMode {
    format_flag.unwrap_or_else(|| OutputMode::from_resolved(resolved))
}

/// Render a serializable value with explicit pretty/text renderers.
///
/// # Errors
///
/// Returns an error if writing to stdout or serializing fails.
pub fn render_mode<T: Serialize>(
    mode: OutputMode,
    value: &T,
    text_fn: impl FnOnce(&T, &mut dyn Write) -> io::Result<()>,
    pretty_fn: impl FnOnce(&T, &mut dyn Write) -> io::Result<()>,
) -> anyhow::Result<()> {
    let stdout = io::stdout();
    let mut out = stdout.lock();
    match mode {
        OutputMode::Json => {
            serde_json::to_writer_pretty(&mut out, value)?;
            writeln!(out)?;
        }
        OutputMode::Text => text_fn(value, &mut out)?,
        OutputMode::Pretty => pretty_fn(value, &mut out)?,
    }
    Ok(())
}

/// Write a ledger error to `w` in the given mode.
///
/// # Errors
///
/// Returns an error if writing or serializing fails.
pub fn write_error(mode: OutputMode, err: &LedgerError, w: &mut dyn Write) -> anyhow::Result<()> {
    let envelope = ErrorEnvelope::from(err);
    match mode {
        OutputMode::Json => {
            serde_json::to_writer_pretty(&mut *w, &envelope)?;
            writeln!(w)?;
        }
        OutputMode::Pretty | OutputMode::Text => {
            writeln!(w, "error[{}]: {}", envelope.error.code, envelope.error.message)?;
            if let Some(hint) = envelope.error.hint {
                writeln!(w, "  hint: {hint}")?;
            }
        }
    }
    Ok(())
}

/// Render `err` to stderr and turn it into the command's failure.
pub fn fail(mode: OutputMode, err: LedgerError) -> anyhow::Error {
    let stderr = io::stderr();
    let mut out = stderr.lock();
    if let Err(write_err) = write_error(mode, &err, &mut out) {
        tracing::warn!(error = %write_err, "failed to render error");
    }
    anyhow::Error::new(err)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn explicit_format_wins_over_resolved() {
        assert_eq!(
            resolve_output_mode(Some(OutputMode::Text), "json"),
            OutputMode::Text
        );
        assert_eq!(resolve_output_mode(None, "json"), OutputMode::Json);
        assert_eq!(resolve_output_mode(None, "text"), OutputMode::Text);
        assert_eq!(resolve_output_mode(None, "pretty"), OutputMode::Pretty);
    }

    #[test]
    fn unknown_resolved_value_falls_back_to_pretty() {
        assert_eq!(OutputMode::from_resolved("yaml"), OutputMode::Pretty);
    }

    #[test]
    fn pretty_kv_aligns_keys() {
        let mut buf = Vec::new();
        pretty_kv(&mut buf, "version", "3").expect("write");
        assert_eq!(String::from_utf8(buf).expect("utf8"), "version:     3\n");
    }

    #[test]
    fn json_error_is_the_api_envelope() {
        let mut buf = Vec::new();
        let err = LedgerError::BadRequest("entityId is required".into());
        write_error(OutputMode::Json, &err, &mut buf).expect("write");
        let json: serde_json::Value = serde_json::from_slice(&buf).expect("json");
        assert_eq!(json["success"], false);
        assert_eq!(json["error"]["kind"], err.kind());
        assert!(
            json["error"]["message"]
                .as_str()
                .is_some_and(|m| m.contains("entityId"))
        );
    }

    #[test]
    fn text_error_carries_code() {
        let mut buf = Vec::new();
        let err = LedgerError::BadRequest("nope".into());
        write_error(OutputMode::Text, &err, &mut buf).expect("write");
        let text = String::from_utf8(buf).expect("utf8");
        assert!(text.starts_with(&format!("error[{}]", err.code().code())));
    }
}
