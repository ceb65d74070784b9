//! Append-only decision audit log (spec §6.5).

use std::path::Path;

use anyhow::{Context, Result};
use tokio::fs::OpenOptions;
use tokio::io::AsyncWriteExt;
use tokio::sync::Mutex;

use crate::model::{Action, Decision, Volatility};

const HEADER: &str = "timestamp,pair,action,size_pct,entry_type,entry_offset_bps,stop_atr,tp_atr,followups,comment,price,confluence_score,volatility_regime,trend_regime,momentum_regime,reasons,dry_run";

pub struct DecisionLogRow {
    pub timestamp: String,
    pub pair: String,
    pub decision: Decision,
    pub price: f64,
    pub confluence_score: i32,
    pub volatility_regime: String,
    pub trend_regime: String,
    pub momentum_regime: String,
    pub reasons: Vec<String>,
    pub dry_run: bool,
}

/// Quote a CSV field per RFC4180: fields containing `"`, `,`, or a newline are
/// wrapped in quotes with internal quotes doubled.
fn escape_csv(field: &str) -> String {
    if field.contains('"') || field.contains(',') || field.contains('\n') {
        format!("\"{}\"", field.replace('"', "\"\""))
    } else {
        field.to_string()
    }
}

fn action_str(action: Action) -> &'static str {
    match action {
        Action::Hold => "HOLD",
        Action::OpenLong => "OPEN_LONG",
        Action::Add => "ADD",
        Action::Trim => "TRIM",
        Action::ClosePartial => "CLOSE_PARTIAL",
        Action::CloseAll => "CLOSE_ALL",
        Action::MoveStop => "MOVE_STOP",
        Action::SetTp => "SET_TP",
        Action::Pause => "PAUSE",
    }
}

fn opt_f64(v: Option<f64>) -> String {
    v.map(|x| x.to_string()).unwrap_or_default()
}

pub fn format_row(row: &DecisionLogRow) -> String {
    let (entry_type, entry_offset_bps) = match &row.decision.entry {
        Some(e) => (
            match e.entry_type {
                crate::model::EntryType::Market => "market".to_string(),
                crate::model::EntryType::Limit => "limit".to_string(),
            },
            opt_f64(e.offset_bps),
        ),
        None => (String::new(), String::new()),
    };
    let followups = row.decision.followups.join(";");
    let reasons = row.reasons.join(";");

    let fields = [
        row.timestamp.clone(),
        row.pair.clone(),
        action_str(row.decision.action).to_string(),
        opt_f64(row.decision.size_pct),
        entry_type,
        entry_offset_bps,
        opt_f64(row.decision.stop_atr),
        opt_f64(row.decision.tp_atr),
        followups,
        row.decision.comment.clone(),
        row.price.to_string(),
        row.confluence_score.to_string(),
        row.volatility_regime.clone(),
        row.trend_regime.clone(),
        row.momentum_regime.clone(),
        reasons,
        row.dry_run.to_string(),
    ];

    fields
        .iter()
        .map(|f| escape_csv(f))
        .collect::<Vec<_>>()
        .join(",")
}

/// Serialised, queue-backed append-only writer: callers `log(row)` and rows
/// are flushed one at a time so concurrent callers never interleave partial
/// lines, matching the "decision logging is serialised through a queue"
/// ordering guarantee (spec §5).
pub struct DecisionLog {
    path: std::path::PathBuf,
    // Guards the actual write so two concurrent `log` calls serialise;
    // mirrors the teacher's atomic-write idiom (runtime_config.rs) without
    // needing a full tmp-file swap since this file is append-only. Held
    // across the await in `log`, so this is the async-context lock type.
    write_lock: Mutex<()>,
}

impl DecisionLog {
    pub async fn open(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref().to_path_buf();
        let needs_header = !path.exists();
        let mut file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&path)
            .await
            .with_context(|| format!("failed to open decision log at {}", path.display()))?;
        if needs_header {
            file.write_all(format!("{HEADER}\n").as_bytes()).await?;
            file.flush().await?;
        }
        Ok(Self {
            path,
            write_lock: Mutex::new(()),
        })
    }

    pub async fn log(&self, row: &DecisionLogRow) -> Result<()> {
        let line = format!("{}\n", format_row(row));
        let _guard = self.write_lock.lock().await;
        let mut file = OpenOptions::new()
            .append(true)
            .open(&self.path)
            .await
            .with_context(|| format!("failed to append to {}", self.path.display()))?;
        file.write_all(line.as_bytes()).await?;
        Ok(())
    }
}

pub fn volatility_str(v: Volatility) -> &'static str {
    match v {
        Volatility::High => "high",
        Volatility::Normal => "normal",
        Volatility::Low => "low",
        Volatility::Unknown => "unknown",
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::Decision;

    #[test]
    fn header_matches_spec_column_order() {
        assert_eq!(
            HEADER,
            "timestamp,pair,action,size_pct,entry_type,entry_offset_bps,stop_atr,tp_atr,followups,comment,price,confluence_score,volatility_regime,trend_regime,momentum_regime,reasons,dry_run"
        );
    }

    #[test]
    fn escape_roundtrips_strings_with_special_chars() {
        for s in ["hello", "has,comma", "has\"quote", "multi\nline", ""] {
            let escaped = escape_csv(s);
            let decoded = decode_csv_field(&escaped);
            assert_eq!(decoded, s);
        }
    }

    fn decode_csv_field(field: &str) -> String {
        if field.starts_with('"') && field.ends_with('"') && field.len() >= 2 {
            field[1..field.len() - 1].replace("\"\"", "\"")
        } else {
            field.to_string()
        }
    }

    #[test]
    fn arrays_are_semicolon_joined() {
        let row = DecisionLogRow {
            timestamp: "2026-01-01T00:00:00Z".into(),
            pair: "DOGE/USD".into(),
            decision: Decision {
                followups: vec!["a".into(), "b".into()],
                ..Decision::hold("test")
            },
            price: 1.0,
            confluence_score: 0,
            volatility_regime: "normal".into(),
            trend_regime: "neutral".into(),
            momentum_regime: "neutral".into(),
            reasons: vec!["Startup".into(), "Periodic".into()],
            dry_run: true,
        };
        let line = format_row(&row);
        assert!(line.contains("a;b"));
        assert!(line.contains("Startup;Periodic"));
    }
}
