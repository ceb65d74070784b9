use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum Action {
    Hold,
    OpenLong,
    Add,
    Trim,
    ClosePartial,
    CloseAll,
    MoveStop,
    SetTp,
    Pause,
}

impl Action {
    pub fn from_str_lenient(s: &str) -> Option<Action> {
        match s.to_ascii_uppercase().as_str() {
            "HOLD" => Some(Action::Hold),
            "OPEN_LONG" => Some(Action::OpenLong),
            "ADD" => Some(Action::Add),
            "TRIM" => Some(Action::Trim),
            "CLOSE_PARTIAL" => Some(Action::ClosePartial),
            "CLOSE_ALL" => Some(Action::CloseAll),
            "MOVE_STOP" => Some(Action::MoveStop),
            "SET_TP" => Some(Action::SetTp),
            "PAUSE" => Some(Action::Pause),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EntryType {
    Market,
    Limit,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct EntrySpec {
    pub entry_type: EntryType,
    pub offset_bps: Option<f64>,
}

/// A fully normalised decision: every field has already been validated and
/// coerced by the decision adapter. Downstream consumers (the execution
/// engine) never need to re-validate shape.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Decision {
    pub action: Action,
    pub size_pct: Option<f64>,
    pub entry: Option<EntrySpec>,
    pub stop_atr: Option<f64>,
    pub tp_atr: Option<f64>,
    pub followups: Vec<String>,
    pub comment: String,
}

impl Decision {
    pub fn hold(comment: impl Into<String>) -> Self {
        Self {
            action: Action::Hold,
            size_pct: None,
            entry: None,
            stop_atr: None,
            tp_atr: None,
            followups: Vec::new(),
            comment: comment.into(),
        }
    }
}
