//! Raw biometric event wire types, milliseconds everywhere except the
//! explicit physical quantities (mph, hours) computed downstream.

use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum KeyEventKind {
    Down,
    Up,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct KeyEvent {
    pub key: String,
    pub kind: KeyEventKind,
    pub ts: i64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum MouseEventKind {
    Move,
    Click,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MouseEvent {
    pub x: i32,
    pub y: i32,
    pub kind: MouseEventKind,
    pub ts: i64,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn key_event_kind_round_trips() {
        let json = serde_json::to_string(&KeyEventKind::Down).unwrap();
        assert_eq!(json, "\"DOWN\"");
        let kind: KeyEventKind = serde_json::from_str("\"UP\"").unwrap();
        assert_eq!(kind, KeyEventKind::Up);
    }
}
