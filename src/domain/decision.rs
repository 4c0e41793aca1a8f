//! The public decision contract. This and the risk range are the only hard
//! public contract of `POST /evaluate`; internal tags are not required.

use serde::{Deserialize, Serialize};

use super::session::Mode;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum Decision {
    Allow,
    Challenge,
    Block,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EvaluateResponse {
    pub decision: Decision,
    pub risk: f64,
    pub mode: Mode,
}

impl Mode {
    pub fn as_wire(&self) -> &'static str {
        match self {
            Mode::Normal => "NORMAL",
            Mode::Challenge => "CHALLENGE",
        }
    }
}
