//! Wire and internal types shared across the orchestrator, kept distinct the
//! way the sensor collector keeps wire event types apart from internal
//! windowing state.

pub mod decision;
pub mod events;
pub mod features;
pub mod model;
pub mod session;

pub use decision::{Decision, EvaluateResponse};
pub use events::{KeyEvent, KeyEventKind, MouseEvent, MouseEventKind};
pub use features::{KeyFeatures, MouseFeatures};
pub use model::{ModelType, StoredModel};
pub use session::{KeyboardState, Mode, MouseState, SessionState};
