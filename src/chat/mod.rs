//! Chat exchanges over the session store and answer provider

pub mod controller;
pub mod errors;
pub mod events;
pub mod gate;

pub use controller::{ChatService, ChatSettings, ChatStream, ControllerState, StreamingController};
pub use errors::{ChatError, ChatResult};
pub use events::ChatEvent;
pub use gate::SessionGates;
