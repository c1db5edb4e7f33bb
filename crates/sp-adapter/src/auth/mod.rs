//! Client authentication

mod gate;

pub use gate::{AuthGate, AuthMethod, AuthStats};
