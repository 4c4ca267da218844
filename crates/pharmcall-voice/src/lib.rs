//! Voice-call side of the pharmacy scheduler: the provider contract, the Vapi
//! client, transcript heuristics, and the two [`CallExecutor`] backends.
//!
//! [`CallExecutor`]: pharmcall_scheduler::CallExecutor

pub mod executor;
pub mod extract;
pub mod provider;
pub mod simulate;
pub mod vapi;
pub mod waiters;

pub use executor::VoiceCallExecutor;
pub use provider::{CallStatusReport, PlaceCallRequest, ProviderCallStatus, ProviderError, VoiceProvider};
pub use simulate::SimulatedExecutor;
pub use vapi::VapiProvider;
pub use waiters::CallWaiters;
