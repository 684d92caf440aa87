//! Session and dispatch core shared by Ditto client sessions.
//!
//! This crate defines the wire envelope, message classification and the
//! registration bus, plus the retry, consumption, acknowledgement and token
//! refresh machinery a session wires to its transport.

/// Acknowledgement parsing and aggregation.
pub mod acks;
/// Session event fan-out.
pub mod channel;
/// Classification keys for inbound messages.
pub mod classification;
/// Consumption handshake state machine.
pub mod consumption;
/// Access tokens and credential providers.
pub mod credentials;
/// Delivery of classified messages to registrations.
pub mod dispatch;
/// Stable client error types and HTTP classification helpers.
pub mod error;
/// Wire envelope, outbound signals and inbound frames.
pub mod protocol;
/// Registrations and the registration bus.
pub mod registration;
/// Retry scheduler with Fibonacci backoff.
pub mod retry;
/// Dedicated single-thread schedulers.
pub mod scheduler;
/// Pointers and selector matching.
pub mod selector;
/// Token refresh scheduling.
pub mod token_refresh;
/// Session lifecycle types.
pub mod types;

pub use acks::{
    AckCompletion, AckDelivery, AckHandler, Acknowledgement, AcknowledgementAggregator,
    Acknowledgements, acknowledgements_from_envelope,
};
pub use channel::{EventStream, SessionChannels};
pub use classification::{ClassificationKey, KeyKind};
pub use consumption::{
    Channel, ConsumptionOptions, ConsumptionPhase, ConsumptionStateMachine, SubStream,
};
pub use credentials::{AccessToken, CredentialError, CredentialProvider, InMemoryCredentials};
pub use dispatch::{Dispatcher, Handler, PendingReply, Subscriber};
pub use error::{ClientError, ConnectFailureKind, ErrorCategory, classify_http_status};
pub use protocol::{Envelope, Inbound, Signal};
pub use registration::{Registration, RegistrationBus, RegistrationHandle, RegistrationId, Route};
pub use retry::{Retry, RetryBuilder, RetryPolicy, is_recoverable};
pub use scheduler::DedicatedScheduler;
pub use selector::{Pointer, Selector};
pub use token_refresh::{TokenRefresher, TokenSink};
pub use types::{SessionEvent, SessionState};
