use std::{
    fmt,
    sync::atomic::{AtomicU8, Ordering},
};

use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::error::{ClientError, ErrorCategory};

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
pub enum Channel {
    Twin,
    Live,
}

impl Channel {
    pub fn sub_streams(self) -> &'static [SubStream] {
        match self {
            Channel::Twin => &[SubStream::TwinEvents],
            Channel::Live => &[
                SubStream::LiveEvents,
                SubStream::LiveCommands,
                SubStream::LiveMessages,
            ],
        }
    }
}

/// Independently guarded stream of inbound traffic.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum SubStream {
    TwinEvents,
    LiveEvents,
    LiveCommands,
    LiveMessages,
}

impl SubStream {
    pub const ALL: [SubStream; 4] = [
        SubStream::TwinEvents,
        SubStream::LiveEvents,
        SubStream::LiveCommands,
        SubStream::LiveMessages,
    ];

    pub fn channel(self) -> Channel {
        match self {
            SubStream::TwinEvents => Channel::Twin,
            SubStream::LiveEvents | SubStream::LiveCommands | SubStream::LiveMessages => {
                Channel::Live
            }
        }
    }

    pub fn start_command(self) -> &'static str {
        match self {
            SubStream::TwinEvents => "START-SEND-EVENTS",
            SubStream::LiveEvents => "START-SEND-LIVE-EVENTS",
            SubStream::LiveCommands => "START-SEND-LIVE-COMMANDS",
            SubStream::LiveMessages => "START-SEND-MESSAGES",
        }
    }

    pub fn stop_command(self) -> &'static str {
        match self {
            SubStream::TwinEvents => "STOP-SEND-EVENTS",
            SubStream::LiveEvents => "STOP-SEND-LIVE-EVENTS",
            SubStream::LiveCommands => "STOP-SEND-LIVE-COMMANDS",
            SubStream::LiveMessages => "STOP-SEND-MESSAGES",
        }
    }

    pub fn start_ack(self) -> String {
        ack_for(self.start_command())
    }

    pub fn stop_ack(self) -> String {
        ack_for(self.stop_command())
    }

    fn index(self) -> usize {
        match self {
            SubStream::TwinEvents => 0,
            SubStream::LiveEvents => 1,
            SubStream::LiveCommands => 2,
            SubStream::LiveMessages => 3,
        }
    }
}

impl fmt::Display for SubStream {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.start_command().trim_start_matches("START-SEND-"))
    }
}

pub fn ack_for(command: &str) -> String {
    format!("{command}:ACK")
}

/// Optional server-side narrowing of a started sub-stream.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConsumptionOptions {
    pub namespaces: Vec<String>,
    /// RQL filter expression.
    pub filter: Option<String>,
}

impl ConsumptionOptions {
    /// The start command with its query, e.g.
    /// `START-SEND-EVENTS?namespaces=org.acme&filter=eq(attributes/on,true)`.
    pub fn start_command(&self, sub_stream: SubStream) -> String {
        let mut params = Vec::new();
        if !self.namespaces.is_empty() {
            params.push(format!("namespaces={}", self.namespaces.join(",")));
        }
        if let Some(filter) = self.filter.as_deref().filter(|filter| !filter.is_empty()) {
            params.push(format!("filter={filter}"));
        }
        if params.is_empty() {
            sub_stream.start_command().to_owned()
        } else {
            format!("{}?{}", sub_stream.start_command(), params.join("&"))
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum ConsumptionPhase {
    Idle = 0,
    Starting = 1,
    Active = 2,
    Stopping = 3,
}

impl ConsumptionPhase {
    fn from_u8(raw: u8) -> Self {
        match raw {
            1 => Self::Starting,
            2 => Self::Active,
            3 => Self::Stopping,
            _ => Self::Idle,
        }
    }

    pub fn is_in_flight(self) -> bool {
        matches!(self, Self::Starting | Self::Stopping)
    }
}

/// Per sub-stream `Idle -> Starting -> Active -> Stopping -> Idle` guards.
/// A failed request returns the sub-stream to the phase it left.
#[derive(Debug, Default)]
pub struct ConsumptionStateMachine {
    phases: [AtomicU8; 4],
    origins: [AtomicU8; 4],
}

impl ConsumptionStateMachine {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn phase(&self, sub_stream: SubStream) -> ConsumptionPhase {
        ConsumptionPhase::from_u8(self.slot(sub_stream).load(Ordering::Acquire))
    }

    pub fn active(&self) -> Vec<SubStream> {
        SubStream::ALL
            .into_iter()
            .filter(|sub_stream| self.phase(*sub_stream) == ConsumptionPhase::Active)
            .collect()
    }

    /// Move every sub-stream to `Starting`. Fails without side effects if any
    /// of them has a request in flight.
    pub fn begin_start(&self, sub_streams: &[SubStream]) -> Result<Vec<SubStream>, ClientError> {
        self.acquire(sub_streams, ConsumptionPhase::Starting, |phase| {
            matches!(phase, ConsumptionPhase::Idle | ConsumptionPhase::Active).then_some(true)
        })
    }

    /// Move every active sub-stream to `Stopping`; idle ones are skipped.
    pub fn begin_stop(&self, sub_streams: &[SubStream]) -> Result<Vec<SubStream>, ClientError> {
        self.acquire(sub_streams, ConsumptionPhase::Stopping, |phase| match phase {
            ConsumptionPhase::Active => Some(true),
            ConsumptionPhase::Idle => Some(false),
            ConsumptionPhase::Starting | ConsumptionPhase::Stopping => None,
        })
    }

    /// A failed restart of an active sub-stream leaves it active.
    pub fn finish_start(&self, sub_stream: SubStream, acknowledged: bool) {
        let next = if acknowledged {
            ConsumptionPhase::Active
        } else {
            self.origin(sub_stream)
        };
        self.settle(sub_stream, ConsumptionPhase::Starting, next);
    }

    /// A failed stop leaves the stream active.
    pub fn finish_stop(&self, sub_stream: SubStream, acknowledged: bool) {
        let next = if acknowledged {
            ConsumptionPhase::Idle
        } else {
            self.origin(sub_stream)
        };
        self.settle(sub_stream, ConsumptionPhase::Stopping, next);
    }

    /// Drop every guard back to idle, e.g. after the session closed.
    pub fn reset(&self) {
        for slot in self.phases.iter().chain(&self.origins) {
            slot.store(ConsumptionPhase::Idle as u8, Ordering::Release);
        }
    }

    /// `admit` returns `Some(true)` to transition, `Some(false)` to skip and
    /// `None` to reject as concurrent.
    fn acquire(
        &self,
        sub_streams: &[SubStream],
        target: ConsumptionPhase,
        admit: impl Fn(ConsumptionPhase) -> Option<bool>,
    ) -> Result<Vec<SubStream>, ClientError> {
        let mut requested = sub_streams.to_vec();
        requested.sort();
        requested.dedup();

        let mut acquired: Vec<(SubStream, ConsumptionPhase)> = Vec::new();
        for sub_stream in requested {
            let slot = self.slot(sub_stream);
            loop {
                let current = ConsumptionPhase::from_u8(slot.load(Ordering::Acquire));
                match admit(current) {
                    Some(true) => {
                        if slot
                            .compare_exchange(
                                current as u8,
                                target as u8,
                                Ordering::AcqRel,
                                Ordering::Acquire,
                            )
                            .is_ok()
                        {
                            self.origins[sub_stream.index()]
                                .store(current as u8, Ordering::Release);
                            acquired.push((sub_stream, current));
                            break;
                        }
                    }
                    Some(false) => break,
                    None => {
                        self.roll_back(&acquired, target);
                        debug!(%sub_stream, phase = ?current, "rejecting concurrent consumption request");
                        return Err(ClientError::concurrent_consumption(sub_stream));
                    }
                }
            }
        }
        Ok(acquired.into_iter().map(|(sub_stream, _)| sub_stream).collect())
    }

    fn roll_back(&self, acquired: &[(SubStream, ConsumptionPhase)], target: ConsumptionPhase) {
        for (sub_stream, previous) in acquired {
            let _ = self.slot(*sub_stream).compare_exchange(
                target as u8,
                *previous as u8,
                Ordering::AcqRel,
                Ordering::Acquire,
            );
        }
    }

    fn settle(&self, sub_stream: SubStream, from: ConsumptionPhase, to: ConsumptionPhase) {
        if self
            .slot(sub_stream)
            .compare_exchange(from as u8, to as u8, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            warn!(%sub_stream, expected = ?from, actual = ?self.phase(sub_stream), "consumption settled out of order");
        }
    }

    fn origin(&self, sub_stream: SubStream) -> ConsumptionPhase {
        ConsumptionPhase::from_u8(self.origins[sub_stream.index()].load(Ordering::Acquire))
    }

    fn slot(&self, sub_stream: SubStream) -> &AtomicU8 {
        &self.phases[sub_stream.index()]
    }
}

/// Validate that every requested sub-stream belongs to `channel`. An empty
/// request means every sub-stream of the channel.
pub fn sub_streams_for(
    channel: Channel,
    requested: &[SubStream],
) -> Result<Vec<SubStream>, ClientError> {
    if requested.is_empty() {
        return Ok(channel.sub_streams().to_vec());
    }
    if let Some(foreign) = requested.iter().find(|s| s.channel() != channel) {
        return Err(ClientError::new(
            ErrorCategory::Config,
            "sub_stream_channel_mismatch",
            format!("{foreign} does not belong to the {channel:?} channel"),
        ));
    }
    Ok(requested.to_vec())
}
