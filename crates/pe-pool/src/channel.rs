use std::any::Any;
use std::fmt;
use std::sync::Arc;

use pe_core::ProcError;

use crate::methods::MethodTable;

/// Live handle to an external resource.
///
/// Health is asserted only through `activate`/`passivate`; an error from
/// either marks the channel invalid.
pub trait Channel: Send + 'static {
    fn activate(&mut self) -> Result<(), ProcError> {
        Ok(())
    }

    fn passivate(&mut self) -> Result<(), ProcError> {
        Ok(())
    }

    /// Hook run when the channel is marked invalid, before it is closed.
    fn invalidate(&mut self) {}

    fn close(&mut self);

    fn methods(&self) -> Arc<MethodTable>;

    fn as_any_mut(&mut self) -> &mut dyn Any;
}

pub trait ChannelFactory: Send + Sync {
    fn create(&self) -> Result<Box<dyn Channel>, ProcError>;
}

impl<F> ChannelFactory for F
where
    F: Fn() -> Result<Box<dyn Channel>, ProcError> + Send + Sync,
{
    fn create(&self) -> Result<Box<dyn Channel>, ProcError> {
        self()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChannelState {
    Created,
    Active,
    Idle,
    Invalid,
    Closed,
}

pub struct ManagedChannel {
    id: u64,
    state: ChannelState,
    channel: Box<dyn Channel>,
}

impl ManagedChannel {
    pub fn new(id: u64, channel: Box<dyn Channel>) -> Self {
        Self {
            id,
            state: ChannelState::Created,
            channel,
        }
    }

    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn state(&self) -> ChannelState {
        self.state
    }

    pub fn channel_mut(&mut self) -> &mut dyn Channel {
        self.channel.as_mut()
    }

    pub fn methods(&self) -> Arc<MethodTable> {
        self.channel.methods()
    }

    pub fn activate(&mut self) -> Result<(), ProcError> {
        self.transition(ChannelState::Active)
    }

    pub fn passivate(&mut self) -> Result<(), ProcError> {
        self.transition(ChannelState::Idle)
    }

    /// Activate immediately followed by passivate.
    pub fn validate(&mut self) -> Result<(), ProcError> {
        self.activate()?;
        self.passivate()
    }

    pub fn invalidate(&mut self) {
        if matches!(self.state, ChannelState::Invalid | ChannelState::Closed) {
            return;
        }
        self.state = ChannelState::Invalid;
        self.channel.invalidate();
    }

    /// Idempotent.
    pub fn close(&mut self) {
        if self.state == ChannelState::Closed {
            return;
        }
        self.state = ChannelState::Closed;
        self.channel.close();
    }

    fn transition(&mut self, target: ChannelState) -> Result<(), ProcError> {
        match (self.state, target) {
            (ChannelState::Invalid | ChannelState::Closed, _) => {
                return Err(ProcError::channel_invalid(format!(
                    "channel {} is {:?}",
                    self.id, self.state
                )));
            }
            (current, target) if current == target => return Ok(()),
            _ => {}
        }

        let outcome = match target {
            ChannelState::Active => self.channel.activate(),
            _ => self.channel.passivate(),
        };
        match outcome {
            Ok(()) => {
                self.state = target;
                Ok(())
            }
            Err(error) => {
                self.invalidate();
                Err(ProcError::channel_invalid(format!(
                    "channel {} failed to reach {:?}: {}",
                    self.id, target, error
                )))
            }
        }
    }
}

impl fmt::Debug for ManagedChannel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ManagedChannel")
            .field("id", &self.id)
            .field("state", &self.state)
            .field("type", &self.methods().type_name())
            .finish()
    }
}
