//! The `ProcessingModule` user-code contract.

use async_trait::async_trait;

use crate::error::Result;
use crate::message::Message;
use crate::module::consumer::DataConsumer;
use crate::module::label::LabelFunction;

/// User code invoked from the dispatcher thread only, serially with respect
/// to every other control event for this instance (§5). `process` is async
/// because emitting output through [`ModuleContext::send`] can suspend on
/// credit.
#[async_trait]
pub trait ProcessingModule: Send {
    /// Handles one input message (or, for a source module with no declared
    /// inputs, a synthesized empty message, per the source-module step of
    /// the priority dispatch scan).
    async fn process(&mut self, message: &Message, ctx: &mut ModuleContext<'_>) -> Result<()>;

    /// Returns `Some(reason)` if the module detected an unrecoverable
    /// condition during its own setup; `None` (the default) means init
    /// succeeded.
    fn error_on_init(&self) -> Option<String> {
        None
    }

    /// Supplies the labeling function for a `Labeled`-policy input flow
    /// named `flow_name`, if this module declares one. Most modules have no
    /// labeled inputs, hence the default `None`.
    fn label_function(&self, _flow_name: &str) -> Option<Box<dyn LabelFunction>> {
        None
    }
}

/// Factory signature a user library exposes to produce its `ProcessingModule`.
pub type ProcessingModuleFactory = fn() -> Box<dyn ProcessingModule>;

/// The surface user code sees to emit output: applying the declared
/// distribution policy is the dispatcher's job, not the user's.
pub struct ModuleContext<'a> {
    consumer: Option<&'a mut DataConsumer>,
    sequence_number: &'a mut i32,
}

impl<'a> ModuleContext<'a> {
    pub fn new(consumer: Option<&'a mut DataConsumer>, sequence_number: &'a mut i32) -> Self {
        ModuleContext {
            consumer,
            sequence_number,
        }
    }

    /// Queues `payload` for delivery to the declared output, under flow
    /// control. Returns `Ok(None)` immediately if the module has no
    /// declared output (the message is silently dropped, as there is
    /// nowhere to route it).
    pub async fn send(&mut self, payload: Vec<u8>) -> Result<()> {
        let Some(consumer) = self.consumer.as_deref_mut() else {
            return Ok(());
        };
        let seq = *self.sequence_number;
        *self.sequence_number += 1;
        consumer.dispatch(payload, seq).await
    }
}
