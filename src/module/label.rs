//! The `LabelFunction` user-code contract (§9, "inheritance of
//! ProcessingModule/LabelFunction").
//!
//! A module binary statically links one implementation per labeled input
//! and exposes it through a factory function — there is no dynamic
//! loading; the binary itself is the deployment unit.

use derivative::Derivative;

use crate::message::Message;

/// Computes which of `n` consumer instances a message should be routed to
/// under the `labeled` distribution policy.
pub trait LabelFunction: Send + Sync {
    fn label(&self, message: &Message, instance_count: usize) -> usize;
}

/// A `LabelFunction` built from a plain closure, for tests and for simple
/// user modules that don't need their own type.
#[derive(Derivative)]
#[derivative(Debug)]
pub struct ClosureLabelFunction<F>(#[derivative(Debug = "ignore")] pub F)
where
    F: Fn(&Message, usize) -> usize + Send + Sync;

impl<F> LabelFunction for ClosureLabelFunction<F>
where
    F: Fn(&Message, usize) -> usize + Send + Sync,
{
    fn label(&self, message: &Message, instance_count: usize) -> usize {
        (self.0)(message, instance_count)
    }
}

/// Factory signature a user library exposes to produce its `LabelFunction`.
pub type LabelFunctionFactory = fn() -> Box<dyn LabelFunction>;
