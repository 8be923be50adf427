//! Domain model (IDs, behavior, method descriptors, lifecycle events).
//!
//! キューやスケジューラから独立した、純粋なデータ型だけを置きます。

pub mod behavior;
pub mod events;
pub mod ids;
pub mod method;

pub use behavior::{Behavior, Setting, SubmitContext};
pub use events::{
    CompleteEvent, ErrorEvent, FactoryEvent, FallbackEvent, ScopedEvent, SuccessEvent, Verdict,
};
pub use ids::{HookId, Id, IdMarker, TaskId, VDataId};
pub use method::{MethodDescriptor, Verb};
