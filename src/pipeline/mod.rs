//! The two halves of the queue contract: the producer fills the queue, the
//! drain loop empties it under rate control.

mod drain;
mod producer;

pub use drain::{Cycle, DrainLoop, DrainStats};
pub use producer::{ProducerLoop, ProducerStats};
