pub use self::consumer_batch::ConsumerBatch;
pub use self::consumer_stream::{ConsumerStream, ConsumerStreamError};
pub use self::listing::{Consumers, Streams};

mod consumer_batch;
mod consumer_stream;
mod listing;
