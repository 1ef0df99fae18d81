pub mod config;
pub mod error;
pub mod router;
pub mod routing;
pub mod sink;

pub mod events;
pub mod kafka;

pub use config::{KafkaConfiguration, RawConfig, TopicConfiguration};
pub use error::{Error, Result};
pub use events::{ChangeEvent, ChangeEventExtractor, Transaction};
pub use router::{EventRouter, TransactionEventHandler};
