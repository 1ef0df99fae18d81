pub mod admin;
pub mod consumer;
pub mod key_strategy;
pub mod producer;
pub mod serializer;
pub mod topic_validator;


pub use admin::{KafkaTopicAdmin, TopicAdmin};
pub use consumer::SinkConsumer;
pub use key_strategy::KeyStrategy;
pub use producer::KafkaProducer;
pub use serializer::JsonSerializer;
pub use topic_validator::{PollingTopicValidator, TopicValidator};
