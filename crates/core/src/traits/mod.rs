pub mod broker;

pub use broker::{
    Acker, Broker, ConsumerSpec, Delivery, DeliveryStream, ProvisionOutcome, RetentionPolicy,
    StorageMode, StreamSpec,
};
